//! Static virtual address allocation

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("No free addresses left in {0}")]
    PoolExhausted(Ipv4Network),

    #[error("Invalid address pool: {0}")]
    InvalidPool(String),
}

/// Pool definition: a network and the inclusive host offsets handed out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub network: Ipv4Network,
    pub range_start: u32,
    pub range_end: u32,
    /// Offsets never handed out (the tunnel server's own address)
    pub reserved: Vec<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Network::new(Ipv4Addr::new(10, 8, 0, 0), 24)
                .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(10, 8, 0, 0))),
            range_start: 10,
            range_end: 250,
            reserved: vec![1],
        }
    }
}

/// Stateless address allocator.
///
/// `assign` only looks at the addresses it is given. Callers must record the
/// result before another allocation against the same pool can see it.
#[derive(Debug, Clone)]
pub struct AddressPool {
    network: Ipv4Network,
    base: u32,
    start: u32,
    end: u32,
    reserved: BTreeSet<u32>,
}

impl AddressPool {
    pub fn new(config: &PoolConfig) -> Result<Self, AllocError> {
        let prefix = config.network.prefix();
        if prefix > 30 {
            return Err(AllocError::InvalidPool(format!(
                "{} has no room for hosts",
                config.network
            )));
        }
        let size = 1u64 << (32 - u32::from(prefix));
        if config.range_start > config.range_end {
            return Err(AllocError::InvalidPool(format!(
                "range start {} is after range end {}",
                config.range_start, config.range_end
            )));
        }
        if config.range_start == 0 || u64::from(config.range_end) >= size - 1 {
            return Err(AllocError::InvalidPool(format!(
                "range {}..={} does not fit the host part of {}",
                config.range_start, config.range_end, config.network
            )));
        }

        Ok(Self {
            network: config.network,
            base: u32::from(config.network.network()),
            start: config.range_start,
            end: config.range_end,
            reserved: config.reserved.iter().copied().collect(),
        })
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    /// Netmask written next to each binding
    pub fn netmask(&self) -> Ipv4Addr {
        self.network.mask()
    }

    /// Addresses this pool hands out, lowest first
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (self.start..=self.end)
            .filter(move |offset| !self.reserved.contains(offset))
            .map(move |offset| Ipv4Addr::from(self.base + offset))
    }

    pub fn capacity(&self) -> usize {
        self.candidates().count()
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        if !self.network.contains(address) {
            return false;
        }
        let offset = u32::from(address) - self.base;
        (self.start..=self.end).contains(&offset) && !self.reserved.contains(&offset)
    }

    /// Lowest free address not present in `assigned`
    pub fn assign(&self, assigned: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, AllocError> {
        let address = self
            .candidates()
            .find(|candidate| !assigned.contains(candidate))
            .ok_or(AllocError::PoolExhausted(self.network))?;

        debug!(%address, "Allocated address from {}", self.network);
        Ok(address)
    }
}
