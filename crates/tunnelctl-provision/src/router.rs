//! Router entity boundary
//!
//! Routers are owned by an external system. The orchestrator reads their
//! identity and previous tunnel assignment and writes the provisioning
//! outcome back through [`RouterRepository`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;
use tunnelctl_pki::SealedKey;
use uuid::Uuid;

pub type RouterId = u64;

const MAX_NAME_SEGMENT: usize = 20;

#[derive(Debug, Error)]
pub enum RouterStoreError {
    #[error("Router {0} not found")]
    NotFound(RouterId),

    #[error("Invalid router name '{0}'")]
    InvalidName(String),

    #[error("Router storage error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,
    pub name: String,
    pub vpn_address: Option<Ipv4Addr>,
    pub certificate_id: Option<Uuid>,
    pub ca_certificate: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<SealedKey>,
    pub provisioned: bool,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Router {
    pub fn new(id: RouterId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            vpn_address: None,
            certificate_id: None,
            ca_certificate: None,
            client_certificate: None,
            client_key: None,
            provisioned: false,
            provisioned_at: None,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    /// Key used for the router in the certificate repository
    pub fn reference(&self) -> String {
        self.id.to_string()
    }

    pub(crate) fn clear_tunnel_fields(&mut self) {
        self.vpn_address = None;
        self.certificate_id = None;
        self.ca_certificate = None;
        self.client_certificate = None;
        self.client_key = None;
        self.provisioned = false;
        self.provisioned_at = None;
    }
}

/// Derive a router's certificate common name.
///
/// `{prefix}-{id}-{name}` where the name is lowercased, spaces and
/// underscores become dashes, anything outside `[a-z0-9-]` is dropped and the
/// result is cut to 20 characters. Pure, so a crashed provisioning run can be
/// driven again without minting a new identity.
pub fn derive_common_name(prefix: &str, id: RouterId, name: &str) -> String {
    let segment: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .take(MAX_NAME_SEGMENT)
        .collect();
    let segment = segment.trim_matches('-');

    if segment.is_empty() {
        format!("{}-{}", prefix, id)
    } else {
        format!("{}-{}-{}", prefix, id, segment)
    }
}

/// Durable home of router records
#[async_trait]
pub trait RouterRepository: Send + Sync {
    /// Register a router under the next free id
    async fn create(&self, name: &str) -> Result<Router, RouterStoreError>;

    async fn get(&self, id: RouterId) -> Result<Option<Router>, RouterStoreError>;

    /// Replace a stored router
    async fn update(&self, router: Router) -> Result<(), RouterStoreError>;

    /// All routers ordered by id
    async fn list(&self) -> Result<Vec<Router>, RouterStoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterSnapshot {
    #[serde(default)]
    pub routers: Vec<Router>,
}

/// In-memory router store
pub struct InMemoryRouterStore {
    routers: RwLock<BTreeMap<RouterId, Router>>,
}

impl InMemoryRouterStore {
    pub fn new() -> Self {
        Self {
            routers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_snapshot(snapshot: RouterSnapshot) -> Self {
        Self {
            routers: RwLock::new(
                snapshot
                    .routers
                    .into_iter()
                    .map(|router| (router.id, router))
                    .collect(),
            ),
        }
    }

    pub fn snapshot(&self) -> Result<RouterSnapshot, RouterStoreError> {
        Ok(RouterSnapshot {
            routers: self.read()?.values().cloned().collect(),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<RouterId, Router>>, RouterStoreError> {
        self.routers
            .read()
            .map_err(|_| RouterStoreError::Backend("router store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<RouterId, Router>>, RouterStoreError> {
        self.routers
            .write()
            .map_err(|_| RouterStoreError::Backend("router store lock poisoned".to_string()))
    }
}

impl Default for InMemoryRouterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouterRepository for InMemoryRouterStore {
    async fn create(&self, name: &str) -> Result<Router, RouterStoreError> {
        if name.trim().is_empty() {
            return Err(RouterStoreError::InvalidName(name.to_string()));
        }

        let mut routers = self.write()?;
        let id = routers.keys().next_back().map_or(1, |last| last + 1);
        let router = Router::new(id, name.trim());
        routers.insert(id, router.clone());

        debug!(router_id = id, "Registered router '{}'", router.name);
        Ok(router)
    }

    async fn get(&self, id: RouterId) -> Result<Option<Router>, RouterStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn update(&self, router: Router) -> Result<(), RouterStoreError> {
        let mut routers = self.write()?;
        match routers.get_mut(&router.id) {
            Some(stored) => {
                *stored = router;
                Ok(())
            }
            None => Err(RouterStoreError::NotFound(router.id)),
        }
    }

    async fn list(&self) -> Result<Vec<Router>, RouterStoreError> {
        Ok(self.read()?.values().cloned().collect())
    }
}
