//! Virtual address management for the tunnel overlay
//!
//! [`AddressPool`] hands out static virtual addresses and [`CcdStore`]
//! persists the common name to address bindings the tunnel server reads.

pub mod allocator;
pub mod ccd;

pub use allocator::{AddressPool, AllocError, PoolConfig};
pub use ccd::{validate_common_name, Binding, CcdConfig, CcdError, CcdStore, MappingStore};
