use thiserror::Error;
use tunnelctl_ipam::{AllocError, CcdError};
use tunnelctl_mgmt::ManagementError;
use tunnelctl_pki::PkiError;

use crate::router::{RouterId, RouterStoreError};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Router {0} not found")]
    RouterNotFound(RouterId),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Allocation(#[from] AllocError),

    #[error("Mapping store error: {0}")]
    Mapping(#[from] CcdError),

    #[error("Router store error: {0}")]
    RouterStore(RouterStoreError),

    #[error("Management interface error: {0}")]
    Management(#[from] ManagementError),
}

impl ProvisionError {
    /// Errors caused by the request rather than by the system
    pub fn is_client_error(&self) -> bool {
        match self {
            ProvisionError::RouterNotFound(_) => true,
            ProvisionError::Pki(e) => e.is_client_error(),
            ProvisionError::Mapping(CcdError::InvalidCommonName(_)) => true,
            _ => false,
        }
    }

    /// Pool exhaustion needs an operator to widen the pool or free addresses
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(
            self,
            ProvisionError::Allocation(AllocError::PoolExhausted(_))
        )
    }
}

impl From<RouterStoreError> for ProvisionError {
    fn from(err: RouterStoreError) -> Self {
        match err {
            RouterStoreError::NotFound(id) => ProvisionError::RouterNotFound(id),
            other => ProvisionError::RouterStore(other),
        }
    }
}
