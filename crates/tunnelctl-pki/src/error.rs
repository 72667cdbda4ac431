use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by the certificate authority manager
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("Certificate {0} is already revoked")]
    AlreadyRevoked(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Certificate authority '{0}' already exists")]
    DuplicateAuthority(String),

    #[error("Certificate authority '{0}' is not active")]
    InactiveAuthority(String),

    #[error("Certificate authority '{0}' is outside its validity window")]
    AuthorityExpired(String),

    #[error("Invalid certificate material: {0}")]
    InvalidMaterial(String),

    #[error("Certificate storage error: {0}")]
    Storage(StorageError),
}

impl PkiError {
    /// Errors caused by the request rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PkiError::AlreadyRevoked(_)
                | PkiError::NotFound(_)
                | PkiError::DuplicateAuthority(_)
                | PkiError::InactiveAuthority(_)
        )
    }
}

impl From<StorageError> for PkiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => PkiError::NotFound(what),
            StorageError::DuplicateAuthority(name) => PkiError::DuplicateAuthority(name),
            other => PkiError::Storage(other),
        }
    }
}

impl From<rcgen::Error> for PkiError {
    fn from(err: rcgen::Error) -> Self {
        PkiError::Generation(err.to_string())
    }
}
