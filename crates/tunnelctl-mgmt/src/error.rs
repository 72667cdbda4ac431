use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("Management interface at {address} is unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Management interface at {address} did not answer within {after:?}")]
    Timeout { address: String, after: Duration },

    #[error("Management interface closed the connection before completing the reply")]
    ConnectionClosed,

    #[error("Management command rejected: {0}")]
    Rejected(String),

    #[error("Invalid common name '{0}'")]
    InvalidCommonName(String),

    #[error("Management I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ManagementError {
    /// Infrastructure failures, as opposed to replies the server rejected
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ManagementError::Unreachable { .. }
                | ManagementError::Timeout { .. }
                | ManagementError::ConnectionClosed
                | ManagementError::Io(_)
        )
    }
}
