use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoaError {
    #[error("No reply from {target} within {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("CoA I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid CoA request: {0}")]
    InvalidRequest(String),

    #[error("Attribute {attribute} is {length} bytes, the limit is 253")]
    AttributeTooLong { attribute: u8, length: usize },

    #[error("Packet would be {0} bytes, the limit is 4096")]
    PacketTooLarge(usize),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Unknown packet code {0}")]
    UnknownCode(u8),
}

impl CoaError {
    /// Infrastructure failures, as opposed to bad input
    pub fn is_unreachable(&self) -> bool {
        matches!(self, CoaError::Timeout { .. } | CoaError::Io(_))
    }
}
