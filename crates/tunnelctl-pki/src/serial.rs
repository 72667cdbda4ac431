//! Certificate serial numbers

use rand::RngCore;
use std::fmt;
use std::str::FromStr;

use crate::error::PkiError;

/// Serial length in bytes (128 bits)
pub const SERIAL_BYTES: usize = 16;

/// A random certificate serial, rendered as uppercase hex.
///
/// The first byte is kept in `0x01..=0x7F` so the DER integer is positive,
/// never padded, and always renders to exactly 32 hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Serial(Vec<u8>);

impl Serial {
    pub fn random() -> Self {
        let mut bytes = [0u8; SERIAL_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] &= 0x7f;
        if bytes[0] == 0 {
            bytes[0] = 0x01;
        }
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0))
    }
}

impl FromStr for Serial {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| PkiError::InvalidMaterial(format!("serial '{}': {}", s, e)))?;
        if bytes.is_empty() {
            return Err(PkiError::InvalidMaterial("empty serial".to_string()));
        }
        Ok(Self(bytes))
    }
}

impl From<&Serial> for rcgen::SerialNumber {
    fn from(serial: &Serial) -> Self {
        rcgen::SerialNumber::from(serial.0.clone())
    }
}
