//! RADIUS Change-of-Authorization and Disconnect requests (RFC 5176)
//!
//! [`CoaService`] terminates or modifies a device's session through the
//! authentication proxy. The packet travels through a
//! [`SessionControlTransport`]: either the structured encoder in [`packet`]
//! or a minimal hand-built datagram.

pub mod error;
pub mod packet;
pub mod service;
pub mod transport;

pub use error::CoaError;
pub use packet::{Attribute, Code, Packet, MIKROTIK_VENDOR_ID};
pub use service::{normalize_hardware_address, CoaConfig, CoaService, EncoderKind};
pub use transport::{Outcome, RawSocketTransport, SessionControlTransport, UdpStructuredTransport};
