//! Client for the tunnel server's management interface
//!
//! The interface is a line protocol over TCP: the server greets with a
//! banner, each command is one line and the reply ends with `END`, a
//! `SUCCESS:` line or an `ERROR:` line. Every call opens its own short-lived
//! connection bounded by a timeout.

pub mod client;
pub mod error;
pub mod status;

pub use client::{ManagementClient, ManagementConfig};
pub use error::ManagementError;
pub use status::{parse_status, ConnectionInfo, ServerStats};
