//! Certificate authority management for the tunnel overlay
//!
//! Creates the overlay CA (certificate, key, DH parameters and the static
//! tunnel key), issues server and router client certificates, revokes them
//! and produces signed revocation lists.

pub mod authority;
pub mod dh;
pub mod error;
pub mod models;
pub mod render;
pub mod serial;
pub mod static_key;
pub mod storage;

pub use authority::{default_client_common_name, CertificateAuthorityManager, PkiConfig};
pub use dh::{DhParamSource, FFDHE2048_PEM};
pub use error::PkiError;
pub use models::{
    Certificate, CertificateAuthority, CertificateStatus, CertificateType, SealedKey, Subject,
};
pub use render::{render_client_config, render_server_config, ServerProfile, TransportProtocol};
pub use serial::Serial;
pub use static_key::generate_static_key;
pub use storage::{
    CertificateRepository, CertificateSnapshot, InMemoryCertificateStore, StorageError,
};
