//! Router provisioning for the tunnel overlay
//!
//! [`ProvisioningOrchestrator`] turns a router record into a running tunnel
//! identity: a static address, a client certificate and the binding the
//! tunnel server reads. [`HealthMonitor`] keeps that state honest against
//! what the tunnel server reports.

pub mod audit;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod router;

pub use audit::{AuditAction, AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use error::ProvisionError;
pub use monitor::{
    DriftEvent, HealthMonitor, HealthStatus, MonitorConfig, ReconcileReport, TunnelObserver,
};
pub use orchestrator::{ProvisionResult, ProvisioningConfig, ProvisioningOrchestrator};
pub use router::{
    derive_common_name, InMemoryRouterStore, Router, RouterId, RouterRepository, RouterSnapshot,
    RouterStoreError,
};
