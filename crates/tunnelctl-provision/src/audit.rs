//! Audit trail for revocations and provisioning state changes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Provisioned,
    Deprovisioned,
    Reprovisioned,
    CertificateIssued,
    CertificateRevoked,
    BindingRemoved,
    ProvisioningRolledBack,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::Provisioned => "provisioned",
            AuditAction::Deprovisioned => "deprovisioned",
            AuditAction::Reprovisioned => "reprovisioned",
            AuditAction::CertificateIssued => "certificate_issued",
            AuditAction::CertificateRevoked => "certificate_revoked",
            AuditAction::BindingRemoved => "binding_removed",
            AuditAction::ProvisioningRolledBack => "provisioning_rolled_back",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: String,
    pub action: AuditAction,
    /// What was acted on, e.g. `router:5` or `certificate:<serial>`
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: AuditAction,
        target: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            action,
            target: target.into(),
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }
}

/// Receives audit events. Recording never fails the operation being
/// audited; sinks deal with their own delivery problems.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Writes events as structured logs under the `audit` target
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            actor = %event.actor,
            action = %event.action,
            target_ref = %event.target,
            timestamp = %event.timestamp.to_rfc3339(),
            "{}",
            event.detail
        );
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events().into_iter().map(|event| event.action).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
