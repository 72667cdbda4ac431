//! Provisioning orchestrator
//!
//! Composes the address pool, the mapping store and the CA manager into
//! per-router `provision`, `deprovision` and `reprovision` operations.
//!
//! Locking: operations on one router are serialized by a per-router mutex.
//! Reading the assigned set, choosing an address and writing the binding
//! happen under a single pool mutex, so the binding itself is the
//! reservation. Locks are always taken router first, then pool.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tunnelctl_ipam::{validate_common_name, AddressPool, Binding, MappingStore};
use tunnelctl_pki::{
    Certificate, CertificateAuthority, CertificateAuthorityManager, PkiError, Subject,
};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::ProvisionError;
use crate::router::{derive_common_name, Router, RouterId, RouterRepository};

const REPLACED_REASON: &str = "Replaced by new provisioning";
const ROLLBACK_REASON: &str = "Provisioning rolled back";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// CA used for issuance, referenced by name
    pub ca_name: String,
    /// Subject of the CA when it has to be created
    pub ca_subject: Subject,
    /// Create the named CA on first use when it does not exist
    pub auto_create_ca: bool,
    pub common_name_prefix: String,
    /// Recorded as the actor of audit events
    pub actor: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ca_name: "Netily Cloud CA".to_string(),
            ca_subject: Subject::new(
                "Netily Cloud Controller CA",
                "Netily ISP Platform",
                "KE",
            ),
            auto_create_ca: true,
            common_name_prefix: "netily-router".to_string(),
            actor: "tunnelctl".to_string(),
        }
    }
}

/// Outcome of a successful provisioning run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResult {
    pub router_id: RouterId,
    pub address: Ipv4Addr,
    pub common_name: String,
    pub certificate_id: Uuid,
    pub serial_number: String,
    pub ca_id: Uuid,
    /// Serial of the certificate this run replaced
    pub replaced_serial: Option<String>,
}

pub struct ProvisioningOrchestrator {
    config: ProvisioningConfig,
    pki: Arc<CertificateAuthorityManager>,
    pool: AddressPool,
    mappings: Arc<dyn MappingStore>,
    routers: Arc<dyn RouterRepository>,
    audit_sink: Arc<dyn AuditSink>,
    router_locks: DashMap<RouterId, Arc<Mutex<()>>>,
    pool_lock: Mutex<()>,
    ca_lock: Mutex<()>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        config: ProvisioningConfig,
        pki: Arc<CertificateAuthorityManager>,
        pool: AddressPool,
        mappings: Arc<dyn MappingStore>,
        routers: Arc<dyn RouterRepository>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            pki,
            pool,
            mappings,
            routers,
            audit_sink,
            router_locks: DashMap::new(),
            pool_lock: Mutex::new(()),
            ca_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    pub fn pki(&self) -> &Arc<CertificateAuthorityManager> {
        &self.pki
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn mappings(&self) -> &Arc<dyn MappingStore> {
        &self.mappings
    }

    pub fn routers(&self) -> &Arc<dyn RouterRepository> {
        &self.routers
    }

    pub fn derived_common_name(&self, router: &Router) -> String {
        derive_common_name(&self.config.common_name_prefix, router.id, &router.name)
    }

    /// The router's active certificate, if it has one
    pub async fn active_certificate(
        &self,
        router: &Router,
    ) -> Result<Option<Certificate>, ProvisionError> {
        self.pki
            .repository()
            .active_client_certificate(&router.reference())
            .await
            .map_err(|e| ProvisionError::Pki(e.into()))
    }

    /// Common name the router is currently known by: its active
    /// certificate's, else the derived one
    pub async fn current_common_name(&self, router: &Router) -> Result<String, ProvisionError> {
        Ok(match self.active_certificate(router).await? {
            Some(certificate) => certificate.common_name,
            None => self.derived_common_name(router),
        })
    }

    /// Resolve the configured CA, creating it when allowed
    pub async fn ensure_ca(&self) -> Result<CertificateAuthority, ProvisionError> {
        let _guard = self.ca_lock.lock().await;

        match self.pki.resolve_active_ca(Some(&self.config.ca_name)).await {
            Ok(ca) => Ok(ca),
            Err(PkiError::NotFound(_)) if self.config.auto_create_ca => {
                info!("Certificate authority '{}' missing, creating it", self.config.ca_name);
                Ok(self
                    .pki
                    .create_ca(&self.config.ca_name, self.config.ca_subject.clone(), None)
                    .await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give a router an address, a fresh client certificate and a binding.
    ///
    /// An existing active certificate is revoked and replaced. Failures after
    /// the binding is written restore the previous binding and revoke any
    /// certificate issued by this run. When issuance fails after the old
    /// certificate was revoked, the router is left unprovisioned with no
    /// binding but keeps its address.
    pub async fn provision(&self, router_id: RouterId) -> Result<ProvisionResult, ProvisionError> {
        let lock = self.router_lock(router_id);
        let _guard = lock.lock().await;

        self.provision_locked(router_id, None).await
    }

    /// Revoke the router's certificate, remove its binding and clear its
    /// tunnel fields. Returns `false` when there was nothing to undo.
    pub async fn deprovision(&self, router_id: RouterId) -> Result<bool, ProvisionError> {
        let lock = self.router_lock(router_id);
        let _guard = lock.lock().await;

        self.deprovision_locked(router_id).await
    }

    /// Deprovision then provision, keeping the previous address when it is
    /// still free
    pub async fn reprovision(
        &self,
        router_id: RouterId,
    ) -> Result<ProvisionResult, ProvisionError> {
        let lock = self.router_lock(router_id);
        let _guard = lock.lock().await;

        let previous_address = self.load_router(router_id).await?.vpn_address;
        self.deprovision_locked(router_id).await?;
        let result = self.provision_locked(router_id, previous_address).await?;

        self.emit(
            AuditAction::Reprovisioned,
            router_target(router_id),
            format!("{} at {}", result.common_name, result.address),
        )
        .await;
        Ok(result)
    }

    /// Record that a router was seen connected. Skipped when the stored
    /// value is younger than `min_interval`.
    pub async fn touch_last_seen(
        &self,
        router_id: RouterId,
        seen_at: DateTime<Utc>,
        min_interval: Duration,
    ) -> Result<bool, ProvisionError> {
        let lock = self.router_lock(router_id);
        let _guard = lock.lock().await;

        let mut router = self.load_router(router_id).await?;
        let stale = router
            .last_seen
            .map_or(true, |last| seen_at - last > min_interval);
        if !stale {
            return Ok(false);
        }

        router.last_seen = Some(seen_at);
        self.routers.update(router).await?;
        Ok(true)
    }

    /// Remove bindings whose common name belongs to no provisioned router
    pub async fn cleanup_orphaned_bindings(&self) -> Result<usize, ProvisionError> {
        let routers = self.routers.list().await?;

        let mut live = HashSet::new();
        let mut owners: HashMap<String, RouterId> = HashMap::new();
        for router in &routers {
            owners.insert(self.derived_common_name(router), router.id);
            if router.provisioned {
                live.insert(self.current_common_name(router).await?);
            }
        }

        let mut removed = 0;
        for binding in self.mappings.list().await? {
            if live.contains(&binding.common_name) {
                continue;
            }

            let removed_one = match owners.get(&binding.common_name) {
                // A provisioning run binds before it marks the router, so
                // check again while holding the router's lock
                Some(&owner) => {
                    let lock = self.router_lock(owner);
                    let _guard = lock.lock().await;
                    let provisioned = self
                        .routers
                        .get(owner)
                        .await?
                        .is_some_and(|router| router.provisioned);
                    if provisioned {
                        false
                    } else {
                        self.mappings.unbind(&binding.common_name).await?
                    }
                }
                None => self.mappings.unbind(&binding.common_name).await?,
            };

            if removed_one {
                info!(
                    common_name = %binding.common_name,
                    "Removed orphaned binding for {}",
                    binding.address
                );
                self.emit(
                    AuditAction::BindingRemoved,
                    format!("binding:{}", binding.common_name),
                    format!("orphaned binding for {}", binding.address),
                )
                .await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Cleaned up {} orphaned bindings", removed);
        }
        Ok(removed)
    }

    async fn provision_locked(
        &self,
        router_id: RouterId,
        preferred: Option<Ipv4Addr>,
    ) -> Result<ProvisionResult, ProvisionError> {
        let mut router = self.load_router(router_id).await?;
        let ca = self.ensure_ca().await?;

        let router_ref = router.reference();
        let common_name = self.derived_common_name(&router);
        validate_common_name(&common_name)?;

        let previous_binding = self.mappings.read(&common_name).await?;
        let prior = self.active_certificate(&router).await?;

        let address = self
            .reserve_address(&router, &common_name, previous_binding.as_ref(), preferred)
            .await?;

        if let Some(prior) = &prior {
            if let Err(e) = self.pki.revoke(prior.id, REPLACED_REASON).await {
                self.restore_binding(router_id, &common_name, previous_binding)
                    .await;
                return Err(e.into());
            }
            self.emit(
                AuditAction::CertificateRevoked,
                certificate_target(prior),
                REPLACED_REASON,
            )
            .await;
        }

        let certificate = match self
            .pki
            .issue_client_certificate(&ca, &router_ref, Some(&common_name), None)
            .await
        {
            Ok(certificate) => certificate,
            Err(e) => {
                error!(router_id, "Certificate issuance failed: {}", e);
                match &prior {
                    // The old certificate is gone, so no binding may outlive it.
                    // The router record keeps the address reserved.
                    Some(prior) => {
                        let names = [common_name.as_str(), prior.common_name.as_str()];
                        self.release_bindings(&names).await;
                        self.mark_unprovisioned(router).await;
                    }
                    None => {
                        self.restore_binding(router_id, &common_name, previous_binding)
                            .await;
                    }
                }
                self.emit(
                    AuditAction::ProvisioningRolledBack,
                    router_target(router_id),
                    e.to_string(),
                )
                .await;
                return Err(e.into());
            }
        };
        self.emit(
            AuditAction::CertificateIssued,
            certificate_target(&certificate),
            format!("for {}", common_name),
        )
        .await;

        router.vpn_address = Some(address);
        router.certificate_id = Some(certificate.id);
        router.ca_certificate = Some(ca.certificate_pem.clone());
        router.client_certificate = Some(certificate.certificate_pem.clone());
        router.client_key = Some(certificate.private_key.clone());
        router.provisioned = true;
        router.provisioned_at = Some(Utc::now());

        if let Err(e) = self.routers.update(router).await {
            error!(router_id, "Persisting router failed, rolling back: {}", e);
            if let Err(revoke_err) = self.pki.revoke(certificate.id, ROLLBACK_REASON).await {
                error!(
                    serial = %certificate.serial_number,
                    "Failed to revoke certificate during rollback: {}",
                    revoke_err
                );
            }
            self.restore_binding(router_id, &common_name, previous_binding)
                .await;
            self.emit(
                AuditAction::ProvisioningRolledBack,
                router_target(router_id),
                e.to_string(),
            )
            .await;
            return Err(e.into());
        }

        // A renamed router leaves its old name behind
        if let Some(prior) = &prior {
            if prior.common_name != common_name {
                if let Err(e) = self.mappings.unbind(&prior.common_name).await {
                    warn!("Failed to remove binding for {}: {}", prior.common_name, e);
                }
            }
        }

        info!(
            router_id,
            common_name = %common_name,
            serial = %certificate.serial_number,
            "Router provisioned at {}",
            address
        );
        self.emit(
            AuditAction::Provisioned,
            router_target(router_id),
            format!("{} at {}", common_name, address),
        )
        .await;

        Ok(ProvisionResult {
            router_id,
            address,
            common_name,
            certificate_id: certificate.id,
            serial_number: certificate.serial_number,
            ca_id: ca.id,
            replaced_serial: prior.map(|certificate| certificate.serial_number),
        })
    }

    async fn deprovision_locked(&self, router_id: RouterId) -> Result<bool, ProvisionError> {
        let mut router = self.load_router(router_id).await?;
        let derived = self.derived_common_name(&router);
        let active = self.active_certificate(&router).await?;

        let mut changed = false;
        let mut names = vec![derived];

        if let Some(certificate) = &active {
            if !names.contains(&certificate.common_name) {
                names.push(certificate.common_name.clone());
            }

            let reason = format!("Router {} deprovisioned", router.name);
            match self.pki.revoke(certificate.id, &reason).await {
                Ok(_) => {
                    changed = true;
                    self.emit(
                        AuditAction::CertificateRevoked,
                        certificate_target(certificate),
                        reason,
                    )
                    .await;
                }
                Err(PkiError::AlreadyRevoked(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        for name in &names {
            if self.mappings.unbind(name).await? {
                changed = true;
            }
        }

        if router.provisioned || router.vpn_address.is_some() || router.certificate_id.is_some() {
            router.clear_tunnel_fields();
            self.routers.update(router).await?;
            changed = true;
        }

        if changed {
            info!(router_id, "Router deprovisioned");
            self.emit(
                AuditAction::Deprovisioned,
                router_target(router_id),
                names.join(", "),
            )
            .await;
        } else {
            debug!(router_id, "Router already deprovisioned");
        }
        Ok(changed)
    }

    /// Choose an address and bind it, all under the pool lock
    async fn reserve_address(
        &self,
        router: &Router,
        common_name: &str,
        previous_binding: Option<&Binding>,
        preferred: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, ProvisionError> {
        let _pool = self.pool_lock.lock().await;

        let recorded = router.vpn_address.filter(|address| {
            let inside = self.pool.contains(*address);
            if !inside {
                warn!(
                    router_id = router.id,
                    "Recorded address {} is outside the pool, reallocating", address
                );
            }
            inside
        });

        let address = match recorded {
            Some(address) => address,
            None => {
                let assigned = self.assigned_addresses(router.id, common_name).await?;
                let wanted = preferred.or(previous_binding.map(|binding| binding.address));
                match wanted {
                    Some(address) if self.pool.contains(address) && !assigned.contains(&address) => {
                        address
                    }
                    _ => self.pool.assign(&assigned)?,
                }
            }
        };

        self.mappings
            .bind(common_name, address, self.pool.netmask())
            .await?;
        debug!(router_id = router.id, "Bound {} to {}", common_name, address);
        Ok(address)
    }

    /// Addresses held by anyone other than this router
    async fn assigned_addresses(
        &self,
        router_id: RouterId,
        common_name: &str,
    ) -> Result<HashSet<Ipv4Addr>, ProvisionError> {
        let mut assigned: HashSet<Ipv4Addr> = self
            .mappings
            .list()
            .await?
            .into_iter()
            .filter(|binding| binding.common_name != common_name)
            .map(|binding| binding.address)
            .collect();

        for other in self.routers.list().await? {
            if other.id != router_id {
                assigned.extend(other.vpn_address);
            }
        }
        Ok(assigned)
    }

    async fn restore_binding(
        &self,
        router_id: RouterId,
        common_name: &str,
        previous: Option<Binding>,
    ) {
        let _pool = self.pool_lock.lock().await;

        let restored = match previous {
            Some(binding) => match self.assigned_addresses(router_id, common_name).await {
                Ok(assigned) if !assigned.contains(&binding.address) => self
                    .mappings
                    .bind(common_name, binding.address, binding.mask)
                    .await
                    .map(|_| ()),
                // The old address went elsewhere in the meantime
                Ok(_) => self.mappings.unbind(common_name).await.map(|_| ()),
                Err(e) => {
                    error!(common_name, "Cannot restore binding: {}", e);
                    return;
                }
            },
            None => self.mappings.unbind(common_name).await.map(|_| ()),
        };

        if let Err(e) = restored {
            error!(common_name, "Failed to roll back binding: {}", e);
        }
    }

    async fn release_bindings(&self, common_names: &[&str]) {
        let _pool = self.pool_lock.lock().await;

        let mut released = HashSet::new();
        for &common_name in common_names {
            if !released.insert(common_name) {
                continue;
            }
            if let Err(e) = self.mappings.unbind(common_name).await {
                error!(common_name, "Failed to remove binding: {}", e);
            }
        }
    }

    async fn mark_unprovisioned(&self, mut router: Router) {
        let address = router.vpn_address;
        router.clear_tunnel_fields();
        router.vpn_address = address;
        if let Err(e) = self.routers.update(router).await {
            error!("Failed to mark router unprovisioned: {}", e);
        }
    }

    async fn load_router(&self, router_id: RouterId) -> Result<Router, ProvisionError> {
        self.routers
            .get(router_id)
            .await?
            .ok_or(ProvisionError::RouterNotFound(router_id))
    }

    fn router_lock(&self, router_id: RouterId) -> Arc<Mutex<()>> {
        self.router_locks
            .entry(router_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn emit(&self, action: AuditAction, target: String, detail: impl Into<String>) {
        self.audit_sink
            .record(AuditEvent::new(&self.config.actor, action, target, detail))
            .await;
    }
}

fn router_target(router_id: RouterId) -> String {
    format!("router:{}", router_id)
}

fn certificate_target(certificate: &Certificate) -> String {
    format!("certificate:{}", certificate.serial_number)
}
