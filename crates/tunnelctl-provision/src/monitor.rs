//! Health monitor
//!
//! Periodically compares what the orchestrator believes against what the
//! tunnel server reports, keeps `last_seen` fresh, removes orphaned
//! bindings and sweeps expired certificates.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tunnelctl_mgmt::{ConnectionInfo, ManagementClient, ManagementError, ServerStats};
use tunnelctl_pki::Certificate;

use crate::error::ProvisionError;
use crate::orchestrator::ProvisioningOrchestrator;
use crate::router::RouterId;

/// Read-only view of the tunnel server
#[async_trait]
pub trait TunnelObserver: Send + Sync {
    async fn connected_clients(&self) -> Result<Vec<ConnectionInfo>, ManagementError>;

    async fn ping(&self) -> bool;
}

#[async_trait]
impl TunnelObserver for ManagementClient {
    async fn connected_clients(&self) -> Result<Vec<ConnectionInfo>, ManagementError> {
        self.get_connected_clients().await
    }

    async fn ping(&self) -> bool {
        ManagementClient::ping(self).await
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconcile_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub health_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cleanup_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub expiry_interval: Duration,
    /// `last_seen` is only rewritten when older than this
    #[serde_as(as = "DurationSeconds<u64>")]
    pub last_seen_refresh: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(120),
            health_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            expiry_interval: Duration::from_secs(60 * 60),
            last_seen_refresh: Duration::from_secs(60),
        }
    }
}

/// A difference between recorded and observed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftEvent {
    /// Provisioned router that is not connected
    Disconnected {
        router_id: RouterId,
        common_name: String,
    },
    /// Connected identity that no provisioned router owns
    UnknownClient {
        common_name: String,
        real_address: String,
    },
    AddressMismatch {
        router_id: RouterId,
        common_name: String,
        expected: Ipv4Addr,
        observed: IpAddr,
    },
    /// Provisioned router without a mapping record
    MissingBinding {
        router_id: RouterId,
        common_name: String,
    },
    /// Mapping record that no provisioned router owns
    OrphanedBinding {
        common_name: String,
        address: Ipv4Addr,
    },
}

impl fmt::Display for DriftEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftEvent::Disconnected {
                router_id,
                common_name,
            } => write!(f, "router {} ({}) is disconnected", router_id, common_name),
            DriftEvent::UnknownClient {
                common_name,
                real_address,
            } => write!(
                f,
                "unknown client {} connected from {}",
                common_name, real_address
            ),
            DriftEvent::AddressMismatch {
                router_id,
                common_name,
                expected,
                observed,
            } => write!(
                f,
                "router {} ({}) has {} but {} is recorded",
                router_id, common_name, observed, expected
            ),
            DriftEvent::MissingBinding {
                router_id,
                common_name,
            } => write!(
                f,
                "router {} ({}) has no address binding",
                router_id, common_name
            ),
            DriftEvent::OrphanedBinding {
                common_name,
                address,
            } => write!(f, "binding {} -> {} has no router", common_name, address),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub provisioned: usize,
    pub connected: usize,
    /// Connected clients reported by the server, known or not
    pub clients_total: usize,
    pub last_seen_updated: usize,
    pub events: Vec<DriftEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy { stats: ServerStats },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy { .. })
    }
}

pub struct HealthMonitor {
    config: MonitorConfig,
    orchestrator: Arc<ProvisioningOrchestrator>,
    observer: Arc<dyn TunnelObserver>,
}

impl HealthMonitor {
    pub fn new(
        config: MonitorConfig,
        orchestrator: Arc<ProvisioningOrchestrator>,
        observer: Arc<dyn TunnelObserver>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            observer,
        }
    }

    /// Compare provisioned routers against connected clients.
    ///
    /// Fails only when the tunnel server cannot be queried.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ProvisionError> {
        let clients = self.observer.connected_clients().await?;
        let connected: HashMap<&str, &ConnectionInfo> = clients
            .iter()
            .map(|client| (client.common_name.as_str(), client))
            .collect();

        let bindings: HashMap<String, Ipv4Addr> = self
            .orchestrator
            .mappings()
            .list()
            .await?
            .into_iter()
            .map(|binding| (binding.common_name, binding.address))
            .collect();

        let mut report = ReconcileReport {
            clients_total: clients.len(),
            ..Default::default()
        };
        let mut known = HashSet::new();
        let now = Utc::now();
        let refresh = chrono::Duration::from_std(self.config.last_seen_refresh)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        for router in self.orchestrator.routers().list().await? {
            if !router.provisioned {
                continue;
            }
            report.provisioned += 1;

            let common_name = self.orchestrator.current_common_name(&router).await?;
            known.insert(common_name.clone());

            match connected.get(common_name.as_str()) {
                Some(client) => {
                    report.connected += 1;
                    match self
                        .orchestrator
                        .touch_last_seen(router.id, now, refresh)
                        .await
                    {
                        Ok(true) => report.last_seen_updated += 1,
                        Ok(false) => {}
                        Err(e) => warn!(router_id = router.id, "Cannot update last seen: {}", e),
                    }

                    if let (Some(expected), Some(observed)) =
                        (router.vpn_address, client.virtual_address)
                    {
                        if observed != IpAddr::V4(expected) {
                            report.events.push(DriftEvent::AddressMismatch {
                                router_id: router.id,
                                common_name: common_name.clone(),
                                expected,
                                observed,
                            });
                        }
                    }
                }
                None => report.events.push(DriftEvent::Disconnected {
                    router_id: router.id,
                    common_name: common_name.clone(),
                }),
            }

            if !bindings.contains_key(&common_name) {
                report.events.push(DriftEvent::MissingBinding {
                    router_id: router.id,
                    common_name,
                });
            }
        }

        for client in &clients {
            if !known.contains(&client.common_name) {
                report.events.push(DriftEvent::UnknownClient {
                    common_name: client.common_name.clone(),
                    real_address: client.real_address.clone(),
                });
            }
        }

        let mut orphans: Vec<_> = bindings
            .iter()
            .filter(|(common_name, _)| !known.contains(*common_name))
            .collect();
        orphans.sort();
        for (common_name, address) in orphans {
            report.events.push(DriftEvent::OrphanedBinding {
                common_name: common_name.clone(),
                address: *address,
            });
        }

        for event in &report.events {
            warn!("Tunnel drift: {}", event);
        }
        info!(
            provisioned = report.provisioned,
            connected = report.connected,
            clients = report.clients_total,
            "Reconciled tunnel state"
        );
        Ok(report)
    }

    /// Reachability plus aggregate traffic
    pub async fn check_health(&self) -> HealthStatus {
        if !self.observer.ping().await {
            return HealthStatus::Unhealthy {
                reason: "management interface unreachable".to_string(),
            };
        }

        match self.observer.connected_clients().await {
            Ok(clients) => HealthStatus::Healthy {
                stats: ServerStats::from_clients(&clients),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    pub async fn cleanup_orphaned_bindings(&self) -> Result<usize, ProvisionError> {
        self.orchestrator.cleanup_orphaned_bindings().await
    }

    /// Move certificates past their validity to `expired`
    pub async fn expire_certificates(&self) -> Result<Vec<Certificate>, ProvisionError> {
        let now = Utc::now();
        let pki = self.orchestrator.pki();

        let expired = pki.expire_stale(now).await?;
        for certificate in pki.due_for_renewal(now).await? {
            warn!(
                serial = %certificate.serial_number,
                "Certificate for {} expires in {} days",
                certificate.common_name,
                certificate.days_until_expiry(now)
            );
        }
        Ok(expired)
    }

    /// Run every check on its own interval until `shutdown` turns true or
    /// its sender is dropped
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reconcile = ticker(self.config.reconcile_interval);
            let mut health = ticker(self.config.health_interval);
            let mut cleanup = ticker(self.config.cleanup_interval);
            let mut expiry = ticker(self.config.expiry_interval);

            info!("Health monitor started");
            loop {
                tokio::select! {
                    _ = reconcile.tick() => {
                        if let Err(e) = self.reconcile().await {
                            error!("Tunnel reconciliation failed: {}", e);
                        }
                    }
                    _ = health.tick() => {
                        match self.check_health().await {
                            HealthStatus::Healthy { stats } => debug!(
                                clients = stats.connected_clients,
                                bytes_in = stats.bytes_in,
                                bytes_out = stats.bytes_out,
                                "Tunnel server healthy"
                            ),
                            HealthStatus::Unhealthy { reason } => {
                                error!("Tunnel server unhealthy: {}", reason)
                            }
                        }
                    }
                    _ = cleanup.tick() => {
                        if let Err(e) = self.cleanup_orphaned_bindings().await {
                            error!("Orphaned binding cleanup failed: {}", e);
                        }
                    }
                    _ = expiry.tick() => {
                        match self.expire_certificates().await {
                            Ok(expired) if !expired.is_empty() => {
                                info!("Marked {} certificates expired", expired.len())
                            }
                            Ok(_) => {}
                            Err(e) => error!("Certificate expiry sweep failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
