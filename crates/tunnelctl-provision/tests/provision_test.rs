use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;
use tunnelctl_ipam::{
    AddressPool, Binding, CcdConfig, CcdError, CcdStore, MappingStore, PoolConfig,
};
use tunnelctl_pki::{
    Certificate, CertificateAuthority, CertificateAuthorityManager, CertificateRepository,
    CertificateStatus, DhParamSource, InMemoryCertificateStore, PkiConfig, PkiError,
    StorageError,
};
use tunnelctl_provision::{
    AuditAction, InMemoryRouterStore, MemoryAuditSink, ProvisionError, ProvisioningConfig,
    ProvisioningOrchestrator, Router, RouterId, RouterRepository, RouterStoreError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Mapping store whose writes can be made to fail
struct FlakyMappings {
    inner: CcdStore,
    fail_bind: AtomicBool,
}

#[async_trait]
impl MappingStore for FlakyMappings {
    async fn bind(
        &self,
        common_name: &str,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<PathBuf, CcdError> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(CcdError::Io {
                path: PathBuf::from(common_name),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.bind(common_name, address, mask).await
    }

    async fn unbind(&self, common_name: &str) -> Result<bool, CcdError> {
        self.inner.unbind(common_name).await
    }

    async fn read(&self, common_name: &str) -> Result<Option<Binding>, CcdError> {
        self.inner.read(common_name).await
    }

    async fn list(&self) -> Result<Vec<Binding>, CcdError> {
        self.inner.list().await
    }
}

/// Router store whose updates can be made to fail
#[derive(Default)]
struct FlakyRouters {
    inner: InMemoryRouterStore,
    fail_update: AtomicBool,
}

#[async_trait]
impl RouterRepository for FlakyRouters {
    async fn create(&self, name: &str) -> Result<Router, RouterStoreError> {
        self.inner.create(name).await
    }

    async fn get(&self, id: RouterId) -> Result<Option<Router>, RouterStoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, router: Router) -> Result<(), RouterStoreError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(RouterStoreError::Backend("database unavailable".to_string()));
        }
        self.inner.update(router).await
    }

    async fn list(&self) -> Result<Vec<Router>, RouterStoreError> {
        self.inner.list().await
    }
}

/// Certificate store whose inserts can be made to fail
#[derive(Default)]
struct FlakyCertificates {
    inner: InMemoryCertificateStore,
    fail_insert: AtomicBool,
}

#[async_trait]
impl CertificateRepository for FlakyCertificates {
    async fn insert_authority(&self, authority: CertificateAuthority) -> Result<(), StorageError> {
        self.inner.insert_authority(authority).await
    }

    async fn get_authority(&self, id: Uuid) -> Result<CertificateAuthority, StorageError> {
        self.inner.get_authority(id).await
    }

    async fn find_authority(
        &self,
        name: &str,
    ) -> Result<Option<CertificateAuthority>, StorageError> {
        self.inner.find_authority(name).await
    }

    async fn list_authorities(&self) -> Result<Vec<CertificateAuthority>, StorageError> {
        self.inner.list_authorities().await
    }

    async fn set_active_authority(&self, id: Uuid) -> Result<(), StorageError> {
        self.inner.set_active_authority(id).await
    }

    async fn insert_certificate(&self, certificate: Certificate) -> Result<(), StorageError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("certificate store offline".to_string()));
        }
        self.inner.insert_certificate(certificate).await
    }

    async fn update_certificate(&self, certificate: Certificate) -> Result<(), StorageError> {
        self.inner.update_certificate(certificate).await
    }

    async fn remove_certificate(&self, id: Uuid) -> Result<(), StorageError> {
        self.inner.remove_certificate(id).await
    }

    async fn get_certificate(&self, id: Uuid) -> Result<Certificate, StorageError> {
        self.inner.get_certificate(id).await
    }

    async fn find_by_serial(&self, serial: &str) -> Result<Option<Certificate>, StorageError> {
        self.inner.find_by_serial(serial).await
    }

    async fn active_client_certificate(
        &self,
        router_ref: &str,
    ) -> Result<Option<Certificate>, StorageError> {
        self.inner.active_client_certificate(router_ref).await
    }

    async fn list_certificates(&self, ca_id: Uuid) -> Result<Vec<Certificate>, StorageError> {
        self.inner.list_certificates(ca_id).await
    }

    async fn list_by_status(
        &self,
        status: CertificateStatus,
    ) -> Result<Vec<Certificate>, StorageError> {
        self.inner.list_by_status(status).await
    }
}

struct Harness {
    _dir: TempDir,
    orchestrator: Arc<ProvisioningOrchestrator>,
    certificates: Arc<FlakyCertificates>,
    mappings: Arc<FlakyMappings>,
    routers: Arc<FlakyRouters>,
    audit: Arc<MemoryAuditSink>,
}

impl Harness {
    fn new(range_start: u32, range_end: u32) -> Self {
        Self::with_config(range_start, range_end, ProvisioningConfig::default())
    }

    fn with_config(range_start: u32, range_end: u32, config: ProvisioningConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();

        let certificates = Arc::new(FlakyCertificates::default());
        let pki = Arc::new(CertificateAuthorityManager::new(
            PkiConfig {
                dh: DhParamSource::Ffdhe2048,
                ..PkiConfig::default()
            },
            certificates.clone(),
        ));
        let pool = AddressPool::new(&PoolConfig {
            range_start,
            range_end,
            ..PoolConfig::default()
        })
        .unwrap();
        let mappings = Arc::new(FlakyMappings {
            inner: CcdStore::new(&CcdConfig {
                directory: dir.path().join("ccd"),
            }),
            fail_bind: AtomicBool::new(false),
        });
        let routers = Arc::new(FlakyRouters::default());
        let audit = Arc::new(MemoryAuditSink::new());

        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            config,
            pki,
            pool,
            mappings.clone(),
            routers.clone(),
            audit.clone(),
        ));

        Self {
            _dir: dir,
            orchestrator,
            certificates,
            mappings,
            routers,
            audit,
        }
    }

    async fn router(&self, name: &str) -> Router {
        self.routers.create(name).await.unwrap()
    }

    async fn stored(&self, id: RouterId) -> Router {
        self.routers.get(id).await.unwrap().unwrap()
    }

    async fn certificates_for(&self, id: RouterId) -> Vec<Certificate> {
        let repository = self.orchestrator.pki().repository();
        let mut certificates = Vec::new();
        for ca in repository.list_authorities().await.unwrap() {
            certificates.extend(
                repository
                    .list_certificates(ca.id)
                    .await
                    .unwrap()
                    .into_iter()
                    .filter(|cert| cert.router_ref.as_deref() == Some(id.to_string().as_str())),
            );
        }
        certificates
    }

    async fn active_count(&self, id: RouterId) -> usize {
        self.certificates_for(id)
            .await
            .iter()
            .filter(|cert| cert.status == CertificateStatus::Active)
            .count()
    }
}

#[tokio::test]
async fn test_provision_assigns_address_certificate_and_binding() {
    let h = Harness::new(10, 250);
    let router = h.router("Main Office").await;

    let result = h.orchestrator.provision(router.id).await.unwrap();
    assert_eq!(result.address, Ipv4Addr::new(10, 8, 0, 10));
    assert_eq!(result.common_name, "netily-router-1-main-office");
    assert_eq!(result.replaced_serial, None);

    let stored = h.stored(router.id).await;
    assert!(stored.provisioned);
    assert!(stored.provisioned_at.is_some());
    assert_eq!(stored.vpn_address, Some(result.address));
    assert_eq!(stored.certificate_id, Some(result.certificate_id));
    assert!(stored
        .ca_certificate
        .as_deref()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));
    assert!(stored
        .client_key
        .as_ref()
        .unwrap()
        .expose()
        .contains("PRIVATE KEY"));

    let binding = h.mappings.read(&result.common_name).await.unwrap().unwrap();
    assert_eq!(binding.address, result.address);
    assert_eq!(binding.mask, Ipv4Addr::new(255, 255, 255, 0));

    // The CA was created on first use and issued the certificate
    let ca = h.orchestrator.ensure_ca().await.unwrap();
    assert_eq!(ca.name, "Netily Cloud CA");
    assert_eq!(result.ca_id, ca.id);
    assert!(h.audit.actions().contains(&AuditAction::Provisioned));
}

#[tokio::test]
async fn test_small_pool_exhausts_on_fourth_router() {
    let h = Harness::new(10, 12);
    let mut routers = Vec::new();
    for name in ["alpha", "beta", "gamma", "delta"] {
        routers.push(h.router(name).await);
    }

    let mut addresses = Vec::new();
    for router in &routers[..3] {
        addresses.push(h.orchestrator.provision(router.id).await.unwrap().address);
    }
    assert_eq!(
        addresses,
        vec![
            Ipv4Addr::new(10, 8, 0, 10),
            Ipv4Addr::new(10, 8, 0, 11),
            Ipv4Addr::new(10, 8, 0, 12),
        ]
    );

    let err = h.orchestrator.provision(routers[3].id).await.unwrap_err();
    assert!(err.is_pool_exhausted());
    assert!(!err.is_client_error());

    // Nothing was left behind for the refused router
    assert_eq!(h.mappings.list().await.unwrap().len(), 3);
    assert!(h.certificates_for(routers[3].id).await.is_empty());
    assert!(!h.stored(routers[3].id).await.provisioned);
}

#[tokio::test]
async fn test_reprovision_rotates_certificate_and_keeps_address() {
    let h = Harness::new(10, 250);
    let router = h.router("tower").await;

    let first = h.orchestrator.provision(router.id).await.unwrap();
    assert_eq!(first.address, Ipv4Addr::new(10, 8, 0, 10));

    let second = h.orchestrator.reprovision(router.id).await.unwrap();
    assert_ne!(second.certificate_id, first.certificate_id);
    assert_eq!(second.address, first.address);

    let certificates = h.certificates_for(router.id).await;
    let old = certificates
        .iter()
        .find(|cert| cert.id == first.certificate_id)
        .unwrap();
    assert_eq!(old.status, CertificateStatus::Revoked);
    assert_eq!(h.active_count(router.id).await, 1);

    let bindings = h.mappings.list().await.unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].address, Ipv4Addr::new(10, 8, 0, 10));
    assert_eq!(bindings[0].common_name, second.common_name);

    assert_eq!(
        h.stored(router.id).await.certificate_id,
        Some(second.certificate_id)
    );
    assert!(h.audit.actions().contains(&AuditAction::Reprovisioned));
}

#[tokio::test]
async fn test_provisioning_again_replaces_active_certificate() {
    let h = Harness::new(10, 250);
    let router = h.router("tower").await;

    let first = h.orchestrator.provision(router.id).await.unwrap();
    let second = h.orchestrator.provision(router.id).await.unwrap();

    assert_eq!(second.address, first.address);
    assert_eq!(second.replaced_serial, Some(first.serial_number.clone()));
    assert_eq!(h.active_count(router.id).await, 1);

    let old = h
        .certificates_for(router.id)
        .await
        .into_iter()
        .find(|cert| cert.id == first.certificate_id)
        .unwrap();
    assert_eq!(
        old.revocation_reason.as_deref(),
        Some("Replaced by new provisioning")
    );
}

#[tokio::test]
async fn test_renamed_router_drops_old_binding() {
    let h = Harness::new(10, 250);
    let mut router = h.router("alpha").await;
    let first = h.orchestrator.provision(router.id).await.unwrap();
    assert_eq!(first.common_name, "netily-router-1-alpha");

    router = h.stored(router.id).await;
    router.name = "beta".to_string();
    h.routers.update(router.clone()).await.unwrap();

    let second = h.orchestrator.provision(router.id).await.unwrap();
    assert_eq!(second.common_name, "netily-router-1-beta");
    assert_eq!(second.address, first.address);

    let bindings = h.mappings.list().await.unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].common_name, "netily-router-1-beta");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_provisions_get_distinct_addresses() {
    let h = Harness::new(10, 250);
    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(h.router(&format!("site {}", i)).await.id);
    }

    let mut tasks = Vec::new();
    for id in ids {
        let orchestrator = h.orchestrator.clone();
        tasks.push(tokio::spawn(async move { orchestrator.provision(id).await }));
    }

    let mut addresses = HashSet::new();
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert!(addresses.insert(result.address), "duplicate {}", result.address);
    }
    assert_eq!(addresses.len(), 20);

    let bound: HashSet<_> = h
        .mappings
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|binding| binding.address)
        .collect();
    assert_eq!(bound, addresses);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_provisions_of_one_router_leave_one_certificate() {
    let h = Harness::new(10, 250);
    let id = h.router("tower").await.id;

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let orchestrator = h.orchestrator.clone();
        tasks.push(tokio::spawn(async move { orchestrator.provision(id).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.active_count(id).await, 1);
    assert_eq!(h.certificates_for(id).await.len(), 5);
    assert_eq!(h.mappings.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_deprovision_is_idempotent() {
    let h = Harness::new(10, 250);
    let router = h.router("Kisumu Hub").await;
    let result = h.orchestrator.provision(router.id).await.unwrap();

    assert!(h.orchestrator.deprovision(router.id).await.unwrap());
    assert!(!h.mappings.exists(&result.common_name).await.unwrap());
    assert!(h.mappings.list().await.unwrap().is_empty());

    let stored = h.stored(router.id).await;
    assert!(!stored.provisioned);
    assert_eq!(stored.vpn_address, None);
    assert_eq!(stored.certificate_id, None);
    assert_eq!(stored.client_key, None);

    let certificate = h
        .certificates_for(router.id)
        .await
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(certificate.status, CertificateStatus::Revoked);
    assert_eq!(
        certificate.revocation_reason.as_deref(),
        Some("Router Kisumu Hub deprovisioned")
    );

    // Second call is a no-op
    assert!(!h.orchestrator.deprovision(router.id).await.unwrap());
    let deprovisioned = h
        .audit
        .actions()
        .into_iter()
        .filter(|action| *action == AuditAction::Deprovisioned)
        .count();
    assert_eq!(deprovisioned, 1);
}

#[tokio::test]
async fn test_freed_address_is_reused() {
    let h = Harness::new(10, 250);
    let first = h.router("alpha").await;
    let second = h.router("beta").await;

    h.orchestrator.provision(first.id).await.unwrap();
    h.orchestrator.deprovision(first.id).await.unwrap();

    let result = h.orchestrator.provision(second.id).await.unwrap();
    assert_eq!(result.address, Ipv4Addr::new(10, 8, 0, 10));
}

#[tokio::test]
async fn test_unknown_router() {
    let h = Harness::new(10, 250);

    let err = h.orchestrator.provision(42).await.unwrap_err();
    assert!(matches!(err, ProvisionError::RouterNotFound(42)));
    assert!(err.is_client_error());

    let err = h.orchestrator.deprovision(42).await.unwrap_err();
    assert!(matches!(err, ProvisionError::RouterNotFound(42)));
}

#[tokio::test]
async fn test_missing_ca_without_auto_create() {
    let h = Harness::with_config(
        10,
        250,
        ProvisioningConfig {
            auto_create_ca: false,
            ..ProvisioningConfig::default()
        },
    );
    let router = h.router("alpha").await;

    let err = h.orchestrator.provision(router.id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Pki(PkiError::NotFound(_))));
    assert!(h.mappings.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_binding_leaves_no_certificate() {
    let h = Harness::new(10, 250);
    let router = h.router("alpha").await;
    h.mappings.fail_bind.store(true, Ordering::SeqCst);

    let err = h.orchestrator.provision(router.id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Mapping(CcdError::Io { .. })));

    assert!(h.certificates_for(router.id).await.is_empty());
    assert!(!h.stored(router.id).await.provisioned);
}

#[tokio::test]
async fn test_failed_persist_rolls_back() {
    let h = Harness::new(10, 250);
    let router = h.router("alpha").await;
    h.routers.fail_update.store(true, Ordering::SeqCst);

    let err = h.orchestrator.provision(router.id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::RouterStore(_)));

    // The issued certificate is revoked and the binding is gone
    let certificates = h.certificates_for(router.id).await;
    assert_eq!(certificates.len(), 1);
    assert_eq!(certificates[0].status, CertificateStatus::Revoked);
    assert_eq!(
        certificates[0].revocation_reason.as_deref(),
        Some("Provisioning rolled back")
    );
    assert!(h.mappings.list().await.unwrap().is_empty());
    assert!(h
        .audit
        .actions()
        .contains(&AuditAction::ProvisioningRolledBack));

    // Once storage recovers the same router provisions cleanly
    h.routers.fail_update.store(false, Ordering::SeqCst);
    let result = h.orchestrator.provision(router.id).await.unwrap();
    assert_eq!(result.address, Ipv4Addr::new(10, 8, 0, 10));
    assert_eq!(h.active_count(router.id).await, 1);
}

#[tokio::test]
async fn test_failed_reissue_leaves_no_binding() {
    let h = Harness::new(10, 250);
    let router = h.router("alpha").await;
    let first = h.orchestrator.provision(router.id).await.unwrap();

    h.certificates.fail_insert.store(true, Ordering::SeqCst);
    let err = h.orchestrator.provision(router.id).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::Pki(PkiError::Storage(StorageError::Backend(_)))
    ));

    // The old certificate was revoked, so nothing may still route to it
    let stored = h.stored(router.id).await;
    assert!(!stored.provisioned);
    assert_eq!(stored.certificate_id, None);
    assert_eq!(stored.vpn_address, Some(first.address));
    assert_eq!(h.active_count(router.id).await, 0);
    assert!(h.mappings.list().await.unwrap().is_empty());
    assert_eq!(h.orchestrator.cleanup_orphaned_bindings().await.unwrap(), 0);

    // The address stays reserved for this router
    let other = h.router("beta").await;
    let other_result = h.orchestrator.provision(other.id).await.unwrap();
    assert_ne!(other_result.address, first.address);

    h.certificates.fail_insert.store(false, Ordering::SeqCst);
    let result = h.orchestrator.provision(router.id).await.unwrap();
    assert_eq!(result.address, first.address);
    assert_eq!(result.replaced_serial, None);
    assert_eq!(h.active_count(router.id).await, 1);
}

#[tokio::test]
async fn test_cleanup_removes_only_orphans() {
    let h = Harness::new(10, 250);
    let router = h.router("alpha").await;
    let result = h.orchestrator.provision(router.id).await.unwrap();

    h.mappings
        .bind(
            "decommissioned-site",
            Ipv4Addr::new(10, 8, 0, 99),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .await
        .unwrap();

    let removed = h.orchestrator.cleanup_orphaned_bindings().await.unwrap();
    assert_eq!(removed, 1);

    let bindings = h.mappings.list().await.unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].common_name, result.common_name);
    assert!(h.audit.actions().contains(&AuditAction::BindingRemoved));
}
