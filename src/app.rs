//! Wiring of the stores, the CA manager and the orchestrator

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tunnelctl_coa::CoaService;
use tunnelctl_ipam::{AddressPool, CcdStore};
use tunnelctl_mgmt::ManagementClient;
use tunnelctl_pki::{
    render_client_config, Certificate, CertificateAuthorityManager, InMemoryCertificateStore,
};
use tunnelctl_provision::{
    InMemoryRouterStore, ProvisioningOrchestrator, RouterId, RouterRepository, TracingAuditSink,
};

use crate::config::AppConfig;
use crate::state::{replace_file, StateFile, StateStore};

/// Files the tunnel server loads from its material directory
pub const SERVER_MATERIAL: [&str; 6] = [
    "ca.crt",
    "server.crt",
    "server.key",
    "dh.pem",
    "ta.key",
    "crl.pem",
];

pub struct App {
    config: AppConfig,
    state: StateStore,
    certificates: Arc<InMemoryCertificateStore>,
    routers: Arc<InMemoryRouterStore>,
    orchestrator: Arc<ProvisioningOrchestrator>,
}

impl App {
    /// Load state and build the component graph
    pub async fn open(config: AppConfig) -> Result<Self> {
        let state = StateStore::new(config.state_file());
        let snapshot = state.load().await?;
        debug!(
            authorities = snapshot.certificates.authorities.len(),
            routers = snapshot.routers.routers.len(),
            "Loaded state from {:?}",
            state.path()
        );

        let certificates = Arc::new(InMemoryCertificateStore::from_snapshot(
            snapshot.certificates,
        ));
        let routers = Arc::new(InMemoryRouterStore::from_snapshot(snapshot.routers));
        let pki = Arc::new(CertificateAuthorityManager::new(
            config.pki.issuance.clone(),
            certificates.clone(),
        ));
        let pool = AddressPool::new(&config.pool).context("Invalid address pool")?;

        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            config.provisioning_config(),
            pki,
            pool,
            Arc::new(CcdStore::new(&config.ccd)),
            routers.clone(),
            Arc::new(TracingAuditSink),
        ));

        Ok(Self {
            config,
            state,
            certificates,
            routers,
            orchestrator,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<ProvisioningOrchestrator> {
        &self.orchestrator
    }

    pub fn pki(&self) -> &Arc<CertificateAuthorityManager> {
        self.orchestrator.pki()
    }

    pub fn routers(&self) -> &Arc<InMemoryRouterStore> {
        &self.routers
    }

    pub fn management(&self) -> ManagementClient {
        ManagementClient::new(&self.config.management)
    }

    pub fn coa(&self) -> Result<CoaService> {
        CoaService::from_config(&self.config.coa).context("CoA service is not usable")
    }

    /// Write the stores back to the state file
    pub async fn persist(&self) -> Result<()> {
        let state = StateFile {
            certificates: self
                .certificates
                .snapshot()
                .context("Failed to snapshot certificates")?,
            routers: self
                .routers
                .snapshot()
                .context("Failed to snapshot routers")?,
        };
        self.state.save(&state).await
    }

    /// Client profile for a provisioned router
    pub async fn client_config(&self, router_id: RouterId) -> Result<String> {
        let router = self
            .routers
            .get(router_id)
            .await?
            .with_context(|| format!("Router {} not found", router_id))?;
        let certificate_id = router
            .certificate_id
            .with_context(|| format!("Router {} is not provisioned", router_id))?;

        let repository = self.pki().repository();
        let certificate = repository.get_certificate(certificate_id).await?;
        let ca = repository.get_authority(certificate.ca_id).await?;

        Ok(render_client_config(&ca, &certificate, &self.config.server))
    }

    /// Issue the tunnel server certificate and write everything the server
    /// config references into `output_dir` (the profile's material directory
    /// by default). Keys are written owner-only.
    pub async fn write_server_material(
        &self,
        common_name: &str,
        output_dir: Option<&Path>,
    ) -> Result<(Certificate, PathBuf)> {
        let pki = self.pki();
        let ca = self.orchestrator.ensure_ca().await?;
        let certificate = pki.issue_server_certificate(&ca, common_name, None).await?;
        let crl = pki.generate_crl(&ca).await?;

        let dir = output_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.server.material_dir.clone());
        let [ca_file, cert_file, key_file, dh_file, tls_auth_file, crl_file] = SERVER_MATERIAL;

        replace_file(&dir.join(ca_file), ca.certificate_pem.as_bytes(), false).await?;
        replace_file(&dir.join(cert_file), certificate.certificate_pem.as_bytes(), false).await?;
        replace_file(&dir.join(key_file), certificate.private_key.expose().as_bytes(), true)
            .await?;
        replace_file(&dir.join(dh_file), ca.dh_parameters.as_bytes(), false).await?;
        replace_file(&dir.join(tls_auth_file), ca.tls_auth_key.expose().as_bytes(), true).await?;
        replace_file(&dir.join(crl_file), crl.as_bytes(), false).await?;

        debug!("Wrote server material to {:?}", dir);
        Ok((certificate, dir))
    }
}
