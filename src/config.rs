//! Operator configuration
//!
//! Loaded from `tunnelctl.yml` (or `--config` / `TUNNELCTL_CONFIG`). Every
//! section has defaults, so an empty or missing file is a valid setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tunnelctl_coa::CoaConfig;
use tunnelctl_ipam::{AddressPool, CcdConfig, PoolConfig};
use tunnelctl_mgmt::ManagementConfig;
use tunnelctl_pki::{PkiConfig, ServerProfile, Subject};
use tunnelctl_provision::{MonitorConfig, ProvisioningConfig};

pub const DEFAULT_CONFIG_FILE: &str = "tunnelctl.yml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiSection {
    /// Name of the CA used for issuance
    pub ca_name: String,
    pub ca_subject: Subject,
    pub auto_create_ca: bool,
    #[serde(flatten)]
    pub issuance: PkiConfig,
}

impl Default for PkiSection {
    fn default() -> Self {
        let provisioning = ProvisioningConfig::default();
        Self {
            ca_name: provisioning.ca_name,
            ca_subject: provisioning.ca_subject,
            auto_create_ca: provisioning.auto_create_ca,
            issuance: PkiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSection {
    pub common_name_prefix: String,
    pub actor: String,
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        let provisioning = ProvisioningConfig::default();
        Self {
            common_name_prefix: provisioning.common_name_prefix,
            actor: provisioning.actor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the certificate and router state file lives
    pub state_dir: PathBuf,
    pub pki: PkiSection,
    pub pool: PoolConfig,
    pub ccd: CcdConfig,
    pub server: ServerProfile,
    pub management: ManagementConfig,
    pub coa: CoaConfig,
    pub provisioning: ProvisioningSection,
    pub monitor: MonitorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/tunnelctl"),
            pki: PkiSection::default(),
            pool: PoolConfig::default(),
            ccd: CcdConfig::default(),
            server: ServerProfile::default(),
            management: ManagementConfig::default(),
            coa: CoaConfig::default(),
            provisioning: ProvisioningSection::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from an explicit path, or from `tunnelctl.yml` in the working
    /// directory when present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        // An empty document parses as null
        let mut config: AppConfig = if content.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(content).context("Failed to parse YAML config")?
        };

        config.coa.secret = expand_env_vars(&config.coa.secret)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        AddressPool::new(&self.pool).context("Invalid address pool")?;

        if self.pki.ca_name.trim().is_empty() {
            anyhow::bail!("pki.ca_name must not be empty");
        }
        if self.provisioning.common_name_prefix.is_empty() {
            anyhow::bail!("provisioning.common_name_prefix must not be empty");
        }
        if self.coa.port == 0 {
            anyhow::bail!("coa.port must not be 0");
        }
        Ok(())
    }

    pub fn provisioning_config(&self) -> ProvisioningConfig {
        ProvisioningConfig {
            ca_name: self.pki.ca_name.clone(),
            ca_subject: self.pki.ca_subject.clone(),
            auto_create_ca: self.pki.auto_create_ca,
            common_name_prefix: self.provisioning.common_name_prefix.clone(),
            actor: self.provisioning.actor.clone(),
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }
}

/// Replace `${VAR}` with the variable's value; unset variables become empty
pub fn expand_env_vars(input: &str) -> Result<String> {
    let pattern =
        regex_lite::Regex::new(r"\$\{([^}]+)\}").context("Invalid expansion pattern")?;

    Ok(pattern
        .replace_all(input, |captures: &regex_lite::Captures| {
            std::env::var(&captures[1]).unwrap_or_default()
        })
        .into_owned())
}
