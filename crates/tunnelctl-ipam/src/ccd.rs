//! Client config directory (CCD) store
//!
//! One file per common name holding a single `ifconfig-push <address> <mask>`
//! line, read by the tunnel server when the client connects. Files are
//! replaced atomically through a temporary file in the same directory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DIRECTIVE: &str = "ifconfig-push";
const MAX_COMMON_NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum CcdError {
    #[error("Invalid common name '{0}'")]
    InvalidCommonName(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CcdError {
    fn io(path: &Path, source: io::Error) -> Self {
        CcdError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A common name bound to a static virtual address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub common_name: String,
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl Binding {
    pub fn to_record(&self) -> String {
        format!("{} {} {}\n", DIRECTIVE, self.address, self.mask)
    }

    /// Parse a record body; `None` when it holds no usable directive
    pub fn parse(common_name: &str, record: &str) -> Option<Self> {
        record.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? != DIRECTIVE {
                return None;
            }
            let address = parts.next()?.parse().ok()?;
            let mask = parts.next()?.parse().ok()?;
            Some(Binding {
                common_name: common_name.to_string(),
                address,
                mask,
            })
        })
    }
}

/// Reject names that could escape the directory or confuse the server
pub fn validate_common_name(common_name: &str) -> Result<(), CcdError> {
    let valid = !common_name.is_empty()
        && common_name.len() <= MAX_COMMON_NAME_LEN
        && !common_name.starts_with('.')
        && !common_name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(CcdError::InvalidCommonName(common_name.to_string()))
    }
}

/// Persistent common name to address bindings.
///
/// Operations on different common names may run concurrently; operations on
/// the same name are serialized by the caller.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Write or replace the binding, returning where it lives
    async fn bind(
        &self,
        common_name: &str,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<PathBuf, CcdError>;

    /// Remove the binding; `false` when there was none
    async fn unbind(&self, common_name: &str) -> Result<bool, CcdError>;

    async fn read(&self, common_name: &str) -> Result<Option<Binding>, CcdError>;

    async fn list(&self) -> Result<Vec<Binding>, CcdError>;

    async fn exists(&self, common_name: &str) -> Result<bool, CcdError> {
        Ok(self.read(common_name).await?.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CcdConfig {
    pub directory: PathBuf,
}

impl Default for CcdConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/etc/openvpn/ccd"),
        }
    }
}

/// File-backed [`MappingStore`]
#[derive(Debug, Clone)]
pub struct CcdStore {
    directory: PathBuf,
}

impl CcdStore {
    pub fn new(config: &CcdConfig) -> Self {
        Self {
            directory: config.directory.clone(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, common_name: &str) -> Result<PathBuf, CcdError> {
        validate_common_name(common_name)?;
        Ok(self.directory.join(common_name))
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), CcdError> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| CcdError::io(&self.directory, e))?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = self
            .directory
            .join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

        if let Err(e) = fs::write(&temp, contents).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CcdError::io(&temp, e));
        }
        if let Err(e) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CcdError::io(path, e));
        }
        Ok(())
    }
}

#[async_trait]
impl MappingStore for CcdStore {
    async fn bind(
        &self,
        common_name: &str,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<PathBuf, CcdError> {
        let path = self.record_path(common_name)?;
        let binding = Binding {
            common_name: common_name.to_string(),
            address,
            mask,
        };

        self.write_atomic(&path, &binding.to_record()).await?;

        info!(%address, "Bound {} in {}", common_name, self.directory.display());
        Ok(path)
    }

    async fn unbind(&self, common_name: &str) -> Result<bool, CcdError> {
        let path = self.record_path(common_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed binding for {}", common_name);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CcdError::io(&path, e)),
        }
    }

    async fn read(&self, common_name: &str) -> Result<Option<Binding>, CcdError> {
        let path = self.record_path(common_name)?;
        match fs::read_to_string(&path).await {
            Ok(record) => Ok(Binding::parse(common_name, &record)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CcdError::io(&path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<Binding>, CcdError> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CcdError::io(&self.directory, e)),
        };

        let mut bindings = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CcdError::io(&self.directory, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_common_name(&name).is_err() {
                continue;
            }
            let is_file = entry
                .file_type()
                .await
                .map(|kind| kind.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }

            match fs::read_to_string(entry.path()).await {
                Ok(record) => match Binding::parse(&name, &record) {
                    Some(binding) => bindings.push(binding),
                    None => debug!("Skipping CCD record without a binding: {}", name),
                },
                // Removed between listing and reading
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to read CCD record {}: {}", name, e),
            }
        }

        bindings.sort_by(|a, b| a.common_name.cmp(&b.common_name));
        Ok(bindings)
    }

    async fn exists(&self, common_name: &str) -> Result<bool, CcdError> {
        let path = self.record_path(common_name)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| CcdError::io(&path, e))
    }
}
