//! File-backed state
//!
//! Certificate authorities, certificates and router records live in one JSON
//! document. Saves go through a temporary file and a rename so a crash never
//! leaves a half-written state file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tunnelctl_pki::CertificateSnapshot;
use tunnelctl_provision::RouterSnapshot;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub certificates: CertificateSnapshot,
    #[serde(default)]
    pub routers: RouterSnapshot,
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file; a missing file is an empty state
    pub async fn load(&self) -> Result<StateFile> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {:?}, starting empty", self.path);
                return Ok(StateFile::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state file: {:?}", self.path))
            }
        };

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {:?}", self.path))
    }

    pub async fn save(&self, state: &StateFile) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        // The state holds private keys
        replace_file(&self.path, json.as_bytes(), true).await?;

        debug!("Saved state to {:?}", self.path);
        Ok(())
    }
}

/// Replace `path` through a temporary file and a rename.
///
/// With `private` set the temporary file is created with mode 0600, so the
/// content is never readable by others, not even briefly.
pub async fn replace_file(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create directory: {:?}", parent))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    let temp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(if private { 0o600 } else { 0o644 });
    #[cfg(not(unix))]
    let _ = private;

    let written = async {
        let mut file = options.open(&temp).await?;
        file.write_all(contents).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e).with_context(|| format!("Failed to write {:?}", temp));
    }

    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e).with_context(|| format!("Failed to replace {:?}", path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tunnelctl_provision::Router;

    #[tokio::test]
    async fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let state = store.load().await.unwrap();
        assert!(state.routers.routers.is_empty());
        assert!(state.certificates.authorities.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));

        let state = StateFile {
            routers: RouterSnapshot {
                routers: vec![Router::new(1, "alpha")],
            },
            ..StateFile::default()
        };
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.routers.routers.len(), 1);
        assert_eq!(loaded.routers.routers[0].name, "alpha");

        // No temporary files are left next to the state file
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_file_replaces_readable_one() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.key");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        replace_file(&path, b"secret", true).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&StateFile::default()).await.unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(StateStore::new(path).load().await.is_err());
    }
}
