//! Certificate storage

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::models::{Certificate, CertificateAuthority, CertificateStatus, CertificateType};

/// Certificate storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serial number collision: {0}")]
    SerialCollision(String),

    #[error("Certificate authority '{0}' already exists")]
    DuplicateAuthority(String),

    #[error("Common name '{0}' already has an active certificate")]
    DuplicateCommonName(String),

    #[error("Storage error: {0}")]
    Backend(String),
}

/// Durable home of CAs and certificates.
///
/// Implementations must enforce serial uniqueness, unique CA names and a
/// single active certificate per common name within a CA.
#[async_trait]
pub trait CertificateRepository: Send + Sync {
    async fn insert_authority(&self, authority: CertificateAuthority) -> Result<(), StorageError>;

    async fn get_authority(&self, id: Uuid) -> Result<CertificateAuthority, StorageError>;

    async fn find_authority(&self, name: &str)
        -> Result<Option<CertificateAuthority>, StorageError>;

    async fn list_authorities(&self) -> Result<Vec<CertificateAuthority>, StorageError>;

    /// Mark one CA active and every other CA inactive
    async fn set_active_authority(&self, id: Uuid) -> Result<(), StorageError>;

    async fn insert_certificate(&self, certificate: Certificate) -> Result<(), StorageError>;

    async fn update_certificate(&self, certificate: Certificate) -> Result<(), StorageError>;

    async fn remove_certificate(&self, id: Uuid) -> Result<(), StorageError>;

    async fn get_certificate(&self, id: Uuid) -> Result<Certificate, StorageError>;

    async fn find_by_serial(&self, serial: &str) -> Result<Option<Certificate>, StorageError>;

    async fn active_client_certificate(
        &self,
        router_ref: &str,
    ) -> Result<Option<Certificate>, StorageError>;

    /// Certificates issued by a CA
    async fn list_certificates(&self, ca_id: Uuid) -> Result<Vec<Certificate>, StorageError>;

    async fn list_by_status(
        &self,
        status: CertificateStatus,
    ) -> Result<Vec<Certificate>, StorageError>;
}

/// Serializable copy of a store's contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateSnapshot {
    #[serde(default)]
    pub authorities: Vec<CertificateAuthority>,
    #[serde(default)]
    pub certificates: Vec<Certificate>,
}

#[derive(Default)]
struct StoreState {
    authorities: HashMap<Uuid, CertificateAuthority>,
    certificates: HashMap<Uuid, Certificate>,
}

impl StoreState {
    fn check_active_common_name(&self, certificate: &Certificate) -> Result<(), StorageError> {
        if certificate.status != CertificateStatus::Active {
            return Ok(());
        }
        let clash = self.certificates.values().any(|other| {
            other.id != certificate.id
                && other.ca_id == certificate.ca_id
                && other.status == CertificateStatus::Active
                && other.common_name == certificate.common_name
        });
        if clash {
            return Err(StorageError::DuplicateCommonName(
                certificate.common_name.clone(),
            ));
        }
        Ok(())
    }
}

/// In-memory certificate store
pub struct InMemoryCertificateStore {
    state: RwLock<StoreState>,
}

impl InMemoryCertificateStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn from_snapshot(snapshot: CertificateSnapshot) -> Self {
        let state = StoreState {
            authorities: snapshot
                .authorities
                .into_iter()
                .map(|ca| (ca.id, ca))
                .collect(),
            certificates: snapshot
                .certificates
                .into_iter()
                .map(|cert| (cert.id, cert))
                .collect(),
        };
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn snapshot(&self) -> Result<CertificateSnapshot, StorageError> {
        let state = self.read()?;
        let mut authorities: Vec<_> = state.authorities.values().cloned().collect();
        authorities.sort_by_key(|ca| ca.created_at);
        let mut certificates: Vec<_> = state.certificates.values().cloned().collect();
        certificates.sort_by_key(|cert| cert.created_at);
        Ok(CertificateSnapshot {
            authorities,
            certificates,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>, StorageError> {
        self.state
            .read()
            .map_err(|_| StorageError::Backend("certificate store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>, StorageError> {
        self.state
            .write()
            .map_err(|_| StorageError::Backend("certificate store lock poisoned".to_string()))
    }
}

impl Default for InMemoryCertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateRepository for InMemoryCertificateStore {
    async fn insert_authority(&self, authority: CertificateAuthority) -> Result<(), StorageError> {
        debug!("Storing certificate authority: {}", authority.name);

        let mut state = self.write()?;
        if state
            .authorities
            .values()
            .any(|existing| existing.name == authority.name)
        {
            return Err(StorageError::DuplicateAuthority(authority.name));
        }
        state.authorities.insert(authority.id, authority);
        Ok(())
    }

    async fn get_authority(&self, id: Uuid) -> Result<CertificateAuthority, StorageError> {
        self.read()?
            .authorities
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("certificate authority {}", id)))
    }

    async fn find_authority(
        &self,
        name: &str,
    ) -> Result<Option<CertificateAuthority>, StorageError> {
        Ok(self
            .read()?
            .authorities
            .values()
            .find(|ca| ca.name == name)
            .cloned())
    }

    async fn list_authorities(&self) -> Result<Vec<CertificateAuthority>, StorageError> {
        let mut authorities: Vec<_> = self.read()?.authorities.values().cloned().collect();
        authorities.sort_by_key(|ca| ca.created_at);
        Ok(authorities)
    }

    async fn set_active_authority(&self, id: Uuid) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if !state.authorities.contains_key(&id) {
            return Err(StorageError::NotFound(format!(
                "certificate authority {}",
                id
            )));
        }
        for authority in state.authorities.values_mut() {
            authority.is_active = authority.id == id;
        }
        Ok(())
    }

    async fn insert_certificate(&self, certificate: Certificate) -> Result<(), StorageError> {
        debug!(
            "Storing certificate {} (serial {})",
            certificate.common_name, certificate.serial_number
        );

        let mut state = self.write()?;
        if state
            .certificates
            .values()
            .any(|existing| existing.serial_number == certificate.serial_number)
        {
            return Err(StorageError::SerialCollision(certificate.serial_number));
        }
        if state.certificates.contains_key(&certificate.id) {
            return Err(StorageError::Backend(format!(
                "certificate {} already stored",
                certificate.id
            )));
        }
        state.check_active_common_name(&certificate)?;
        state.certificates.insert(certificate.id, certificate);
        Ok(())
    }

    async fn update_certificate(&self, certificate: Certificate) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if !state.certificates.contains_key(&certificate.id) {
            return Err(StorageError::NotFound(format!(
                "certificate {}",
                certificate.id
            )));
        }
        state.check_active_common_name(&certificate)?;
        state.certificates.insert(certificate.id, certificate);
        Ok(())
    }

    async fn remove_certificate(&self, id: Uuid) -> Result<(), StorageError> {
        self.write()?
            .certificates
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("certificate {}", id)))
    }

    async fn get_certificate(&self, id: Uuid) -> Result<Certificate, StorageError> {
        trace!("Retrieving certificate {}", id);
        self.read()?
            .certificates
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("certificate {}", id)))
    }

    async fn find_by_serial(&self, serial: &str) -> Result<Option<Certificate>, StorageError> {
        Ok(self
            .read()?
            .certificates
            .values()
            .find(|cert| cert.serial_number.eq_ignore_ascii_case(serial))
            .cloned())
    }

    async fn active_client_certificate(
        &self,
        router_ref: &str,
    ) -> Result<Option<Certificate>, StorageError> {
        Ok(self
            .read()?
            .certificates
            .values()
            .filter(|cert| {
                cert.certificate_type == CertificateType::Client
                    && cert.status == CertificateStatus::Active
                    && cert.router_ref.as_deref() == Some(router_ref)
            })
            .max_by_key(|cert| cert.created_at)
            .cloned())
    }

    async fn list_certificates(&self, ca_id: Uuid) -> Result<Vec<Certificate>, StorageError> {
        let mut certificates: Vec<_> = self
            .read()?
            .certificates
            .values()
            .filter(|cert| cert.ca_id == ca_id)
            .cloned()
            .collect();
        certificates.sort_by_key(|cert| cert.created_at);
        Ok(certificates)
    }

    async fn list_by_status(
        &self,
        status: CertificateStatus,
    ) -> Result<Vec<Certificate>, StorageError> {
        let mut certificates: Vec<_> = self
            .read()?
            .certificates
            .values()
            .filter(|cert| cert.status == status)
            .cloned()
            .collect();
        certificates.sort_by_key(|cert| cert.created_at);
        Ok(certificates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SealedKey;
    use chrono::{Duration, Utc};

    fn create_test_cert(ca_id: Uuid, common_name: &str, serial: &str) -> Certificate {
        let now = Utc::now();
        Certificate {
            id: Uuid::new_v4(),
            ca_id,
            router_ref: Some(common_name.to_string()),
            common_name: common_name.to_string(),
            serial_number: serial.to_string(),
            certificate_type: CertificateType::Client,
            status: CertificateStatus::Active,
            valid_from: now,
            valid_until: now + Duration::days(365),
            certificate_pem: "cert_pem".to_string(),
            private_key: SealedKey::new("key_pem"),
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_serial_collision_is_rejected() {
        let store = InMemoryCertificateStore::new();
        let ca_id = Uuid::new_v4();

        store
            .insert_certificate(create_test_cert(ca_id, "router-a", "0A0B"))
            .await
            .unwrap();
        let result = store
            .insert_certificate(create_test_cert(ca_id, "router-b", "0A0B"))
            .await;

        assert!(matches!(result, Err(StorageError::SerialCollision(s)) if s == "0A0B"));
        assert_eq!(store.list_certificates(ca_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_active_common_name_is_unique_per_ca() {
        let store = InMemoryCertificateStore::new();
        let ca_id = Uuid::new_v4();

        store
            .insert_certificate(create_test_cert(ca_id, "router-a", "01"))
            .await
            .unwrap();

        let duplicate = store
            .insert_certificate(create_test_cert(ca_id, "router-a", "02"))
            .await;
        assert!(matches!(
            duplicate,
            Err(StorageError::DuplicateCommonName(_))
        ));

        // Another CA may reuse the name
        store
            .insert_certificate(create_test_cert(Uuid::new_v4(), "router-a", "03"))
            .await
            .unwrap();

        // A revoked holder frees the name
        let mut revoked = create_test_cert(ca_id, "router-a", "04");
        revoked.status = CertificateStatus::Revoked;
        store.insert_certificate(revoked).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_client_certificate_lookup() {
        let store = InMemoryCertificateStore::new();
        let ca_id = Uuid::new_v4();

        let mut old = create_test_cert(ca_id, "router-a", "01");
        old.status = CertificateStatus::Revoked;
        store.insert_certificate(old).await.unwrap();
        let current = create_test_cert(ca_id, "router-a", "02");
        store.insert_certificate(current.clone()).await.unwrap();

        let found = store
            .active_client_certificate("router-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, current.id);
        assert!(store
            .active_client_certificate("router-b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_preserves_records() {
        let store = InMemoryCertificateStore::new();
        let ca_id = Uuid::new_v4();
        store
            .insert_certificate(create_test_cert(ca_id, "router-a", "01"))
            .await
            .unwrap();

        let restored = InMemoryCertificateStore::from_snapshot(store.snapshot().unwrap());
        let found = restored.find_by_serial("01").await.unwrap().unwrap();
        assert_eq!(found.common_name, "router-a");
    }

    #[tokio::test]
    async fn test_missing_certificate() {
        let store = InMemoryCertificateStore::new();
        let result = store.get_certificate(Uuid::new_v4()).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
