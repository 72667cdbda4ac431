//! Certificate authority manager
//!
//! Creates CAs, signs server and router certificates, revokes them and
//! publishes revocation lists. Key and certificate generation runs on the
//! blocking pool; DH parameter generation runs concurrently with it and
//! never holds any lock, so slow parameter generation does not delay
//! issuance from an existing CA.

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, RevokedCertParams, SanType,
    SerialNumber,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use x509_parser::pem::parse_x509_pem;

use crate::dh::DhParamSource;
use crate::error::PkiError;
use crate::models::{
    Certificate, CertificateAuthority, CertificateStatus, CertificateType, SealedKey, Subject,
};
use crate::serial::Serial;
use crate::static_key::generate_static_key;
use crate::storage::CertificateRepository;

/// Issuance defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    pub ca_validity_days: u32,
    pub server_validity_days: u32,
    pub client_validity_days: u32,
    /// Distance between a CRL's `this_update` and `next_update`
    pub crl_validity_days: u32,
    pub renewal_threshold_days: i64,
    pub dh: DhParamSource,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            ca_validity_days: 3650,
            server_validity_days: 825,
            client_validity_days: 365,
            crl_validity_days: 7,
            renewal_threshold_days: 30,
            dh: DhParamSource::default(),
        }
    }
}

/// Default client common name for a router
pub fn default_client_common_name(router_ref: &str) -> String {
    format!("router_{}", router_ref)
}

pub struct CertificateAuthorityManager {
    config: PkiConfig,
    repository: Arc<dyn CertificateRepository>,
    revocation_lock: Mutex<()>,
}

impl CertificateAuthorityManager {
    pub fn new(config: PkiConfig, repository: Arc<dyn CertificateRepository>) -> Self {
        Self {
            config,
            repository,
            revocation_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PkiConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn CertificateRepository> {
        &self.repository
    }

    /// Create a new CA and make it the active issuer.
    ///
    /// Generates the signing key and self-signed certificate, DH parameters
    /// and the static tunnel key. Any previously active CA is demoted but
    /// kept for its revocation list.
    pub async fn create_ca(
        &self,
        name: &str,
        subject: Subject,
        validity_days: Option<u32>,
    ) -> Result<CertificateAuthority, PkiError> {
        if name.trim().is_empty() {
            return Err(PkiError::InvalidMaterial(
                "certificate authority name is empty".to_string(),
            ));
        }
        if self.repository.find_authority(name).await?.is_some() {
            return Err(PkiError::DuplicateAuthority(name.to_string()));
        }

        let days = validity_days.unwrap_or(self.config.ca_validity_days);
        let valid_from = Utc::now();
        let valid_until = valid_from + Duration::days(i64::from(days));

        info!("Creating certificate authority '{}' ({} days)", name, days);

        let not_before = to_offset(valid_from)?;
        let not_after = to_offset(valid_until)?;
        let ca_subject = subject.clone();
        let signing = tokio::task::spawn_blocking(move || {
            build_ca_certificate(&ca_subject, &Serial::random(), not_before, not_after)
        });

        let (dh_parameters, signed) = tokio::join!(self.config.dh.generate(), signing);
        let (certificate_pem, key_pem) = signed.map_err(worker_failed)??;
        let dh_parameters = dh_parameters?;

        let authority = CertificateAuthority {
            id: Uuid::new_v4(),
            name: name.to_string(),
            subject,
            certificate_pem,
            private_key: SealedKey::new(key_pem),
            dh_parameters,
            tls_auth_key: generate_static_key(),
            valid_from,
            valid_until,
            is_active: true,
            created_at: valid_from,
        };

        self.repository.insert_authority(authority.clone()).await?;
        self.repository.set_active_authority(authority.id).await?;

        info!(ca_id = %authority.id, "Certificate authority '{}' created and activated", name);
        Ok(authority)
    }

    /// Make the named CA the active issuer, demoting all others
    pub async fn activate_ca(&self, name: &str) -> Result<CertificateAuthority, PkiError> {
        let mut authority = self
            .repository
            .find_authority(name)
            .await?
            .ok_or_else(|| PkiError::NotFound(format!("certificate authority '{}'", name)))?;

        self.repository.set_active_authority(authority.id).await?;
        authority.is_active = true;

        info!(ca_id = %authority.id, "Certificate authority '{}' activated", name);
        Ok(authority)
    }

    /// Resolve the CA used for new issuance.
    ///
    /// With a reference the named CA must exist and be active. Without one
    /// exactly one CA must be active.
    pub async fn resolve_active_ca(
        &self,
        reference: Option<&str>,
    ) -> Result<CertificateAuthority, PkiError> {
        match reference {
            Some(name) => {
                let authority = self.repository.find_authority(name).await?.ok_or_else(|| {
                    PkiError::NotFound(format!("certificate authority '{}'", name))
                })?;
                if !authority.is_active {
                    return Err(PkiError::InactiveAuthority(name.to_string()));
                }
                Ok(authority)
            }
            None => {
                let mut active: Vec<_> = self
                    .repository
                    .list_authorities()
                    .await?
                    .into_iter()
                    .filter(|ca| ca.is_active)
                    .collect();
                match active.len() {
                    0 => Err(PkiError::NotFound(
                        "active certificate authority".to_string(),
                    )),
                    1 => Ok(active.remove(0)),
                    n => Err(PkiError::InvalidMaterial(format!(
                        "{} certificate authorities are active",
                        n
                    ))),
                }
            }
        }
    }

    pub async fn issue_server_certificate(
        &self,
        ca: &CertificateAuthority,
        common_name: &str,
        validity_days: Option<u32>,
    ) -> Result<Certificate, PkiError> {
        let days = validity_days.unwrap_or(self.config.server_validity_days);
        self.issue(ca, CertificateType::Server, None, common_name, days)
            .await
    }

    /// Issue a router certificate. The common name defaults to
    /// [`default_client_common_name`].
    pub async fn issue_client_certificate(
        &self,
        ca: &CertificateAuthority,
        router_ref: &str,
        common_name: Option<&str>,
        validity_days: Option<u32>,
    ) -> Result<Certificate, PkiError> {
        let common_name = common_name
            .map(str::to_string)
            .unwrap_or_else(|| default_client_common_name(router_ref));
        let days = validity_days.unwrap_or(self.config.client_validity_days);
        self.issue(
            ca,
            CertificateType::Client,
            Some(router_ref.to_string()),
            &common_name,
            days,
        )
        .await
    }

    async fn issue(
        &self,
        ca: &CertificateAuthority,
        certificate_type: CertificateType,
        router_ref: Option<String>,
        common_name: &str,
        validity_days: u32,
    ) -> Result<Certificate, PkiError> {
        if common_name.trim().is_empty() {
            return Err(PkiError::InvalidMaterial("common name is empty".to_string()));
        }

        // Work from the stored record so activation changes are respected
        let ca = self.repository.get_authority(ca.id).await?;
        let now = Utc::now();
        if !ca.is_active {
            return Err(PkiError::InactiveAuthority(ca.name));
        }
        if !ca.is_valid(now) {
            return Err(PkiError::AuthorityExpired(ca.name));
        }

        let serial = Serial::random();
        let mut certificate = Certificate {
            id: Uuid::new_v4(),
            ca_id: ca.id,
            router_ref,
            common_name: common_name.to_string(),
            serial_number: serial.to_string(),
            certificate_type,
            status: CertificateStatus::Pending,
            valid_from: now,
            valid_until: now + Duration::days(i64::from(validity_days)),
            certificate_pem: String::new(),
            private_key: SealedKey::new(String::new()),
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
        };

        // The pending record claims the serial before any signing happens
        self.repository.insert_certificate(certificate.clone()).await?;

        let subject = ca.subject.with_common_name(common_name);
        let not_before = to_offset(certificate.valid_from)?;
        let not_after = to_offset(certificate.valid_until)?;
        let signed = tokio::task::spawn_blocking(move || {
            build_leaf_certificate(
                &ca,
                &subject,
                certificate_type,
                &serial,
                not_before,
                not_after,
            )
        })
        .await
        .map_err(worker_failed)
        .and_then(|result| result);

        let (certificate_pem, key_pem) = match signed {
            Ok(material) => material,
            Err(e) => {
                self.discard_pending(certificate.id).await;
                return Err(e);
            }
        };

        certificate.certificate_pem = certificate_pem;
        certificate.private_key = SealedKey::new(key_pem);
        certificate.status = CertificateStatus::Active;

        if let Err(e) = self.repository.update_certificate(certificate.clone()).await {
            self.discard_pending(certificate.id).await;
            return Err(e.into());
        }

        info!(
            serial = %certificate.serial_number,
            "Issued {} certificate for {}",
            certificate_type,
            certificate.common_name
        );
        Ok(certificate)
    }

    async fn discard_pending(&self, certificate_id: Uuid) {
        if let Err(e) = self.repository.remove_certificate(certificate_id).await {
            warn!("Failed to discard pending certificate {}: {}", certificate_id, e);
        }
    }

    /// Revoke a certificate. Stored material is kept for the CRL.
    pub async fn revoke(&self, certificate_id: Uuid, reason: &str) -> Result<Certificate, PkiError> {
        let _guard = self.revocation_lock.lock().await;

        let mut certificate = self.repository.get_certificate(certificate_id).await?;
        if certificate.is_revoked() {
            return Err(PkiError::AlreadyRevoked(certificate.serial_number));
        }

        certificate.mark_revoked(reason, Utc::now());
        self.repository.update_certificate(certificate.clone()).await?;

        info!(
            serial = %certificate.serial_number,
            "Revoked certificate {}: {}",
            certificate.common_name,
            reason
        );
        Ok(certificate)
    }

    /// Build a PEM revocation list of every revoked certificate issued by `ca`
    pub async fn generate_crl(&self, ca: &CertificateAuthority) -> Result<String, PkiError> {
        let ca = self.repository.get_authority(ca.id).await?;
        let now = Utc::now();

        let mut revoked_certs = Vec::new();
        for certificate in self.repository.list_certificates(ca.id).await? {
            if !certificate.is_revoked() {
                continue;
            }
            let serial: Serial = certificate.serial_number.parse()?;
            revoked_certs.push(RevokedCertParams {
                serial_number: SerialNumber::from(&serial),
                revocation_time: to_offset(certificate.revoked_at.unwrap_or(now))?,
                reason_code: None,
                invalidity_date: None,
            });
        }

        debug!(
            "Building CRL for '{}' with {} revoked certificates",
            ca.name,
            revoked_certs.len()
        );

        let params = CertificateRevocationListParams {
            this_update: to_offset(now)?,
            next_update: to_offset(now + Duration::days(i64::from(self.config.crl_validity_days)))?,
            crl_number: SerialNumber::from(now.timestamp().unsigned_abs()),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };

        tokio::task::spawn_blocking(move || -> Result<String, PkiError> {
            let (issuer, issuer_key) = load_issuer(&ca)?;
            let crl = params.signed_by(&issuer, &issuer_key)?;
            Ok(crl.pem()?)
        })
        .await
        .map_err(worker_failed)?
    }

    /// Check that `certificate` names `ca` as issuer and carries its signature
    pub fn verify_issued_by(
        &self,
        ca: &CertificateAuthority,
        certificate: &Certificate,
    ) -> Result<bool, PkiError> {
        let (_, ca_pem) = parse_x509_pem(ca.certificate_pem.as_bytes())
            .map_err(|e| PkiError::InvalidMaterial(format!("CA certificate: {}", e)))?;
        let ca_cert = ca_pem
            .parse_x509()
            .map_err(|e| PkiError::InvalidMaterial(format!("CA certificate: {}", e)))?;

        let (_, leaf_pem) = parse_x509_pem(certificate.certificate_pem.as_bytes())
            .map_err(|e| PkiError::InvalidMaterial(format!("certificate: {}", e)))?;
        let leaf = leaf_pem
            .parse_x509()
            .map_err(|e| PkiError::InvalidMaterial(format!("certificate: {}", e)))?;

        if leaf.issuer().as_raw() != ca_cert.subject().as_raw() {
            return Ok(false);
        }
        Ok(leaf.verify_signature(Some(ca_cert.public_key())).is_ok())
    }

    /// Mark active certificates past `valid_until` as expired
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Certificate>, PkiError> {
        let mut expired = Vec::new();
        for mut certificate in self
            .repository
            .list_by_status(CertificateStatus::Active)
            .await?
        {
            if certificate.valid_until >= now {
                continue;
            }
            certificate.status = CertificateStatus::Expired;
            self.repository.update_certificate(certificate.clone()).await?;
            info!(
                serial = %certificate.serial_number,
                "Certificate {} expired",
                certificate.common_name
            );
            expired.push(certificate);
        }
        Ok(expired)
    }

    /// Active certificates that expire within the renewal threshold
    pub async fn due_for_renewal(&self, now: DateTime<Utc>) -> Result<Vec<Certificate>, PkiError> {
        Ok(self
            .repository
            .list_by_status(CertificateStatus::Active)
            .await?
            .into_iter()
            .filter(|cert| cert.needs_renewal(now, self.config.renewal_threshold_days))
            .collect())
    }
}

fn worker_failed(err: tokio::task::JoinError) -> PkiError {
    PkiError::Generation(format!("signing task failed: {}", err))
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime, PkiError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| PkiError::Generation(format!("timestamp out of range: {}", e)))
}

fn build_ca_certificate(
    subject: &Subject,
    serial: &Serial,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<(String, String), PkiError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = subject.to_distinguished_name();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from(serial));
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn build_leaf_certificate(
    ca: &CertificateAuthority,
    subject: &Subject,
    certificate_type: CertificateType,
    serial: &Serial,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<(String, String), PkiError> {
    let (issuer, issuer_key) = load_issuer(ca)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject.to_distinguished_name();
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = match certificate_type {
        CertificateType::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
        CertificateType::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
    };
    if certificate_type == CertificateType::Server {
        if let Ok(name) = Ia5String::try_from(subject.common_name.as_str()) {
            params.subject_alt_names = vec![SanType::DnsName(name)];
        }
    }
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(SerialNumber::from(serial));
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate()?;
    let cert = params.signed_by(&key_pair, &issuer, &issuer_key)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Rebuild the CA's signing handle from its stored certificate and key
fn load_issuer(ca: &CertificateAuthority) -> Result<(rcgen::Certificate, KeyPair), PkiError> {
    let key = KeyPair::from_pem(ca.private_key.expose())
        .map_err(|e| PkiError::InvalidMaterial(format!("CA key for '{}': {}", ca.name, e)))?;
    let params = CertificateParams::from_ca_cert_pem(&ca.certificate_pem).map_err(|e| {
        PkiError::InvalidMaterial(format!("CA certificate for '{}': {}", ca.name, e))
    })?;
    let issuer = params.self_signed(&key)?;
    Ok((issuer, key))
}
