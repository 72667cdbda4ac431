//! Certificate authority and certificate records

use chrono::{DateTime, Duration, Utc};
use rcgen::{DistinguishedName, DnType};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Private key material.
///
/// The PEM text is only reachable through [`SealedKey::expose`]; `Debug` and
/// `Display` never print it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedKey(String);

impl SealedKey {
    pub fn new(pem: impl Into<String>) -> Self {
        Self(pem.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedKey(<redacted>)")
    }
}

impl fmt::Display for SealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Subject fields shared by the CA and every certificate it issues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub common_name: String,
    pub organization: String,
    /// Two-letter country code
    pub country: String,
}

impl Subject {
    pub fn new(
        common_name: impl Into<String>,
        organization: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            common_name: common_name.into(),
            organization: organization.into(),
            country: country.into(),
        }
    }

    /// Same organization and country, different common name
    pub fn with_common_name(&self, common_name: &str) -> Self {
        Self {
            common_name: common_name.to_string(),
            organization: self.organization.clone(),
            country: self.country.clone(),
        }
    }

    pub(crate) fn to_distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, self.country.as_str());
        dn.push(DnType::OrganizationName, self.organization.as_str());
        dn.push(DnType::CommonName, self.common_name.as_str());
        dn
    }
}

/// A certificate authority able to sign tunnel certificates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthority {
    pub id: Uuid,
    /// Unique name used as the configuration reference
    pub name: String,
    pub subject: Subject,
    pub certificate_pem: String,
    pub private_key: SealedKey,
    pub dh_parameters: String,
    /// Shared key for tunnel packet authentication
    pub tls_auth_key: SealedKey,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl CertificateAuthority {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now <= self.valid_until
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.valid_until - now).num_days()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateType {
    Server,
    Client,
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateType::Server => f.write_str("server"),
            CertificateType::Client => f.write_str("client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Pending,
    Active,
    Revoked,
    Expired,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertificateStatus::Pending => "pending",
            CertificateStatus::Active => "active",
            CertificateStatus::Revoked => "revoked",
            CertificateStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A server or router certificate issued by a [`CertificateAuthority`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Uuid,
    pub ca_id: Uuid,
    /// External router identifier, client certificates only
    pub router_ref: Option<String>,
    pub common_name: String,
    /// Uppercase hex
    pub serial_number: String,
    pub certificate_type: CertificateType,
    pub status: CertificateStatus,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub certificate_pem: String,
    pub private_key: SealedKey,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Certificate {
    /// Active and inside its validity window
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status == CertificateStatus::Active
            && self.valid_from <= now
            && now <= self.valid_until
    }

    pub fn is_revoked(&self) -> bool {
        self.status == CertificateStatus::Revoked
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.valid_until - now).num_days()
    }

    /// Check if the certificate expires within `threshold_days`
    pub fn needs_renewal(&self, now: DateTime<Utc>, threshold_days: i64) -> bool {
        now > self.valid_until - Duration::days(threshold_days)
    }

    pub(crate) fn mark_revoked(&mut self, reason: &str, at: DateTime<Utc>) {
        self.status = CertificateStatus::Revoked;
        self.revoked_at = Some(at);
        self.revocation_reason = Some(reason.to_string());
    }
}
