use chrono::{Duration, Utc};
use std::sync::Arc;
use tunnelctl_pki::{
    CertificateAuthorityManager, CertificateRepository, CertificateStatus, CertificateType,
    DhParamSource, InMemoryCertificateStore, PkiConfig, PkiError, Subject,
};
use x509_parser::pem::parse_x509_pem;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn manager() -> CertificateAuthorityManager {
    init_tracing();
    let config = PkiConfig {
        dh: DhParamSource::Ffdhe2048,
        ..PkiConfig::default()
    };
    CertificateAuthorityManager::new(config, Arc::new(InMemoryCertificateStore::new()))
}

fn subject() -> Subject {
    Subject::new("Overlay Controller CA", "Overlay ISP", "KE")
}

fn crl_serials(crl_pem: &str) -> Vec<String> {
    let (_, pem) = parse_x509_pem(crl_pem.as_bytes()).unwrap();
    assert_eq!(pem.label, "X509 CRL");
    let (_, crl) = x509_parser::parse_x509_crl(&pem.contents).unwrap();
    crl.iter_revoked_certificates()
        .map(|revoked| hex::encode_upper(revoked.raw_serial()))
        .collect()
}

#[tokio::test]
async fn test_create_ca_produces_complete_material() {
    let manager = manager();
    let ca = manager.create_ca("primary", subject(), None).await.unwrap();

    assert!(ca.is_active);
    assert!(ca.certificate_pem.contains("BEGIN CERTIFICATE"));
    assert!(ca.private_key.expose().contains("PRIVATE KEY"));
    assert!(ca.dh_parameters.contains("BEGIN DH PARAMETERS"));
    assert!(ca.tls_auth_key.expose().contains("OpenVPN Static key V1"));
    assert_eq!(ca.days_until_expiry(Utc::now()), 3649);

    let (_, pem) = parse_x509_pem(ca.certificate_pem.as_bytes()).unwrap();
    let cert = pem.parse_x509().unwrap();
    assert!(cert.is_ca());
    assert_eq!(cert.subject().to_string(), cert.issuer().to_string());
    assert!(cert.subject().to_string().contains("CN=Overlay Controller CA"));
}

#[tokio::test]
async fn test_create_ca_rejects_duplicate_name() {
    let manager = manager();
    manager.create_ca("primary", subject(), None).await.unwrap();

    let result = manager.create_ca("primary", subject(), None).await;
    assert!(matches!(result, Err(PkiError::DuplicateAuthority(name)) if name == "primary"));
}

#[tokio::test]
async fn test_new_ca_demotes_previous_one() {
    let manager = manager();
    let first = manager.create_ca("first", subject(), None).await.unwrap();
    let second = manager.create_ca("second", subject(), None).await.unwrap();

    let active = manager.resolve_active_ca(None).await.unwrap();
    assert_eq!(active.id, second.id);

    let result = manager.resolve_active_ca(Some("first")).await;
    assert!(matches!(result, Err(PkiError::InactiveAuthority(_))));

    // Issuing from a demoted CA is refused
    let result = manager
        .issue_client_certificate(&first, "1", None, None)
        .await;
    assert!(matches!(result, Err(PkiError::InactiveAuthority(_))));

    manager.activate_ca("first").await.unwrap();
    assert_eq!(
        manager.resolve_active_ca(Some("first")).await.unwrap().id,
        first.id
    );
    assert!(manager.resolve_active_ca(Some("missing")).await.is_err());
}

#[tokio::test]
async fn test_client_certificate_verifies_against_ca() {
    let manager = manager();
    let ca = manager.create_ca("primary", subject(), None).await.unwrap();

    let cert = manager
        .issue_client_certificate(&ca, "7", None, None)
        .await
        .unwrap();

    assert_eq!(cert.common_name, "router_7");
    assert_eq!(cert.router_ref.as_deref(), Some("7"));
    assert_eq!(cert.certificate_type, CertificateType::Client);
    assert_eq!(cert.status, CertificateStatus::Active);
    assert_eq!(cert.serial_number.len(), 32);
    assert_eq!(cert.serial_number, cert.serial_number.to_uppercase());
    assert!(manager.verify_issued_by(&ca, &cert).unwrap());

    // Signature does not verify against an unrelated CA
    let other = manager.create_ca("other", subject(), None).await.unwrap();
    assert!(!manager.verify_issued_by(&other, &cert).unwrap());

    let (_, pem) = parse_x509_pem(cert.certificate_pem.as_bytes()).unwrap();
    let x509 = pem.parse_x509().unwrap();
    assert!(!x509.is_ca());
    assert_eq!(hex::encode_upper(x509.raw_serial()), cert.serial_number);
    let eku = x509.extended_key_usage().unwrap().unwrap().value;
    assert!(eku.client_auth);
    assert!(!eku.server_auth);
}

#[tokio::test]
async fn test_server_certificate_loads_into_rustls() {
    let manager = manager();
    let ca = manager.create_ca("primary", subject(), None).await.unwrap();

    let cert = manager
        .issue_server_certificate(&ca, "vpn.example.net", None)
        .await
        .unwrap();
    assert_eq!(cert.certificate_type, CertificateType::Server);
    assert!(cert.router_ref.is_none());
    assert!(cert.valid_until - cert.valid_from >= Duration::days(825));

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert.certificate_pem.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut cert.private_key.expose().as_bytes())
        .unwrap()
        .unwrap();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key);
    assert!(server_config.is_ok());
}

#[tokio::test]
async fn test_revoke_twice_is_rejected_without_changing_state() {
    let manager = manager();
    let ca = manager.create_ca("primary", subject(), None).await.unwrap();
    let cert = manager
        .issue_client_certificate(&ca, "3", None, None)
        .await
        .unwrap();

    let revoked = manager.revoke(cert.id, "compromised").await.unwrap();
    assert_eq!(revoked.status, CertificateStatus::Revoked);

    let second = manager.revoke(cert.id, "again").await;
    assert!(matches!(second, Err(PkiError::AlreadyRevoked(_))));

    let stored = manager.repository().get_certificate(cert.id).await.unwrap();
    assert_eq!(stored.revocation_reason.as_deref(), Some("compromised"));
    assert_eq!(stored.revoked_at, revoked.revoked_at);
    assert!(!stored.certificate_pem.is_empty());
}

#[tokio::test]
async fn test_crl_lists_only_revoked_serials() {
    let manager = manager();
    let ca = manager.create_ca("primary", subject(), None).await.unwrap();

    let revoked = manager
        .issue_client_certificate(&ca, "1", None, None)
        .await
        .unwrap();
    let active = manager
        .issue_client_certificate(&ca, "2", None, None)
        .await
        .unwrap();
    manager.revoke(revoked.id, "lost").await.unwrap();

    let crl = manager.generate_crl(&ca).await.unwrap();
    let serials = crl_serials(&crl);

    assert_eq!(serials, vec![revoked.serial_number.clone()]);
    assert!(!serials.contains(&active.serial_number));
}

#[tokio::test]
async fn test_empty_crl_is_signed_by_ca() {
    let manager = manager();
    let ca = manager.create_ca("primary", subject(), None).await.unwrap();

    let crl = manager.generate_crl(&ca).await.unwrap();
    assert!(crl_serials(&crl).is_empty());

    let (_, pem) = parse_x509_pem(crl.as_bytes()).unwrap();
    let (_, parsed) = x509_parser::parse_x509_crl(&pem.contents).unwrap();
    assert!(parsed.issuer().to_string().contains("CN=Overlay Controller CA"));

    let next_update = parsed.next_update().unwrap().timestamp();
    let this_update = parsed.last_update().timestamp();
    assert_eq!(next_update - this_update, 7 * 24 * 60 * 60);
}

#[tokio::test]
async fn test_active_common_name_is_unique() {
    let manager = manager();
    let ca = manager.create_ca("primary", subject(), None).await.unwrap();

    let first = manager
        .issue_client_certificate(&ca, "9", Some("router-nine"), None)
        .await
        .unwrap();
    let duplicate = manager
        .issue_client_certificate(&ca, "9", Some("router-nine"), None)
        .await;
    assert!(matches!(duplicate, Err(PkiError::Storage(_))));

    // Failed issuance leaves no pending record behind
    let records = manager.repository().list_certificates(ca.id).await.unwrap();
    assert_eq!(records.len(), 1);

    manager.revoke(first.id, "rotated").await.unwrap();
    manager
        .issue_client_certificate(&ca, "9", Some("router-nine"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_expire_stale_marks_only_past_certificates() {
    let manager = manager();
    let ca = manager.create_ca("primary", subject(), None).await.unwrap();

    let short = manager
        .issue_client_certificate(&ca, "1", None, Some(1))
        .await
        .unwrap();
    let long = manager
        .issue_client_certificate(&ca, "2", None, None)
        .await
        .unwrap();

    let expired = manager
        .expire_stale(Utc::now() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, short.id);

    let stored = manager.repository().get_certificate(long.id).await.unwrap();
    assert_eq!(stored.status, CertificateStatus::Active);

    let due = manager
        .due_for_renewal(Utc::now() + Duration::days(340))
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, long.id);
}
