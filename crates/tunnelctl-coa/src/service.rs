use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::CoaError;
use crate::packet::{Attribute, Code};
use crate::transport::{RawSocketTransport, SessionControlTransport, UdpStructuredTransport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Structured,
    Raw,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoaConfig {
    /// Proxy receiving the requests (the tunnel gateway)
    pub server: String,
    pub port: u16,
    pub secret: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    pub encoder: EncoderKind,
}

impl Default for CoaConfig {
    fn default() -> Self {
        Self {
            server: "10.8.0.1".to_string(),
            port: 3799,
            secret: String::new(),
            timeout: Duration::from_secs(5),
            encoder: EncoderKind::Structured,
        }
    }
}

impl CoaConfig {
    pub fn target(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Normalize a hardware address to `AA-BB-CC-DD-EE-FF`.
///
/// Accepts `:`, `-` or `.` separators, or 12 bare hex digits.
pub fn normalize_hardware_address(mac: &str) -> Result<String, CoaError> {
    let digits: String = mac
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoaError::InvalidRequest(format!(
            "'{}' is not a hardware address",
            mac
        )));
    }

    let upper = digits.to_ascii_uppercase();
    let pairs: Vec<&str> = (0..12).step_by(2).map(|i| &upper[i..i + 2]).collect();
    Ok(pairs.join("-"))
}

/// Sends Disconnect and CoA requests. Each call is one round trip with no
/// retry; the result only says whether the proxy acknowledged.
pub struct CoaService {
    transport: Arc<dyn SessionControlTransport>,
}

impl CoaService {
    pub fn new(transport: Arc<dyn SessionControlTransport>) -> Self {
        Self { transport }
    }

    pub fn from_config(config: &CoaConfig) -> Result<Self, CoaError> {
        if config.secret.is_empty() {
            return Err(CoaError::InvalidRequest(
                "CoA shared secret is not configured".to_string(),
            ));
        }
        let target = config.target();
        let transport: Arc<dyn SessionControlTransport> = match config.encoder {
            EncoderKind::Structured => Arc::new(UdpStructuredTransport::new(
                target,
                &config.secret,
                config.timeout,
            )),
            EncoderKind::Raw => Arc::new(RawSocketTransport::new(
                target,
                &config.secret,
                config.timeout,
            )),
        };
        Ok(Self::new(transport))
    }

    pub async fn disconnect_by_identity(
        &self,
        identity: &str,
        nas_address: Option<Ipv4Addr>,
        session_id: Option<&str>,
    ) -> Result<bool, CoaError> {
        if identity.is_empty() {
            return Err(CoaError::InvalidRequest("identity is empty".to_string()));
        }

        let mut attributes = vec![Attribute::UserName(identity.to_string())];
        attributes.extend(nas_address.map(Attribute::NasIpAddress));
        if let Some(session_id) = session_id {
            attributes.push(Attribute::AcctSessionId(session_id.to_string()));
        }

        self.send(Code::DisconnectRequest, attributes, identity).await
    }

    pub async fn disconnect_by_hardware_address(
        &self,
        mac: &str,
        nas_address: Option<Ipv4Addr>,
    ) -> Result<bool, CoaError> {
        let station = normalize_hardware_address(mac)?;

        let mut attributes = vec![Attribute::CallingStationId(station.clone())];
        attributes.extend(nas_address.map(Attribute::NasIpAddress));

        self.send(Code::DisconnectRequest, attributes, &station).await
    }

    /// Replace session attributes in place. Many NAS devices ignore these;
    /// disconnecting and letting the device re-authenticate is more reliable.
    pub async fn change_session_attributes(
        &self,
        identity: &str,
        rate_limit: Option<&str>,
        session_timeout: Option<u32>,
        nas_address: Option<Ipv4Addr>,
    ) -> Result<bool, CoaError> {
        if rate_limit.is_none() && session_timeout.is_none() {
            return Err(CoaError::InvalidRequest(
                "nothing to change: give a rate limit or a session timeout".to_string(),
            ));
        }

        let mut attributes = vec![Attribute::UserName(identity.to_string())];
        attributes.extend(nas_address.map(Attribute::NasIpAddress));
        if let Some(limit) = rate_limit {
            attributes.push(Attribute::MikrotikRateLimit(limit.to_string()));
        }
        attributes.extend(session_timeout.map(Attribute::SessionTimeout));

        self.send(Code::CoaRequest, attributes, identity).await
    }

    async fn send(
        &self,
        code: Code,
        attributes: Vec<Attribute>,
        subject: &str,
    ) -> Result<bool, CoaError> {
        let outcome = self.transport.exchange(code, &attributes).await?;
        if outcome.is_acknowledged() {
            info!("{:?} acknowledged for {}", code, subject);
        } else {
            warn!("{:?} for {} not acknowledged: {:?}", code, subject, outcome);
        }
        Ok(outcome.is_acknowledged())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outcome;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Code, Vec<Attribute>)>>,
    }

    #[async_trait]
    impl SessionControlTransport for RecordingTransport {
        async fn exchange(
            &self,
            code: Code,
            attributes: &[Attribute],
        ) -> Result<Outcome, CoaError> {
            self.sent.lock().unwrap().push((code, attributes.to_vec()));
            Ok(Outcome::Acknowledged)
        }
    }

    #[test]
    fn test_normalize_hardware_address() {
        for input in [
            "aa:bb:cc:dd:ee:ff",
            "AA-BB-CC-DD-EE-FF",
            "aabb.ccdd.eeff",
            "aabbccddeeff",
        ] {
            assert_eq!(
                normalize_hardware_address(input).unwrap(),
                "AA-BB-CC-DD-EE-FF"
            );
        }
        assert!(normalize_hardware_address("aa:bb:cc").is_err());
        assert!(normalize_hardware_address("zz:bb:cc:dd:ee:ff").is_err());
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let result = CoaService::from_config(&CoaConfig::default());
        assert!(matches!(result, Err(CoaError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_disconnect_attributes() {
        let transport = Arc::new(RecordingTransport::default());
        let service = CoaService::new(transport.clone());

        assert!(service
            .disconnect_by_identity("user1", Some(Ipv4Addr::new(10, 8, 0, 10)), Some("81a0"))
            .await
            .unwrap());
        assert!(service
            .disconnect_by_hardware_address("aa:bb:cc:dd:ee:ff", None)
            .await
            .unwrap());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].0, Code::DisconnectRequest);
        assert_eq!(
            sent[0].1,
            vec![
                Attribute::UserName("user1".to_string()),
                Attribute::NasIpAddress(Ipv4Addr::new(10, 8, 0, 10)),
                Attribute::AcctSessionId("81a0".to_string()),
            ]
        );
        assert_eq!(
            sent[1].1,
            vec![Attribute::CallingStationId("AA-BB-CC-DD-EE-FF".to_string())]
        );
    }

    #[tokio::test]
    async fn test_change_requires_an_attribute() {
        let transport = Arc::new(RecordingTransport::default());
        let service = CoaService::new(transport.clone());

        let result = service
            .change_session_attributes("user1", None, None, None)
            .await;
        assert!(matches!(result, Err(CoaError::InvalidRequest(_))));

        service
            .change_session_attributes("user1", Some("5M/5M"), Some(3600), None)
            .await
            .unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Code::CoaRequest);
        assert!(sent[0]
            .1
            .contains(&Attribute::MikrotikRateLimit("5M/5M".to_string())));
        assert!(sent[0].1.contains(&Attribute::SessionTimeout(3600)));
    }
}
