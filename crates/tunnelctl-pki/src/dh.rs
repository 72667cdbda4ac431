//! Diffie-Hellman parameters for the tunnel key exchange

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::PkiError;

/// RFC 7919 `ffdhe2048` group (generator 2), PKCS#3 PEM
pub const FFDHE2048_PEM: &str = "-----BEGIN DH PARAMETERS-----
MIIBCAKCAQEA//////////+t+FRYortKmq/cViAnPTzx2LnFg84tNpWp4TZBFGQz
+8yTnc4kmz75fS/jY2MMddj2gbICrsRhetPfHtXV/WVhJDP1H18GbtCFY2VVPe0a
87VXE15/V8k1mE8McODmi3fipona8+/och3xWKE2rec1MKzKT0g6eXq8CrGCsyT7
YdEIqUuyyOP7uWrat2DX9GgdT0Kj3jlN9K5W7edjcrsZCwenyO4KbXCeAvzhzffi
7MA0BM0oNC9hkXL+nOmFg/+OTxIy7vKBg8P+OxtMb61zO7X8vC7CIAXFjvGDfRaD
ssbzSibBsu/6iGtCOGEoXJf//////////wIBAg==
-----END DH PARAMETERS-----
";

const DH_PEM_HEADER: &str = "-----BEGIN DH PARAMETERS-----";

/// Where CA creation obtains its DH parameters
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DhParamSource {
    /// Fresh safe-prime parameters from `openssl dhparam`
    Openssl {
        bits: u32,
        #[serde_as(as = "DurationSeconds<u64>")]
        timeout: Duration,
    },
    /// The published RFC 7919 group
    Ffdhe2048,
}

impl Default for DhParamSource {
    fn default() -> Self {
        DhParamSource::Openssl {
            bits: 2048,
            timeout: Duration::from_secs(300),
        }
    }
}

impl DhParamSource {
    /// Produce PEM encoded DH parameters.
    ///
    /// Runs as a child process so the runtime stays free; a timeout or a
    /// non-zero exit is a [`PkiError::Generation`].
    pub async fn generate(&self) -> Result<String, PkiError> {
        match self {
            DhParamSource::Ffdhe2048 => {
                debug!("Using RFC 7919 ffdhe2048 DH group");
                Ok(FFDHE2048_PEM.to_string())
            }
            DhParamSource::Openssl { bits, timeout } => {
                info!("Generating {}-bit DH parameters (this can take a while)", bits);

                let mut command = Command::new("openssl");
                command.arg("dhparam").arg(bits.to_string()).kill_on_drop(true);

                let output = tokio::time::timeout(*timeout, command.output())
                    .await
                    .map_err(|_| {
                        PkiError::Generation(format!(
                            "DH parameter generation timed out after {}s",
                            timeout.as_secs()
                        ))
                    })?
                    .map_err(|e| PkiError::Generation(format!("cannot run openssl: {}", e)))?;

                if !output.status.success() {
                    return Err(PkiError::Generation(format!(
                        "openssl dhparam exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }

                let pem = String::from_utf8(output.stdout).map_err(|e| {
                    PkiError::Generation(format!("openssl produced invalid output: {}", e))
                })?;
                if !pem.contains(DH_PEM_HEADER) {
                    return Err(PkiError::Generation(
                        "openssl output does not contain DH parameters".to_string(),
                    ));
                }

                Ok(pem)
            }
        }
    }
}
