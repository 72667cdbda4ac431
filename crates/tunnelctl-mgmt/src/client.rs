use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::ManagementError;
use crate::status::{parse_status, ConnectionInfo, ServerStats};

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// `host:port` of the management interface
    pub address: String,
    /// Budget for connect, banner, command and reply together
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7505".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Management interface client. Each call uses a fresh connection.
#[derive(Debug, Clone)]
pub struct ManagementClient {
    address: String,
    timeout: Duration,
}

impl ManagementClient {
    pub fn new(config: &ManagementConfig) -> Self {
        Self {
            address: config.address.clone(),
            timeout: config.timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one command and collect the reply lines.
    ///
    /// The terminating `END` is dropped; a terminating `SUCCESS:` or
    /// `ERROR:` line is kept so callers can inspect it.
    pub async fn send_command(&self, command: &str) -> Result<Vec<String>, ManagementError> {
        debug!("Management command: {}", command);

        match tokio::time::timeout(self.timeout, self.exchange(command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Management interface at {} timed out after {:?}",
                    self.address, self.timeout
                );
                Err(ManagementError::Timeout {
                    address: self.address.clone(),
                    after: self.timeout,
                })
            }
        }
    }

    async fn exchange(&self, command: &str) -> Result<Vec<String>, ManagementError> {
        let mut stream = TcpStream::connect(&self.address).await.map_err(|source| {
            ManagementError::Unreachable {
                address: self.address.clone(),
                source,
            }
        })?;

        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);
        let mut line = Vec::new();

        // Greeting banner
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(ManagementError::ConnectionClosed);
        }

        write_half
            .write_all(format!("{}\r\n", command).as_bytes())
            .await?;
        write_half.flush().await?;

        let mut lines = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Err(ManagementError::ConnectionClosed);
            }
            // Common names are not guaranteed to be UTF-8
            let decoded = String::from_utf8_lossy(&line);
            let text = decoded.trim_end_matches(['\r', '\n']);

            if text.starts_with('>') {
                continue;
            }
            if text == "END" {
                break;
            }
            let terminal = text.starts_with("SUCCESS:") || text.starts_with("ERROR:");
            lines.push(text.to_string());
            if terminal {
                break;
            }
        }

        Ok(lines)
    }

    /// Currently connected clients. An empty list means nobody is connected;
    /// an unreachable server is an error.
    pub async fn get_connected_clients(&self) -> Result<Vec<ConnectionInfo>, ManagementError> {
        let lines = self.send_command("status 2").await?;
        if let Some(error) = lines.iter().find(|line| line.starts_with("ERROR:")) {
            return Err(ManagementError::Rejected(error.clone()));
        }

        let clients = parse_status(&lines);
        debug!("{} clients connected", clients.len());
        Ok(clients)
    }

    /// Disconnect a client by common name. `false` when the server did not
    /// report a kill.
    pub async fn kill_client(&self, common_name: &str) -> Result<bool, ManagementError> {
        if common_name.is_empty()
            || common_name
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == '"')
        {
            return Err(ManagementError::InvalidCommonName(common_name.to_string()));
        }

        let lines = self.send_command(&format!("kill {}", common_name)).await?;
        let killed = lines
            .iter()
            .any(|line| line.contains("SUCCESS") || line.contains("client(s) killed"));

        if killed {
            info!("Tunnel client killed: {}", common_name);
        } else {
            warn!(
                "Kill for {} was not acknowledged: {}",
                common_name,
                lines.join(" | ")
            );
        }
        Ok(killed)
    }

    pub async fn get_server_stats(&self) -> Result<ServerStats, ManagementError> {
        let clients = self.get_connected_clients().await?;
        Ok(ServerStats::from_clients(&clients))
    }

    pub async fn is_client_connected(&self, common_name: &str) -> Result<bool, ManagementError> {
        Ok(self.get_client_by_cn(common_name).await?.is_some())
    }

    pub async fn get_client_by_cn(
        &self,
        common_name: &str,
    ) -> Result<Option<ConnectionInfo>, ManagementError> {
        Ok(self
            .get_connected_clients()
            .await?
            .into_iter()
            .find(|client| client.common_name == common_name))
    }

    /// Server version lines
    pub async fn version(&self) -> Result<Vec<String>, ManagementError> {
        let lines = self.send_command("version").await?;
        if let Some(error) = lines.iter().find(|line| line.starts_with("ERROR:")) {
            return Err(ManagementError::Rejected(error.clone()));
        }
        Ok(lines)
    }

    /// Reachability check; never fails, only answers `false`
    pub async fn ping(&self) -> bool {
        match self.send_command("version").await {
            Ok(_) => true,
            Err(e) => {
                debug!("Management ping failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagementConfig::default();
        assert_eq!(config.address, "127.0.0.1:7505");
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_kill_rejects_command_injection() {
        let client = ManagementClient::new(&ManagementConfig::default());
        for bad in ["", "router 1", "router\r\nsignal SIGTERM", "\"quoted\""] {
            let result = client.kill_client(bad).await;
            assert!(
                matches!(result, Err(ManagementError::InvalidCommonName(_))),
                "{:?}",
                bad
            );
        }
    }
}
