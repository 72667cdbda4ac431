//! Parser for `status 2` replies
//!
//! ```text
//! HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,...,Bytes Received,Bytes Sent,Connected Since,Connected Since (time_t),...
//! CLIENT_LIST,router-1,203.0.113.9:51820,10.8.0.10,,5120,2048,2024-05-01 10:00:00,1714557600,...
//! HEADER,ROUTING_TABLE,Virtual Address,Common Name,Real Address,Last Ref,Last Ref (time_t)
//! ROUTING_TABLE,10.8.0.10,router-1,203.0.113.9:51820,2024-05-01 10:05:00,1714557900
//! GLOBAL_STATS,Max bcast/mcast queue length,0
//! END
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::trace;

/// A connected client as observed through the management interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub common_name: String,
    /// Remote endpoint, `host:port`
    pub real_address: String,
    /// From the routing table; `None` when the table has no entry
    pub virtual_address: Option<IpAddr>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_since: String,
    pub connected_since_epoch: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub connected_clients: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ServerStats {
    pub fn from_clients(clients: &[ConnectionInfo]) -> Self {
        Self {
            connected_clients: clients.len(),
            bytes_in: clients.iter().map(|c| c.bytes_received).sum(),
            bytes_out: clients.iter().map(|c| c.bytes_sent).sum(),
        }
    }
}

const COMMON_NAME: &str = "Common Name";
const REAL_ADDRESS: &str = "Real Address";
const VIRTUAL_ADDRESS: &str = "Virtual Address";
const BYTES_RECEIVED: &str = "Bytes Received";
const BYTES_SENT: &str = "Bytes Sent";
const CONNECTED_SINCE: &str = "Connected Since";
const CONNECTED_SINCE_EPOCH: &str = "Connected Since (time_t)";

/// Field positions within a record, record tag at index 0
struct Columns(HashMap<String, usize>);

impl Columns {
    fn from_header(fields: &[&str]) -> Self {
        // fields: HEADER, <TAG>, <column names...>
        Columns(
            fields
                .iter()
                .enumerate()
                .skip(2)
                .map(|(index, name)| (name.to_string(), index - 1))
                .collect(),
        )
    }

    fn client_list_default() -> Self {
        Self::positional(&[
            COMMON_NAME,
            REAL_ADDRESS,
            VIRTUAL_ADDRESS,
            "Virtual IPv6 Address",
            BYTES_RECEIVED,
            BYTES_SENT,
            CONNECTED_SINCE,
            CONNECTED_SINCE_EPOCH,
        ])
    }

    fn routing_table_default() -> Self {
        Self::positional(&[VIRTUAL_ADDRESS, COMMON_NAME, REAL_ADDRESS, "Last Ref"])
    }

    fn positional(names: &[&str]) -> Self {
        Columns(
            names
                .iter()
                .enumerate()
                .map(|(index, name)| (name.to_string(), index + 1))
                .collect(),
        )
    }

    fn get<'a>(&self, record: &[&'a str], name: &str) -> Option<&'a str> {
        self.0
            .get(name)
            .and_then(|index| record.get(*index))
            .map(|value| value.trim())
    }
}

/// Parse a status reply into one record per connected client.
///
/// Clients are joined with the routing table by common name. A client with
/// no routing entry keeps `virtual_address: None`. When a client owns several
/// routes (host iroutes), the one matching the address its client-list row
/// reports wins, else the first listed. Lines that are neither headers nor
/// known records are ignored.
pub fn parse_status<S: AsRef<str>>(lines: &[S]) -> Vec<ConnectionInfo> {
    let mut client_columns = Columns::client_list_default();
    let mut routing_columns = Columns::routing_table_default();

    let mut clients: Vec<ConnectionInfo> = Vec::new();
    let mut reported: HashMap<String, IpAddr> = HashMap::new();
    let mut routes: HashMap<String, Vec<IpAddr>> = HashMap::new();

    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() || line.starts_with('>') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();

        match fields.first().copied() {
            Some("HEADER") => match fields.get(1).copied() {
                Some("CLIENT_LIST") => client_columns = Columns::from_header(&fields),
                Some("ROUTING_TABLE") => routing_columns = Columns::from_header(&fields),
                _ => {}
            },
            Some("CLIENT_LIST") => {
                let Some(common_name) = client_columns.get(&fields, COMMON_NAME) else {
                    continue;
                };
                if common_name.is_empty() || common_name == "UNDEF" {
                    continue;
                }
                let number = |name: &str| {
                    client_columns
                        .get(&fields, name)
                        .and_then(|value| value.parse::<u64>().ok())
                        .unwrap_or(0)
                };
                let info = ConnectionInfo {
                    common_name: common_name.to_string(),
                    real_address: client_columns
                        .get(&fields, REAL_ADDRESS)
                        .unwrap_or_default()
                        .to_string(),
                    virtual_address: None,
                    bytes_received: number(BYTES_RECEIVED),
                    bytes_sent: number(BYTES_SENT),
                    connected_since: client_columns
                        .get(&fields, CONNECTED_SINCE)
                        .unwrap_or_default()
                        .to_string(),
                    connected_since_epoch: client_columns
                        .get(&fields, CONNECTED_SINCE_EPOCH)
                        .and_then(|value| value.parse().ok()),
                };
                let listed = client_columns
                    .get(&fields, VIRTUAL_ADDRESS)
                    .and_then(|value| value.parse::<IpAddr>().ok());
                if let Some(address) = listed {
                    reported.insert(info.common_name.clone(), address);
                } else {
                    reported.remove(&info.common_name);
                }
                match clients.iter_mut().find(|c| c.common_name == info.common_name) {
                    Some(existing) => *existing = info,
                    None => clients.push(info),
                }
            }
            Some("ROUTING_TABLE") => {
                let common_name = routing_columns.get(&fields, COMMON_NAME);
                let address = routing_columns
                    .get(&fields, VIRTUAL_ADDRESS)
                    .and_then(|value| value.parse::<IpAddr>().ok());
                match (common_name, address) {
                    (Some(common_name), Some(address)) => {
                        routes.entry(common_name.to_string()).or_default().push(address);
                    }
                    _ => trace!("Skipping routing entry: {}", line),
                }
            }
            _ => {}
        }
    }

    for client in &mut clients {
        let Some(candidates) = routes.get(&client.common_name) else {
            continue;
        };
        let preferred = reported
            .get(&client.common_name)
            .filter(|address| candidates.contains(address));
        client.virtual_address = preferred.or(candidates.first()).copied();
    }
    clients
}
