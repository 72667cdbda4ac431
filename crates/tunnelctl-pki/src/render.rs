//! Tunnel configuration rendering

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::models::{Certificate, CertificateAuthority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => f.write_str("udp"),
            TransportProtocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// Where and how the tunnel server listens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerProfile {
    /// Address routers dial
    pub public_address: String,
    pub port: u16,
    pub protocol: TransportProtocol,
    pub network: Ipv4Network,
    /// Management interface the server exposes
    pub management_host: String,
    pub management_port: u16,
    pub ccd_dir: PathBuf,
    /// Directory holding ca.crt, server.crt, server.key, dh.pem and ta.key
    pub material_dir: PathBuf,
    pub max_clients: u32,
}

impl Default for ServerProfile {
    fn default() -> Self {
        Self {
            public_address: "vpn.example.net".to_string(),
            port: 1194,
            protocol: TransportProtocol::Udp,
            network: Ipv4Network::new(Ipv4Addr::new(10, 8, 0, 0), 24)
                .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(10, 8, 0, 0))),
            management_host: "127.0.0.1".to_string(),
            management_port: 7505,
            ccd_dir: PathBuf::from("/etc/openvpn/ccd"),
            material_dir: PathBuf::from("/etc/openvpn"),
            max_clients: 100,
        }
    }
}

/// Render an inline client profile for a router certificate
pub fn render_client_config(
    ca: &CertificateAuthority,
    certificate: &Certificate,
    server: &ServerProfile,
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Tunnel client configuration");
    let _ = writeln!(out, "# Common name: {}", certificate.common_name);
    if let Some(router_ref) = &certificate.router_ref {
        let _ = writeln!(out, "# Router: {}", router_ref);
    }
    let _ = writeln!(out, "# Serial: {}", certificate.serial_number);
    out.push('\n');

    let _ = writeln!(out, "client");
    let _ = writeln!(out, "dev tun");
    let _ = writeln!(out, "proto {}", server.protocol);
    let _ = writeln!(out, "remote {} {}", server.public_address, server.port);
    out.push('\n');
    out.push_str("resolv-retry infinite\nnobind\npersist-key\npersist-tun\n\n");
    out.push_str("cipher AES-256-GCM\nauth SHA256\nkey-direction 1\nremote-cert-tls server\n\n");
    out.push_str("verb 3\nmute 20\n\n");

    push_inline(&mut out, "ca", &ca.certificate_pem);
    push_inline(&mut out, "cert", &certificate.certificate_pem);
    push_inline(&mut out, "key", certificate.private_key.expose());
    push_inline(&mut out, "tls-auth", ca.tls_auth_key.expose());

    out
}

/// Render the tunnel server configuration
pub fn render_server_config(server: &ServerProfile) -> String {
    let dir = &server.material_dir;
    let mut out = String::new();

    let _ = writeln!(out, "# Tunnel server configuration");
    out.push('\n');
    let _ = writeln!(out, "port {}", server.port);
    let _ = writeln!(out, "proto {}", server.protocol);
    let _ = writeln!(out, "dev tun");
    out.push('\n');
    let _ = writeln!(out, "ca {}", dir.join("ca.crt").display());
    let _ = writeln!(out, "cert {}", dir.join("server.crt").display());
    let _ = writeln!(out, "key {}", dir.join("server.key").display());
    let _ = writeln!(out, "dh {}", dir.join("dh.pem").display());
    let _ = writeln!(out, "crl-verify {}", dir.join("crl.pem").display());
    let _ = writeln!(out, "tls-auth {} 0", dir.join("ta.key").display());
    out.push('\n');
    let _ = writeln!(
        out,
        "server {} {}",
        server.network.network(),
        server.network.mask()
    );
    out.push_str("topology subnet\nkeepalive 10 120\n\n");
    out.push_str("cipher AES-256-GCM\nauth SHA256\nuser nobody\ngroup nogroup\n");
    out.push_str("persist-key\npersist-tun\n\n");
    out.push_str("verb 3\nmute 20\n\n");
    let _ = writeln!(
        out,
        "management {} {}",
        server.management_host, server.management_port
    );
    let _ = writeln!(out, "client-config-dir {}", server.ccd_dir.display());
    let _ = writeln!(out, "max-clients {}", server.max_clients);

    out
}

fn push_inline(out: &mut String, tag: &str, body: &str) {
    let _ = writeln!(out, "<{}>", tag);
    out.push_str(body.trim_end());
    out.push('\n');
    let _ = writeln!(out, "</{}>", tag);
}
