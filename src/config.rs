use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::blacklist::Blacklist;
use crate::error::{ProxyError, Result};

/// Command line interface
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Forward/reverse HTTP proxy with a disguised WebSocket tunnel",
    long_about = "umbra listens on one shared port and splits traffic by its first bytes:\n\
                  HTTP requests are proxied (absolute-form and CONNECT forward, Host-based\n\
                  reverse), everything else is terminated as a TLS+WebSocket covert channel\n\
                  that tunnels raw TCP to the target named by the upgrade path."
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// IP address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// TLS certificate chain (PEM); enables the covert tunnel together with --key
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// JSON configuration file carrying the reverse-proxy map
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Blocked IPs and domains, one entry per line
    #[arg(long)]
    pub blacklist: Option<PathBuf>,

    /// Worker threads; 0 means one per CPU
    #[arg(long, default_value_t = 0)]
    pub threads: usize,

    /// Log level for the proxy's own events (RUST_LOG overrides this)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    agent: AgentSection,
}

#[derive(Debug, Default, Deserialize)]
struct AgentSection {
    #[serde(default)]
    positive: PositiveSection,
    addressable: Option<AddressEntry>,
    #[serde(default)]
    reverse_map: HashMap<String, AddressEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct PositiveSection {
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddressEntry {
    host: String,
    port: u16,
}

/// Load the reverse-proxy map from a JSON configuration file
///
/// `agent.reverse_map` maps incoming `Host` values to fixed endpoints whose
/// `host` must be an IP literal; entries that do not parse are skipped.
/// `agent.addressable` contributes one extra entry keyed by
/// `agent.positive.host` (default `localhost`).
pub fn load_reverse_map(path: &Path) -> Result<HashMap<String, SocketAddr>> {
    let raw = fs::read_to_string(path).map_err(|err| {
        ProxyError::security(format!("cannot read config {}: {err}", path.display()))
    })?;
    let parsed: ConfigFile = serde_json::from_str(&raw).map_err(|err| {
        ProxyError::security(format!("cannot parse config {}: {err}", path.display()))
    })?;

    let agent = parsed.agent;
    let mut map = HashMap::new();

    if let Some(entry) = agent.addressable {
        match entry.host.parse::<IpAddr>() {
            Ok(ip) => {
                let key = agent
                    .positive
                    .host
                    .clone()
                    .unwrap_or_else(|| "localhost".to_string());
                map.insert(key, SocketAddr::new(ip, entry.port));
            }
            Err(_) => debug!("skipping addressable entry: host is not an IP literal"),
        }
    }

    for (incoming, entry) in agent.reverse_map {
        match entry.host.parse::<IpAddr>() {
            Ok(ip) => {
                map.insert(incoming, SocketAddr::new(ip, entry.port));
            }
            Err(_) => debug!("skipping reverse-map entry {incoming}: host is not an IP literal"),
        }
    }

    Ok(map)
}

/// Load the blacklist from a line-oriented file
///
/// Lines that parse as IP addresses go into the exact-match set, everything
/// else is a domain. Blank lines and `#` comments are ignored.
pub fn load_blacklist(path: &Path) -> Result<Blacklist> {
    let raw = fs::read_to_string(path).map_err(|err| {
        ProxyError::security(format!("cannot read blacklist {}: {err}", path.display()))
    })?;

    let mut ips = Vec::new();
    let mut domains = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.parse::<IpAddr>().is_ok() {
            ips.push(line.to_string());
        } else {
            domains.push(line.to_string());
        }
    }

    let mut blacklist = Blacklist::new();
    blacklist.load(ips, domains);
    Ok(blacklist)
}

/// Build the TLS acceptor from PEM certificate chain and private key files
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|err| {
            ProxyError::security(format!(
                "cannot read certificate {}: {err}",
                cert_path.display()
            ))
        })?
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| {
            ProxyError::security(format!(
                "cannot parse certificate {}: {err}",
                cert_path.display()
            ))
        })?;

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|err| {
        ProxyError::security(format!("cannot read key {}: {err}", key_path.display()))
    })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ProxyError::security(format!("invalid certificate/key pair: {err}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
