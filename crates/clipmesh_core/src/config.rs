use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ClipError, Result};

/// Marks an endpoint as Noise-encrypted in the peer specification.
pub const NOISE_PREFIX: &str = "noise:";

pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// One reachable address of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host_port: String,
    pub encrypted: bool,
}

/// One logical remote peer, possibly reachable via several interchangeable
/// addresses (e.g. LAN and VPN).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    /// Friendly name, derived from the first endpoint.
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

impl PeerSpec {
    pub fn uses_crypto(&self) -> bool {
        self.endpoints.iter().any(|e| e.encrypted)
    }
}

/// Parses the peer specification:
///
/// ```text
/// peers    := peer ("," peer)*
/// peer     := endpoint ("|" endpoint)*
/// endpoint := ["noise:"] host ":" port
/// ```
///
/// Whitespace around tokens is trimmed; empty entries are skipped.
pub fn parse_peers(peers: &str) -> Vec<PeerSpec> {
    let mut specs = Vec::new();

    for peer in peers.split(',') {
        let peer = peer.trim();
        if peer.is_empty() {
            continue;
        }

        let mut endpoints = Vec::new();
        for addr in peer.split('|') {
            let addr = addr.trim();
            if addr.is_empty() {
                continue;
            }

            match addr.strip_prefix(NOISE_PREFIX) {
                Some(actual) => endpoints.push(Endpoint {
                    host_port: actual.to_string(),
                    encrypted: true,
                }),
                None => endpoints.push(Endpoint {
                    host_port: addr.to_string(),
                    encrypted: false,
                }),
            }
        }

        if let Some(first) = endpoints.first() {
            let name = if first.encrypted {
                format!("{}{}", NOISE_PREFIX, first.host_port)
            } else {
                first.host_port.clone()
            };
            specs.push(PeerSpec { name, endpoints });
        }
    }

    specs
}

/// True iff any configured endpoint requires the encrypted transport, which
/// means the node must load its identity keypair and trust store.
pub fn uses_crypto(specs: &[PeerSpec]) -> bool {
    specs.iter().any(PeerSpec::uses_crypto)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_name: String,
    pub port: u16,
    pub peers: String,
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            port: DEFAULT_PORT,
            peers: String::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join("clipmesh"))
            .ok_or_else(|| ClipError::Config("unable to determine config directory".to_string()))
    }

    pub async fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub async fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let permissions = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(dir, permissions)?;
            }
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| ClipError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, contents).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, permissions)?;
        }

        Ok(())
    }
}
