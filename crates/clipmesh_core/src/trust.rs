use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::{ClipError, KeyMismatch, Result};
use crate::identity::KEY_SIZE;

const STORE_FILE: &str = "known_hosts";

/// A trusted peer's pinned static public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedHost {
    /// Address aliases, pipe-separated on disk. All map to the same key.
    pub addresses: Vec<String>,
    pub public_key: Vec<u8>,
    pub first_seen: DateTime<Utc>,
    pub comment: Option<String>,
}

/// Persistent trust-on-first-use store of peer public keys, keyed by
/// normalized `host:port`. The first key seen at an address is pinned;
/// a later mismatch is an alarm, never an update.
pub struct TrustStore {
    hosts: RwLock<HashMap<String, Arc<TrustedHost>>>,
    path: PathBuf,
    save_lock: Mutex<()>,
}

fn normalize_addr(addr: &str) -> String {
    addr.trim().to_lowercase()
}

impl TrustStore {
    /// Loads the known-hosts file from the config directory, creating an
    /// empty store if the file does not exist. Malformed lines are skipped
    /// with a warning so one bad entry cannot lock the node out.
    pub async fn load(config_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(config_dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let path = config_dir.join(STORE_FILE);
        let mut hosts = HashMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (line_num, line) in contents.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }

                    match parse_line(line) {
                        Ok(host) => {
                            let host = Arc::new(host);
                            for addr in &host.addresses {
                                hosts.insert(normalize_addr(addr), Arc::clone(&host));
                            }
                        }
                        Err(e) => {
                            warn!(
                                "skipping malformed line {} in {}: {}",
                                line_num + 1,
                                path.display(),
                                e
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ClipError::Io(e)),
        }

        Ok(Self {
            hosts: RwLock::new(hosts),
            path,
            save_lock: Mutex::new(()),
        })
    }

    /// Checks a peer's static key against the pinned entry for its address.
    ///
    /// First contact pins the key and persists the store. A matching key is
    /// fine. A different key refuses the connection with a loud error; the
    /// store is never auto-updated.
    pub async fn verify(&self, addr: &str, public_key: &[u8]) -> Result<()> {
        let existing = {
            let hosts = self.hosts.read().await;
            hosts.get(&normalize_addr(addr)).cloned()
        };

        match existing {
            None => self.add(vec![addr.to_string()], public_key).await,
            Some(host) if host.public_key == public_key => Ok(()),
            Some(host) => Err(KeyMismatch {
                address: addr.to_string(),
                expected_key: host.public_key.clone(),
                actual_key: public_key.to_vec(),
                store_path: self.path.clone(),
            }
            .into()),
        }
    }

    /// Pins a new peer key (first contact) and persists the store.
    pub async fn add(&self, addresses: Vec<String>, public_key: &[u8]) -> Result<()> {
        let host = Arc::new(TrustedHost {
            addresses: addresses.clone(),
            public_key: public_key.to_vec(),
            first_seen: Utc::now(),
            comment: None,
        });

        {
            let mut hosts = self.hosts.write().await;
            for addr in &addresses {
                hosts.insert(normalize_addr(addr), Arc::clone(&host));
            }
        }

        self.save().await
    }

    pub async fn lookup(&self, addr: &str) -> Option<Arc<TrustedHost>> {
        let hosts = self.hosts.read().await;
        hosts.get(&normalize_addr(addr)).cloned()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self) -> Result<()> {
        // Aliases share one record; write each record once.
        let records: Vec<Arc<TrustedHost>> = {
            let hosts = self.hosts.read().await;
            let mut seen: Vec<Arc<TrustedHost>> = Vec::new();
            for host in hosts.values() {
                if !seen.iter().any(|h| Arc::ptr_eq(h, host)) {
                    seen.push(Arc::clone(host));
                }
            }
            seen
        };

        let mut out = String::new();
        out.push_str("# clipmesh known hosts\n");
        out.push_str("# Format: address(es) public-key-base64 timestamp [comment]\n\n");

        for host in records {
            out.push_str(&host.addresses.join("|"));
            out.push(' ');
            out.push_str(&BASE64.encode(&host.public_key));
            out.push(' ');
            out.push_str(&host.first_seen.to_rfc3339_opts(SecondsFormat::Secs, true));
            if let Some(comment) = &host.comment {
                out.push(' ');
                out.push_str(comment);
            }
            out.push('\n');
        }

        let _guard = self.save_lock.lock().await;
        tokio::fs::write(&self.path, out).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

/// Parses one `address(es) key [timestamp] [comment]` line.
fn parse_line(line: &str) -> Result<TrustedHost> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(ClipError::Config(
            "need at least an address and a key".to_string(),
        ));
    }

    let addresses: Vec<String> = fields[0].split('|').map(str::to_string).collect();

    let public_key = BASE64
        .decode(fields[1])
        .map_err(|e| ClipError::Config(format!("invalid public key: {}", e)))?;
    if public_key.len() != KEY_SIZE {
        return Err(ClipError::Config(format!(
            "invalid public key length: {}",
            public_key.len()
        )));
    }

    let mut first_seen = Utc::now();
    let mut comment = None;

    if fields.len() >= 3 {
        match DateTime::parse_from_rfc3339(fields[2]) {
            Ok(t) => {
                first_seen = t.with_timezone(&Utc);
                if fields.len() >= 4 {
                    comment = Some(fields[3..].join(" "));
                }
            }
            // No timestamp; the remainder is a comment.
            Err(_) => comment = Some(fields[2..].join(" ")),
        }
    }

    Ok(TrustedHost {
        addresses,
        public_key,
        first_seen,
        comment,
    })
}
