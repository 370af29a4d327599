use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::info;

use crate::error::{ClipError, Result};
use crate::noise;

pub const KEY_SIZE: usize = 32;
const IDENTITY_FILE: &str = "identity.key";

/// Long-lived Curve25519 static keypair identifying this node to its peers.
#[derive(Clone)]
pub struct Identity {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("private", &"[REDACTED]")
            .field("public", &self.fingerprint())
            .finish()
    }
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let keypair = noise::builder()?
            .generate_keypair()
            .map_err(|e| ClipError::Handshake(format!("failed to generate keypair: {}", e)))?;

        Ok(Self {
            private: keypair.private,
            public: keypair.public,
        })
    }

    /// Loads the identity from `identity.key` in the config directory, or
    /// generates and persists a fresh one. The file is 64 raw bytes,
    /// private key followed by public key, owner-only permissions. A file of
    /// the wrong size is a fatal startup error, not something to overwrite.
    pub fn load_or_create(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let key_path = config_dir.join(IDENTITY_FILE);

        match std::fs::read(&key_path) {
            Ok(data) => {
                if data.len() != KEY_SIZE * 2 {
                    return Err(ClipError::Config(format!(
                        "invalid {} size: expected {}, got {}",
                        IDENTITY_FILE,
                        KEY_SIZE * 2,
                        data.len()
                    )));
                }
                Ok(Self {
                    private: data[..KEY_SIZE].to_vec(),
                    public: data[KEY_SIZE..].to_vec(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate()?;
                identity.save(&key_path)?;
                info!(
                    "generated new identity {} at {}",
                    identity.fingerprint(),
                    key_path.display()
                );
                Ok(identity)
            }
            Err(e) => Err(ClipError::Io(e)),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut data = Vec::with_capacity(KEY_SIZE * 2);
        data.extend_from_slice(&self.private);
        data.extend_from_slice(&self.public);
        std::fs::write(path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public)
    }
}

/// Short base64 fingerprint of a public key, for logs.
pub fn fingerprint(public_key: &[u8]) -> String {
    if public_key.len() < 8 {
        return BASE64.encode(public_key);
    }
    BASE64.encode(&public_key[..8])[..12].to_string()
}
