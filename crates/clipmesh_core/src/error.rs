use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClipError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error(transparent)]
    Trust(#[from] KeyMismatch),

    #[error("clipboard error: {0}")]
    Clipboard(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ClipError>;

/// A peer presented a static key that does not match the one pinned in the
/// trust store. Never auto-remediated; the operator must remove the stale
/// entry by hand.
#[derive(Debug, Clone)]
pub struct KeyMismatch {
    pub address: String,
    pub expected_key: Vec<u8>,
    pub actual_key: Vec<u8>,
    pub store_path: std::path::PathBuf,
}

impl fmt::Display for KeyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\n@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\n\
             @    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @\n\
             @@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\n\
             Someone could be eavesdropping on you right now (man-in-the-middle attack)!\n\
             It is also possible that the peer's host key has just been changed.\n\
             \n\
             Host: {}\n\
             Expected key: {}\n\
             Received key: {}\n\
             \n\
             To accept the new key, remove the old entry from:\n  {}\n\
             \n\
             Connection refused.",
            self.address,
            BASE64.encode(&self.expected_key),
            BASE64.encode(&self.actual_key),
            self.store_path.display(),
        )
    }
}

impl std::error::Error for KeyMismatch {}
