use std::sync::Arc;

use copypasta::{ClipboardContext, ClipboardProvider};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ClipError, Result};

/// Identifies the type of clipboard content. The wire values double as frame
/// kind bytes; 0x00 is reserved for the encrypted-transport discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentKind {
    Text = 0x01,
    Image = 0x02,
}

impl ContentKind {
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(ContentKind::Text),
            0x02 => Ok(ContentKind::Image),
            0x00 => Err(ClipError::Protocol(
                "frame kind 0x00 is reserved".to_string(),
            )),
            other => Err(ClipError::Protocol(format!(
                "unknown frame kind: {:#04x}",
                other
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
        }
    }
}

/// Clipboard data with its type and content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardContent {
    pub kind: ContentKind,
    pub data: Vec<u8>,
    pub digest: String,
}

impl ClipboardContent {
    pub fn new(kind: ContentKind, data: Vec<u8>) -> Self {
        let digest = digest(&data);
        Self { kind, data, digest }
    }

    pub fn text(s: &str) -> Self {
        Self::new(ContentKind::Text, s.as_bytes().to_vec())
    }
}

/// Hex SHA-256 of the content bytes. The kind does not participate, so the
/// same bytes arriving as text or image dedup against each other.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Platform clipboard seen through a narrow interface: read, write, and a
/// last-broadcast-digest hint used by the poller for change detection.
#[async_trait::async_trait]
pub trait ClipboardAdapter: Send + Sync {
    async fn read(&self) -> Result<ClipboardContent>;
    async fn write(&self, content: &ClipboardContent) -> Result<()>;
    async fn last_digest(&self) -> Option<String>;
    async fn set_last_digest(&self, digest: &str);
}

/// System clipboard backend. Text only; image frames received from peers are
/// surfaced as a clipboard error, which the reader logs and skips.
pub struct SystemClipboard {
    context: Arc<Mutex<ClipboardContext>>,
    last_digest: Mutex<Option<String>>,
}

impl SystemClipboard {
    pub fn new() -> Result<Self> {
        let context = ClipboardContext::new().map_err(|e| {
            ClipError::Clipboard(format!("failed to create clipboard context: {}", e))
        })?;

        Ok(Self {
            context: Arc::new(Mutex::new(context)),
            last_digest: Mutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl ClipboardAdapter for SystemClipboard {
    async fn read(&self) -> Result<ClipboardContent> {
        let mut ctx = self.context.lock().await;
        let text = ctx
            .get_contents()
            .map_err(|e| ClipError::Clipboard(format!("failed to read clipboard: {}", e)))?;
        Ok(ClipboardContent::text(&text))
    }

    async fn write(&self, content: &ClipboardContent) -> Result<()> {
        match content.kind {
            ContentKind::Text => {
                let text = String::from_utf8(content.data.clone()).map_err(|e| {
                    ClipError::Clipboard(format!("received text is not valid UTF-8: {}", e))
                })?;
                let mut ctx = self.context.lock().await;
                ctx.set_contents(text).map_err(|e| {
                    ClipError::Clipboard(format!("failed to set clipboard: {}", e))
                })?;
            }
            ContentKind::Image => {
                return Err(ClipError::Clipboard(
                    "image content is not supported by this clipboard backend".to_string(),
                ));
            }
        }

        let mut last = self.last_digest.lock().await;
        *last = Some(content.digest.clone());

        debug!("set clipboard contents: {} bytes", content.data.len());
        Ok(())
    }

    async fn last_digest(&self) -> Option<String> {
        self.last_digest.lock().await.clone()
    }

    async fn set_last_digest(&self, digest: &str) {
        let mut last = self.last_digest.lock().await;
        *last = Some(digest.to_string());
    }
}

/// In-memory adapter used by tests and headless environments.
#[derive(Default)]
pub struct MemoryClipboard {
    current: Mutex<Option<ClipboardContent>>,
    last_digest: Mutex<Option<String>>,
    writes: Mutex<Vec<ClipboardContent>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a local copy: replaces the current content without touching
    /// the last-digest hint, exactly as a user copy would.
    pub async fn set_text(&self, text: &str) {
        let mut current = self.current.lock().await;
        *current = Some(ClipboardContent::text(text));
    }

    /// Everything peers have written to this clipboard, oldest first.
    pub async fn writes(&self) -> Vec<ClipboardContent> {
        self.writes.lock().await.clone()
    }

    pub async fn current(&self) -> Option<ClipboardContent> {
        self.current.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ClipboardAdapter for MemoryClipboard {
    async fn read(&self) -> Result<ClipboardContent> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(content) => Ok(content.clone()),
            None => Ok(ClipboardContent::text("")),
        }
    }

    async fn write(&self, content: &ClipboardContent) -> Result<()> {
        let mut current = self.current.lock().await;
        *current = Some(content.clone());
        drop(current);

        self.writes.lock().await.push(content.clone());

        let mut last = self.last_digest.lock().await;
        *last = Some(content.digest.clone());
        Ok(())
    }

    async fn last_digest(&self) -> Option<String> {
        self.last_digest.lock().await.clone()
    }

    async fn set_last_digest(&self, digest: &str) {
        let mut last = self.last_digest.lock().await;
        *last = Some(digest.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_content_addressed() {
        let a = ClipboardContent::text("hello");
        let b = ClipboardContent::new(ContentKind::Image, b"hello".to_vec());

        // The kind does not participate in the digest.
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);
        assert_ne!(a.digest, ClipboardContent::text("world").digest);
    }

    #[test]
    fn wire_kinds() {
        assert_eq!(ContentKind::from_wire(0x01).unwrap(), ContentKind::Text);
        assert_eq!(ContentKind::from_wire(0x02).unwrap(), ContentKind::Image);
        assert!(ContentKind::from_wire(0x00).is_err());
        assert!(ContentKind::from_wire(0x42).is_err());
    }

    #[tokio::test]
    async fn memory_clipboard_tracks_writes_and_digest() {
        let clipboard = MemoryClipboard::new();

        let content = ClipboardContent::text("synced");
        clipboard.write(&content).await.unwrap();

        assert_eq!(clipboard.read().await.unwrap(), content);
        assert_eq!(clipboard.last_digest().await, Some(content.digest.clone()));
        assert_eq!(clipboard.writes().await.len(), 1);

        // A local copy does not update the last-digest hint.
        clipboard.set_text("copied locally").await;
        assert_eq!(clipboard.last_digest().await, Some(content.digest));
    }
}
