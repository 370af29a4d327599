use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// How recently a digest must have been seen for `is_seen_recent` to fire.
pub const SEEN_WINDOW: Duration = Duration::from_secs(5);

/// Entries older than this are dropped by the sweeper. Kept well above the
/// query window.
pub const SWEEP_WINDOW: Duration = Duration::from_secs(30);

/// Interval between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Short-TTL set of recently observed content digests, consulted on both the
/// send and receive paths to break feedback loops between peers.
#[derive(Default)]
pub struct SeenCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl SeenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a digest was observed now.
    pub async fn mark(&self, digest: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(digest.to_string(), Instant::now());
    }

    /// True iff the digest was marked within the last 5 seconds.
    pub async fn is_seen_recent(&self, digest: &str) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(digest) {
            Some(at) => at.elapsed() <= SEEN_WINDOW,
            None => false,
        }
    }

    /// Drops entries older than the sweep window. Called from the sweeper
    /// task; cheap enough to run inline in tests.
    pub async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, at| at.elapsed() <= SWEEP_WINDOW);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn recent_digests_are_seen() {
        let cache = SeenCache::new();
        cache.mark("abc").await;

        assert!(cache.is_seen_recent("abc").await);
        assert!(!cache.is_seen_recent("other").await);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.is_seen_recent("abc").await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.is_seen_recent("abc").await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_the_window_but_bounds_memory() {
        let cache = SeenCache::new();
        cache.mark("old").await;

        tokio::time::advance(Duration::from_secs(10)).await;
        cache.mark("fresh").await;

        // "old" is past the query window but within the sweep window.
        cache.sweep().await;
        assert_eq!(cache.len().await, 2);

        tokio::time::advance(Duration::from_secs(25)).await;
        cache.sweep().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remark_refreshes_the_window() {
        let cache = SeenCache::new();
        cache.mark("abc").await;

        tokio::time::advance(Duration::from_secs(4)).await;
        cache.mark("abc").await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.is_seen_recent("abc").await);
    }
}
