//! Relay message deduplication
//!
//! A reconnecting Redis subscriber replays the catch-up stream from slightly
//! before the disconnect, so the same message id can arrive twice. Ids seen
//! within the window are skipped.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Message deduplicator with periodic cleanup
#[derive(Clone)]
pub struct MessageDeduplicator {
    /// message id -> expiry
    entries: Arc<DashMap<String, Instant>>,
    dedup_window: Duration,
}

impl MessageDeduplicator {
    #[must_use]
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            dedup_window,
        }
    }

    /// Start the cleanup task; it stops when `cancel` fires
    pub fn spawn_cleanup(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let dedup = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => dedup.cleanup_expired(),
                }
            }
            debug!("Dedup cleanup task stopped");
        })
    }

    /// Whether `message_id` is new within the window; records it if so
    #[must_use]
    pub fn should_process(&self, message_id: &str) -> bool {
        let now = Instant::now();

        if let Some(mut expires_at) = self.entries.get_mut(message_id) {
            if *expires_at > now {
                return false;
            }
            *expires_at = now + self.dedup_window;
            return true;
        }

        self.entries
            .insert(message_id.to_string(), now + self.dedup_window);
        true
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expires_at| *expires_at > now);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window_skipped() {
        let dedup = MessageDeduplicator::default();

        assert!(dedup.should_process("m-1"));
        assert!(!dedup.should_process("m-1"));
        assert!(dedup.should_process("m-2"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_expired_entry_processed_again() {
        let dedup = MessageDeduplicator::new(Duration::from_millis(10));

        assert!(dedup.should_process("m-1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(dedup.should_process("m-1"));
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let dedup = MessageDeduplicator::new(Duration::from_millis(10));
        assert!(dedup.should_process("m-1"));
        std::thread::sleep(Duration::from_millis(20));

        dedup.cleanup_expired();
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_cancel() {
        let dedup = MessageDeduplicator::default();
        let cancel = CancellationToken::new();
        let task = dedup.spawn_cleanup(Duration::from_millis(5), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
