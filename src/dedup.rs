//! # Dedup Cache
//!
//! Short-lived record of message IDs published during this process lifetime.
//! It only absorbs accidental double-sends (for example a broker ack that
//! arrives just before the outbox write fails); the outbox `sent` flag stays
//! the correctness mechanism.
//!
//! ## Eviction
//! - entries older than the TTL no longer count as seen and are dropped by
//!   [`DedupCache::prune`]
//! - reaching the size cap flushes the whole cache before the next insert
//!
//! ## Message IDs
//! IDs come from the payload through an [`IdExtractor`]. The default reads a
//! JSON pointer (`/data/id`); payloads without an ID are never cached.

use crate::config::DedupSettings;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct DedupCache {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_settings(settings: &DedupSettings) -> Self {
        Self::new(settings.ttl(), settings.max_entries)
    }

    // The cache is advisory, so a poisoned lock just keeps its data.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `id` was recorded less than one TTL ago.
    pub fn contains(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        self.entries()
            .get(id)
            .is_some_and(|seen_at| seen_at.elapsed() < self.ttl)
    }

    /// Records `id` as published now. Empty IDs are ignored.
    pub fn insert(&self, id: &str) {
        if id.is_empty() {
            return;
        }
        let mut entries = self.entries();
        if entries.len() >= self.max_entries && !entries.contains_key(id) {
            warn!(
                "Dedup cache reached {} entries, flushing",
                self.max_entries
            );
            entries.clear();
        }
        entries.insert(id.to_string(), Instant::now());
    }

    /// Drops expired entries and returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, seen_at| seen_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prunes the cache every `interval` until `token` is cancelled.
    pub fn spawn_pruner(
        self: Arc<Self>,
        token: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.prune();
                        if removed > 0 {
                            debug!("Pruned {} dedup entries", removed);
                        }
                    }
                }
            }
        })
    }
}

/// Pulls an application-level message ID out of a payload.
pub trait IdExtractor: Send + Sync {
    fn extract(&self, payload: &[u8]) -> Option<String>;
}

/// Reads the ID at a JSON pointer such as `/data/id`.
///
/// String and number values are accepted, anything else yields no ID.
#[derive(Debug, Clone)]
pub struct JsonPointerExtractor {
    pointer: String,
}

impl JsonPointerExtractor {
    pub fn new(pointer: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
        }
    }
}

impl IdExtractor for JsonPointerExtractor {
    fn extract(&self, payload: &[u8]) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
        let id = match value.pointer(&self.pointer)? {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!id.is_empty()).then_some(id)
    }
}

/// Disables deduplication.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdExtractor;

impl IdExtractor for NoIdExtractor {
    fn extract(&self, _payload: &[u8]) -> Option<String> {
        None
    }
}

pub fn extractor_from_settings(settings: &DedupSettings) -> Arc<dyn IdExtractor> {
    if settings.id_pointer.trim().is_empty() {
        Arc::new(NoIdExtractor)
    } else {
        Arc::new(JsonPointerExtractor::new(settings.id_pointer.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = DedupCache::new(Duration::from_secs(30), 10);
        cache.insert("abc");
        assert!(cache.contains("abc"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.contains("abc"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.contains("abc"));
        assert_eq!(cache.prune(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn empty_ids_are_never_cached() {
        let cache = DedupCache::new(Duration::from_secs(30), 10);
        cache.insert("");
        assert!(cache.is_empty());
        assert!(!cache.contains(""));
    }

    #[test]
    fn reaching_the_cap_flushes_everything() {
        let cache = DedupCache::new(Duration::from_secs(30), 3);
        for id in ["a", "b", "c"] {
            cache.insert(id);
        }
        assert_eq!(cache.len(), 3);

        cache.insert("b");
        assert_eq!(cache.len(), 3);

        cache.insert("d");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("d"));
        assert!(!cache.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn pruner_stops_on_cancel() {
        let cache = Arc::new(DedupCache::new(Duration::from_secs(1), 10));
        cache.insert("abc");
        let token = CancellationToken::new();
        let pruner = Arc::clone(&cache).spawn_pruner(token.clone(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());

        token.cancel();
        pruner.await.unwrap();
    }

    #[test]
    fn json_pointer_extraction() {
        let extractor = JsonPointerExtractor::new("/data/id");
        assert_eq!(
            extractor.extract(br#"{"data": {"id": "evt-1"}}"#),
            Some("evt-1".to_string())
        );
        assert_eq!(
            extractor.extract(br#"{"data": {"id": 42}}"#),
            Some("42".to_string())
        );
        assert_eq!(extractor.extract(br#"{"data": {"id": ""}}"#), None);
        assert_eq!(extractor.extract(br#"{"id": "top-level"}"#), None);
        assert_eq!(extractor.extract(b"plain text"), None);
    }

    #[test]
    fn empty_pointer_disables_extraction() {
        let settings = DedupSettings {
            id_pointer: String::new(),
            ..Default::default()
        };
        let extractor = extractor_from_settings(&settings);
        assert_eq!(extractor.extract(br#"{"data": {"id": "evt-1"}}"#), None);
    }
}
