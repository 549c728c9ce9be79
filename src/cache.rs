#![forbid(unsafe_code)]

//! Time-boxed snapshots of the blacklist, the whitelist and the active
//! patterns.
//!
//! The cache is an explicit service owned by the engine (and shared with
//! whoever mutates the lists so they can invalidate it). Each named slot holds
//! a single entry. Invalidation is coarse: [`ClassificationCache::clear`]
//! drops all three slots at once.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ListEntry, Pattern};

pub const BLACKLIST_CACHE: &str = "blacklist_all";
pub const WHITELIST_CACHE: &str = "whitelist_all";
pub const PATTERNS_CACHE: &str = "patterns_active";

/// Anything that can sit in a cache slot. `Default` is the empty snapshot
/// served when a refresh fails.
pub trait Snapshot: Default + Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + Sync + 'static> Snapshot for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// Blacklist or whitelist indexed for O(1) lookups by item id and by channel
/// hash.
#[derive(Debug, Default)]
pub struct ListIndex {
    items: HashMap<String, ListEntry>,
    channels: HashMap<String, String>,
}

impl ListIndex {
    pub fn from_entries(entries: Vec<ListEntry>) -> Self {
        let mut index = Self::default();
        for entry in entries {
            if entry.is_channel_rule {
                let replace = match index
                    .channels
                    .get(&entry.channel_hash)
                    .and_then(|item_id| index.items.get(item_id))
                {
                    Some(existing) => entry.priority > existing.priority,
                    None => true,
                };
                if replace {
                    index
                        .channels
                        .insert(entry.channel_hash.clone(), entry.item_id.clone());
                }
            }
            index.items.insert(entry.item_id.clone(), entry);
        }
        index
    }

    pub fn by_item(&self, item_id: &str) -> Option<&ListEntry> {
        self.items.get(item_id)
    }

    pub fn by_channel(&self, channel_hash: &str) -> Option<&ListEntry> {
        self.channels
            .get(channel_hash)
            .and_then(|item_id| self.items.get(item_id))
    }
}

impl Snapshot for ListIndex {
    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug)]
pub struct CacheEntry<T> {
    pub data: Arc<T>,
    pub timestamp: Instant,
}

/// One named cache holding a single entry.
#[derive(Debug)]
pub struct CacheSlot<T> {
    name: &'static str,
    entry: RwLock<Option<CacheEntry<T>>>,
}

impl<T: Snapshot> CacheSlot<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            entry: RwLock::new(None),
        }
    }

    fn fresh(&self, ttl: Duration) -> Option<Arc<T>> {
        self.entry
            .read()
            .as_ref()
            .filter(|entry| entry.timestamp.elapsed() < ttl)
            .map(|entry| entry.data.clone())
    }

    fn store(&self, data: T) -> Arc<T> {
        let data = Arc::new(data);
        *self.entry.write() = Some(CacheEntry {
            data: data.clone(),
            timestamp: Instant::now(),
        });
        data
    }

    fn clear(&self) {
        self.entry.write().take();
    }

    fn stats(&self) -> SlotStats {
        let guard = self.entry.read();
        SlotStats {
            name: self.name,
            populated: guard.is_some(),
            size: guard.as_ref().map_or(0, |entry| entry.data.len()),
            age_ms: guard
                .as_ref()
                .map(|entry| entry.timestamp.elapsed().as_millis() as u64),
        }
    }
}

/// Result of a cache lookup. `cached` is false whenever the fetcher ran;
/// `degraded` marks the empty stand-in served after a failed fetch.
#[derive(Debug)]
pub struct Cached<T> {
    pub data: Arc<T>,
    pub cached: bool,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStats {
    pub name: &'static str,
    pub populated: bool,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetch_errors: u64,
    pub hit_rate: f64,
    pub entries: Vec<SlotStats>,
}

#[derive(Debug)]
pub struct ClassificationCache {
    ttl: Duration,
    blacklist: CacheSlot<ListIndex>,
    whitelist: CacheSlot<ListIndex>,
    patterns: CacheSlot<Vec<Pattern>>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_errors: AtomicU64,
}

impl ClassificationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            blacklist: CacheSlot::new(BLACKLIST_CACHE),
            whitelist: CacheSlot::new(WHITELIST_CACHE),
            patterns: CacheSlot::new(PATTERNS_CACHE),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetch_errors: AtomicU64::new(0),
        }
    }

    pub fn blacklist(&self) -> &CacheSlot<ListIndex> {
        &self.blacklist
    }

    pub fn whitelist(&self) -> &CacheSlot<ListIndex> {
        &self.whitelist
    }

    pub fn patterns(&self) -> &CacheSlot<Vec<Pattern>> {
        &self.patterns
    }

    /// Serves the slot while it is younger than the TTL, otherwise runs
    /// `fetcher` and stores its output. A failed fetch is logged and answered
    /// with an empty snapshot that is not stored, so the next call retries.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        slot: &CacheSlot<T>,
        force_refresh: bool,
        fetcher: F,
    ) -> Cached<T>
    where
        T: Snapshot,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !force_refresh && let Some(data) = slot.fresh(self.ttl) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Cached {
                data,
                cached: true,
                degraded: false,
            };
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match fetcher().await {
            Ok(data) => {
                debug!(cache = slot.name, size = data.len(), "cache refreshed");
                Cached {
                    data: slot.store(data),
                    cached: false,
                    degraded: false,
                }
            }
            Err(err) => {
                self.fetch_errors.fetch_add(1, Ordering::Relaxed);
                warn!(cache = slot.name, error = %err, "cache refresh failed, serving empty snapshot");
                Cached {
                    data: Arc::new(T::default()),
                    cached: false,
                    degraded: true,
                }
            }
        }
    }

    /// Drops every slot unconditionally.
    pub fn clear(&self) {
        self.blacklist.clear();
        self.whitelist.clear();
        self.patterns.clear();
        debug!("classification cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            ttl_secs: self.ttl.as_secs(),
            hits,
            misses,
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entries: vec![
                self.blacklist.stats(),
                self.whitelist.stats(),
                self.patterns.stats(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::models::{ContentType, NewEntry};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn entry(item_id: &str, channel: Option<&str>, channel_rule: bool, priority: i64) -> ListEntry {
        NewEntry {
            item_id: item_id.into(),
            title: format!("title {item_id}"),
            content_type: ContentType::Video,
            channel_id: channel.map(str::to_string),
            is_channel_rule: channel_rule,
            priority,
            ..NewEntry::default()
        }
        .into_entry(Utc::now())
    }

    async fn fetch_counting(
        cache: &ClassificationCache,
        calls: &AtomicUsize,
        force: bool,
    ) -> Cached<Vec<Pattern>> {
        cache
            .get_or_fetch(cache.patterns(), force, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn second_lookup_within_ttl_hits_cache() {
        let cache = ClassificationCache::new(Duration::from_secs(300));
        let calls = AtomicUsize::new(0);

        let first = fetch_counting(&cache, &calls, false).await;
        tokio::time::advance(Duration::from_secs(299)).await;
        let second = fetch_counting(&cache, &calls, false).await;

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_refetched() {
        let cache = ClassificationCache::new(Duration::from_secs(300));
        let calls = AtomicUsize::new(0);

        fetch_counting(&cache, &calls, false).await;
        tokio::time::advance(Duration::from_secs(300)).await;
        let again = fetch_counting(&cache, &calls, false).await;

        assert!(!again.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_and_force_refresh_invoke_fetcher() {
        let cache = ClassificationCache::new(Duration::from_secs(300));
        let calls = AtomicUsize::new(0);

        fetch_counting(&cache, &calls, false).await;
        cache.clear();
        fetch_counting(&cache, &calls, false).await;
        fetch_counting(&cache, &calls, true).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_fetch_serves_empty_and_retries() {
        let cache = ClassificationCache::new(Duration::from_secs(300));
        let failed = cache
            .get_or_fetch(cache.blacklist(), false, || async {
                Err::<ListIndex, _>(FilterError::ExternalService("db down".into()))
            })
            .await;
        assert!(failed.data.is_empty());
        assert!(!failed.cached);
        assert!(failed.degraded);
        assert!(!cache.stats().entries[0].populated);

        let recovered = cache
            .get_or_fetch(cache.blacklist(), false, || async {
                Ok(ListIndex::from_entries(vec![entry("abc", None, false, 0)]))
            })
            .await;
        assert_eq!(recovered.data.len(), 1);
        assert!(!recovered.degraded);
        assert_eq!(cache.stats().fetch_errors, 1);
    }

    #[test]
    fn list_index_resolves_items_and_channels() {
        let index = ListIndex::from_entries(vec![
            entry("vid1", Some("UCone"), false, 0),
            entry("vid2", Some("UCtwo"), true, 1),
            entry("vid3", Some("UCtwo"), true, 5),
        ]);
        assert!(index.by_item("vid1").is_some());
        assert!(index.by_channel(&crate::models::content_hash("UCone")).is_none());
        let rule = index
            .by_channel(&crate::models::content_hash("UCtwo"))
            .unwrap();
        assert_eq!(rule.item_id, "vid3");
        assert!(index.by_item("vid2").is_some());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn stats_report_slot_names() {
        let cache = ClassificationCache::new(Duration::from_secs(60));
        let names: Vec<_> = cache.stats().entries.iter().map(|slot| slot.name).collect();
        assert_eq!(names, vec![BLACKLIST_CACHE, WHITELIST_CACHE, PATTERNS_CACHE]);
        assert_eq!(cache.stats().ttl_secs, 60);
    }
}
