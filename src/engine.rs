#![forbid(unsafe_code)]

//! Decision engine: whitelist first, then the blacklist by id and by channel,
//! then patterns, otherwise allow.
//!
//! The engine never fails a classification. Store or cache trouble degrades
//! to "nothing listed" and a task that dies mid-batch becomes a fail-open
//! result carrying the `error` flag.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, Cached, ClassificationCache, ListIndex};
use crate::config::{DEFAULT_BATCH_SIZE, FilterSettings, MAX_BATCH_SIZE};
use crate::error::Result;
use crate::matcher::PatternMatcher;
use crate::metrics::{EngineMetrics, MetricsSnapshot, RuleHit, RunStats};
use crate::models::{
    ClassificationResult, ContentItem, DailyMetrics, ListKind, Pattern, PatternContext, TypeCount,
};
use crate::sanitize::sanitize_item_id;
use crate::store::FilterStore;

const ITEM_CONFIDENCE: f64 = 1.0;
const CHANNEL_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub channel_blocking: bool,
    pub pattern_matching: bool,
    pub batch_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            channel_blocking: true,
            pattern_matching: true,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl From<&FilterSettings> for EngineOptions {
    fn from(settings: &FilterSettings) -> Self {
        Self {
            channel_blocking: settings.channel_blocking,
            pattern_matching: settings.pattern_matching,
            batch_size: settings.batch_size,
        }
    }
}

/// Items that survived sanitization plus how many were thrown away.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub items: Vec<ContentItem>,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub whitelisted: u64,
    pub errors: u64,
    pub chunks: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct BatchOutcome {
    /// One result per input item, in input order.
    pub results: Vec<ClassificationResult>,
    pub chunks: usize,
    pub stats: BatchStats,
    pub run: RunStats,
}

/// Best pattern for a sample text, as returned by [`FilterEngine::best_pattern_match`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BestPatternMatch {
    pub matched: bool,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternTotals {
    pub total: usize,
    pub active: usize,
    pub total_matches: i64,
}

/// Store-backed numbers served by `GET /api/content-filter?details=true`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDetails {
    pub blacklist: Vec<TypeCount>,
    pub whitelist: Vec<TypeCount>,
    pub patterns: PatternTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub today: Option<DailyMetrics>,
}

#[derive(Debug, Clone)]
struct RuleSet {
    whitelist: Arc<ListIndex>,
    blacklist: Arc<ListIndex>,
    patterns: Arc<Vec<Pattern>>,
    cached: bool,
    /// At least one snapshot is an empty stand-in for a failed fetch.
    degraded: bool,
}

#[derive(Debug)]
struct EngineInner {
    store: FilterStore,
    cache: Arc<ClassificationCache>,
    matcher: PatternMatcher,
    metrics: EngineMetrics,
    options: EngineOptions,
}

/// Cheap to clone; clones share the cache, the matcher and the counters.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    inner: Arc<EngineInner>,
}

impl FilterEngine {
    pub fn new(store: FilterStore, cache: Arc<ClassificationCache>, options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                cache,
                matcher: PatternMatcher::new(),
                metrics: EngineMetrics::new(),
                options,
            }),
        }
    }

    pub fn store(&self) -> &FilterStore {
        &self.inner.store
    }

    pub fn cache(&self) -> &Arc<ClassificationCache> {
        &self.inner.cache
    }

    pub fn options(&self) -> EngineOptions {
        self.inner.options
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Zeroes the in-memory counters. The daily rows in the store are kept.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Drops the list and pattern snapshots along with memoized regexes.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        self.inner.matcher.clear();
    }

    /// Classifies one item and records it as its own run.
    pub async fn classify(&self, item: &ContentItem) -> ClassificationResult {
        let rules = self.load_rules(false).await;
        let (result, hit) = self.classify_with(item, &rules).await;

        let mut run = RunStats::default();
        run.record(&result, &hit);
        self.finish_run(&run).await;
        result
    }

    /// Classifies `items` in chunks of `batch_size` (the configured size when
    /// `None`). Items inside a chunk are evaluated concurrently and the engine
    /// yields to the scheduler between chunks.
    pub async fn classify_batch(
        &self,
        items: Vec<ContentItem>,
        batch_size: Option<usize>,
    ) -> BatchOutcome {
        let batch_size = batch_size
            .unwrap_or(self.inner.options.batch_size)
            .clamp(1, MAX_BATCH_SIZE);
        let started = Instant::now();
        let mut results = Vec::with_capacity(items.len());
        let mut run = RunStats::default();
        let mut chunks = 0;

        for chunk in items.chunks(batch_size) {
            if chunks > 0 {
                tokio::task::yield_now().await;
            }
            chunks += 1;

            let rules = self.load_rules(false).await;
            let mut slots: Vec<Option<(ClassificationResult, RuleHit)>> = vec![None; chunk.len()];
            let mut tasks = JoinSet::new();
            for (index, item) in chunk.iter().cloned().enumerate() {
                let engine = self.clone();
                let rules = rules.clone();
                tasks.spawn(async move { (index, engine.classify_with(&item, &rules).await) });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, outcome)) => slots[index] = Some(outcome),
                    Err(err) => warn!(error = %err, "classification task failed"),
                }
            }

            for (slot, item) in slots.into_iter().zip(chunk) {
                let (result, hit) = slot.unwrap_or_else(|| {
                    (
                        ClassificationResult::fail_open(&item.item_id, "classification failed"),
                        RuleHit::Failed,
                    )
                });
                run.record(&result, &hit);
                results.push(result);
            }
        }

        self.finish_run(&run).await;
        debug!(
            items = run.total,
            chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch classified"
        );

        let stats = BatchStats {
            total: run.total,
            allowed: run.allowed,
            blocked: run.blocked,
            whitelisted: run.whitelisted,
            errors: run.errors,
            chunks,
            dropped: 0,
        };
        BatchOutcome {
            results,
            chunks,
            stats,
            run,
        }
    }

    /// Best pattern for `text` among active patterns bound to `context`.
    pub async fn best_pattern_match(&self, text: &str, context: PatternContext) -> BestPatternMatch {
        let patterns = self.load_patterns(false).await.data;
        let best = self.inner.matcher.match_patterns(text, &patterns, context);
        BestPatternMatch {
            matched: best.result.matched,
            score: best.result.score,
            matched_text: best.result.matched_text,
            pattern_id: best.pattern.map(|pattern| pattern.id.clone()),
        }
    }

    pub async fn details(&self) -> Result<EngineDetails> {
        let store = &self.inner.store;
        let patterns = store.list_patterns().await?;
        Ok(EngineDetails {
            blacklist: store.count_by_type(ListKind::Blacklist).await?,
            whitelist: store.count_by_type(ListKind::Whitelist).await?,
            patterns: PatternTotals {
                total: patterns.len(),
                active: patterns.iter().filter(|pattern| pattern.is_active).count(),
                total_matches: patterns.iter().map(|pattern| pattern.match_count).sum(),
            },
            today: store.daily_metrics(Utc::now().date_naive()).await?,
        })
    }

    async fn classify_with(
        &self,
        item: &ContentItem,
        rules: &RuleSet,
    ) -> (ClassificationResult, RuleHit) {
        let started = Instant::now();
        #[cfg(test)]
        if item.title == tests::PANIC_TITLE {
            panic!("classification task aborted");
        }
        let (mut result, hit) = match self.decide(item, rules) {
            // An empty stand-in list proves nothing, so the allow is not trusted.
            (_, RuleHit::DefaultAllow) if rules.degraded => (
                ClassificationResult::fail_open(item.item_id.trim(), "rule snapshot unavailable"),
                RuleHit::Failed,
            ),
            decided => decided,
        };

        if let RuleHit::Pattern(pattern_id) = &hit {
            self.inner.metrics.record_pattern_hit(pattern_id);
            if let Err(err) = self
                .inner
                .store
                .record_pattern_match(pattern_id, Utc::now())
                .await
            {
                warn!(pattern_id = %pattern_id, error = %err, "failed to record pattern match");
            }
        }

        result.cached = rules.cached;
        result.response_time = elapsed_ms(started.elapsed());
        (result, hit)
    }

    fn decide(&self, item: &ContentItem, rules: &RuleSet) -> (ClassificationResult, RuleHit) {
        let item_id = item.item_id.trim();
        let options = &self.inner.options;
        let channel_hash = options.channel_blocking.then(|| item.channel_hash());

        if rules.whitelist.by_item(item_id).is_some() {
            return (
                ClassificationResult::whitelisted(item_id, "Whitelisted item", ITEM_CONFIDENCE),
                RuleHit::WhitelistedItem,
            );
        }
        if let Some(hash) = &channel_hash
            && let Some(rule) = rules.whitelist.by_channel(hash)
        {
            return (
                ClassificationResult::whitelisted(
                    item_id,
                    format!("Whitelisted channel: {}", channel_label(item, rule.channel_name.as_deref())),
                    CHANNEL_CONFIDENCE,
                ),
                RuleHit::WhitelistedChannel,
            );
        }
        if rules.blacklist.by_item(item_id).is_some() {
            return (
                ClassificationResult::blocked(item_id, "Blacklisted item", ITEM_CONFIDENCE),
                RuleHit::BlockedItem,
            );
        }
        if let Some(hash) = &channel_hash
            && let Some(rule) = rules.blacklist.by_channel(hash)
        {
            return (
                ClassificationResult::blocked(
                    item_id,
                    format!("Channel blocked: {}", channel_label(item, rule.channel_name.as_deref())),
                    CHANNEL_CONFIDENCE,
                ),
                RuleHit::BlockedChannel,
            );
        }

        if options.pattern_matching {
            // Store order: heaviest first. The first match wins.
            for pattern in rules.patterns.iter().filter(|pattern| pattern.is_active) {
                let text = item.field(pattern.context);
                let matched = self.inner.matcher.evaluate(&text, pattern);
                if !matched.matched {
                    continue;
                }
                let confidence = (matched.score * pattern.weight).clamp(0.0, 1.0);
                let mut result = ClassificationResult::blocked(
                    item_id,
                    format!(
                        "Matched {} pattern \"{}\" in {}",
                        pattern.pattern_type.as_str(),
                        pattern.pattern,
                        pattern.context.as_str()
                    ),
                    confidence,
                );
                result.matched_pattern = Some(pattern.id.clone());
                return (result, RuleHit::Pattern(pattern.id.clone()));
            }
        }

        (
            ClassificationResult::allowed(item_id, "No filter rules matched"),
            RuleHit::DefaultAllow,
        )
    }

    async fn load_rules(&self, force_refresh: bool) -> RuleSet {
        let store = &self.inner.store;
        let cache = &self.inner.cache;

        let whitelist = cache
            .get_or_fetch(cache.whitelist(), force_refresh, || async move {
                Ok(ListIndex::from_entries(
                    store.all_entries(ListKind::Whitelist).await?,
                ))
            })
            .await;
        let blacklist = cache
            .get_or_fetch(cache.blacklist(), force_refresh, || async move {
                Ok(ListIndex::from_entries(
                    store.all_entries(ListKind::Blacklist).await?,
                ))
            })
            .await;
        let patterns = if self.inner.options.pattern_matching {
            self.load_patterns(force_refresh).await
        } else {
            Cached {
                data: Arc::new(Vec::new()),
                cached: true,
                degraded: false,
            }
        };

        RuleSet {
            cached: whitelist.cached && blacklist.cached && patterns.cached,
            degraded: whitelist.degraded || blacklist.degraded || patterns.degraded,
            whitelist: whitelist.data,
            blacklist: blacklist.data,
            patterns: patterns.data,
        }
    }

    async fn load_patterns(&self, force_refresh: bool) -> Cached<Vec<Pattern>> {
        let store = &self.inner.store;
        let cache = &self.inner.cache;
        cache
            .get_or_fetch(cache.patterns(), force_refresh, || async move {
                store.active_patterns().await
            })
            .await
    }

    async fn finish_run(&self, run: &RunStats) {
        if run.total == 0 {
            return;
        }
        self.inner.metrics.record_run(run);
        if let Err(err) = self
            .inner
            .store
            .record_daily_metrics(Utc::now().date_naive(), run)
            .await
        {
            warn!(error = %err, "daily metrics not persisted");
        }
    }
}

/// Sanitizes item ids and drops items that have no usable id or no title.
pub fn prepare_batch(items: Vec<ContentItem>) -> PreparedBatch {
    let mut prepared = PreparedBatch::default();
    for mut item in items {
        let raw = if item.item_id.trim().is_empty() {
            item.id.clone()
        } else {
            item.item_id.clone()
        };
        let Some(item_id) = sanitize_item_id(item.content_type, &raw) else {
            prepared.dropped += 1;
            continue;
        };
        if item.title.trim().is_empty() {
            prepared.dropped += 1;
            continue;
        }
        if item.id.trim().is_empty() {
            item.id = item_id.clone();
        }
        item.item_id = item_id;
        prepared.items.push(item);
    }
    if prepared.dropped > 0 {
        info!(dropped = prepared.dropped, kept = prepared.items.len(), "dropped unusable items");
    }
    prepared
}

fn channel_label<'a>(item: &'a ContentItem, rule_name: Option<&'a str>) -> &'a str {
    match rule_name {
        Some(name) if !name.trim().is_empty() => name,
        _ if !item.channel_name.trim().is_empty() => &item.channel_name,
        _ => item.channel_key(),
    }
}

fn elapsed_ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}
