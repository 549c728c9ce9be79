#![forbid(unsafe_code)]

//! Classification counters.
//!
//! [`RunStats`] accumulates one classification run (a single item or a whole
//! batch). The engine folds every run into [`EngineMetrics`] and also persists
//! it to the daily aggregate row; that write is best effort and reports a
//! [`MetricError`] for the caller to log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::models::ClassificationResult;

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("failed to persist daily metrics: {0}")]
    Storage(#[from] libsql::Error),
}

/// Which step of the decision produced a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleHit {
    WhitelistedItem,
    WhitelistedChannel,
    BlockedItem,
    BlockedChannel,
    Pattern(String),
    DefaultAllow,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub whitelisted: u64,
    pub cache_hits: u64,
    pub pattern_matches: u64,
    pub channel_blocks: u64,
    pub errors: u64,
    pub total_time_ms: f64,
}

impl RunStats {
    pub fn record(&mut self, result: &ClassificationResult, hit: &RuleHit) {
        self.total += 1;
        if result.allowed {
            self.allowed += 1;
        }
        if result.blocked {
            self.blocked += 1;
        }
        if result.whitelisted {
            self.whitelisted += 1;
        }
        if result.cached {
            self.cache_hits += 1;
        }
        if result.error {
            self.errors += 1;
        }
        match hit {
            RuleHit::Pattern(_) => self.pattern_matches += 1,
            RuleHit::BlockedChannel => self.channel_blocks += 1,
            _ => {}
        }
        self.total_time_ms += result.response_time;
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.total += other.total;
        self.allowed += other.allowed;
        self.blocked += other.blocked;
        self.whitelisted += other.whitelisted;
        self.cache_hits += other.cache_hits;
        self.pattern_matches += other.pattern_matches;
        self.channel_blocks += other.channel_blocks;
        self.errors += other.errors;
        self.total_time_ms += other.total_time_ms;
    }

    pub fn avg_time_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_time_ms / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_items: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub whitelisted: u64,
    pub cache_hits: u64,
    pub pattern_matches: u64,
    pub channel_blocks: u64,
    pub errors: u64,
    pub avg_response_time_ms: f64,
    pub runs: u64,
    pub pattern_hits: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MetricsState {
    totals: RunStats,
    runs: u64,
    pattern_hits: BTreeMap<String, u64>,
    last_updated: Option<DateTime<Utc>>,
}

/// Process-wide counters shared by every classification.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    state: Mutex<MetricsState>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, run: &RunStats) {
        let mut state = self.state.lock();
        state.totals.merge(run);
        state.runs += 1;
        state.last_updated = Some(Utc::now());
    }

    pub fn record_pattern_hit(&self, pattern_id: &str) {
        *self
            .state
            .lock()
            .pattern_hits
            .entry(pattern_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            total_items: state.totals.total,
            allowed: state.totals.allowed,
            blocked: state.totals.blocked,
            whitelisted: state.totals.whitelisted,
            cache_hits: state.totals.cache_hits,
            pattern_matches: state.totals.pattern_matches,
            channel_blocks: state.totals.channel_blocks,
            errors: state.totals.errors,
            avg_response_time_ms: state.totals.avg_time_ms(),
            runs: state.runs,
            pattern_hits: state.pattern_hits.clone(),
            last_updated: state.last_updated,
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = MetricsState::default();
    }
}
