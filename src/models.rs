#![forbid(unsafe_code)]

//! Records shared by the engine, the store and the HTTP API.
//!
//! API-facing structs serialize in camelCase so the existing frontend can keep
//! posting the same payloads it sends today.

use std::borrow::Cow;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// Kind of item a classification or list entry refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Video,
    Playlist,
    Channel,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Playlist => "playlist",
            Self::Channel => "channel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" | "videos" => Some(Self::Video),
            "playlist" | "playlists" => Some(Self::Playlist),
            "channel" | "channels" => Some(Self::Channel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Keyword,
    Regex,
    Wildcard,
    Fuzzy,
    Semantic,
}

impl PatternType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Regex => "regex",
            Self::Wildcard => "wildcard",
            Self::Fuzzy => "fuzzy",
            Self::Semantic => "semantic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keyword" => Some(Self::Keyword),
            "regex" => Some(Self::Regex),
            "wildcard" => Some(Self::Wildcard),
            "fuzzy" => Some(Self::Fuzzy),
            "semantic" => Some(Self::Semantic),
            _ => None,
        }
    }
}

/// Which text field of a [`ContentItem`] a pattern is evaluated against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternContext {
    #[default]
    Title,
    Description,
    Tags,
    Channel,
}

impl PatternContext {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Tags => "tags",
            Self::Channel => "channel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "title" => Some(Self::Title),
            "description" => Some(Self::Description),
            "tags" => Some(Self::Tags),
            "channel" | "channelname" => Some(Self::Channel),
            _ => None,
        }
    }
}

/// Subject of one classification. Built per request and never persisted by
/// the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub item_id: String,
    #[serde(rename = "type", default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ContentItem {
    pub fn new(item_id: impl Into<String>, content_type: ContentType, title: impl Into<String>) -> Self {
        let item_id = item_id.into();
        Self {
            id: item_id.clone(),
            item_id,
            content_type,
            title: title.into(),
            ..Self::default()
        }
    }

    /// Text a pattern with the given context is evaluated against. Tags are
    /// joined with single spaces.
    pub fn field(&self, context: PatternContext) -> Cow<'_, str> {
        match context {
            PatternContext::Title => Cow::Borrowed(&self.title),
            PatternContext::Description => Cow::Borrowed(&self.description),
            PatternContext::Tags => Cow::Owned(self.tags.join(" ")),
            PatternContext::Channel => Cow::Borrowed(&self.channel_name),
        }
    }

    /// Identity used for channel-level rules: the explicit channel id, or the
    /// item id itself when none was provided.
    pub fn channel_key(&self) -> &str {
        match self.channel_id.as_deref().map(str::trim) {
            Some(channel) if !channel.is_empty() => channel,
            _ => &self.item_id,
        }
    }

    pub fn channel_hash(&self) -> String {
        content_hash(self.channel_key())
    }
}

/// Stable one-way content address used as the key for channel-level lookups.
pub fn content_hash(value: &str) -> String {
    blake3::hash(value.trim().as_bytes()).to_hex().to_string()
}

/// Selects the blacklist or whitelist table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Blacklist,
    Whitelist,
}

impl ListKind {
    pub fn table(self) -> &'static str {
        match self {
            Self::Blacklist => "blacklist",
            Self::Whitelist => "whitelist",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "blacklist" | "block" => Some(Self::Blacklist),
            "whitelist" | "allow" => Some(Self::Whitelist),
            _ => None,
        }
    }
}

/// Row of the blacklist or whitelist. `is_channel_rule` means the entry
/// blocks (or allows) the whole channel rather than one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub item_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    pub priority: i64,
    #[serde(alias = "isChannelBlock", alias = "isChannelWhitelist")]
    pub is_channel_rule: bool,
    pub video_hash: String,
    pub channel_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload accepted when creating or importing a list entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntry {
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, alias = "isChannelBlock", alias = "isChannelWhitelist")]
    pub is_channel_rule: bool,
    #[serde(default)]
    pub category_id: Option<String>,
}

impl NewEntry {
    pub fn validate(&self) -> Result<()> {
        if self.item_id.trim().is_empty() {
            return Err(FilterError::validation("itemId is required"));
        }
        if self.title.trim().is_empty() {
            return Err(FilterError::validation("title is required"));
        }
        Ok(())
    }

    pub fn into_entry(self, now: DateTime<Utc>) -> ListEntry {
        let item_id = self.item_id.trim().to_string();
        let channel_id = self
            .channel_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let channel_hash = content_hash(channel_id.as_deref().unwrap_or(&item_id));
        ListEntry {
            video_hash: content_hash(&item_id),
            channel_hash,
            item_id,
            title: self.title.trim().to_string(),
            content_type: self.content_type,
            thumbnail: self.thumbnail,
            channel_id,
            channel_name: self.channel_name,
            priority: self.priority,
            is_channel_rule: self.is_channel_rule,
            category_id: self.category_id,
            added_at: now,
            updated_at: now,
        }
    }
}

/// Configurable text rule used to block content by similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub id: String,
    pub pattern: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    pub context: PatternContext,
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_threshold: Option<f64>,
    #[serde(alias = "isEnabled")]
    pub is_active: bool,
    pub match_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_matched: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPattern {
    pub pattern: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    #[serde(default)]
    pub context: PatternContext,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub match_threshold: Option<f64>,
    #[serde(default = "default_true", alias = "isEnabled")]
    pub is_active: bool,
    #[serde(default)]
    pub category_id: Option<String>,
}

impl NewPattern {
    pub fn validate(&self) -> Result<()> {
        if self.pattern.trim().is_empty() {
            return Err(FilterError::validation("pattern must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.weight) {
            return Err(FilterError::validation("weight must be between 0 and 1"));
        }
        if let Some(threshold) = self.match_threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(FilterError::validation(
                "matchThreshold must be between 0 and 1",
            ));
        }
        if self.pattern_type == PatternType::Regex {
            crate::matcher::validate_regex(&self.pattern)?;
        }
        Ok(())
    }

    pub fn into_pattern(self, id: String, now: DateTime<Utc>) -> Pattern {
        Pattern {
            id,
            pattern: self.pattern,
            pattern_type: self.pattern_type,
            context: self.context,
            weight: self.weight,
            match_threshold: self.match_threshold,
            is_active: self.is_active,
            match_count: 0,
            last_matched: None,
            category_id: self.category_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// UI grouping for entries and patterns. Not consumed by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    pub color: String,
    pub is_system: bool,
    pub is_active: bool,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

fn default_color() -> String {
    "#6b7280".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCategory {
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i64,
}

impl NewCategory {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FilterError::validation("category name is required"));
        }
        Ok(())
    }
}

/// Verdict for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub item_id: String,
    pub allowed: bool,
    pub blocked: bool,
    pub whitelisted: bool,
    pub reason: String,
    pub confidence: f64,
    pub cached: bool,
    /// Milliseconds spent classifying the item.
    pub response_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl ClassificationResult {
    pub fn allowed(item_id: &str, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.to_string(),
            allowed: true,
            blocked: false,
            whitelisted: false,
            reason: reason.into(),
            confidence: 1.0,
            cached: false,
            response_time: 0.0,
            matched_pattern: None,
            error: false,
        }
    }

    pub fn whitelisted(item_id: &str, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            whitelisted: true,
            confidence,
            ..Self::allowed(item_id, reason)
        }
    }

    pub fn blocked(item_id: &str, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            allowed: false,
            blocked: true,
            confidence,
            ..Self::allowed(item_id, reason)
        }
    }

    /// Result used when classification itself failed: content stays visible.
    pub fn fail_open(item_id: &str, message: impl Into<String>) -> Self {
        Self {
            confidence: 0.0,
            error: true,
            ..Self::allowed(item_id, message)
        }
    }
}

/// One row per calendar day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyMetrics {
    pub date: NaiveDate,
    pub total_filtered: i64,
    pub blocked_count: i64,
    pub whitelisted_count: i64,
    pub pattern_matches: i64,
    pub channel_blocks: i64,
    pub cache_hits: i64,
    pub errors: i64,
    pub avg_filter_time: f64,
}

/// Paginated list query. `page` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryQuery {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(rename = "type", default)]
    pub content_type: Option<ContentType>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

pub const MAX_PAGE_LIMIT: u32 = 100;

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

impl Default for EntryQuery {
    fn default() -> Self {
        Self {
            search: None,
            content_type: None,
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl EntryQuery {
    pub fn take(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn skip(&self) -> u32 {
        self.page.max(1).saturating_sub(1).saturating_mul(self.take())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_item_deserializes_frontend_payload() {
        let item: ContentItem = serde_json::from_value(serde_json::json!({
            "id": "1",
            "itemId": "dQw4w9WgXcQ",
            "type": "video",
            "title": "Never",
            "channelName": "Rick",
            "tags": ["music", "80s"]
        }))
        .unwrap();
        assert_eq!(item.content_type, ContentType::Video);
        assert_eq!(item.field(PatternContext::Tags), "music 80s");
        assert_eq!(item.field(PatternContext::Channel), "Rick");
        assert!(item.description.is_empty());
    }

    #[test]
    fn channel_key_falls_back_to_item_id() {
        let mut item = ContentItem::new("UCabc", ContentType::Channel, "A channel");
        assert_eq!(item.channel_key(), "UCabc");
        item.channel_id = Some("  ".into());
        assert_eq!(item.channel_key(), "UCabc");
        item.channel_id = Some("UCother".into());
        assert_eq!(item.channel_hash(), content_hash("UCother"));
    }

    #[test]
    fn new_entry_computes_hashes() {
        let entry = NewEntry {
            item_id: " vid123 ".into(),
            title: "Title".into(),
            channel_id: Some("UCchan".into()),
            is_channel_rule: true,
            ..NewEntry::default()
        }
        .into_entry(Utc::now());
        assert_eq!(entry.item_id, "vid123");
        assert_eq!(entry.video_hash, content_hash("vid123"));
        assert_eq!(entry.channel_hash, content_hash("UCchan"));
        assert_eq!(entry.video_hash.len(), 64);
    }

    #[test]
    fn new_entry_accepts_channel_block_alias() {
        let entry: NewEntry = serde_json::from_value(serde_json::json!({
            "itemId": "UCx",
            "title": "Spam channel",
            "type": "channel",
            "isChannelBlock": true
        }))
        .unwrap();
        assert!(entry.is_channel_rule);
        assert_eq!(entry.content_type, ContentType::Channel);
    }

    #[test]
    fn new_pattern_rejects_out_of_range_weight() {
        let mut pattern = NewPattern {
            pattern: "spam".into(),
            pattern_type: PatternType::Keyword,
            context: PatternContext::Title,
            weight: 1.5,
            match_threshold: None,
            is_active: true,
            category_id: None,
        };
        assert!(pattern.validate().is_err());
        pattern.weight = 0.4;
        pattern.match_threshold = Some(2.0);
        assert!(pattern.validate().is_err());
        pattern.match_threshold = Some(0.5);
        assert!(pattern.validate().is_ok());
    }

    #[test]
    fn entry_query_paginates() {
        let query = EntryQuery {
            page: 3,
            limit: 25,
            ..EntryQuery::default()
        };
        assert_eq!(query.skip(), 50);
        assert_eq!(query.take(), 25);

        let oversized = EntryQuery {
            page: 0,
            limit: 1000,
            ..EntryQuery::default()
        };
        assert_eq!(oversized.skip(), 0);
        assert_eq!(oversized.take(), MAX_PAGE_LIMIT);
    }

    #[test]
    fn fail_open_result_is_allowed_with_error_flag() {
        let result = ClassificationResult::fail_open("x", "boom");
        assert!(result.allowed);
        assert!(!result.blocked);
        assert!(result.error);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], true);
        let ok = serde_json::to_value(ClassificationResult::allowed("x", "ok")).unwrap();
        assert!(ok.get("error").is_none());
    }
}
