#![forbid(unsafe_code)]

//! Persistence for blacklist/whitelist entries, patterns, categories and the
//! daily metrics rollup.
//!
//! Everything lives in one local SQLite-compatible database opened through
//! libsql. Timestamps are stored as RFC 3339 text in UTC so lexical ordering
//! matches chronological ordering.

use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use tracing::debug;
use uuid::Uuid;

use crate::error::{FilterError, Result};
use crate::metrics::{MetricError, RunStats};
use crate::models::{
    Category, ContentType, DailyMetrics, EntryQuery, ListEntry, ListKind, NewCategory, NewEntry,
    NewPattern, Page, Pattern, PatternContext, PatternType, TypeCount,
};

const ENTRY_COLUMNS: &str = "item_id, title, content_type, thumbnail, channel_id, channel_name, \
     priority, is_channel_rule, video_hash, channel_hash, category_id, added_at, updated_at";

const PATTERN_COLUMNS: &str = "id, pattern, pattern_type, context, weight, match_threshold, \
     is_active, match_count, last_matched, category_id, created_at, updated_at";

const CATEGORY_COLUMNS: &str = "id, name, color, is_system, is_active, priority, created_at";

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    for kind in [ListKind::Blacklist, ListKind::Whitelist] {
        let table = kind.table();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                item_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT 'video',
                thumbnail TEXT,
                channel_id TEXT,
                channel_name TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                is_channel_rule INTEGER NOT NULL DEFAULT 0,
                video_hash TEXT NOT NULL,
                channel_hash TEXT NOT NULL,
                category_id TEXT,
                added_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_channel_hash ON {table}(channel_hash);
            CREATE INDEX IF NOT EXISTS idx_{table}_priority ON {table}(priority DESC, added_at DESC);
            "#
        ))
        .await?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS patterns (
            id TEXT PRIMARY KEY,
            pattern TEXT NOT NULL,
            pattern_type TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT 'title',
            weight REAL NOT NULL DEFAULT 1.0,
            match_threshold REAL,
            is_active INTEGER NOT NULL DEFAULT 1,
            match_count INTEGER NOT NULL DEFAULT 0,
            last_matched TEXT,
            category_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_patterns_active ON patterns(is_active, weight DESC);

        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            color TEXT NOT NULL,
            is_system INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS daily_metrics (
            date TEXT PRIMARY KEY,
            total_filtered INTEGER NOT NULL DEFAULT 0,
            blocked_count INTEGER NOT NULL DEFAULT 0,
            whitelisted_count INTEGER NOT NULL DEFAULT 0,
            pattern_matches INTEGER NOT NULL DEFAULT 0,
            channel_blocks INTEGER NOT NULL DEFAULT 0,
            cache_hits INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            avg_filter_time REAL NOT NULL DEFAULT 0
        );
        "#,
    )
    .await?;
    Ok(())
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| FilterError::Internal(format!("invalid stored timestamp {value:?}: {err}")))
}

fn ids_json(ids: &[String]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

/// Handle over the filter database. Clones share the same connection.
#[derive(Clone)]
pub struct FilterStore {
    conn: Connection,
}

impl std::fmt::Debug for FilterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStore").finish_non_exhaustive()
    }
}

impl FilterStore {
    /// Opens (and if necessary creates) the database and its tables.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| {
                FilterError::Internal(format!("creating {}: {err}", parent.display()))
            })?;
        }

        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        debug!(path = %path.display(), "opened filter store");
        Ok(Self { conn })
    }

    // ---- blacklist / whitelist -------------------------------------------

    /// Inserts a new entry. Fails with a conflict when the id is already listed.
    pub async fn insert_entry(&self, kind: ListKind, entry: NewEntry) -> Result<ListEntry> {
        entry.validate()?;
        let entry = entry.into_entry(Utc::now());
        if self.get_entry(kind, &entry.item_id).await?.is_some() {
            return Err(FilterError::conflict(format!(
                "{} already contains {}",
                kind.table(),
                entry.item_id
            )));
        }
        self.write_entry(kind, &entry).await?;
        Ok(entry)
    }

    /// Inserts or refreshes an entry, keeping the original `added_at`.
    pub async fn upsert_entry(&self, kind: ListKind, entry: NewEntry) -> Result<ListEntry> {
        entry.validate()?;
        let entry = entry.into_entry(Utc::now());
        self.write_entry(kind, &entry).await?;
        self.get_entry(kind, &entry.item_id)
            .await?
            .ok_or_else(|| FilterError::Internal(format!("{} vanished after upsert", entry.item_id)))
    }

    async fn write_entry(&self, kind: ListKind, entry: &ListEntry) -> Result<()> {
        let table = kind.table();
        self.conn
            .execute(
                &format!(
                    r#"
                    INSERT INTO {table} ({ENTRY_COLUMNS})
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    ON CONFLICT(item_id) DO UPDATE SET
                        title = excluded.title,
                        content_type = excluded.content_type,
                        thumbnail = excluded.thumbnail,
                        channel_id = excluded.channel_id,
                        channel_name = excluded.channel_name,
                        priority = excluded.priority,
                        is_channel_rule = excluded.is_channel_rule,
                        video_hash = excluded.video_hash,
                        channel_hash = excluded.channel_hash,
                        category_id = excluded.category_id,
                        updated_at = excluded.updated_at
                    "#
                ),
                params![
                    entry.item_id.as_str(),
                    entry.title.as_str(),
                    entry.content_type.as_str(),
                    entry.thumbnail.as_deref(),
                    entry.channel_id.as_deref(),
                    entry.channel_name.as_deref(),
                    entry.priority,
                    entry.is_channel_rule as i64,
                    entry.video_hash.as_str(),
                    entry.channel_hash.as_str(),
                    entry.category_id.as_deref(),
                    timestamp(entry.added_at),
                    timestamp(entry.updated_at),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_entry(&self, kind: ListKind, item_id: &str) -> Result<Option<ListEntry>> {
        let table = kind.table();
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM {table} WHERE item_id = ?1"),
                [item_id.trim()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_entry(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_entry(&self, kind: ListKind, item_id: &str) -> Result<()> {
        let table = kind.table();
        let removed = self
            .conn
            .execute(
                &format!("DELETE FROM {table} WHERE item_id = ?1"),
                [item_id.trim()],
            )
            .await?;
        if removed == 0 {
            return Err(FilterError::not_found(format!(
                "{item_id} is not in the {table}"
            )));
        }
        Ok(())
    }

    /// Deletes every listed id in one statement and returns how many existed.
    pub async fn delete_entries(&self, kind: ListKind, item_ids: &[String]) -> Result<u64> {
        let table = kind.table();
        let removed = self
            .conn
            .execute(
                &format!("DELETE FROM {table} WHERE item_id IN (SELECT value FROM json_each(?1))"),
                params![ids_json(item_ids)?],
            )
            .await?;
        Ok(removed)
    }

    pub async fn set_priority(&self, kind: ListKind, item_ids: &[String], priority: i64) -> Result<u64> {
        let table = kind.table();
        let updated = self
            .conn
            .execute(
                &format!(
                    "UPDATE {table} SET priority = ?1, updated_at = ?2 \
                     WHERE item_id IN (SELECT value FROM json_each(?3))"
                ),
                params![priority, timestamp(Utc::now()), ids_json(item_ids)?],
            )
            .await?;
        Ok(updated)
    }

    /// Paginated listing ordered by priority, then newest first. `search`
    /// matches case-insensitively against the title, channel name and id.
    pub async fn list_entries(&self, kind: ListKind, query: &EntryQuery) -> Result<Page<ListEntry>> {
        let table = kind.table();
        let content_type = query.content_type.map(ContentType::as_str);
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase);
        let filter = r#"
            WHERE (?1 IS NULL OR content_type = ?1)
              AND (
                ?2 IS NULL
                OR instr(lower(title), ?2) > 0
                OR instr(lower(coalesce(channel_name, '')), ?2) > 0
                OR instr(lower(item_id), ?2) > 0
              )
        "#;

        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM {table} {filter}"),
                params![content_type, search.clone()],
            )
            .await?;
        let total: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM {table} {filter} \
                     ORDER BY priority DESC, added_at DESC, item_id ASC \
                     LIMIT ?3 OFFSET ?4"
                ),
                params![
                    content_type,
                    search,
                    i64::from(query.take()),
                    i64::from(query.skip())
                ],
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_entry(&row)?);
        }

        Ok(Page {
            items,
            total,
            page: query.page.max(1),
            limit: query.take(),
        })
    }

    /// Every entry of a list, used to build the classification snapshot.
    pub async fn all_entries(&self, kind: ListKind) -> Result<Vec<ListEntry>> {
        let table = kind.table();
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM {table} ORDER BY priority DESC, added_at DESC"
                ),
                params![],
            )
            .await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }

    pub async fn count_by_type(&self, kind: ListKind) -> Result<Vec<TypeCount>> {
        let table = kind.table();
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT content_type, COUNT(*) FROM {table} \
                     GROUP BY content_type ORDER BY content_type"
                ),
                params![],
            )
            .await?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next().await? {
            let raw: String = row.get(0)?;
            counts.push(TypeCount {
                content_type: parse_content_type(&raw)?,
                count: row.get(1)?,
            });
        }
        Ok(counts)
    }

    // ---- patterns ---------------------------------------------------------

    pub async fn insert_pattern(&self, pattern: NewPattern) -> Result<Pattern> {
        pattern.validate()?;
        let pattern = pattern.into_pattern(Uuid::new_v4().to_string(), Utc::now());
        self.conn
            .execute(
                &format!(
                    "INSERT INTO patterns ({PATTERN_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    pattern.id.as_str(),
                    pattern.pattern.as_str(),
                    pattern.pattern_type.as_str(),
                    pattern.context.as_str(),
                    pattern.weight,
                    pattern.match_threshold,
                    pattern.is_active as i64,
                    pattern.match_count,
                    pattern.last_matched.map(timestamp),
                    pattern.category_id.as_deref(),
                    timestamp(pattern.created_at),
                    timestamp(pattern.updated_at),
                ],
            )
            .await?;
        Ok(pattern)
    }

    /// Replaces the editable fields of a pattern. Match statistics survive.
    pub async fn update_pattern(&self, id: &str, pattern: NewPattern) -> Result<Pattern> {
        pattern.validate()?;
        let updated = self
            .conn
            .execute(
                r#"
                UPDATE patterns SET
                    pattern = ?1,
                    pattern_type = ?2,
                    context = ?3,
                    weight = ?4,
                    match_threshold = ?5,
                    is_active = ?6,
                    category_id = ?7,
                    updated_at = ?8
                WHERE id = ?9
                "#,
                params![
                    pattern.pattern.as_str(),
                    pattern.pattern_type.as_str(),
                    pattern.context.as_str(),
                    pattern.weight,
                    pattern.match_threshold,
                    pattern.is_active as i64,
                    pattern.category_id.as_deref(),
                    timestamp(Utc::now()),
                    id,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(FilterError::not_found(format!("pattern {id} not found")));
        }
        self.get_pattern(id)
            .await?
            .ok_or_else(|| FilterError::not_found(format!("pattern {id} not found")))
    }

    pub async fn get_pattern(&self, id: &str) -> Result<Option<Pattern>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?1"),
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_pattern(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_patterns(&self) -> Result<Vec<Pattern>> {
        self.fetch_patterns("").await
    }

    /// Active patterns in evaluation order: heaviest first, then oldest.
    pub async fn active_patterns(&self) -> Result<Vec<Pattern>> {
        self.fetch_patterns("WHERE is_active = 1").await
    }

    async fn fetch_patterns(&self, filter: &str) -> Result<Vec<Pattern>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PATTERN_COLUMNS} FROM patterns {filter} \
                     ORDER BY weight DESC, created_at ASC, rowid ASC"
                ),
                params![],
            )
            .await?;
        let mut patterns = Vec::new();
        while let Some(row) = rows.next().await? {
            patterns.push(row_to_pattern(&row)?);
        }
        Ok(patterns)
    }

    pub async fn set_patterns_active(&self, ids: &[String], active: bool) -> Result<u64> {
        let updated = self
            .conn
            .execute(
                "UPDATE patterns SET is_active = ?1, updated_at = ?2 \
                 WHERE id IN (SELECT value FROM json_each(?3))",
                params![active as i64, timestamp(Utc::now()), ids_json(ids)?],
            )
            .await?;
        Ok(updated)
    }

    pub async fn delete_pattern(&self, id: &str) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM patterns WHERE id = ?1", [id])
            .await?;
        if removed == 0 {
            return Err(FilterError::not_found(format!("pattern {id} not found")));
        }
        Ok(())
    }

    /// Bumps the match counter and stamps the match time.
    pub async fn record_pattern_match(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE patterns SET match_count = match_count + 1, last_matched = ?1 WHERE id = ?2",
                params![timestamp(at), id],
            )
            .await?;
        Ok(())
    }

    // ---- categories -------------------------------------------------------

    pub async fn insert_category(&self, category: NewCategory) -> Result<Category> {
        category.validate()?;
        let name = category.name.trim().to_string();
        let mut rows = self
            .conn
            .query("SELECT 1 FROM categories WHERE name = ?1", [name.as_str()])
            .await?;
        if rows.next().await?.is_some() {
            return Err(FilterError::conflict(format!(
                "category {name:?} already exists"
            )));
        }

        let category = Category {
            id: Uuid::new_v4().to_string(),
            name,
            color: category.color,
            is_system: category.is_system,
            is_active: category.is_active,
            priority: category.priority,
            created_at: Utc::now(),
        };
        self.conn
            .execute(
                &format!("INSERT INTO categories ({CATEGORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    category.id.as_str(),
                    category.name.as_str(),
                    category.color.as_str(),
                    category.is_system as i64,
                    category.is_active as i64,
                    category.priority,
                    timestamp(category.created_at),
                ],
            )
            .await?;
        Ok(category)
    }

    pub async fn get_category(&self, id: &str) -> Result<Option<Category>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"),
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_category(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CATEGORY_COLUMNS} FROM categories ORDER BY priority DESC, name ASC"
                ),
                params![],
            )
            .await?;
        let mut categories = Vec::new();
        while let Some(row) = rows.next().await? {
            categories.push(row_to_category(&row)?);
        }
        Ok(categories)
    }

    /// System categories cannot be deleted.
    pub async fn delete_category(&self, id: &str) -> Result<()> {
        let Some(category) = self.get_category(id).await? else {
            return Err(FilterError::not_found(format!("category {id} not found")));
        };
        if category.is_system {
            return Err(FilterError::conflict(format!(
                "system category {:?} cannot be deleted",
                category.name
            )));
        }
        self.conn
            .execute("DELETE FROM categories WHERE id = ?1", [id])
            .await?;
        Ok(())
    }

    pub async fn set_categories_active(&self, ids: &[String], active: bool) -> Result<u64> {
        let updated = self
            .conn
            .execute(
                "UPDATE categories SET is_active = ?1 WHERE id IN (SELECT value FROM json_each(?2))",
                params![active as i64, ids_json(ids)?],
            )
            .await?;
        Ok(updated)
    }

    pub async fn set_categories_priority(&self, ids: &[String], priority: i64) -> Result<u64> {
        let updated = self
            .conn
            .execute(
                "UPDATE categories SET priority = ?1 WHERE id IN (SELECT value FROM json_each(?2))",
                params![priority, ids_json(ids)?],
            )
            .await?;
        Ok(updated)
    }

    // ---- daily metrics ----------------------------------------------------

    /// Folds one run into the row for `date`. Counters add up; the average
    /// filter time becomes the mean of the stored value and the run's average.
    pub async fn record_daily_metrics(
        &self,
        date: NaiveDate,
        run: &RunStats,
    ) -> std::result::Result<(), MetricError> {
        self.conn
            .execute(
                r#"
                INSERT INTO daily_metrics (
                    date, total_filtered, blocked_count, whitelisted_count,
                    pattern_matches, channel_blocks, cache_hits, errors, avg_filter_time
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(date) DO UPDATE SET
                    total_filtered = total_filtered + excluded.total_filtered,
                    blocked_count = blocked_count + excluded.blocked_count,
                    whitelisted_count = whitelisted_count + excluded.whitelisted_count,
                    pattern_matches = pattern_matches + excluded.pattern_matches,
                    channel_blocks = channel_blocks + excluded.channel_blocks,
                    cache_hits = cache_hits + excluded.cache_hits,
                    errors = errors + excluded.errors,
                    avg_filter_time = (avg_filter_time + excluded.avg_filter_time) / 2.0
                "#,
                params![
                    date.to_string(),
                    run.total as i64,
                    run.blocked as i64,
                    run.whitelisted as i64,
                    run.pattern_matches as i64,
                    run.channel_blocks as i64,
                    run.cache_hits as i64,
                    run.errors as i64,
                    run.avg_time_ms(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn daily_metrics(&self, date: NaiveDate) -> Result<Option<DailyMetrics>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT total_filtered, blocked_count, whitelisted_count, pattern_matches,
                       channel_blocks, cache_hits, errors, avg_filter_time
                FROM daily_metrics
                WHERE date = ?1
                "#,
                [date.to_string()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(DailyMetrics {
            date,
            total_filtered: row.get(0)?,
            blocked_count: row.get(1)?,
            whitelisted_count: row.get(2)?,
            pattern_matches: row.get(3)?,
            channel_blocks: row.get(4)?,
            cache_hits: row.get(5)?,
            errors: row.get(6)?,
            avg_filter_time: row.get(7)?,
        }))
    }
}

fn parse_content_type(raw: &str) -> Result<ContentType> {
    ContentType::parse(raw)
        .ok_or_else(|| FilterError::Internal(format!("unknown stored content type {raw:?}")))
}

// Column order must match ENTRY_COLUMNS.
fn row_to_entry(row: &Row) -> Result<ListEntry> {
    let content_type: String = row.get(2)?;
    let added_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok(ListEntry {
        item_id: row.get(0)?,
        title: row.get(1)?,
        content_type: parse_content_type(&content_type)?,
        thumbnail: row.get(3)?,
        channel_id: row.get(4)?,
        channel_name: row.get(5)?,
        priority: row.get(6)?,
        is_channel_rule: row.get::<i64>(7)? != 0,
        video_hash: row.get(8)?,
        channel_hash: row.get(9)?,
        category_id: row.get(10)?,
        added_at: parse_timestamp(&added_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

// Column order must match PATTERN_COLUMNS.
fn row_to_pattern(row: &Row) -> Result<Pattern> {
    let pattern_type: String = row.get(2)?;
    let context: String = row.get(3)?;
    let last_matched: Option<String> = row.get(8)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    Ok(Pattern {
        id: row.get(0)?,
        pattern: row.get(1)?,
        pattern_type: PatternType::parse(&pattern_type).ok_or_else(|| {
            FilterError::Internal(format!("unknown stored pattern type {pattern_type:?}"))
        })?,
        context: PatternContext::parse(&context).ok_or_else(|| {
            FilterError::Internal(format!("unknown stored pattern context {context:?}"))
        })?,
        weight: row.get(4)?,
        match_threshold: row.get(5)?,
        is_active: row.get::<i64>(6)? != 0,
        match_count: row.get(7)?,
        last_matched: last_matched.as_deref().map(parse_timestamp).transpose()?,
        category_id: row.get(9)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

// Column order must match CATEGORY_COLUMNS.
fn row_to_category(row: &Row) -> Result<Category> {
    let created_at: String = row.get(6)?;
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        is_system: row.get::<i64>(3)? != 0,
        is_active: row.get::<i64>(4)? != 0,
        priority: row.get(5)?,
        created_at: parse_timestamp(&created_at)?,
    })
}
