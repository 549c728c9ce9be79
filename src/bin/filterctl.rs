#![forbid(unsafe_code)]

//! Administrative command line for the content filter database.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use newtube_filter::{
    cache::ClassificationCache,
    config::{FilterSettings, SettingsOverrides, resolve_settings},
    engine::{EngineOptions, FilterEngine, prepare_batch},
    import::{ImportManager, ImportRequest},
    models::{ContentItem, ListKind, NewCategory, NewEntry, NewPattern, PatternContext, PatternType},
    store::FilterStore,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

/// Manage and exercise the NewTube content filter offline.
#[derive(Parser, Debug)]
#[command(name = "filterctl", version, about, long_about = None)]
struct Cli {
    /// Filter database path (overrides FILTER_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Env file to read settings from
    #[arg(long, global = true)]
    env: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a JSON array of content items and print the verdicts
    Classify {
        #[arg(short, long)]
        input: PathBuf,
        /// Items per chunk
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Import a JSON array of entries into a list
    Import {
        #[arg(long, value_parser = parse_list_kind, default_value = "blacklist")]
        list: ListKind,
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        skip_duplicates: bool,
    },
    /// Load categories and patterns from a TOML rules file
    Seed {
        #[arg(short, long)]
        rules: PathBuf,
    },
    /// Print list sizes and the daily metrics row
    Stats {
        /// Day to report, defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn parse_list_kind(value: &str) -> std::result::Result<ListKind, String> {
    ListKind::parse(value).ok_or_else(|| format!("expected blacklist or whitelist, got {value}"))
}

#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    categories: Vec<NewCategory>,
    #[serde(default)]
    patterns: Vec<SeedPattern>,
}

/// Pattern row of a rules file. Keys follow the API's camelCase; `category`
/// refers to a category by name.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedPattern {
    pattern: String,
    #[serde(rename = "type")]
    pattern_type: PatternType,
    #[serde(default)]
    context: PatternContext,
    #[serde(default = "default_seed_weight")]
    weight: f64,
    #[serde(default)]
    match_threshold: Option<f64>,
    #[serde(default = "default_seed_active", alias = "active")]
    is_active: bool,
    #[serde(default)]
    category: Option<String>,
}

fn default_seed_weight() -> f64 {
    1.0
}

fn default_seed_active() -> bool {
    true
}

fn parse_rules(content: &str) -> Result<RulesFile> {
    toml::from_str(content).context("parsing rules file")
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SeedSummary {
    categories_created: usize,
    categories_existing: usize,
    patterns_created: usize,
    patterns_existing: usize,
}

async fn seed_rules(store: &FilterStore, rules: RulesFile) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();
    let mut known = store.list_categories().await?;
    let mut existing_patterns: Vec<(String, PatternType, PatternContext)> = store
        .list_patterns()
        .await?
        .into_iter()
        .map(|pattern| (pattern.pattern, pattern.pattern_type, pattern.context))
        .collect();

    for category in rules.categories {
        if known.iter().any(|existing| existing.name == category.name) {
            summary.categories_existing += 1;
            continue;
        }
        let created = store.insert_category(category).await?;
        info!(category = %created.name, "category created");
        known.push(created);
        summary.categories_created += 1;
    }

    for seed in rules.patterns {
        let key = (seed.pattern.clone(), seed.pattern_type, seed.context);
        if existing_patterns.contains(&key) {
            summary.patterns_existing += 1;
            continue;
        }
        let category_id = match seed.category.as_deref() {
            Some(name) => Some(
                known
                    .iter()
                    .find(|category| category.name == name)
                    .map(|category| category.id.clone())
                    .ok_or_else(|| anyhow!("pattern {:?} names unknown category {name}", seed.pattern))?,
            ),
            None => None,
        };
        let pattern = NewPattern {
            pattern: seed.pattern,
            pattern_type: seed.pattern_type,
            context: seed.context,
            weight: seed.weight,
            match_threshold: seed.match_threshold,
            is_active: seed.is_active,
            category_id,
        };
        let created = store.insert_pattern(pattern).await?;
        info!(pattern_id = %created.id, "pattern created");
        existing_patterns.push(key);
        summary.patterns_created += 1;
    }

    Ok(summary)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

async fn open_engine(settings: &FilterSettings) -> Result<FilterEngine> {
    let store = FilterStore::open(&settings.db_path)
        .await
        .with_context(|| format!("opening filter DB {}", settings.db_path.display()))?;
    let cache = Arc::new(ClassificationCache::new(settings.cache_ttl));
    Ok(FilterEngine::new(store, cache, EngineOptions::from(settings)))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = resolve_settings(SettingsOverrides {
        db_path: cli.db,
        env_path: cli.env,
        ..SettingsOverrides::default()
    })?;
    let engine = open_engine(&settings).await?;

    match cli.command {
        Command::Classify { input, batch_size } => {
            let items: Vec<ContentItem> = read_json(&input)?;
            let prepared = prepare_batch(items);
            if prepared.dropped > 0 {
                warn!(dropped = prepared.dropped, "skipped items with invalid ids or titles");
            }
            let mut outcome = engine.classify_batch(prepared.items, batch_size).await;
            outcome.stats.dropped = prepared.dropped;
            let report = json!({ "results": outcome.results, "stats": outcome.stats });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Import {
            list,
            input,
            skip_duplicates,
        } => {
            let items: Vec<NewEntry> = read_json(&input)?;
            let mut request = ImportRequest::new(list, items);
            request.skip_duplicates = skip_duplicates;
            request.batch_name = input
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            let imports = ImportManager::new(engine.clone(), settings.max_active_imports);
            let progress = imports.run(request).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Command::Seed { rules } => {
            let content = fs::read_to_string(&rules)
                .with_context(|| format!("reading {}", rules.display()))?;
            let summary = seed_rules(engine.store(), parse_rules(&content)?).await?;
            println!(
                "categories: {} created, {} already present; patterns: {} created, {} already present",
                summary.categories_created,
                summary.categories_existing,
                summary.patterns_created,
                summary.patterns_existing
            );
        }
        Command::Stats { date } => {
            let store = engine.store();
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let report = json!({
                "blacklist": store.count_by_type(ListKind::Blacklist).await?,
                "whitelist": store.count_by_type(ListKind::Whitelist).await?,
                "patterns": store.list_patterns().await?.len(),
                "date": date,
                "daily": store.daily_metrics(date).await?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::tempdir;

    const RULES: &str = r##"
[[categories]]
name = "Spam"
color = "#ef4444"
isSystem = true

[[categories]]
name = "Clickbait"

[[patterns]]
pattern = "giveaway"
type = "keyword"
category = "Spam"

[[patterns]]
pattern = "you won't believe*"
type = "wildcard"
context = "title"
weight = 0.8
matchThreshold = 0.6
isActive = false
"##;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn import_flags_parse_list_kind() {
        let cli = Cli::try_parse_from([
            "filterctl",
            "--db",
            "/tmp/f.db",
            "import",
            "--list",
            "whitelist",
            "--input",
            "items.json",
            "--skip-duplicates",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/f.db")));
        match cli.command {
            Command::Import {
                list,
                skip_duplicates,
                ..
            } => {
                assert_eq!(list, ListKind::Whitelist);
                assert!(skip_duplicates);
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(
            Cli::try_parse_from(["filterctl", "import", "--list", "greylist", "-i", "x.json"])
                .is_err()
        );
    }

    #[test]
    fn stats_date_parses() {
        let cli = Cli::try_parse_from(["filterctl", "stats", "--date", "2024-03-01"]).unwrap();
        match cli.command {
            Command::Stats { date } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 1));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rules_file_parses_with_defaults() {
        let rules = parse_rules(RULES).unwrap();
        assert_eq!(rules.categories.len(), 2);
        assert!(rules.categories[0].is_system);
        assert_eq!(rules.categories[1].color, "#6b7280");
        assert_eq!(rules.patterns[0].weight, 1.0);
        assert!(rules.patterns[0].is_active);
        assert_eq!(rules.patterns[1].pattern_type, PatternType::Wildcard);
        assert_eq!(rules.patterns[1].weight, 0.8);
        assert_eq!(rules.patterns[1].match_threshold, Some(0.6));
        assert!(!rules.patterns[1].is_active);
    }

    #[tokio::test]
    async fn seeding_twice_creates_nothing_new() {
        let dir = tempdir().unwrap();
        let store = FilterStore::open(&dir.path().join("filter.db")).await.unwrap();

        let first = seed_rules(&store, parse_rules(RULES).unwrap()).await.unwrap();
        assert_eq!(
            first,
            SeedSummary {
                categories_created: 2,
                categories_existing: 0,
                patterns_created: 2,
                patterns_existing: 0,
            }
        );

        let patterns = store.list_patterns().await.unwrap();
        let spam = store
            .list_categories()
            .await
            .unwrap()
            .into_iter()
            .find(|category| category.name == "Spam")
            .unwrap();
        assert!(
            patterns
                .iter()
                .any(|pattern| pattern.category_id.as_deref() == Some(spam.id.as_str()))
        );

        let second = seed_rules(&store, parse_rules(RULES).unwrap()).await.unwrap();
        assert_eq!(
            second,
            SeedSummary {
                categories_created: 0,
                categories_existing: 2,
                patterns_created: 0,
                patterns_existing: 2,
            }
        );
        assert_eq!(store.list_patterns().await.unwrap().len(), 2);
    }

    #[test]
    fn legacy_active_key_is_accepted() {
        let rules = parse_rules(
            r#"
[[patterns]]
pattern = "x"
type = "keyword"
active = false
"#,
        )
        .unwrap();
        assert!(!rules.patterns[0].is_active);
    }

    #[tokio::test]
    async fn unknown_category_reference_fails() {
        let dir = tempdir().unwrap();
        let store = FilterStore::open(&dir.path().join("filter.db")).await.unwrap();
        let rules = parse_rules(
            r#"
[[patterns]]
pattern = "x"
type = "keyword"
category = "Missing"
"#,
        )
        .unwrap();
        assert!(seed_rules(&store, rules).await.is_err());
    }
}
