#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DB_PATH: &str = "filter.db";
pub const DEFAULT_FILTER_PORT: u16 = 8080;
pub const DEFAULT_FILTER_HOST: &str = "127.0.0.1";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_ACTIVE_IMPORTS: usize = 2;

#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub cache_ttl: Duration,
    pub batch_size: usize,
    pub channel_blocking: bool,
    pub pattern_matching: bool,
    pub max_active_imports: usize,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            host: DEFAULT_FILTER_HOST.to_string(),
            port: DEFAULT_FILTER_PORT,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            channel_blocking: true,
            pattern_matching: true,
            max_active_imports: DEFAULT_MAX_ACTIVE_IMPORTS,
        }
    }
}

/// Values given on the command line; they win over both the process
/// environment and the env file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub db_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<FilterSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> FilterSettings {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> FilterSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let defaults = FilterSettings::default();

    let db_path = overrides
        .db_path
        .or_else(|| lookup("FILTER_DB_PATH").map(PathBuf::from))
        .unwrap_or(defaults.db_path);
    let port = overrides
        .port
        .or_else(|| lookup("FILTER_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(defaults.port);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("FILTER_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(defaults.host);
    let cache_ttl = lookup("FILTER_CACHE_TTL_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(defaults.cache_ttl);
    let batch_size = lookup("FILTER_BATCH_SIZE")
        .and_then(|value| value.parse::<usize>().ok())
        .map(|value| value.clamp(1, MAX_BATCH_SIZE))
        .unwrap_or(defaults.batch_size);
    let channel_blocking = lookup("FILTER_CHANNEL_BLOCKING")
        .and_then(|value| parse_bool(&value))
        .unwrap_or(defaults.channel_blocking);
    let pattern_matching = lookup("FILTER_PATTERN_MATCHING")
        .and_then(|value| parse_bool(&value))
        .unwrap_or(defaults.pattern_matching);
    let max_active_imports = lookup("FILTER_MAX_ACTIVE_IMPORTS")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(defaults.max_active_imports);

    FilterSettings {
        db_path,
        host,
        port,
        cache_ttl,
        batch_size,
        channel_blocking,
        pattern_matching,
        max_active_imports,
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
