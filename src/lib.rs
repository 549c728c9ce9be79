#![forbid(unsafe_code)]

//! Content classification for NewTube: blacklist/whitelist lookups,
//! channel-level rules and weighted pattern matching behind a TTL cache.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod import;
pub mod matcher;
pub mod metrics;
pub mod models;
pub mod sanitize;
pub mod store;
