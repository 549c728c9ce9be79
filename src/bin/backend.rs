#![forbid(unsafe_code)]

//! Axum backend for the NewTube content filter.
//!
//! Classification endpoints always answer: when rule storage misbehaves the
//! engine lets content through and flags the affected results. Admin
//! endpoints (lists, patterns, categories, imports) report failures with a
//! structured JSON error body instead.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use newtube_filter::{
    cache::{CacheStats, ClassificationCache},
    config::{FilterSettings, SettingsOverrides, resolve_settings},
    engine::{BatchStats, EngineDetails, EngineOptions, FilterEngine, BestPatternMatch, prepare_batch},
    error::FilterError,
    import::{CancelOutcome, ImportManager, ImportProgress, ImportRequest, MAX_IMPORT_ITEMS},
    metrics::MetricsSnapshot,
    models::{
        Category, ClassificationResult, ContentItem, EntryQuery, ListEntry, ListKind, NewCategory,
        NewEntry, NewPattern, Page, Pattern, PatternContext,
    },
    sanitize::sanitize_item_id,
    store::FilterStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct BackendArgs {
    settings: FilterSettings,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = SettingsOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some((flag, value)) = arg.split_once('=')
                && flag.starts_with("--")
            {
                apply_flag(&mut overrides, flag, value.to_string())?;
                continue;
            }

            match arg.as_str() {
                "--db" | "--port" | "--host" | "--env" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("{arg} requires a value"))?;
                    apply_flag(&mut overrides, &arg, value)?;
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_settings(overrides)?;
        let listen_host = parse_host_arg(&settings.host)?;
        Ok(Self {
            settings,
            listen_host,
        })
    }
}

fn apply_flag(overrides: &mut SettingsOverrides, flag: &str, value: String) -> Result<()> {
    match flag {
        "--db" => overrides.db_path = Some(PathBuf::from(value)),
        "--port" => overrides.port = Some(parse_port_arg(&value)?),
        "--host" => {
            parse_host_arg(&value)?;
            overrides.host = Some(value);
        }
        "--env" => overrides.env_path = Some(PathBuf::from(value)),
        _ => return Err(anyhow!("unknown argument: {flag}")),
    }
    Ok(())
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/FILTER_HOST")
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    engine: FilterEngine,
    imports: ImportManager,
    settings: Arc<FilterSettings>,
}

async fn build_state(settings: FilterSettings) -> Result<AppState> {
    let store = FilterStore::open(&settings.db_path)
        .await
        .with_context(|| format!("opening filter DB {}", settings.db_path.display()))?;
    let cache = Arc::new(ClassificationCache::new(settings.cache_ttl));
    let engine = FilterEngine::new(store, cache, EngineOptions::from(&settings));
    let imports = ImportManager::new(engine.clone(), settings.max_active_imports);
    Ok(AppState {
        engine,
        imports,
        settings: Arc::new(settings),
    })
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "requestId": Uuid::new_v4().to_string(),
                "timestamp": Utc::now().to_rfc3339(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// Generous per-item allowance so a full bulk import (or a large classification
// batch with descriptions) fits in one request body.
const MAX_ITEM_BYTES: usize = 1024;
const MAX_BODY_BYTES: usize = MAX_IMPORT_ITEMS * MAX_ITEM_BYTES;

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/content-filter",
            post(classify_items)
                .put(classify_batched)
                .get(filter_status)
                .delete(clear_filter_cache),
        )
        .route(
            "/api/blacklist",
            get(list_blacklist).post(create_blacklist_entry),
        )
        .route(
            "/api/blacklist/bulk-import",
            post(start_blacklist_import)
                .get(import_status)
                .delete(cancel_import),
        )
        .route("/api/blacklist/batch", post(blacklist_batch))
        .route(
            "/api/blacklist/{item_id}",
            get(get_blacklist_entry).delete(delete_blacklist_entry),
        )
        .route(
            "/api/whitelist",
            get(list_whitelist).post(create_whitelist_entry),
        )
        .route(
            "/api/whitelist/bulk-import",
            post(start_whitelist_import)
                .get(import_status)
                .delete(cancel_import),
        )
        .route("/api/whitelist/batch", post(whitelist_batch))
        .route(
            "/api/whitelist/{item_id}",
            get(get_whitelist_entry).delete(delete_whitelist_entry),
        )
        .route("/api/patterns", get(list_patterns).post(create_pattern))
        .route("/api/patterns/batch", post(patterns_batch))
        .route("/api/patterns/test", post(test_patterns))
        .route(
            "/api/patterns/{id}",
            put(update_pattern).delete(delete_pattern),
        )
        .route(
            "/api/categories",
            get(list_categories).post(create_category),
        )
        .route("/api/categories/batch", post(categories_batch))
        .route(
            "/api/categories/{id}",
            axum::routing::delete(delete_category),
        )
        .fallback(not_found_fallback)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let BackendArgs {
        settings,
        listen_host,
    } = BackendArgs::parse()?;
    let port = settings.port;
    let state = build_state(settings).await?;
    let app = router(state);

    let addr = SocketAddr::new(listen_host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "content filter listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn not_found_fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

// ---- classification -----------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyOptions {
    #[serde(default)]
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyRequest {
    #[serde(default)]
    items: Vec<ContentItem>,
    #[serde(default)]
    options: ClassifyOptions,
    #[serde(default)]
    batch_size: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyResponse {
    results: Vec<ClassificationResult>,
    stats: BatchStats,
    metrics: MetricsSnapshot,
}

async fn classify_items(
    State(state): State<AppState>,
    Json(request): Json<ClassifyRequest>,
) -> ApiResult<Json<ClassifyResponse>> {
    let batch_size = request.options.batch_size;
    run_classification(&state, request.items, batch_size).await
}

async fn classify_batched(
    State(state): State<AppState>,
    Json(request): Json<ClassifyRequest>,
) -> ApiResult<Json<ClassifyResponse>> {
    let batch_size = request
        .batch_size
        .or(request.options.batch_size)
        .unwrap_or(state.settings.batch_size);
    run_classification(&state, request.items, Some(batch_size)).await
}

async fn run_classification(
    state: &AppState,
    items: Vec<ContentItem>,
    batch_size: Option<usize>,
) -> ApiResult<Json<ClassifyResponse>> {
    if items.is_empty() {
        return Err(ApiError::validation("items must be a non-empty array"));
    }
    let prepared = prepare_batch(items);
    let mut outcome = state.engine.classify_batch(prepared.items, batch_size).await;
    outcome.stats.dropped = prepared.dropped;
    if outcome.stats.errors > 0 {
        warn!(errors = outcome.stats.errors, "classification failed open for some items");
    }
    Ok(Json(ClassifyResponse {
        results: outcome.results,
        stats: outcome.stats,
        metrics: state.engine.metrics(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    details: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EngineConfig {
    channel_blocking: bool,
    pattern_matching: bool,
    batch_size: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FilterStatus {
    metrics: MetricsSnapshot,
    cache: CacheStats,
    config: EngineConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<EngineDetails>,
}

async fn filter_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<FilterStatus>> {
    let options = state.engine.options();
    let details = if query.details {
        Some(state.engine.details().await?)
    } else {
        None
    };
    Ok(Json(FilterStatus {
        metrics: state.engine.metrics(),
        cache: state.engine.cache_stats(),
        config: EngineConfig {
            channel_blocking: options.channel_blocking,
            pattern_matching: options.pattern_matching,
            batch_size: options.batch_size,
        },
        details,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearQuery {
    #[serde(default)]
    reset_metrics: bool,
}

async fn clear_filter_cache(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
) -> Json<Value> {
    state.engine.clear_cache();
    if query.reset_metrics {
        state.engine.reset_metrics();
    }
    info!(reset_metrics = query.reset_metrics, "classification cache cleared on request");
    Json(json!({
        "cleared": true,
        "metricsReset": query.reset_metrics,
        "cache": state.engine.cache_stats(),
    }))
}

// ---- bulk import --------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchIdQuery {
    #[serde(default)]
    batch_id: Option<String>,
}

async fn start_blacklist_import(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<(StatusCode, Json<ImportProgress>)> {
    start_import(&state, ListKind::Blacklist, request)
}

async fn start_whitelist_import(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<(StatusCode, Json<ImportProgress>)> {
    start_import(&state, ListKind::Whitelist, request)
}

fn start_import(
    state: &AppState,
    kind: ListKind,
    mut request: ImportRequest,
) -> ApiResult<(StatusCode, Json<ImportProgress>)> {
    request.list = kind;
    let progress = state.imports.start(request)?;
    info!(batch_id = %progress.id, items = progress.total, list = kind.table(), "bulk import queued");
    Ok((StatusCode::ACCEPTED, Json(progress)))
}

async fn import_status(
    State(state): State<AppState>,
    Query(query): Query<BatchIdQuery>,
) -> ApiResult<Response> {
    match query.batch_id {
        Some(batch_id) => {
            let progress = state
                .imports
                .status(&batch_id)
                .ok_or_else(|| ApiError::not_found(format!("import {batch_id} not found")))?;
            Ok(Json(progress).into_response())
        }
        None => Ok(Json(json!({ "imports": state.imports.list() })).into_response()),
    }
}

async fn cancel_import(
    State(state): State<AppState>,
    Query(query): Query<BatchIdQuery>,
) -> ApiResult<Json<Value>> {
    let batch_id = query
        .batch_id
        .ok_or_else(|| ApiError::validation("batchId is required"))?;
    let body = match state.imports.cancel(&batch_id)? {
        CancelOutcome::Cancelled(progress) => json!({ "status": "cancelled", "import": progress }),
        CancelOutcome::Removed(progress) => json!({ "status": "removed", "import": progress }),
    };
    Ok(Json(body))
}

// ---- blacklist / whitelist ----------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EntryAction {
    Delete,
    SetPriority,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryBatchRequest {
    action: EntryAction,
    #[serde(default)]
    item_ids: Vec<String>,
    #[serde(default)]
    priority: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchResponse {
    action: &'static str,
    affected: u64,
}

async fn list_blacklist(
    State(state): State<AppState>,
    Query(query): Query<EntryQuery>,
) -> ApiResult<Json<Page<ListEntry>>> {
    list_entries(&state, ListKind::Blacklist, query).await
}

async fn list_whitelist(
    State(state): State<AppState>,
    Query(query): Query<EntryQuery>,
) -> ApiResult<Json<Page<ListEntry>>> {
    list_entries(&state, ListKind::Whitelist, query).await
}

async fn create_blacklist_entry(
    State(state): State<AppState>,
    Json(entry): Json<NewEntry>,
) -> ApiResult<(StatusCode, Json<ListEntry>)> {
    create_entry(&state, ListKind::Blacklist, entry).await
}

async fn create_whitelist_entry(
    State(state): State<AppState>,
    Json(entry): Json<NewEntry>,
) -> ApiResult<(StatusCode, Json<ListEntry>)> {
    create_entry(&state, ListKind::Whitelist, entry).await
}

async fn get_blacklist_entry(
    State(state): State<AppState>,
    AxumPath(item_id): AxumPath<String>,
) -> ApiResult<Json<ListEntry>> {
    get_entry(&state, ListKind::Blacklist, &item_id).await
}

async fn get_whitelist_entry(
    State(state): State<AppState>,
    AxumPath(item_id): AxumPath<String>,
) -> ApiResult<Json<ListEntry>> {
    get_entry(&state, ListKind::Whitelist, &item_id).await
}

async fn delete_blacklist_entry(
    State(state): State<AppState>,
    AxumPath(item_id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    delete_entry(&state, ListKind::Blacklist, &item_id).await
}

async fn delete_whitelist_entry(
    State(state): State<AppState>,
    AxumPath(item_id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    delete_entry(&state, ListKind::Whitelist, &item_id).await
}

async fn blacklist_batch(
    State(state): State<AppState>,
    Json(request): Json<EntryBatchRequest>,
) -> ApiResult<Json<BatchResponse>> {
    entry_batch(&state, ListKind::Blacklist, request).await
}

async fn whitelist_batch(
    State(state): State<AppState>,
    Json(request): Json<EntryBatchRequest>,
) -> ApiResult<Json<BatchResponse>> {
    entry_batch(&state, ListKind::Whitelist, request).await
}

async fn list_entries(
    state: &AppState,
    kind: ListKind,
    query: EntryQuery,
) -> ApiResult<Json<Page<ListEntry>>> {
    Ok(Json(state.engine.store().list_entries(kind, &query).await?))
}

async fn create_entry(
    state: &AppState,
    kind: ListKind,
    mut entry: NewEntry,
) -> ApiResult<(StatusCode, Json<ListEntry>)> {
    entry.item_id = sanitize_item_id(entry.content_type, &entry.item_id).ok_or_else(|| {
        ApiError::validation(format!("itemId is not a valid {} id", entry.content_type.as_str()))
    })?;
    let created = state.engine.store().insert_entry(kind, entry).await?;
    state.engine.clear_cache();
    info!(item_id = %created.item_id, list = kind.table(), "entry added");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_entry(state: &AppState, kind: ListKind, item_id: &str) -> ApiResult<Json<ListEntry>> {
    state
        .engine
        .store()
        .get_entry(kind, item_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("{item_id} is not in the {}", kind.table())))
}

async fn delete_entry(state: &AppState, kind: ListKind, item_id: &str) -> ApiResult<StatusCode> {
    state.engine.store().delete_entry(kind, item_id).await?;
    state.engine.clear_cache();
    info!(item_id, list = kind.table(), "entry removed");
    Ok(StatusCode::NO_CONTENT)
}

async fn entry_batch(
    state: &AppState,
    kind: ListKind,
    request: EntryBatchRequest,
) -> ApiResult<Json<BatchResponse>> {
    if request.item_ids.is_empty() {
        return Err(ApiError::validation("itemIds must not be empty"));
    }
    let store = state.engine.store();
    let (action, affected) = match request.action {
        EntryAction::Delete => ("delete", store.delete_entries(kind, &request.item_ids).await?),
        EntryAction::SetPriority => {
            let priority = request
                .priority
                .ok_or_else(|| ApiError::validation("priority is required for set_priority"))?;
            (
                "set_priority",
                store.set_priority(kind, &request.item_ids, priority).await?,
            )
        }
    };
    state.engine.clear_cache();
    Ok(Json(BatchResponse { action, affected }))
}

// ---- patterns -----------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ToggleAction {
    Activate,
    Deactivate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatternBatchRequest {
    action: ToggleAction,
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatternTestRequest {
    text: String,
    #[serde(default)]
    context: PatternContext,
}

async fn list_patterns(State(state): State<AppState>) -> ApiResult<Json<Vec<Pattern>>> {
    Ok(Json(state.engine.store().list_patterns().await?))
}

async fn create_pattern(
    State(state): State<AppState>,
    Json(pattern): Json<NewPattern>,
) -> ApiResult<(StatusCode, Json<Pattern>)> {
    let created = state.engine.store().insert_pattern(pattern).await?;
    state.engine.clear_cache();
    info!(pattern_id = %created.id, kind = created.pattern_type.as_str(), "pattern created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_pattern(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(pattern): Json<NewPattern>,
) -> ApiResult<Json<Pattern>> {
    let updated = state.engine.store().update_pattern(&id, pattern).await?;
    state.engine.clear_cache();
    Ok(Json(updated))
}

async fn delete_pattern(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    state.engine.store().delete_pattern(&id).await?;
    state.engine.clear_cache();
    info!(pattern_id = %id, "pattern deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn patterns_batch(
    State(state): State<AppState>,
    Json(request): Json<PatternBatchRequest>,
) -> ApiResult<Json<BatchResponse>> {
    if request.ids.is_empty() {
        return Err(ApiError::validation("ids must not be empty"));
    }
    let (action, active) = match request.action {
        ToggleAction::Activate => ("activate", true),
        ToggleAction::Deactivate => ("deactivate", false),
    };
    let affected = state
        .engine
        .store()
        .set_patterns_active(&request.ids, active)
        .await?;
    state.engine.clear_cache();
    Ok(Json(BatchResponse { action, affected }))
}

async fn test_patterns(
    State(state): State<AppState>,
    Json(request): Json<PatternTestRequest>,
) -> Json<BestPatternMatch> {
    Json(
        state
            .engine
            .best_pattern_match(&request.text, request.context)
            .await,
    )
}

// ---- categories ---------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CategoryAction {
    Activate,
    Deactivate,
    SetPriority,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryBatchRequest {
    action: CategoryAction,
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    priority: Option<i64>,
}

async fn list_categories(State(state): State<AppState>) -> ApiResult<Json<Vec<Category>>> {
    Ok(Json(state.engine.store().list_categories().await?))
}

async fn create_category(
    State(state): State<AppState>,
    Json(category): Json<NewCategory>,
) -> ApiResult<(StatusCode, Json<Category>)> {
    let created = state.engine.store().insert_category(category).await?;
    state.engine.clear_cache();
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_category(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    state.engine.store().delete_category(&id).await?;
    state.engine.clear_cache();
    Ok(StatusCode::NO_CONTENT)
}

async fn categories_batch(
    State(state): State<AppState>,
    Json(request): Json<CategoryBatchRequest>,
) -> ApiResult<Json<BatchResponse>> {
    if request.ids.is_empty() {
        return Err(ApiError::validation("ids must not be empty"));
    }
    let store = state.engine.store();
    let (action, affected) = match request.action {
        CategoryAction::Activate => ("activate", store.set_categories_active(&request.ids, true).await?),
        CategoryAction::Deactivate => (
            "deactivate",
            store.set_categories_active(&request.ids, false).await?,
        ),
        CategoryAction::SetPriority => {
            let priority = request
                .priority
                .ok_or_else(|| ApiError::validation("priority is required for set_priority"))?;
            (
                "set_priority",
                store.set_categories_priority(&request.ids, priority).await?,
            )
        }
    };
    state.engine.clear_cache();
    Ok(Json(BatchResponse { action, affected }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use newtube_filter::import::ImportStatus;
    use newtube_filter::models::{ContentType, PatternType};
    use tower::ServiceExt;
    use std::time::Duration;
    use tempfile::tempdir;

    struct BackendTestContext {
        _temp: tempfile::TempDir,
        state: AppState,
    }

    impl BackendTestContext {
        async fn new() -> Self {
            let temp = tempdir().unwrap();
            let settings = FilterSettings {
                db_path: temp.path().join("filter.db"),
                ..FilterSettings::default()
            };
            let state = build_state(settings).await.unwrap();
            Self { _temp: temp, state }
        }

        fn state(&self) -> State<AppState> {
            State(self.state.clone())
        }
    }

    fn video(item_id: &str, title: &str) -> ContentItem {
        ContentItem::new(item_id, ContentType::Video, title)
    }

    fn new_entry(item_id: &str) -> NewEntry {
        NewEntry {
            item_id: item_id.into(),
            title: format!("entry {item_id}"),
            ..NewEntry::default()
        }
    }

    fn classify_request(items: Vec<ContentItem>) -> ClassifyRequest {
        ClassifyRequest {
            items,
            options: ClassifyOptions::default(),
            batch_size: None,
        }
    }

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn backend_args_flags_override_settings() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join("missing.env");
        let args = BackendArgs::from_iter(
            [
                "--db",
                "/data/filter.db",
                "--port=9100",
                "--host",
                "0.0.0.0",
                "--env",
                env_path.to_str().unwrap(),
            ]
            .map(String::from),
        )
        .unwrap();
        assert_eq!(args.settings.db_path, PathBuf::from("/data/filter.db"));
        assert_eq!(args.settings.port, 9100);
        assert_eq!(args.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_reject_unknown_and_invalid_values() {
        assert!(BackendArgs::from_iter(["--verbose".to_string()]).is_err());
        assert!(BackendArgs::from_iter(["--port".to_string(), "http".to_string()]).is_err());
        assert!(BackendArgs::from_iter(["--host=localhost".to_string()]).is_err());
        assert!(BackendArgs::from_iter(["--db".to_string()]).is_err());
    }

    #[tokio::test]
    async fn api_error_serializes_structured_body() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "NOT_FOUND");
        assert_eq!(parsed["error"]["message"], "missing");
        assert!(parsed["error"]["requestId"].as_str().unwrap().len() >= 32);
        assert!(parsed["error"]["timestamp"].is_string());
    }

    #[test]
    fn filter_errors_map_to_status_codes() {
        let conflict = ApiError::from(FilterError::conflict("dup"));
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.code, "CONFLICT");
        let limited = ApiError::from(FilterError::RateLimited("busy".into()));
        assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn classify_drops_unusable_items_and_reports_stats() {
        let ctx = BackendTestContext::new().await;
        let Json(response) = classify_items(
            ctx.state(),
            Json(classify_request(vec![
                video("dQw4w9WgXcQ", "Never gonna"),
                video("not-an-id", "Broken"),
                video("aaaaaaaaaaa", "  "),
            ])),
        )
        .await
        .unwrap();

        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].allowed);
        assert_eq!(response.stats.dropped, 2);
        assert_eq!(response.stats.total, 1);
        assert_eq!(response.stats.chunks, 1);
        assert_eq!(response.metrics.total_items, 1);
    }

    #[tokio::test]
    async fn classify_rejects_empty_items() {
        let ctx = BackendTestContext::new().await;
        let err = classify_items(ctx.state(), Json(classify_request(Vec::new())))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn batched_classification_uses_requested_chunk_size() {
        let ctx = BackendTestContext::new().await;
        let items = (0..25)
            .map(|i| video(&format!("vid{i:08}"), "title"))
            .collect();
        let mut request = classify_request(items);
        request.batch_size = Some(10);

        let Json(response) = classify_batched(ctx.state(), Json(request)).await.unwrap();
        assert_eq!(response.results.len(), 25);
        assert_eq!(response.stats.chunks, 3);
    }

    #[tokio::test]
    async fn blacklist_mutations_take_effect_immediately() {
        let ctx = BackendTestContext::new().await;
        let item = video("dQw4w9WgXcQ", "Never gonna");

        let Json(before) = classify_items(ctx.state(), Json(classify_request(vec![item.clone()])))
            .await
            .unwrap();
        assert!(before.results[0].allowed);

        let (status, Json(created)) = create_blacklist_entry(
            ctx.state(),
            Json(new_entry("https://www.youtube.com/watch?v=dQw4w9WgXcQ")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.item_id, "dQw4w9WgXcQ");

        let Json(after) = classify_items(ctx.state(), Json(classify_request(vec![item.clone()])))
            .await
            .unwrap();
        assert!(after.results[0].blocked);

        let Json(fetched) = get_blacklist_entry(ctx.state(), AxumPath("dQw4w9WgXcQ".into()))
            .await
            .unwrap();
        assert_eq!(fetched.title, created.title);

        let status = delete_blacklist_entry(ctx.state(), AxumPath("dQw4w9WgXcQ".into()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let missing = get_blacklist_entry(ctx.state(), AxumPath("dQw4w9WgXcQ".into()))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let Json(cleared) = classify_items(ctx.state(), Json(classify_request(vec![item])))
            .await
            .unwrap();
        assert!(cleared.results[0].allowed);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_entries_are_rejected() {
        let ctx = BackendTestContext::new().await;
        create_whitelist_entry(ctx.state(), Json(new_entry("dQw4w9WgXcQ")))
            .await
            .unwrap();
        let dup = create_whitelist_entry(ctx.state(), Json(new_entry("dQw4w9WgXcQ")))
            .await
            .unwrap_err();
        assert_eq!(dup.status, StatusCode::CONFLICT);

        let invalid = create_whitelist_entry(ctx.state(), Json(new_entry("??")))
            .await
            .unwrap_err();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_and_batch_operations() {
        let ctx = BackendTestContext::new().await;
        for id in ["aaaaaaaaaaa", "bbbbbbbbbbb", "ccccccccccc"] {
            create_blacklist_entry(ctx.state(), Json(new_entry(id)))
                .await
                .unwrap();
        }

        let Json(bumped) = blacklist_batch(
            ctx.state(),
            Json(EntryBatchRequest {
                action: EntryAction::SetPriority,
                item_ids: vec!["ccccccccccc".into()],
                priority: Some(10),
            }),
        )
        .await
        .unwrap();
        assert_eq!(bumped.affected, 1);

        let Json(page) = list_blacklist(ctx.state(), Query(EntryQuery::default()))
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items[0].item_id, "ccccccccccc");

        let missing_priority = blacklist_batch(
            ctx.state(),
            Json(EntryBatchRequest {
                action: EntryAction::SetPriority,
                item_ids: vec!["aaaaaaaaaaa".into()],
                priority: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(missing_priority.status, StatusCode::BAD_REQUEST);

        let Json(deleted) = blacklist_batch(
            ctx.state(),
            Json(EntryBatchRequest {
                action: EntryAction::Delete,
                item_ids: vec!["aaaaaaaaaaa".into(), "bbbbbbbbbbb".into()],
                priority: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(deleted.affected, 2);
    }

    #[tokio::test]
    async fn patterns_validate_regex_and_score_text() {
        let ctx = BackendTestContext::new().await;
        let unsafe_regex = NewPattern {
            pattern: "(?=.*x)*".into(),
            pattern_type: PatternType::Regex,
            context: PatternContext::Title,
            weight: 1.0,
            match_threshold: None,
            is_active: true,
            category_id: None,
        };
        let err = create_pattern(ctx.state(), Json(unsafe_regex))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let (_, Json(created)) = create_pattern(
            ctx.state(),
            Json(NewPattern {
                pattern: "giveaway".into(),
                pattern_type: PatternType::Keyword,
                context: PatternContext::Title,
                weight: 1.0,
                match_threshold: None,
                is_active: true,
                category_id: None,
            }),
        )
        .await
        .unwrap();

        let Json(best) = test_patterns(
            ctx.state(),
            Json(PatternTestRequest {
                text: "Huge GIVEAWAY today".into(),
                context: PatternContext::Title,
            }),
        )
        .await;
        assert!(best.matched);
        assert_eq!(best.pattern_id.as_deref(), Some(created.id.as_str()));

        let Json(toggled) = patterns_batch(
            ctx.state(),
            Json(PatternBatchRequest {
                action: ToggleAction::Deactivate,
                ids: vec![created.id.clone()],
            }),
        )
        .await
        .unwrap();
        assert_eq!(toggled.affected, 1);

        let Json(best) = test_patterns(
            ctx.state(),
            Json(PatternTestRequest {
                text: "Huge GIVEAWAY today".into(),
                context: PatternContext::Title,
            }),
        )
        .await;
        assert!(!best.matched);
    }

    #[tokio::test]
    async fn system_categories_cannot_be_deleted() {
        let ctx = BackendTestContext::new().await;
        let (_, Json(system)) = create_category(
            ctx.state(),
            Json(NewCategory {
                name: "Spam".into(),
                color: "#ff0000".into(),
                is_system: true,
                is_active: true,
                priority: 0,
            }),
        )
        .await
        .unwrap();
        let err = delete_category(ctx.state(), AxumPath(system.id))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn bulk_import_can_be_polled_and_removed() {
        let ctx = BackendTestContext::new().await;
        let request = ImportRequest::new(
            ListKind::Whitelist,
            vec![new_entry("aaaaaaaaaaa"), new_entry("bbbbbbbbbbb")],
        );
        let (status, Json(queued)) = start_blacklist_import(ctx.state(), Json(request))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(queued.list, ListKind::Blacklist);

        let mut finished = None;
        for _ in 0..500 {
            let response = import_status(
                ctx.state(),
                Query(BatchIdQuery {
                    batch_id: Some(queued.id.clone()),
                }),
            )
            .await
            .unwrap();
            let body = body_json(response).await;
            if body["status"] == "completed" {
                finished = Some(body);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let finished = finished.expect("import completed");
        assert_eq!(finished["imported"], 2);
        assert_eq!(
            ctx.state.imports.status(&queued.id).unwrap().status,
            ImportStatus::Completed
        );

        let Json(removed) = cancel_import(
            ctx.state(),
            Query(BatchIdQuery {
                batch_id: Some(queued.id.clone()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(removed["status"], "removed");

        let missing = cancel_import(ctx.state(), Query(BatchIdQuery::default()))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_details_and_cache_can_be_cleared() {
        let ctx = BackendTestContext::new().await;
        create_blacklist_entry(ctx.state(), Json(new_entry("aaaaaaaaaaa")))
            .await
            .unwrap();
        classify_items(
            ctx.state(),
            Json(classify_request(vec![video("aaaaaaaaaaa", "t")])),
        )
        .await
        .unwrap();

        let Json(status) = filter_status(ctx.state(), Query(StatusQuery { details: true }))
            .await
            .unwrap();
        let details = status.details.expect("details requested");
        assert_eq!(details.blacklist[0].count, 1);
        assert_eq!(status.metrics.blocked, 1);
        assert!(status.cache.entries.iter().any(|slot| slot.populated));

        let Json(cleared) = clear_filter_cache(ctx.state(), Query(ClearQuery::default())).await;
        assert_eq!(cleared["cleared"], true);
        assert_eq!(ctx.state.engine.metrics().total_items, 1);
        assert!(
            ctx.state
                .engine
                .cache_stats()
                .entries
                .iter()
                .all(|slot| !slot.populated)
        );
    }

    #[tokio::test]
    async fn unknown_api_path_returns_structured_404() {
        let response = not_found_fallback().await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn router_builds_with_every_route() {
        let ctx = BackendTestContext::new().await;
        let _app = router(ctx.state.clone());
        let Json(health) = health().await;
        assert_eq!(health.status, "ok");
    }

    fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn padded(len: usize) -> String {
        "lorem ipsum ".repeat(len / 12 + 1)[..len].to_string()
    }

    #[tokio::test]
    async fn ten_thousand_item_batch_fits_request_body() {
        let ctx = BackendTestContext::new().await;
        let items: Vec<Value> = (0..10_000)
            .map(|i| {
                json!({
                    "itemId": format!("vid{i:08}"),
                    "type": "video",
                    "title": format!("Episode {i}"),
                    "channelName": "Some Channel",
                    "description": padded(220),
                })
            })
            .collect();
        let body = json!({ "items": items, "batchSize": 100 });
        assert!(serde_json::to_vec(&body).unwrap().len() > 2 * 1024 * 1024);

        let response = router(ctx.state.clone())
            .oneshot(json_request(Method::PUT, "/api/content-filter", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let parsed = body_json(response).await;
        assert_eq!(parsed["results"].as_array().unwrap().len(), 10_000);
        assert_eq!(parsed["stats"]["chunks"], 100);
    }

    #[tokio::test]
    async fn large_bulk_import_is_accepted() {
        let ctx = BackendTestContext::new().await;
        let items: Vec<Value> = (0..30_000)
            .map(|i| {
                json!({
                    "itemId": format!("imp{i:08}"),
                    "title": format!("Imported {i}"),
                    "channelName": "Bulk Channel",
                })
            })
            .collect();
        let body = json!({ "items": items, "skipDuplicates": true });
        assert!(serde_json::to_vec(&body).unwrap().len() > 2 * 1024 * 1024);

        let response = router(ctx.state.clone())
            .oneshot(json_request(Method::POST, "/api/blacklist/bulk-import", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let parsed = body_json(response).await;
        assert_eq!(parsed["total"], 30_000);

        let batch_id = parsed["id"].as_str().unwrap().to_string();
        ctx.state.imports.cancel(&batch_id).unwrap();
    }

    #[tokio::test]
    async fn clearing_cache_can_reset_metrics() {
        let ctx = BackendTestContext::new().await;
        classify_items(
            ctx.state(),
            Json(classify_request(vec![video("aaaaaaaaaaa", "t")])),
        )
        .await
        .unwrap();

        let Json(cleared) =
            clear_filter_cache(ctx.state(), Query(ClearQuery { reset_metrics: true })).await;
        assert_eq!(cleared["metricsReset"], true);
        assert_eq!(ctx.state.engine.metrics().total_items, 0);
    }
}
