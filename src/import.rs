#![forbid(unsafe_code)]

//! Bulk import jobs for the blacklist and whitelist.
//!
//! Jobs are tracked in a mutex-guarded map keyed by `import-N` ids so clients
//! can poll progress. Each job writes its items chunk by chunk, yielding
//! between chunks and checking its cancellation token before starting the
//! next one. The classification cache is cleared once a job stops.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::FilterEngine;
use crate::error::{FilterError, Result};
use crate::models::{ListKind, NewEntry};
use crate::sanitize::sanitize_item_id;
use crate::store::FilterStore;

pub const DEFAULT_IMPORT_CHUNK: usize = 50;
pub const MAX_IMPORT_CHUNK: usize = 500;
pub const MAX_IMPORT_ITEMS: usize = 50_000;
pub const MAX_RECORDED_ERRORS: usize = 50;
/// Finished job records kept for polling; older ones are evicted.
pub const DEFAULT_FINISHED_RETENTION: usize = 100;

fn default_list() -> ListKind {
    ListKind::Blacklist
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    #[serde(default)]
    pub items: Vec<NewEntry>,
    #[serde(default = "default_list")]
    pub list: ListKind,
    #[serde(default)]
    pub batch_name: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub skip_duplicates: bool,
}

impl ImportRequest {
    pub fn new(list: ListKind, items: Vec<NewEntry>) -> Self {
        Self {
            items,
            list,
            batch_name: None,
            chunk_size: None,
            skip_duplicates: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_name: Option<String>,
    pub list: ListKind,
    pub status: ImportStatus,
    pub total: usize,
    pub processed: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub message: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// What `DELETE` did to a job.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job was still running and will stop before its next chunk.
    Cancelled(ImportProgress),
    /// The job had already finished; its record is gone.
    Removed(ImportProgress),
}

enum ItemOutcome {
    Imported,
    Skipped,
}

struct ImportJob {
    progress: ImportProgress,
    cancel: CancellationToken,
}

struct ImportManagerInner {
    jobs: Mutex<HashMap<String, ImportJob>>,
    counter: AtomicUsize,
    engine: FilterEngine,
    max_active: usize,
    retain_finished: usize,
}

#[derive(Clone)]
pub struct ImportManager {
    inner: Arc<ImportManagerInner>,
}

impl ImportManager {
    pub fn new(engine: FilterEngine, max_active: usize) -> Self {
        Self::with_retention(engine, max_active, DEFAULT_FINISHED_RETENTION)
    }

    /// Like [`ImportManager::new`], keeping at most `retain_finished`
    /// finished records (never fewer than one).
    pub fn with_retention(engine: FilterEngine, max_active: usize, retain_finished: usize) -> Self {
        Self {
            inner: Arc::new(ImportManagerInner {
                jobs: Mutex::new(HashMap::new()),
                counter: AtomicUsize::new(1),
                engine,
                max_active: max_active.max(1),
                retain_finished: retain_finished.max(1),
            }),
        }
    }

    /// Registers a job and runs it in the background. Returns the queued
    /// progress record.
    pub fn start(&self, request: ImportRequest) -> Result<ImportProgress> {
        let (progress, token) = self.register(&request)?;
        let manager = self.clone();
        let job_id = progress.id.clone();
        tokio::spawn(async move { manager.execute(job_id, request, token).await });
        Ok(progress)
    }

    /// Registers a job and runs it on the current task, returning the final
    /// progress record.
    pub async fn run(&self, request: ImportRequest) -> Result<ImportProgress> {
        let (progress, token) = self.register(&request)?;
        let job_id = progress.id.clone();
        self.execute(job_id.clone(), request, token).await;
        self.status(&job_id)
            .ok_or_else(|| FilterError::Internal(format!("import {job_id} vanished")))
    }

    pub fn status(&self, job_id: &str) -> Option<ImportProgress> {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .map(|job| job.progress.clone())
    }

    pub fn list(&self) -> Vec<ImportProgress> {
        let mut jobs: Vec<_> = self
            .inner
            .jobs
            .lock()
            .values()
            .map(|job| job.progress.clone())
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        jobs
    }

    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut jobs = self.inner.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return Err(FilterError::not_found(format!("import {job_id} not found")));
        };
        if job.progress.finished_at.is_some() {
            let removed = jobs
                .remove(job_id)
                .map(|job| job.progress)
                .ok_or_else(|| FilterError::not_found(format!("import {job_id} not found")))?;
            return Ok(CancelOutcome::Removed(removed));
        }

        job.cancel.cancel();
        job.progress.status = ImportStatus::Cancelled;
        job.progress.message = "Cancellation requested".to_string();
        info!(batch_id = job_id, "import cancellation requested");
        Ok(CancelOutcome::Cancelled(job.progress.clone()))
    }

    fn register(&self, request: &ImportRequest) -> Result<(ImportProgress, CancellationToken)> {
        if request.items.is_empty() {
            return Err(FilterError::validation("items must not be empty"));
        }
        if request.items.len() > MAX_IMPORT_ITEMS {
            return Err(FilterError::validation(format!(
                "at most {MAX_IMPORT_ITEMS} items can be imported at once"
            )));
        }

        let mut jobs = self.inner.jobs.lock();
        evict_finished(&mut jobs, self.inner.retain_finished);
        let active = jobs
            .values()
            .filter(|job| job.progress.finished_at.is_none())
            .count();
        if active >= self.inner.max_active {
            return Err(FilterError::RateLimited(format!(
                "{active} imports already running, try again later"
            )));
        }

        let id = self.next_job_id();
        let token = CancellationToken::new();
        let progress = ImportProgress {
            id: id.clone(),
            batch_name: request.batch_name.clone(),
            list: request.list,
            status: ImportStatus::Queued,
            total: request.items.len(),
            processed: 0,
            imported: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
            message: "Queued".to_string(),
            started_at: Utc::now(),
            finished_at: None,
        };
        jobs.insert(
            id,
            ImportJob {
                progress: progress.clone(),
                cancel: token.clone(),
            },
        );
        Ok((progress, token))
    }

    async fn execute(&self, job_id: String, request: ImportRequest, token: CancellationToken) {
        self.update(&job_id, |progress| {
            if progress.status == ImportStatus::Queued {
                progress.status = ImportStatus::Running;
                progress.message = "Running".to_string();
            }
        });

        let store = self.inner.engine.store();
        let chunk_size = request
            .chunk_size
            .unwrap_or(DEFAULT_IMPORT_CHUNK)
            .clamp(1, MAX_IMPORT_CHUNK);

        for (index, chunk) in request.items.chunks(chunk_size).enumerate() {
            if index > 0 {
                tokio::task::yield_now().await;
            }
            if token.is_cancelled() {
                break;
            }
            for entry in chunk {
                let outcome =
                    import_entry(store, request.list, entry.clone(), request.skip_duplicates).await;
                self.update(&job_id, |progress| {
                    progress.processed += 1;
                    match outcome {
                        Ok(ItemOutcome::Imported) => progress.imported += 1,
                        Ok(ItemOutcome::Skipped) => progress.skipped += 1,
                        Err(err) => {
                            progress.failed += 1;
                            if progress.errors.len() < MAX_RECORDED_ERRORS {
                                progress.errors.push(format!("{}: {err}", entry.item_id));
                            }
                        }
                    }
                });
            }
        }

        self.inner.engine.clear_cache();

        let cancelled = token.is_cancelled();
        self.update(&job_id, |progress| {
            progress.finished_at = Some(Utc::now());
            if cancelled {
                progress.status = ImportStatus::Cancelled;
                progress.message = format!(
                    "Cancelled after {} of {} items",
                    progress.processed, progress.total
                );
            } else if progress.imported == 0 && progress.failed > 0 && progress.skipped == 0 {
                progress.status = ImportStatus::Failed;
                progress.message = format!("All {} items failed", progress.failed);
            } else {
                progress.status = ImportStatus::Completed;
                progress.message = format!(
                    "Imported {}, skipped {}, failed {}",
                    progress.imported, progress.skipped, progress.failed
                );
            }
        });

        evict_finished(&mut self.inner.jobs.lock(), self.inner.retain_finished);

        if let Some(progress) = self.status(&job_id) {
            if progress.failed > 0 {
                warn!(
                    batch_id = %job_id,
                    failed = progress.failed,
                    "import finished with failures"
                );
            }
            info!(
                batch_id = %job_id,
                status = ?progress.status,
                imported = progress.imported,
                skipped = progress.skipped,
                "import finished"
            );
        }
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut ImportProgress)) {
        if let Some(job) = self.inner.jobs.lock().get_mut(job_id) {
            apply(&mut job.progress);
        }
    }

    fn next_job_id(&self) -> String {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("import-{id}")
    }
}

/// Drops the oldest finished records beyond `keep`. Running jobs are never
/// touched.
fn evict_finished(jobs: &mut HashMap<String, ImportJob>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, String)> = jobs
        .iter()
        .filter_map(|(id, job)| job.progress.finished_at.map(|at| (at, id.clone())))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
        debug!(batch_id = %id, "evicted finished import record");
    }
}

async fn import_entry(
    store: &FilterStore,
    list: ListKind,
    mut entry: NewEntry,
    skip_duplicates: bool,
) -> Result<ItemOutcome> {
    entry.validate()?;
    entry.item_id = sanitize_item_id(entry.content_type, &entry.item_id).ok_or_else(|| {
        FilterError::validation(format!(
            "not a valid {} id",
            entry.content_type.as_str()
        ))
    })?;
    if skip_duplicates && store.get_entry(list, &entry.item_id).await?.is_some() {
        return Ok(ItemOutcome::Skipped);
    }
    store.upsert_entry(list, entry).await?;
    Ok(ItemOutcome::Imported)
}
