//! Upsert engine: fetches a window of merged merge requests and writes one
//! Notion page per record, keyed by the sync key.

use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::Config;
use crate::gitlab::{DateWindow, MergeRequest, MergeRequestFilter, MergeRequestSource, DEFAULT_PAGE_SIZE};
use crate::mapper;
use crate::notion::{NotionError, NotionStore};
use crate::retry::{with_retry, DEFAULT_MAX_RETRIES};

/// Bound on concurrent Notion writes, so backoff is not defeated by
/// unlimited parallel calls.
pub const MAX_CONCURRENT_UPSERTS: usize = 3;
/// Default lookback window in days.
pub const DEFAULT_DAYS_BACK: i64 = 7;

/// Per-run knobs, resolved before the engine starts.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub filter: MergeRequestFilter,
    pub database_id: String,
    pub key_property: String,
    pub days_back: i64,
    pub max_retries: u32,
    pub page_size: usize,
}

impl SyncOptions {
    pub fn new(filter: MergeRequestFilter, database_id: String, key_property: String) -> Self {
        Self {
            filter,
            database_id,
            key_property,
            days_back: DEFAULT_DAYS_BACK,
            max_retries: DEFAULT_MAX_RETRIES,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.filter(),
            cfg.notion.database_id.clone(),
            cfg.notion.key_property.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub iid: i64,
    pub message: String,
}

/// Outcome of one run. Built incrementally, returned to the caller,
/// never persisted.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub failures: Vec<SyncFailure>,
    pub duration: Duration,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "total={} created={} updated={} failed={}",
            self.total, self.created, self.updated, self.failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOutcome {
    Created,
    Updated,
}

pub struct SyncEngine {
    source: Arc<dyn MergeRequestSource>,
    store: Arc<dyn NotionStore>,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn MergeRequestSource>, store: Arc<dyn NotionStore>) -> Self {
        Self { source, store }
    }

    /// Sync the configured lookback window. The initial fetch is fatal;
    /// per-record upsert failures are recorded and the batch continues.
    pub async fn run(&self, options: &SyncOptions) -> Result<SyncReport> {
        let started = Instant::now();
        let window =
            DateWindow::last_days(options.days_back).context("invalid lookback window")?;

        let records = self
            .source
            .list_merged(&options.filter, &window, options.page_size)
            .await
            .context("failed to fetch merged merge requests")?;

        let mut report = SyncReport {
            total: records.len(),
            ..SyncReport::default()
        };
        info!(
            total = report.total,
            since = %window.since(),
            until = %window.until(),
            "fetched merged merge requests"
        );

        // Bounded concurrency; results come back in submission order.
        let results: Vec<(i64, Result<UpsertOutcome, NotionError>)> =
            futures::stream::iter(records)
                .map(|mr| {
                    let store = Arc::clone(&self.store);
                    let options = options.clone();
                    async move {
                        let iid = mr.iid;
                        (iid, upsert_one(store.as_ref(), &options, &mr).await)
                    }
                })
                .buffered(MAX_CONCURRENT_UPSERTS)
                .collect()
                .await;

        for (iid, outcome) in results {
            match outcome {
                Ok(UpsertOutcome::Created) => report.created += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(err) => {
                    warn!(iid, %err, "merge request upsert failed");
                    report.failed += 1;
                    report.failures.push(SyncFailure {
                        iid,
                        message: err.to_string(),
                    });
                }
            }
        }

        report.duration = started.elapsed();
        info!(
            duration_ms = report.duration.as_millis() as u64,
            "sync finished: {}",
            report.summary()
        );
        Ok(report)
    }
}

/// Query-then-write for one record. Every store call goes through the
/// backoff executor. The lookup result is the create/update classification:
/// the page either existed or it did not.
async fn upsert_one(
    store: &dyn NotionStore,
    options: &SyncOptions,
    mr: &MergeRequest,
) -> Result<UpsertOutcome, NotionError> {
    let key = mapper::sync_key(mr.iid);
    let properties = mapper::merge_request_properties(mr);

    let existing = with_retry(
        || store.query_page_by_key(&options.database_id, &options.key_property, &key),
        NotionError::is_rate_limit,
        options.max_retries,
    )
    .await?;

    match existing {
        Some(page_id) => {
            // Update leaves the key property untouched.
            with_retry(
                || store.update_page(&page_id, properties.clone()),
                NotionError::is_rate_limit,
                options.max_retries,
            )
            .await?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            let mut with_key = properties.clone();
            with_key.insert(
                options.key_property.clone(),
                mapper::key_property_value(&key),
            );
            with_retry(
                || store.create_page(&options.database_id, with_key.clone()),
                NotionError::is_rate_limit,
                options.max_retries,
            )
            .await?;
            Ok(UpsertOutcome::Created)
        }
    }
}
