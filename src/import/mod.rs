//! CSV import: one blocking feeder, a pool of resolver workers, and the job's
//! own task as the single writer.
//!
//! ```text
//! feeder ──rows──▶ resolver × W ──results──▶ collector ──▶ Store
//! ```
//!
//! Both channels are bounded, so a slow store pushes back all the way to the
//! file reader. Results reach the collector in completion order, not file
//! order; every result carries its own raw row so nothing depends on order.

pub mod fields;
pub mod resolve;

use crate::{
    jobs::{JobContext, JobError, JobHandler, panic_message},
    metrics,
    models::{
        CatalogCard, ImportSummary, InventoryItem, Job, NewReviewItem, ProposedValues, ReviewIssue,
    },
    store::{Store, StoreError},
};
use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord};
use fields::ColumnMap;
use resolve::{ResolveFailure, resolve};
use std::{
    collections::BTreeMap,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Location recorded on inventory rows created by an import.
pub const IMPORT_LOCATION: &str = "Imported";

#[derive(Debug, Clone)]
pub struct ImportPipeline {
    pub workers: usize,
    pub progress_every: u64,
    pub progress_interval: Duration,
}

impl Default for ImportPipeline {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            workers: parallelism.max(2),
            progress_every: 50,
            progress_interval: Duration::from_secs(1),
        }
    }
}

struct SourceRow {
    line: u64,
    record: StringRecord,
}

struct RowResult {
    line: u64,
    raw: BTreeMap<String, String>,
    proposed: ProposedValues,
    outcome: Result<CatalogCard, ResolveFailure>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FeedStats {
    read: u64,
    dropped: u64,
}

impl ImportPipeline {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Imports every row of `source` for `job_id`. Rows that fail to parse
    /// are logged and left out of every count.
    pub async fn run<R>(
        &self,
        store: Arc<dyn Store>,
        job_id: &str,
        source: R,
        cancel: CancellationToken,
    ) -> Result<ImportSummary, JobError>
    where
        R: Read + Send + 'static,
    {
        let (reader, header) = tokio::task::spawn_blocking(move || {
            let mut reader = ReaderBuilder::new()
                .has_headers(true)
                .flexible(false)
                .from_reader(source);
            let header = reader.headers()?.clone();
            Ok::<_, csv::Error>((reader, header))
        })
        .await
        .map_err(|err| JobError::setup("read csv header", err))?
        .map_err(|err| JobError::setup("read csv header", err))?;
        if header.is_empty() {
            return Err(JobError::setup("read csv header", "input is empty"));
        }
        let columns = Arc::new(ColumnMap::from_header(&header));
        if !columns.identifies_cards() {
            warn!(
                target = "cardbulk.import",
                job_id = %job_id,
                header = ?header,
                "header has no card identifying columns; every row will go to review"
            );
        }

        let capacity = self.workers.max(1) * 2;
        let (rows_tx, rows_rx) = mpsc::channel::<SourceRow>(capacity);
        let (results_tx, mut results_rx) = mpsc::channel::<RowResult>(capacity);

        let feeder = {
            let cancel = cancel.clone();
            let job_id = job_id.to_string();
            tokio::task::spawn_blocking(move || feed(reader, rows_tx, &cancel, &job_id))
        };

        let rows_rx = Arc::new(Mutex::new(rows_rx));
        let mut workers = JoinSet::new();
        for worker in 0..self.workers.max(1) {
            workers.spawn(resolve_rows(
                worker,
                rows_rx.clone(),
                results_tx.clone(),
                store.clone(),
                columns.clone(),
                cancel.clone(),
            ));
        }
        drop(rows_rx);

        // Holds the last sender so the result channel closes exactly when
        // every worker has returned. Yields the first worker panic, if any.
        let closer = {
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                let mut panicked = None;
                while let Some(joined) = workers.join_next().await {
                    if let Err(err) = joined {
                        error!(
                            target = "cardbulk.import",
                            job_id = %job_id,
                            error = %err,
                            "resolver worker died"
                        );
                        let message = if err.is_panic() {
                            panic_message(err.into_panic())
                        } else {
                            err.to_string()
                        };
                        panicked.get_or_insert(message);
                    }
                }
                drop(results_tx);
                panicked
            })
        };

        let mut summary = ImportSummary::default();
        let mut throttle = ProgressThrottle::new(self.progress_every, self.progress_interval);
        while let Some(result) = results_rx.recv().await {
            collect(store.as_ref(), job_id, result, &mut summary).await;
            if throttle.tick(Instant::now())
                && let Err(err) = store
                    .update_job_progress(job_id, summary.total() as i64, 0)
                    .await
            {
                warn!(target = "cardbulk.import", job_id = %job_id, error = %err, "progress update failed");
            }
        }

        let panicked = closer.await.unwrap_or_else(|err| {
            error!(target = "cardbulk.import", job_id = %job_id, error = %err, "closer task failed");
            Some(err.to_string())
        });
        let stats = feeder.await.unwrap_or_else(|err| {
            error!(target = "cardbulk.import", job_id = %job_id, error = %err, "feeder task failed");
            FeedStats::default()
        });

        let processed = summary.total() as i64;
        if let Err(err) = store.update_job_progress(job_id, processed, processed).await {
            warn!(target = "cardbulk.import", job_id = %job_id, error = %err, "final progress update failed");
        }
        info!(
            target = "cardbulk.import",
            job_id = %job_id,
            rows_read = stats.read,
            rows_dropped = stats.dropped,
            success = summary.success,
            review = summary.review,
            "import finished"
        );

        // Rows held by a dead worker were never counted anywhere.
        if let Some(message) = panicked {
            return Err(JobError::Panicked(message));
        }
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(summary)
    }
}

/// Runs on a blocking thread: the csv reader does synchronous IO.
fn feed<R: Read>(
    mut reader: csv::Reader<R>,
    rows: mpsc::Sender<SourceRow>,
    cancel: &CancellationToken,
    job_id: &str,
) -> FeedStats {
    let mut stats = FeedStats::default();
    let mut record = StringRecord::new();
    while !cancel.is_cancelled() {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                stats.read += 1;
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                let row = SourceRow {
                    line,
                    record: record.clone(),
                };
                if rows.blocking_send(row).is_err() {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), csv::ErrorKind::Io(_)) => {
                warn!(target = "cardbulk.import", job_id = %job_id, error = %err, "csv source failed; stopping feed");
                break;
            }
            Err(err) => {
                stats.dropped += 1;
                warn!(
                    target = "cardbulk.import",
                    job_id = %job_id,
                    line = err.position().map(|p| p.line()),
                    error = %err,
                    "dropping malformed csv row"
                );
            }
        }
    }
    debug!(target = "cardbulk.import", job_id = %job_id, rows = stats.read, "feeder done");
    stats
}

async fn resolve_rows(
    worker: usize,
    rows: Arc<Mutex<mpsc::Receiver<SourceRow>>>,
    results: mpsc::Sender<RowResult>,
    store: Arc<dyn Store>,
    columns: Arc<ColumnMap>,
    cancel: CancellationToken,
) {
    let mut resolved = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            row = async { rows.lock().await.recv().await } => row,
        };
        let Some(row) = next else {
            break;
        };
        let normalized = columns.normalize(&row.record);
        let outcome = resolve(store.as_ref(), &normalized.query).await;
        let result = RowResult {
            line: row.line,
            raw: columns.raw_record(&row.record),
            proposed: normalized.proposed,
            outcome,
        };
        if results.send(result).await.is_err() {
            break;
        }
        resolved += 1;
    }
    debug!(target = "cardbulk.import", worker, resolved, "resolver worker done");
}

/// Applies one result. Persistence problems never abort the import: a failed
/// inventory write becomes a WriteError review item, and a failed review
/// insert is logged and still counted as reviewed.
async fn collect(store: &dyn Store, job_id: &str, result: RowResult, summary: &mut ImportSummary) {
    let RowResult {
        line,
        raw,
        proposed,
        outcome,
    } = result;

    let (issue, note) = match outcome {
        Ok(card) => {
            let item = InventoryItem {
                scryfall_id: card.scryfall_id,
                quantity: proposed.quantity,
                condition: proposed.condition.clone(),
                is_foil: proposed.is_foil,
                language: proposed.language.clone(),
                location: IMPORT_LOCATION.to_string(),
            };
            match store.add_inventory(&item).await {
                Ok(()) => {
                    summary.success += 1;
                    metrics::rows_resolved("success");
                    return;
                }
                Err(err) => {
                    warn!(
                        target = "cardbulk.import",
                        job_id = %job_id,
                        line,
                        scryfall_id = %item.scryfall_id,
                        error = %err,
                        "inventory write failed; routing row to review"
                    );
                    (ReviewIssue::WriteError, Some(err.to_string()))
                }
            }
        }
        Err(failure) => (failure.issue(), failure.note()),
    };

    summary.review += 1;
    metrics::rows_resolved(issue.as_str());
    let item = NewReviewItem {
        job_id: job_id.to_string(),
        issue,
        raw_data: raw,
        proposed,
        note,
    };
    if let Err(err) = store.add_review_item(&item).await {
        error!(
            target = "cardbulk.import",
            job_id = %job_id,
            line,
            issue = %issue,
            error = %err,
            "review item could not be stored"
        );
    }
}

/// Decides when the collector persists progress: every `every` results or
/// once `interval` has passed since the last write, whichever comes first.
struct ProgressThrottle {
    every: u64,
    interval: Duration,
    pending: u64,
    last: Instant,
}

impl ProgressThrottle {
    fn new(every: u64, interval: Duration) -> Self {
        Self {
            every: every.max(1),
            interval,
            pending: 0,
            last: Instant::now(),
        }
    }

    fn tick(&mut self, now: Instant) -> bool {
        self.pending += 1;
        if self.pending >= self.every || now.duration_since(self.last) >= self.interval {
            self.pending = 0;
            self.last = now;
            return true;
        }
        false
    }
}

/// Job handler for staged CSV uploads. The file for job `id` lives at
/// `<upload_dir>/<id>.csv` and is removed once the import ends.
pub struct CsvImportHandler {
    upload_dir: PathBuf,
    pipeline: ImportPipeline,
}

impl CsvImportHandler {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            pipeline: ImportPipeline::default(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: ImportPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn upload_path(&self, job_id: &str) -> PathBuf {
        self.upload_dir.join(format!("{job_id}.csv"))
    }

    /// Copies `source` into the upload directory under `job_id`.
    pub async fn stage(&self, job_id: &str, source: &Path) -> Result<PathBuf, JobError> {
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|err| JobError::setup("create upload directory", err))?;
        let target = self.upload_path(job_id);
        tokio::fs::copy(source, &target)
            .await
            .map_err(|err| JobError::setup("stage csv file", err))?;
        Ok(target)
    }
}

#[async_trait]
impl JobHandler for CsvImportHandler {
    async fn run(&self, ctx: JobContext) -> Result<String, JobError> {
        let path = self.upload_path(&ctx.job.id);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| JobError::setup("open csv file", err))?
            .into_std()
            .await;

        let outcome = self
            .pipeline
            .run(ctx.store.clone(), &ctx.job.id, file, ctx.cancel.clone())
            .await;
        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!(target = "cardbulk.import", path = %path.display(), error = %err, "could not remove upload");
        }

        let summary = outcome?;
        Ok(serde_json::to_string(&summary).map_err(StoreError::from)?)
    }

    async fn abandon(&self, job: &Job) {
        let path = self.upload_path(&job.id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(target = "cardbulk.import", job_id = %job.id, path = %path.display(), "removed upload of abandoned import");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(target = "cardbulk.import", job_id = %job.id, path = %path.display(), error = %err, "could not remove upload");
            }
        }
    }
}
