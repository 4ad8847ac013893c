use crate::{
    metrics,
    models::{Job, JobKind, JobStatus},
    store::{Store, StoreError},
};
use async_trait::async_trait;
use std::{any::Any, collections::HashMap, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to {action}: {message}")]
    Setup { action: &'static str, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cancelled")]
    Cancelled,
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("job queue is closed")]
    QueueClosed,
}

impl JobError {
    pub fn setup(action: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Setup {
            action,
            message: err.to_string(),
        }
    }
}

/// What a handler gets to work with: the shared store, a snapshot of its job
/// taken when the worker picked it up, and the job's cancellation token.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn Store>,
    pub job: Job,
    pub cancel: CancellationToken,
}

/// A unit of background work. The returned text becomes the job's result
/// summary; an error fails the job with its display text.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<String, JobError>;

    /// Called instead of `run` for a job that will never start, so the
    /// handler can release whatever was prepared for it.
    async fn abandon(&self, _job: &Job) {}
}

pub struct JobRequest {
    pub job: Job,
    pub handler: Arc<dyn JobHandler>,
}

/// Fixed pool of job workers draining one bounded FIFO queue.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    tx: mpsc::Sender<JobRequest>,
    rx: Arc<Mutex<mpsc::Receiver<JobRequest>>>,
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            store,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            tokens: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns `workers` long-lived workers. They run until [`shutdown`] is
    /// called or every sender is gone.
    ///
    /// [`shutdown`]: Dispatcher::shutdown
    pub fn start(&self, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.work(worker).await })
            })
            .collect()
    }

    /// Queues an already-persisted job. Waits for a free slot when the queue
    /// is full.
    pub async fn submit(&self, job: Job, handler: Arc<dyn JobHandler>) -> Result<(), JobError> {
        let token = self.shutdown.child_token();
        self.tokens.lock().await.insert(job.id.clone(), token);
        let job_id = job.id.clone();
        if self.tx.send(JobRequest { job, handler }).await.is_err() {
            self.tokens.lock().await.remove(&job_id);
            return Err(JobError::QueueClosed);
        }
        debug!(target = "cardbulk.dispatcher", job_id = %job_id, "job queued");
        Ok(())
    }

    /// Persists a new pending job of `kind` and queues it.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Job, JobError> {
        let job = Job::new(kind);
        self.enqueue_job(job, handler).await
    }

    /// Like [`enqueue`](Dispatcher::enqueue) for a job whose id the caller
    /// needed up front, e.g. to stage its input file.
    pub async fn enqueue_job(
        &self,
        job: Job,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Job, JobError> {
        self.store.create_job(&job).await?;
        info!(
            target = "cardbulk.dispatcher",
            job_id = %job.id,
            kind = %job.kind,
            "job created"
        );
        self.submit(job.clone(), handler).await?;
        Ok(job)
    }

    /// Requests cancellation of a queued or running job. Returns false when
    /// the dispatcher no longer tracks the id.
    pub async fn cancel(&self, job_id: &str) -> bool {
        match self.tokens.lock().await.get(job_id) {
            Some(token) => {
                token.cancel();
                info!(target = "cardbulk.dispatcher", job_id = %job_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Stops workers from taking new jobs and cancels the running ones.
    /// Anything still queued stays pending.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn work(&self, worker: usize) {
        debug!(target = "cardbulk.dispatcher", worker, "worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                request = async { self.rx.lock().await.recv().await } => request,
            };
            let Some(request) = next else {
                break;
            };
            self.process(worker, request).await;
        }
        debug!(target = "cardbulk.dispatcher", worker, "worker stopped");
    }

    async fn process(&self, worker: usize, request: JobRequest) {
        let JobRequest { job, handler } = request;
        let job_id = job.id.clone();
        let kind = job.kind;
        let cancel = self
            .tokens
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_else(|| self.shutdown.child_token());

        if cancel.is_cancelled() {
            if let Err(err) = self.store.fail_job(&job_id, &JobError::Cancelled.to_string()).await {
                warn!(target = "cardbulk.dispatcher", job_id = %job_id, error = %err, "failed to record cancellation");
            }
            handler.abandon(&job).await;
            info!(target = "cardbulk.dispatcher", job_id = %job_id, worker, "skipped cancelled job");
            metrics::job_finished(kind.as_str(), "cancelled", 0);
            self.tokens.lock().await.remove(&job_id);
            return;
        }

        if let Err(err) = self.store.update_job_status(&job_id, JobStatus::Processing).await {
            error!(
                target = "cardbulk.dispatcher",
                job_id = %job_id,
                worker,
                error = %err,
                "could not mark job processing; dropping it"
            );
            handler.abandon(&job).await;
            self.tokens.lock().await.remove(&job_id);
            return;
        }

        let started = Instant::now();
        info!(target = "cardbulk.dispatcher", job_id = %job_id, kind = %kind, worker, "job started");

        let ctx = JobContext {
            store: self.store.clone(),
            job: Job {
                status: JobStatus::Processing,
                ..job
            },
            cancel,
        };
        // Own task so a panicking handler only takes down its job.
        let outcome = match tokio::spawn(async move { handler.run(ctx).await }).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(JobError::Panicked(panic_message(join.into_panic()))),
            Err(join) => Err(JobError::Panicked(join.to_string())),
        };
        let elapsed_ms = started.elapsed().as_millis();

        let label = match &outcome {
            Ok(summary) => {
                if let Err(err) = self.store.complete_job(&job_id, summary).await {
                    error!(target = "cardbulk.dispatcher", job_id = %job_id, error = %err, "failed to record completion");
                }
                info!(
                    target = "cardbulk.dispatcher",
                    job_id = %job_id,
                    worker,
                    elapsed_ms = elapsed_ms as u64,
                    summary = %summary,
                    "job completed"
                );
                "completed"
            }
            Err(failure) => {
                if let Err(err) = self.store.fail_job(&job_id, &failure.to_string()).await {
                    error!(target = "cardbulk.dispatcher", job_id = %job_id, error = %err, "failed to record failure");
                }
                warn!(
                    target = "cardbulk.dispatcher",
                    job_id = %job_id,
                    worker,
                    elapsed_ms = elapsed_ms as u64,
                    error = %failure,
                    "job failed"
                );
                match failure {
                    JobError::Cancelled => "cancelled",
                    JobError::Panicked(_) => "panicked",
                    _ => "failed",
                }
            }
        };
        metrics::job_finished(kind.as_str(), label, elapsed_ms);
        self.tokens.lock().await.remove(&job_id);
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, testing::temp_store};
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    struct Echo {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, ctx: JobContext) -> Result<String, JobError> {
            self.seen.lock().await.push(ctx.job.id.clone());
            ctx.store.update_job_progress(&ctx.job.id, 3, 0).await?;
            Ok(format!("done {}", ctx.job.id))
        }
    }

    struct Fails;

    #[async_trait]
    impl JobHandler for Fails {
        async fn run(&self, _ctx: JobContext) -> Result<String, JobError> {
            Err(JobError::setup("open csv file", "no such file"))
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _ctx: JobContext) -> Result<String, JobError> {
            panic!("resolver exploded");
        }
    }

    /// Blocks until released, then records that it ran.
    struct Gate {
        release: Arc<Notify>,
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl JobHandler for Gate {
        async fn run(&self, _ctx: JobContext) -> Result<String, JobError> {
            self.release.notified().await;
            self.ran.store(true, Ordering::SeqCst);
            Ok("released".into())
        }
    }

    struct WaitsForCancel;

    #[async_trait]
    impl JobHandler for WaitsForCancel {
        async fn run(&self, ctx: JobContext) -> Result<String, JobError> {
            ctx.cancel.cancelled().await;
            Err(JobError::Cancelled)
        }
    }

    async fn setup(capacity: usize) -> (tempfile::TempDir, Arc<SqliteStore>, Dispatcher) {
        let (dir, store) = temp_store().await;
        let store = Arc::new(store);
        let dispatcher = Dispatcher::new(store.clone(), capacity);
        (dir, store, dispatcher)
    }

    async fn wait_terminal(store: &SqliteStore, id: &str) -> Job {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let job = store.get_job(id).await.expect("job");
                if job.status.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job reached a terminal status")
    }

    #[tokio::test]
    async fn single_worker_completes_jobs_in_submission_order() {
        let (_dir, store, dispatcher) = setup(8).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn JobHandler> = Arc::new(Echo { seen: seen.clone() });

        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = dispatcher
                .enqueue(JobKind::ImportCsv, handler.clone())
                .await
                .expect("enqueue");
            assert_eq!(job.status, JobStatus::Pending);
            ids.push(job.id);
        }
        dispatcher.start(1);

        for id in &ids {
            let job = wait_terminal(&store, id).await;
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.result_summary.as_deref(), Some(format!("done {id}").as_str()));
            assert_eq!(job.progress_current, 3);
            assert_eq!(job.progress_total, 3);
        }
        assert_eq!(*seen.lock().await, ids);
    }

    #[tokio::test]
    async fn handler_error_fails_job_with_its_text() {
        let (_dir, store, dispatcher) = setup(4).await;
        dispatcher.start(2);
        let job = dispatcher
            .enqueue(JobKind::ImportCsv, Arc::new(Fails))
            .await
            .expect("enqueue");
        let job = wait_terminal(&store, &job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.result_summary.as_deref(),
            Some("failed to open csv file: no such file")
        );
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_job() {
        let (_dir, store, dispatcher) = setup(4).await;
        dispatcher.start(1);
        let bad = dispatcher
            .enqueue(JobKind::SyncCatalog, Arc::new(Panics))
            .await
            .expect("enqueue");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let good = dispatcher
            .enqueue(JobKind::ImportCsv, Arc::new(Echo { seen }))
            .await
            .expect("enqueue");

        let bad = wait_terminal(&store, &bad.id).await;
        assert_eq!(bad.status, JobStatus::Failed);
        assert!(
            bad.result_summary
                .as_deref()
                .is_some_and(|s| s.contains("resolver exploded"))
        );
        // The same single worker keeps serving the queue.
        let good = wait_terminal(&store, &good.id).await;
        assert_eq!(good.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_queued_job_never_runs() {
        let (_dir, store, dispatcher) = setup(4).await;
        dispatcher.start(1);
        let release = Arc::new(Notify::new());
        let first_ran = Arc::new(AtomicBool::new(false));
        let second_ran = Arc::new(AtomicBool::new(false));

        let first = dispatcher
            .enqueue(
                JobKind::ImportCsv,
                Arc::new(Gate {
                    release: release.clone(),
                    ran: first_ran.clone(),
                }),
            )
            .await
            .expect("enqueue");
        let second = dispatcher
            .enqueue(
                JobKind::ImportCsv,
                Arc::new(Gate {
                    release: release.clone(),
                    ran: second_ran.clone(),
                }),
            )
            .await
            .expect("enqueue");

        assert!(dispatcher.cancel(&second.id).await);
        release.notify_one();

        let first = wait_terminal(&store, &first.id).await;
        let second = wait_terminal(&store, &second.id).await;
        assert_eq!(first.status, JobStatus::Completed);
        assert!(first_ran.load(Ordering::SeqCst));
        assert_eq!(second.status, JobStatus::Failed);
        assert_eq!(second.result_summary.as_deref(), Some("cancelled"));
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    /// Counts how often the dispatcher gave up on it.
    struct Abandoned {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for Abandoned {
        async fn run(&self, _ctx: JobContext) -> Result<String, JobError> {
            Ok("ran".into())
        }

        async fn abandon(&self, _job: &Job) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn cancelled_queued_job_is_abandoned_once() {
        let (_dir, store, dispatcher) = setup(4).await;
        let count = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn JobHandler> = Arc::new(Abandoned { count: count.clone() });
        let cancelled = dispatcher
            .enqueue(JobKind::ImportCsv, handler.clone())
            .await
            .expect("enqueue");
        let kept = dispatcher
            .enqueue(JobKind::ImportCsv, handler)
            .await
            .expect("enqueue");
        assert!(dispatcher.cancel(&cancelled.id).await);
        dispatcher.start(1);

        assert_eq!(wait_terminal(&store, &cancelled.id).await.status, JobStatus::Failed);
        assert_eq!(wait_terminal(&store, &kept.id).await.status, JobStatus::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn running_job_observes_cancellation() {
        let (_dir, store, dispatcher) = setup(4).await;
        dispatcher.start(1);
        let job = dispatcher
            .enqueue(JobKind::SyncCatalog, Arc::new(WaitsForCancel))
            .await
            .expect("enqueue");
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get_job(&job.id).await.expect("job").status != JobStatus::Processing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job started");

        assert!(dispatcher.cancel(&job.id).await);
        let job = wait_terminal(&store, &job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.result_summary.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn full_queue_blocks_submitter_until_a_worker_frees_a_slot() {
        let (_dir, store, dispatcher) = setup(1).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn JobHandler> = Arc::new(Echo { seen });

        dispatcher
            .enqueue(JobKind::ImportCsv, handler.clone())
            .await
            .expect("first fits");
        let second = Job::new(JobKind::ImportCsv);
        store.create_job(&second).await.expect("create");
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            dispatcher.submit(second.clone(), handler.clone()),
        )
        .await;
        assert!(blocked.is_err(), "submit should wait while the queue is full");

        dispatcher.start(1);
        tokio::time::timeout(Duration::from_secs(5), dispatcher.submit(second.clone(), handler))
            .await
            .expect("slot freed")
            .expect("submitted");
        assert_eq!(wait_terminal(&store, &second.id).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_leaves_queued_jobs_pending() {
        let (_dir, store, dispatcher) = setup(4).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let job = dispatcher
            .enqueue(JobKind::ImportCsv, Arc::new(Echo { seen: seen.clone() }))
            .await
            .expect("enqueue");

        dispatcher.shutdown();
        for handle in dispatcher.start(2) {
            handle.await.expect("worker exits cleanly");
        }
        assert_eq!(
            store.get_job(&job.id).await.expect("job").status,
            JobStatus::Pending
        );
        assert!(seen.lock().await.is_empty());
    }
}
