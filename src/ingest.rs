//! EPUB ingestion pipeline.
//!
//! ```text
//! push ─▶ upload workers (N) ─▶ parse workers (M) ─▶ persistence (1)
//!              │                      │                    │
//!              └──────── failures ────┴──── results ───────┴─▶ Delivery
//! ```
//!
//! Stages are connected by bounded channels, so a slow stage throttles the
//! one before it. Each job carries its own cancellation token, a child of
//! the pipeline shutdown token.
//!
//! Lock discipline: each SQLite store sits behind one mutex that is held
//! for a single statement or, on the catalog, for a whole transaction. No
//! code path holds both store locks at once, and no lock is held across an
//! `.await`.

/// Result delivery.
pub mod delivery;
/// Content hashing.
pub mod hasher;
/// tar.gz import.
pub mod import;
/// Job and payload types.
pub mod job;
/// Cross-store reconciliation.
pub mod repair;

mod parse;
mod persist;
mod upload;

pub use delivery::{Delivery, IngestEvent};
pub use job::{IngestJob, Payload};

use crate::config::{Config, CoverConfig};
use crate::db::{Book, Job, JobKind, JobStatus};
use crate::error::{AppError, Result};
use crate::formats::FormatGate;
use crate::library::StorageLayout;
use crate::store::Store;
use job::StagedBook;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything a stage worker needs, cheap to clone.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub(crate) store: Store,
    pub(crate) layout: StorageLayout,
    pub(crate) gate: FormatGate,
    pub(crate) cover: CoverConfig,
    pub(crate) delivery: Arc<Delivery>,
}

impl StageContext {
    /// Persist a status change and refresh the job cache.
    pub(crate) fn set_status(
        &self,
        record: &mut Job,
        status: JobStatus,
        destination: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let updated = self
            .store
            .app
            .update_job(record.id, status, destination, error)?;
        self.store.jobs.insert(updated.id, updated.clone());
        *record = updated;
        Ok(())
    }

    /// Unwind a job: remove its directory, mark it FAILED and report.
    pub(crate) async fn fail(&self, record: &mut Job, dir: Option<&Path>, error: AppError) {
        tracing::error!(
            job_id = record.id,
            user_id = record.user_id,
            kind = ?error.kind(),
            error = %error,
            "Ingestion failed"
        );

        if let Some(dir) = dir {
            remove_dir(dir).await;
        }

        let message = error.to_string();
        if let Err(e) = self.set_status(record, JobStatus::Failed, None, Some(&message)) {
            tracing::error!(job_id = record.id, error = %e, "Failed to record job failure");
        }

        self.delivery.fail(record, error);
    }

    /// Drop an upload whose content is already catalogued.
    ///
    /// SINGLE jobs report [`AppError::DuplicateBook`]. BATCH jobs are
    /// skipped quietly: the job row keeps the DONE status of its upload.
    pub(crate) async fn reject_duplicate(&self, mut staged: StagedBook, hash: &str, existing_id: i64) {
        tracing::warn!(
            job_id = staged.record.id,
            hash,
            existing_id,
            "Duplicate book"
        );

        match staged.record.kind {
            JobKind::Single => {
                let error = AppError::DuplicateBook { existing_id };
                self.fail(&mut staged.record, Some(&staged.dir), error).await;
            }
            JobKind::Batch => {
                remove_dir(&staged.dir).await;
                self.delivery.skip(&staged.record, existing_id);
            }
        }
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(path = %dir.display(), "Removed book directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Failed to remove book directory"),
    }
}

/// Handle on the running pipeline.
pub struct Pipeline {
    ctx: StageContext,
    queue: async_channel::Sender<IngestJob>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spawn the stage workers.
    ///
    /// Cancelling `shutdown` cancels every in-flight job. The workers stop
    /// once [`Pipeline::shutdown`] has closed the queue and every stage has
    /// drained.
    pub fn start(store: Store, config: &Config, shutdown: CancellationToken) -> Self {
        let capacity = config.workers.queue_capacity.max(1);
        let ctx = StageContext {
            store,
            layout: StorageLayout::new(&config.storage.data_dir),
            gate: FormatGate::new(&config.storage.supported_types),
            cover: config.cover.clone(),
            delivery: Arc::new(Delivery::new(capacity * 4)),
        };

        let (queue, upload_rx) = async_channel::bounded::<IngestJob>(capacity);
        let (parse_tx, parse_rx) = async_channel::bounded::<StagedBook>(capacity);
        let (persist_tx, persist_rx) = tokio::sync::mpsc::channel(capacity);

        let mut tasks = Vec::new();
        for id in 0..config.workers.upload.max(1) {
            tasks.push(tokio::spawn(upload::run_worker(
                id,
                ctx.clone(),
                upload_rx.clone(),
                parse_tx.clone(),
            )));
        }
        for id in 0..config.workers.parse.max(1) {
            tasks.push(tokio::spawn(parse::run_worker(
                id,
                ctx.clone(),
                parse_rx.clone(),
                persist_tx.clone(),
            )));
        }
        tasks.push(tokio::spawn(persist::run(ctx.clone(), persist_rx)));
        tasks.push(tokio::spawn(log_events(
            ctx.delivery.subscribe(),
            shutdown.clone(),
        )));

        tracing::info!(
            upload_workers = config.workers.upload,
            parse_workers = config.workers.parse,
            capacity,
            "Ingestion pipeline started"
        );

        Self {
            ctx,
            queue,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    /// Record a new PENDING job.
    pub fn submit(&self, user_id: i64, kind: JobKind, payload: Payload) -> Result<IngestJob> {
        let record = self.ctx.store.app.insert_job(user_id, kind)?;
        self.ctx.store.jobs.insert(record.id, record.clone());
        Ok(IngestJob {
            record,
            payload,
            cancel: self.shutdown.child_token(),
        })
    }

    /// Enqueue a job for the upload stage.
    ///
    /// Waits only while the queue is full.
    pub async fn push(&self, job: IngestJob) -> Result<()> {
        self.queue.send(job).await.map_err(|async_channel::SendError(mut job)| {
            self.ctx.delivery.forget(job.record.id);
            if let Err(e) = self.ctx.set_status(
                &mut job.record,
                JobStatus::Failed,
                None,
                Some("pipeline is shut down"),
            ) {
                tracing::error!(job_id = job.record.id, error = %e, "Failed to record job failure");
            }
            AppError::Cancelled
        })
    }

    /// Ingest one file and wait for the catalogued book.
    ///
    /// Dropping the returned future cancels the job.
    pub async fn ingest_single(&self, user_id: i64, payload: Payload) -> Result<Book> {
        let job = self.submit(user_id, JobKind::Single, payload)?;
        let job_id = job.record.id;
        let cancel = job.cancel.clone();
        let guard = cancel.clone().drop_guard();

        let completion = self.ctx.delivery.register(job_id);
        self.push(job).await?;

        let outcome = tokio::select! {
            result = completion => result.unwrap_or_else(|_| {
                Err(AppError::Internal(format!("job {} was dropped by the pipeline", job_id)))
            }),
            _ = cancel.cancelled() => {
                self.ctx.delivery.forget(job_id);
                Err(AppError::Cancelled)
            }
        };

        guard.disarm();
        outcome
    }

    /// Submit several files as BATCH jobs and return their records without
    /// waiting for any of them.
    pub fn ingest_batch(self: &Arc<Self>, user_id: i64, payloads: Vec<Payload>) -> Result<Vec<Job>> {
        let jobs = payloads
            .into_iter()
            .map(|payload| self.submit(user_id, JobKind::Batch, payload))
            .collect::<Result<Vec<_>>>()?;
        let records = jobs.iter().map(|job| job.record.clone()).collect();

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            for job in jobs {
                let job_id = job.record.id;
                if let Err(e) = pipeline.push(job).await {
                    tracing::warn!(job_id, error = %e, "Batch job not queued");
                }
            }
        });

        Ok(records)
    }

    /// Unpack a tar.gz archive on the blocking pool and submit its books as
    /// a batch.
    pub async fn import_archive(
        self: &Arc<Self>,
        user_id: i64,
        archive: Vec<u8>,
        map_tags: bool,
    ) -> Result<Vec<Job>> {
        let gate = self.ctx.gate.clone();
        let payloads = tokio::task::spawn_blocking(move || {
            import::extract_tar_gz(&archive, &gate, map_tags)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Archive task failed: {}", e)))??;
        tracing::info!(user_id, entries = payloads.len(), map_tags, "Importing archive");
        self.ingest_batch(user_id, payloads)
    }

    /// Subscribe to job outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.ctx.delivery.subscribe()
    }

    /// Number of SINGLE uploads whose caller is still waiting.
    pub fn pending(&self) -> usize {
        self.ctx.delivery.pending()
    }

    /// Format gate in use.
    pub fn gate(&self) -> &FormatGate {
        &self.ctx.gate
    }

    /// Storage layout in use.
    pub fn layout(&self) -> &StorageLayout {
        &self.ctx.layout
    }

    /// Stop accepting jobs, cancel in-flight ones and wait for the workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.close();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Pipeline task panicked");
            }
        }
        tracing::info!("Ingestion pipeline stopped");
    }
}

async fn log_events(mut events: broadcast::Receiver<IngestEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!(job_id = event.job_id(), event = %json, "Ingest event"),
                Err(e) => tracing::warn!(error = %e, "Failed to encode ingest event"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
