//! Job Scheduler: durable import jobs with one active run loop per
//! knowledge base.
//!
//! All job state lives in the Metadata Store; the scheduler only keeps two
//! in-memory facts: which job currently owns each knowledge base's run slot,
//! and which jobs have been canceled while their loop may still be
//! mid-item. Every state change is pushed as a [`JobUpdate`] on the event
//! channel returned by [`JobScheduler::new`].
//!
//! # Run loop
//!
//! ```text
//! mark job processing
//! loop:
//!     canceled (in memory)?  -> stop
//!     status pending in DB?  -> mark processing (resumed mid-item)
//!     status not pending|processing in DB?  -> stop (paused / canceled)
//!     next pending item?  no -> job done, stop
//!     item processing -> import -> item done|failed|skipped
//!     progress = terminal item count; emit
//! release slot; promote the oldest pending job unless one is paused
//! ```
//!
//! An error escaping the loop (a database failure, not a bad file) marks the
//! job `failed` with the error text.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use knowledge_engine_core::models::{ImportSource, Job, JobItem, JobStatus};
use knowledge_engine_core::protocol::JobUpdate;

use crate::error::KbError;
use crate::ingest::{FileImporter, ImportOutcome};
use crate::registry::StoreRegistry;
use crate::sources::{require_sources, resolve_sources};
use crate::store::{MetaStore, LIST_JOBS_LIMIT};

#[derive(Default)]
struct SlotState {
    /// kb id -> id of the job whose loop owns the slot.
    running: HashMap<String, String>,
    canceled: HashSet<String>,
}

struct Inner {
    registry: Arc<StoreRegistry>,
    importer: Arc<dyn FileImporter>,
    item_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<JobUpdate>,
    slots: Mutex<SlotState>,
}

/// Cheap to clone; clones share the same slots and event channel.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        registry: Arc<StoreRegistry>,
        importer: Arc<dyn FileImporter>,
        item_timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<JobUpdate>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(Inner {
                registry,
                importer,
                item_timeout,
                events,
                slots: Mutex::new(SlotState::default()),
            }),
        };
        (scheduler, rx)
    }

    /// Queue an import job and start it if the knowledge base is idle.
    pub async fn import_files(&self, kb_id: &str, sources: Vec<ImportSource>) -> Result<String> {
        require_sources(&sources)?;
        let files = resolve_sources(&sources)?;
        if files.is_empty() {
            return Err(KbError::NoFilesFound.into());
        }

        let store = self.inner.registry.get(kb_id).await?;
        let job = store
            .create_import_job(&json!({ "sources": sources }), &files)
            .await?;
        info!(kb_id = %kb_id, job_id = %job.id, files = files.len(), "queued import job");
        let job_id = job.id.clone();
        self.publish(kb_id, job);

        self.start(kb_id, &store, &job_id);
        Ok(job_id)
    }

    pub async fn list_jobs(&self, kb_id: &str) -> Result<Vec<Job>> {
        let store = self.inner.registry.get(kb_id).await?;
        store.list_jobs(LIST_JOBS_LIMIT).await
    }

    pub async fn list_job_items(&self, kb_id: &str, job_id: &str) -> Result<Vec<JobItem>> {
        let store = self.inner.registry.get(kb_id).await?;
        require_job(&store, job_id).await?;
        store.list_job_items(job_id).await
    }

    /// `pending | processing` → `paused`. The loop stops before its next item.
    pub async fn pause_job(&self, kb_id: &str, job_id: &str) -> Result<()> {
        let store = self.inner.registry.get(kb_id).await?;
        require_job(&store, job_id).await?;
        if store.pause_job(job_id).await? {
            info!(kb_id = %kb_id, job_id = %job_id, "paused job");
            self.emit(kb_id, &store, job_id).await;
        }
        Ok(())
    }

    /// `paused | pending` → `pending`, starting it if the slot is free.
    pub async fn resume_job(&self, kb_id: &str, job_id: &str) -> Result<()> {
        let store = self.inner.registry.get(kb_id).await?;
        require_job(&store, job_id).await?;
        if store.resume_job(job_id).await? {
            info!(kb_id = %kb_id, job_id = %job_id, "resumed job");
            self.emit(kb_id, &store, job_id).await;
            self.start(kb_id, &store, job_id);
        }
        Ok(())
    }

    /// Cancel a job that has not finished. An item already importing runs
    /// to completion; nothing after it starts.
    pub async fn cancel_job(&self, kb_id: &str, job_id: &str) -> Result<()> {
        let store = self.inner.registry.get(kb_id).await?;
        require_job(&store, job_id).await?;

        self.slots().canceled.insert(job_id.to_string());
        let changed = store.cancel_job(job_id).await?;
        if changed {
            info!(kb_id = %kb_id, job_id = %job_id, "canceled job");
            self.emit(kb_id, &store, job_id).await;
        }

        let owns_slot = self.running_job(kb_id).as_deref() == Some(job_id);
        if !owns_slot {
            self.slots().canceled.remove(job_id);
            // A canceled paused job no longer blocks the queue.
            if changed {
                self.promote_next(kb_id, &store).await?;
            }
        }
        Ok(())
    }

    /// Id of the job whose loop currently owns `kb_id`'s slot.
    pub fn running_job(&self, kb_id: &str) -> Option<String> {
        self.slots().running.get(kb_id).cloned()
    }

    pub fn is_running(&self, kb_id: &str) -> bool {
        self.slots().running.contains_key(kb_id)
    }

    fn slots(&self) -> MutexGuard<'_, SlotState> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot for `job_id` and spawn its loop. No-op if the slot is
    /// taken.
    fn start(&self, kb_id: &str, store: &MetaStore, job_id: &str) -> bool {
        {
            let mut slots = self.slots();
            if slots.running.contains_key(kb_id) {
                debug!(kb_id = %kb_id, job_id = %job_id, "slot busy, job stays queued");
                return false;
            }
            slots.running.insert(kb_id.to_string(), job_id.to_string());
        }

        let scheduler = self.clone();
        let kb_id = kb_id.to_string();
        let job_id = job_id.to_string();
        let store = store.clone();
        tokio::spawn(async move {
            scheduler.run(kb_id, store, job_id).await;
        });
        true
    }

    async fn run(self, kb_id: String, store: MetaStore, job_id: String) {
        if let Err(e) = self.drive(&kb_id, &store, &job_id).await {
            let message = format!("{:#}", e);
            error!(kb_id = %kb_id, job_id = %job_id, error = %message, "job failed");
            match store.fail_job(&job_id, &message).await {
                Ok(true) => self.emit(&kb_id, &store, &job_id).await,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "could not record job failure"),
            }
        }

        {
            let mut slots = self.slots();
            slots.canceled.remove(&job_id);
            if slots.running.get(&kb_id) == Some(&job_id) {
                slots.running.remove(&kb_id);
            }
        }

        if let Err(e) = self.promote_next(&kb_id, &store).await {
            warn!(kb_id = %kb_id, error = %format!("{:#}", e), "could not promote next job");
        }
    }

    async fn drive(&self, kb_id: &str, store: &MetaStore, job_id: &str) -> Result<()> {
        if store.mark_job_processing(job_id).await? {
            debug!(kb_id = %kb_id, job_id = %job_id, "job started");
            self.emit(kb_id, store, job_id).await;
        }

        loop {
            if self.slots().canceled.contains(job_id) {
                return Ok(());
            }
            match store.job_status(job_id).await? {
                Some(JobStatus::Processing) => {}
                // Resumed while this loop was still mid-item.
                Some(JobStatus::Pending) => {
                    if store.mark_job_processing(job_id).await? {
                        debug!(kb_id = %kb_id, job_id = %job_id, "job resumed in place");
                        self.emit(kb_id, store, job_id).await;
                    }
                }
                _ => return Ok(()),
            }

            let Some(item) = store.next_pending_item(job_id).await? else {
                if store.complete_job(job_id).await? {
                    info!(kb_id = %kb_id, job_id = %job_id, "job done");
                    self.emit(kb_id, store, job_id).await;
                }
                return Ok(());
            };

            store.mark_item_processing(&item.id).await?;
            let outcome = self.import_item(store, &item.source_path).await;
            if let ImportOutcome::Failed { error } = &outcome {
                debug!(job_id = %job_id, path = %item.source_path, error = %error, "item failed");
            }
            store
                .finish_item(&item.id, outcome.item_status(), outcome.error_message())
                .await?;
            store.refresh_progress(job_id).await?;
            self.emit(kb_id, store, job_id).await;
        }
    }

    async fn import_item(&self, store: &MetaStore, source_path: &str) -> ImportOutcome {
        let import = self.inner.importer.import(store, source_path);
        let Some(limit) = self.inner.item_timeout else {
            return import.await;
        };
        match tokio::time::timeout(limit, import).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(path = %source_path, secs = limit.as_secs(), "import timed out");
                match store.discard_unfinished(source_path).await {
                    Ok(blobs) => {
                        for relative in blobs {
                            let _ = tokio::fs::remove_file(store.paths().blob_path(&relative)).await;
                        }
                    }
                    Err(e) => warn!(path = %source_path, error = %e, "could not discard partial import"),
                }
                ImportOutcome::Failed {
                    error: format!("import timed out after {}s", limit.as_secs()),
                }
            }
        }
    }

    /// Start the oldest pending job unless the slot is taken or some job is
    /// paused.
    async fn promote_next(&self, kb_id: &str, store: &MetaStore) -> Result<()> {
        if self.is_running(kb_id) {
            return Ok(());
        }
        if store.count_jobs_with_status(JobStatus::Paused).await? > 0 {
            debug!(kb_id = %kb_id, "paused job blocks promotion");
            return Ok(());
        }
        if let Some(next) = store.next_pending_job().await? {
            if self.start(kb_id, store, &next) {
                info!(kb_id = %kb_id, job_id = %next, "promoted queued job");
            }
        }
        Ok(())
    }

    async fn emit(&self, kb_id: &str, store: &MetaStore, job_id: &str) {
        match store.get_job(job_id).await {
            Ok(Some(job)) => self.publish(kb_id, job),
            Ok(None) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "could not load job for update event"),
        }
    }

    fn publish(&self, kb_id: &str, job: Job) {
        let _ = self.inner.events.send(JobUpdate {
            kb_id: kb_id.to_string(),
            job,
        });
    }
}

async fn require_job(store: &MetaStore, job_id: &str) -> Result<()> {
    if store.get_job(job_id).await?.is_none() {
        return Err(KbError::NotFound(format!("job {}", job_id)).into());
    }
    Ok(())
}
