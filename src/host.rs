//! Worker Process Host.
//!
//! Reads newline-delimited JSON requests, dispatches each one on its own
//! task, and writes responses and `job:update` events through a single
//! writer task so frames never interleave. Requests complete in any order;
//! the `id` correlates them. When the input closes, every open store is
//! closed and [`serve`] returns.
//!
//! ```text
//! stdin ──lines──▶ decode ──spawn──▶ WorkerHost::handle ─┐
//!                                                         ├──▶ frame queue ──▶ stdout
//! JobScheduler events ──────────────▶ Event("job:update") ┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use knowledge_engine_core::protocol::{
    decode_frame, encode_frame, Call, DeleteKbParams, DocumentIdResult, EnsureInitializedResult,
    ErrorBody, Event, JobIdResult, JobUpdate, Request, Response, SearchResults, SuccessResult,
    DEFAULT_MAX_FRAME_BYTES, JOB_UPDATE_EVENT,
};

use crate::error::{require_non_empty, KbError};
use crate::ingest::{FileImporter, StreamingImporter};
use crate::jobs::JobScheduler;
use crate::manifest::{ManifestPatch, ManifestStore};
use crate::registry::StoreRegistry;
use crate::sources::require_sources;
use crate::store::{MetaStore, DEFAULT_SEARCH_LIMIT};

pub struct WorkerHost {
    manifests: ManifestStore,
    registry: Arc<StoreRegistry>,
    scheduler: JobScheduler,
    max_frame_bytes: usize,
}

impl WorkerHost {
    /// A host using the streaming importer. The receiver carries job
    /// updates for [`serve`] to forward.
    pub fn new(
        data_root: impl Into<PathBuf>,
        item_timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<JobUpdate>) {
        Self::with_importer(data_root, Arc::new(StreamingImporter::default()), item_timeout)
    }

    pub fn with_importer(
        data_root: impl Into<PathBuf>,
        importer: Arc<dyn FileImporter>,
        item_timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<JobUpdate>) {
        let data_root = data_root.into();
        let registry = Arc::new(StoreRegistry::new(data_root.clone()));
        let (scheduler, events) = JobScheduler::new(registry.clone(), importer, item_timeout);
        let host = Self {
            manifests: ManifestStore::new(data_root),
            registry,
            scheduler,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        };
        (host, events)
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    /// Turn one request into its response. Never fails: errors become
    /// `ok: false` responses.
    pub async fn handle(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        let outcome = match Call::parse(&method, params) {
            Ok(call) => self.dispatch(call).await,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                debug!(method = %method, error = %format!("{:#}", e), "request failed");
                Response::failure(id, error_body(&e))
            }
        }
    }

    pub async fn dispatch(&self, call: Call) -> Result<Value> {
        match call {
            Call::EnsureInitialized(p) => {
                let store = self.open(&p.kb_id).await?;
                to_value(EnsureInitializedResult {
                    kb_id: p.kb_id,
                    meta_db_path: store.paths().meta_db.display().to_string(),
                })
            }
            Call::ImportFiles(p) => {
                require_non_empty("kbId", &p.kb_id)?;
                require_sources(&p.sources)?;
                self.open(&p.kb_id).await?;
                let job_id = self.scheduler.import_files(&p.kb_id, p.sources).await?;
                to_value(JobIdResult { job_id })
            }
            Call::ListJobs(p) => {
                self.open(&p.kb_id).await?;
                to_value(self.scheduler.list_jobs(&p.kb_id).await?)
            }
            Call::ListJobItems(p) => {
                require_non_empty("jobId", &p.job_id)?;
                self.open(&p.kb_id).await?;
                to_value(self.scheduler.list_job_items(&p.kb_id, &p.job_id).await?)
            }
            Call::PauseJob(p) => {
                require_non_empty("jobId", &p.job_id)?;
                self.open(&p.kb_id).await?;
                self.scheduler.pause_job(&p.kb_id, &p.job_id).await?;
                to_value(SuccessResult::OK)
            }
            Call::ResumeJob(p) => {
                require_non_empty("jobId", &p.job_id)?;
                self.open(&p.kb_id).await?;
                self.scheduler.resume_job(&p.kb_id, &p.job_id).await?;
                to_value(SuccessResult::OK)
            }
            Call::CancelJob(p) => {
                require_non_empty("jobId", &p.job_id)?;
                self.open(&p.kb_id).await?;
                self.scheduler.cancel_job(&p.kb_id, &p.job_id).await?;
                to_value(SuccessResult::OK)
            }
            Call::Search(p) => {
                require_non_empty("kbId", &p.kb_id)?;
                if p.query.trim().is_empty() {
                    return to_value(SearchResults { results: Vec::new() });
                }
                let store = self.open(&p.kb_id).await?;
                let results = store
                    .search(&p.query, p.limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
                    .await?;
                to_value(SearchResults { results })
            }
            Call::CreateNote(p) => {
                require_non_empty("title", &p.title)?;
                let store = self.open(&p.kb_id).await?;
                let document_id = store.create_note(p.title.trim(), &p.content).await?;
                to_value(DocumentIdResult { document_id })
            }
            Call::GetStats(p) => {
                let store = self.open(&p.kb_id).await?;
                to_value(store.stats().await?)
            }
            Call::Create(p) => {
                let manifest = self.manifests.create(&p.name, p.description.as_deref())?;
                self.registry.get(&manifest.id).await?;
                to_value(manifest)
            }
            Call::List(_) => to_value(self.manifests.list()?),
            Call::Get(p) => {
                require_non_empty("kbId", &p.kb_id)?;
                let manifest = self.manifests.ensure_initialized(&p.kb_id)?;
                self.registry.get(&p.kb_id).await?;
                to_value(manifest)
            }
            Call::Update(p) => {
                require_non_empty("kbId", &p.kb_id)?;
                let manifest = self.manifests.update(
                    &p.kb_id,
                    ManifestPatch {
                        name: p.name,
                        description: p.description,
                    },
                )?;
                to_value(manifest)
            }
            Call::Delete(p) => {
                self.delete(p).await?;
                to_value(SuccessResult::OK)
            }
        }
    }

    /// Validate the id, make sure the manifest exists, and open the store.
    async fn open(&self, kb_id: &str) -> Result<MetaStore> {
        require_non_empty("kbId", kb_id)?;
        self.manifests.ensure_initialized(kb_id)?;
        self.registry.get(kb_id).await
    }

    async fn delete(&self, p: DeleteKbParams) -> Result<()> {
        require_non_empty("kbId", &p.kb_id)?;
        if !p.confirmed {
            return self.manifests.delete_directory(&p.kb_id, false);
        }
        if let Some(job_id) = self.scheduler.running_job(&p.kb_id) {
            return Err(KbError::PreconditionFailed(format!(
                "job {} is running; cancel or pause it before deleting",
                job_id
            ))
            .into());
        }
        self.registry.close(&p.kb_id).await;
        self.manifests.delete_directory(&p.kb_id, true)
    }

    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).context("Failed to serialize result")
}

/// `message` is the one-line cause chain; `stack` is the full debug report.
pub fn error_body(err: &anyhow::Error) -> ErrorBody {
    ErrorBody {
        message: format!("{:#}", err),
        stack: Some(format!("{:?}", err)),
    }
}

/// Serve requests from `reader` until it closes, writing frames to `writer`.
pub async fn serve<R, W>(
    host: Arc<WorkerHost>,
    mut events: mpsc::UnboundedReceiver<JobUpdate>,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let max = host.max_frame_bytes;
    let (frames, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = queue.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                error!(error = %e, "failed to write frame");
                break;
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, "failed to flush frame");
                break;
            }
        }
    });

    let event_frames = frames.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(update) = events.recv().await {
            let event = match serde_json::to_value(&update) {
                Ok(payload) => Event::new(JOB_UPDATE_EVENT, payload),
                Err(e) => {
                    warn!(error = %e, "failed to serialize job update");
                    continue;
                }
            };
            match encode_frame(&event, max) {
                Ok(frame) => {
                    if event_frames.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping job update"),
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "request channel failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match decode_frame::<Request>(&line, max) {
            Ok(request) => request,
            Err(e) => {
                reject_frame(&line, &e.to_string(), max, &frames);
                continue;
            }
        };

        let host = host.clone();
        let frames = frames.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let response = host.handle(request).await;
            if let Some(frame) = encode_response(response, &id, max) {
                let _ = frames.send(frame);
            }
        });
    }

    info!("request channel closed, shutting down");
    forwarder.abort();
    host.shutdown().await;
    drop(frames);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer_task).await;
    Ok(())
}

fn encode_response(response: Response, id: &str, max: usize) -> Option<Vec<u8>> {
    match encode_frame(&response, max) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(id = %id, error = %e, "response not encodable");
            let fallback = Response::failure(
                id,
                ErrorBody {
                    message: e.to_string(),
                    stack: None,
                },
            );
            encode_frame(&fallback, max).ok()
        }
    }
}

/// Answer an undecodable frame if it at least carries an `id`.
fn reject_frame(line: &str, reason: &str, max: usize, frames: &mpsc::UnboundedSender<Vec<u8>>) {
    let id = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string));
    match id {
        Some(id) => {
            let response = Response::failure(
                id,
                ErrorBody {
                    message: reason.to_string(),
                    stack: None,
                },
            );
            if let Ok(frame) = encode_frame(&response, max) {
                let _ = frames.send(frame);
            }
        }
        None => warn!(error = %reason, "dropping malformed frame"),
    }
}
