//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use knowledge_engine::ingest::{FileImporter, ImportOutcome, StreamingImporter};
use knowledge_engine::jobs::JobScheduler;
use knowledge_engine::store::MetaStore;
use knowledge_engine_core::models::{Job, JobStatus};

/// Lets a test decide when each file import may proceed.
pub struct GatedImporter {
    inner: StreamingImporter,
    gate: Arc<Semaphore>,
    started: mpsc::UnboundedSender<String>,
}

impl GatedImporter {
    /// The importer, its gate (no permits yet), and a feed of paths as each
    /// import begins waiting.
    pub fn new() -> (Arc<Self>, Arc<Semaphore>, mpsc::UnboundedReceiver<String>) {
        let gate = Arc::new(Semaphore::new(0));
        let (started, rx) = mpsc::unbounded_channel();
        let importer = Arc::new(Self {
            inner: StreamingImporter::default(),
            gate: gate.clone(),
            started,
        });
        (importer, gate, rx)
    }
}

#[async_trait]
impl FileImporter for GatedImporter {
    async fn import(&self, store: &MetaStore, source_path: &str) -> ImportOutcome {
        let _ = self.started.send(source_path.to_string());
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.inner.import(store, source_path).await
    }
}

pub fn write(path: &Path, content: &str) -> String {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
    path.to_string_lossy().to_string()
}

/// Poll until the job satisfies `done`, failing the test after 10 seconds.
pub async fn wait_for_job(store: &MetaStore, job_id: &str, done: impl Fn(&Job) -> bool) -> Job {
    for _ in 0..1000 {
        let job = store.get_job(job_id).await.unwrap().expect("job exists");
        if done(&job) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached the expected state", job_id);
}

pub async fn wait_for_status(store: &MetaStore, job_id: &str, status: JobStatus) -> Job {
    wait_for_job(store, job_id, |job| job.status == status).await
}

/// Poll until no run loop owns the knowledge base's slot.
pub async fn wait_until_idle(scheduler: &JobScheduler, kb_id: &str) {
    for _ in 0..1000 {
        if !scheduler.is_running(kb_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scheduler for {} never went idle", kb_id);
}

pub async fn next_started(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("an import started")
        .expect("importer alive")
}
