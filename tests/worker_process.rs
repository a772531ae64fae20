//! The real `kb-worker` binary driven by [`WorkerClient`].

use std::process::{Command, Stdio};
use std::time::Duration;

use tempfile::TempDir;

use knowledge_engine::client::{WorkerClient, WorkerCommand};
use knowledge_engine_core::models::{KbStats, Manifest};
use knowledge_engine_core::protocol::{
    Call, CreateKbParams, CreateNoteParams, KbParams, SearchParams, SearchResults,
};

const WORKER: &str = env!("CARGO_BIN_EXE_kb-worker");
const TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn worker_serves_requests_and_respawns_after_shutdown() {
    let tmp = TempDir::new().unwrap();
    let mut command = WorkerCommand::new(WORKER, tmp.path());
    command.log_level = "warn".into();
    let client = WorkerClient::new(command);

    let manifest: Manifest = client
        .call_as(
            Call::Create(CreateKbParams {
                name: "Process".into(),
                description: None,
            }),
            TIMEOUT,
        )
        .await
        .unwrap();
    client
        .call(
            Call::CreateNote(CreateNoteParams {
                kb_id: manifest.id.clone(),
                title: "Pipes".into(),
                content: "Frames are newline delimited JSON.".into(),
            }),
            TIMEOUT,
        )
        .await
        .unwrap();

    client.shutdown().await;

    // The next call starts a fresh worker over the same data root.
    let found: SearchResults = client
        .call_as(
            Call::Search(SearchParams {
                kb_id: manifest.id.clone(),
                query: "newline".into(),
                limit: None,
            }),
            TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(found.results.len(), 1);

    let stats: KbStats = client
        .call_as(
            Call::GetStats(KbParams {
                kb_id: manifest.id.clone(),
            }),
            TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(stats.documents, 1);
    client.shutdown().await;
}

#[test]
fn worker_without_data_root_exits_with_error() {
    let output = Command::new(WORKER)
        .env_remove("KB_DATA_ROOT")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("KB_DATA_ROOT"), "stderr: {}", stderr);
}

#[test]
fn worker_exits_cleanly_when_input_closes() {
    let tmp = TempDir::new().unwrap();
    let output = Command::new(WORKER)
        .env("KB_DATA_ROOT", tmp.path())
        .env("KB_LOG", "warn")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}
