//! Streaming import of single files into a store.

mod common;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use knowledge_engine::ingest::{FileImporter, ImportOutcome, StreamingImporter};
use knowledge_engine::store::MetaStore;
use knowledge_engine_core::chunk::CHUNK_OVERLAP;
use knowledge_engine_core::paths::KbPaths;

async fn open_store(tmp: &TempDir) -> MetaStore {
    let paths = KbPaths::resolve(tmp.path(), "ingest-kb").unwrap();
    MetaStore::open(paths).await.unwrap().0
}

fn reassemble(chunks: &[String]) -> String {
    let mut text = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            text.push_str(chunk);
        } else {
            text.extend(chunk.chars().skip(CHUNK_OVERLAP));
        }
    }
    text
}

fn document_id(outcome: ImportOutcome) -> String {
    match outcome {
        ImportOutcome::Done { document_id } => document_id,
        other => panic!("expected a finished import, got {:?}", other),
    }
}

#[tokio::test]
async fn large_text_file_streams_into_overlapping_chunks() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    // Multi-byte characters land on read boundaries with a 7-byte buffer.
    let line = "Grüße aus Zürich: naïve café, 東京タワー, emoji 🚀 end.\n";
    let content = line.repeat(200);
    let file = common::write(&tmp.path().join("docs/travel.md"), &content);

    let importer = StreamingImporter::default().with_buffer_size(7);
    let id = document_id(importer.import(&store, &file).await);

    let doc = store.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.title, "travel.md");
    assert_eq!(doc.mime_type.as_deref(), Some("text/markdown"));
    assert_eq!(doc.size_bytes, content.len() as i64);
    assert_eq!(
        doc.sha256.as_deref(),
        Some(hex::encode(Sha256::digest(content.as_bytes())).as_str())
    );

    let blob = store
        .paths()
        .blob_path(doc.blob_relative_path.as_deref().unwrap());
    assert_eq!(std::fs::read(blob).unwrap(), content.as_bytes());

    let chunks = store.list_chunks(&id).await.unwrap();
    assert!(chunks.len() > 2);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
    }
    let texts: Vec<String> = chunks.into_iter().map(|c| c.content).collect();
    assert_eq!(reassemble(&texts), content);

    let hits = store.search("Zürich", 5).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.document_id == id));
}

#[tokio::test]
async fn binary_content_is_stored_but_not_indexed() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let file = tmp.path().join("data.txt");
    std::fs::write(&file, b"header\0\x01\x02 searchable words").unwrap();

    let id = document_id(
        StreamingImporter::default()
            .import(&store, &file.to_string_lossy())
            .await,
    );
    let doc = store.get_document(&id).await.unwrap().unwrap();
    assert!(doc.sha256.is_some());
    assert!(store
        .paths()
        .blob_path(doc.blob_relative_path.as_deref().unwrap())
        .is_file());
    assert!(store.list_chunks(&id).await.unwrap().is_empty());
    assert!(store.search("searchable", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn non_text_extensions_skip_indexing() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let file = common::write(&tmp.path().join("image.png"), "not really a png");

    let id = document_id(StreamingImporter::default().import(&store, &file).await);
    let doc = store.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.mime_type.as_deref(), Some("image/png"));
    assert!(store.list_chunks(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_file_fails_without_leaving_a_document() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let missing = tmp.path().join("gone.txt");

    let outcome = StreamingImporter::default()
        .import(&store, &missing.to_string_lossy())
        .await;
    match outcome {
        ImportOutcome::Failed { error } => assert!(error.contains("gone.txt"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(store.list_documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn directories_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let dir = tmp.path().join("folder");
    std::fs::create_dir(&dir).unwrap();

    let outcome = StreamingImporter::default()
        .import(&store, &dir.to_string_lossy())
        .await;
    assert!(matches!(outcome, ImportOutcome::Skipped { .. }));
    assert!(store.list_documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_import_removes_partial_document() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let file = common::write(&tmp.path().join("notes.txt"), "content that cannot be stored");

    // Blobs cannot be written once the blob directory is a plain file.
    let blobs = store.paths().blobs.clone();
    std::fs::remove_dir_all(&blobs).unwrap();
    std::fs::write(&blobs, b"in the way").unwrap();

    let outcome = StreamingImporter::default().import(&store, &file).await;
    assert!(matches!(outcome, ImportOutcome::Failed { .. }), "{:?}", outcome);
    assert!(store.list_documents().await.unwrap().is_empty());
    assert!(store.search("content", 5).await.unwrap().is_empty());
}
