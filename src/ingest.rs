//! Ingestion Engine: streaming single-file import.
//!
//! One pass over the source stream does three things at once:
//!
//! ```text
//! source ──read 64 KiB──┬─▶ SHA-256
//!                       ├─▶ blobs/<documentId><ext>
//!                       └─▶ UTF-8 decode ─▶ StreamChunker ─▶ chunks (batched commits)
//! ```
//!
//! The document row is committed first with a null hash and the hash is
//! written last, so a crash leaves a row the recovery pass can find. A
//! failure anywhere after the row exists deletes the row (chunks and index
//! entries cascade) and the partial blob, then reports `Failed` rather
//! than propagating: one bad file never aborts a job.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

use knowledge_engine_core::chunk::{StreamChunker, TextChunk, Utf8Decoder};
use knowledge_engine_core::models::JobItemStatus;
use knowledge_engine_core::paths::KbPaths;

use crate::store::{MetaStore, NewFileDocument};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Chunks accumulated before a commit.
const CHUNK_BATCH: usize = 32;

/// Extensions whose content is decoded and chunked. Anything else is stored
/// as a blob only.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "markdown", "mdx", "rst", "adoc", "org", "tex", "csv", "tsv", "json",
    "jsonl", "ndjson", "yaml", "yml", "toml", "ini", "cfg", "conf", "env", "xml", "html", "htm",
    "css", "scss", "js", "mjs", "cjs", "ts", "tsx", "jsx", "py", "rb", "rs", "go", "java", "kt",
    "swift", "c", "h", "cc", "cpp", "hpp", "cs", "php", "sh", "bash", "zsh", "ps1", "sql", "log",
    "vue", "svelte", "lua", "r", "m", "scala", "dart", "ex", "exs", "erl", "hs", "clj", "pl",
];

const MIME_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("text", "text/plain"),
    ("log", "text/plain"),
    ("md", "text/markdown"),
    ("markdown", "text/markdown"),
    ("mdx", "text/markdown"),
    ("csv", "text/csv"),
    ("tsv", "text/tab-separated-values"),
    ("json", "application/json"),
    ("jsonl", "application/x-ndjson"),
    ("ndjson", "application/x-ndjson"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("toml", "application/toml"),
    ("xml", "application/xml"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
    ("ts", "text/typescript"),
    ("py", "text/x-python"),
    ("rs", "text/x-rust"),
    ("sh", "application/x-sh"),
    ("sql", "application/sql"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("zip", "application/zip"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
}

/// Whether content at `path` is worth decoding as text.
pub fn is_textual(path: &Path) -> bool {
    extension(path).is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.as_str()))
}

pub fn mime_type_for(path: &Path) -> Option<&'static str> {
    let ext = extension(path)?;
    MIME_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

/// Decides from the first buffer of a file whether it is binary.
pub trait ContentSniffer: Send + Sync {
    fn is_binary(&self, head: &[u8]) -> bool;
}

/// Treats any NUL byte in the first buffer as binary content.
#[derive(Debug, Default, Clone, Copy)]
pub struct NulByteSniffer;

impl ContentSniffer for NulByteSniffer {
    fn is_binary(&self, head: &[u8]) -> bool {
        head.contains(&0)
    }
}

/// Result of importing one file. Never an `Err`: failures are data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Done { document_id: String },
    Skipped { reason: String },
    Failed { error: String },
}

impl ImportOutcome {
    pub fn item_status(&self) -> JobItemStatus {
        match self {
            Self::Done { .. } => JobItemStatus::Done,
            Self::Skipped { .. } => JobItemStatus::Skipped,
            Self::Failed { .. } => JobItemStatus::Failed,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Done { .. } => None,
            Self::Skipped { reason } => Some(reason),
            Self::Failed { error } => Some(error),
        }
    }
}

/// Imports one file into a knowledge base. The scheduler depends on this
/// trait so its run loop can be driven by other importers.
#[async_trait]
pub trait FileImporter: Send + Sync {
    async fn import(&self, store: &MetaStore, source_path: &str) -> ImportOutcome;
}

/// The production importer.
pub struct StreamingImporter {
    sniffer: Arc<dyn ContentSniffer>,
    buffer_size: usize,
    chunk_batch: usize,
}

impl Default for StreamingImporter {
    fn default() -> Self {
        Self::new(Arc::new(NulByteSniffer))
    }
}

impl StreamingImporter {
    pub fn new(sniffer: Arc<dyn ContentSniffer>) -> Self {
        Self {
            sniffer,
            buffer_size: READ_BUFFER_BYTES,
            chunk_batch: CHUNK_BATCH,
        }
    }

    /// Smaller read buffers exercise multi-byte characters split across reads.
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes.max(1);
        self
    }

    pub async fn import_one_file(&self, store: &MetaStore, source_path: &str) -> ImportOutcome {
        let path = Path::new(source_path);
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                return ImportOutcome::Failed {
                    error: format!("cannot read {}: {}", source_path, e),
                }
            }
        };
        if !metadata.is_file() {
            return ImportOutcome::Skipped {
                reason: format!("{} is not a regular file", source_path),
            };
        }

        let ext = extension(path);
        let id = Uuid::new_v4().to_string();
        let doc = NewFileDocument {
            id: id.clone(),
            title: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| source_path.to_string()),
            source_path: source_path.to_string(),
            blob_relative_path: KbPaths::blob_relative_path(&id, ext.as_deref()),
            mime_type: mime_type_for(path).map(str::to_string),
        };

        if let Err(e) = store.insert_file_document(&doc).await {
            return ImportOutcome::Failed {
                error: format!("{:#}", e),
            };
        }

        match self.stream_into(store, path, &doc).await {
            Ok(()) => ImportOutcome::Done { document_id: id },
            Err(e) => {
                warn!(kb_id = %store.paths().kb_id, path = %source_path, error = %format!("{:#}", e), "import failed");
                if let Err(cleanup) = store.delete_document(&id).await {
                    warn!(document_id = %id, error = %cleanup, "failed to delete partial document");
                }
                let blob = store.paths().blob_path(&doc.blob_relative_path);
                let _ = tokio::fs::remove_file(&blob).await;
                ImportOutcome::Failed {
                    error: format!("{:#}", e),
                }
            }
        }
    }

    async fn stream_into(&self, store: &MetaStore, path: &Path, doc: &NewFileDocument) -> Result<()> {
        let paths = store.paths();
        let mut reader = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        tokio::fs::create_dir_all(&paths.blobs)
            .await
            .with_context(|| format!("Failed to create {}", paths.blobs.display()))?;
        let blob_path = paths.blob_path(&doc.blob_relative_path);
        let mut writer = BufWriter::new(
            tokio::fs::File::create(&blob_path)
                .await
                .with_context(|| format!("Failed to create blob {}", blob_path.display()))?,
        );

        let mut hasher = Sha256::new();
        let mut indexer = is_textual(path).then(TextIndexer::default);
        let mut pending: Vec<TextChunk> = Vec::new();
        let mut buf = vec![0u8; self.buffer_size];
        let mut size: u64 = 0;
        let mut first = true;

        loop {
            let n = reader
                .read(&mut buf)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }
            let bytes = &buf[..n];
            hasher.update(bytes);
            writer.write_all(bytes).await.context("Failed to write blob")?;
            size += n as u64;

            if first {
                first = false;
                if indexer.is_some() && self.sniffer.is_binary(bytes) {
                    debug!(path = %path.display(), "binary content, storing without index");
                    indexer = None;
                }
            }

            if let Some(ix) = indexer.as_mut() {
                pending.extend(ix.push(bytes));
                if pending.len() >= self.chunk_batch {
                    store.insert_chunks(&doc.id, &pending).await?;
                    pending.clear();
                }
            }
        }

        writer.flush().await.context("Failed to flush blob")?;
        writer.into_inner().sync_all().await.context("Failed to sync blob")?;

        if let Some(ix) = indexer {
            pending.extend(ix.finish());
        }
        store.insert_chunks(&doc.id, &pending).await?;

        let sha256 = hex::encode(hasher.finalize());
        store.finalize_document(&doc.id, &sha256, size as i64).await?;
        debug!(kb_id = %paths.kb_id, document_id = %doc.id, bytes = size, "imported file");
        Ok(())
    }
}

#[async_trait]
impl FileImporter for StreamingImporter {
    async fn import(&self, store: &MetaStore, source_path: &str) -> ImportOutcome {
        self.import_one_file(store, source_path).await
    }
}

/// Bytes in, chunks out.
#[derive(Debug, Default)]
struct TextIndexer {
    decoder: Utf8Decoder,
    chunker: StreamChunker,
}

impl TextIndexer {
    fn push(&mut self, bytes: &[u8]) -> Vec<TextChunk> {
        let text = self.decoder.decode(bytes);
        self.chunker.push(&text)
    }

    fn finish(mut self) -> Vec<TextChunk> {
        let tail = self.decoder.finish();
        let mut chunks = self.chunker.push(&tail);
        chunks.extend(self.chunker.finish());
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textual_extensions() {
        assert!(is_textual(Path::new("/a/notes.MD")));
        assert!(is_textual(Path::new("main.rs")));
        assert!(!is_textual(Path::new("photo.png")));
        assert!(!is_textual(Path::new("Makefile")));
    }

    #[test]
    fn mime_lookup() {
        assert_eq!(mime_type_for(Path::new("a.txt")), Some("text/plain"));
        assert_eq!(mime_type_for(Path::new("a.PDF")), Some("application/pdf"));
        assert_eq!(mime_type_for(Path::new("a.unknown")), None);
    }

    #[test]
    fn nul_sniffer() {
        assert!(NulByteSniffer.is_binary(b"ab\0cd"));
        assert!(!NulByteSniffer.is_binary("plain ✓".as_bytes()));
    }

    #[test]
    fn outcome_maps_to_item_status() {
        let failed = ImportOutcome::Failed { error: "boom".into() };
        assert_eq!(failed.item_status(), JobItemStatus::Failed);
        assert_eq!(failed.error_message(), Some("boom"));
        let done = ImportOutcome::Done { document_id: "d".into() };
        assert_eq!(done.item_status(), JobItemStatus::Done);
        assert_eq!(done.error_message(), None);
    }
}
