//! Core data models shared by the worker and the controller.
//!
//! These types are what the Metadata Store persists, what the Job Scheduler
//! drives through its state machines, and what crosses the worker pipe as
//! JSON. Field names serialize in camelCase; timestamps are Unix
//! milliseconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unix epoch milliseconds.
pub type Timestamp = i64;

/// Version written into every new manifest.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Returned when a persisted status string is not a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle of a [`Job`].
///
/// ```text
/// pending -> processing -> done | failed
/// pending -> processing -> paused -> processing
/// pending | processing | paused -> canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Done,
    Failed,
    Canceled,
}

string_enum!(JobStatus, "job status", {
    Pending => "pending",
    Processing => "processing",
    Paused => "paused",
    Done => "done",
    Failed => "failed",
    Canceled => "canceled",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    /// Whether a run loop may keep working on a job in this status.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

/// Lifecycle of a [`JobItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobItemStatus {
    Pending,
    Processing,
    Done,
    Failed,
    Skipped,
}

string_enum!(JobItemStatus, "job item status", {
    Pending => "pending",
    Processing => "processing",
    Done => "done",
    Failed => "failed",
    Skipped => "skipped",
});

impl JobItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ImportFiles,
}

string_enum!(JobType, "job type", {
    ImportFiles => "import_files",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobItemKind {
    File,
}

string_enum!(JobItemKind, "job item kind", {
    File => "file",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    File,
    Note,
}

string_enum!(DocumentKind, "document kind", {
    File => "file",
    Note => "note",
});

/// A durable batch-import unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// The import request exactly as submitted (`{"sources": [...]}`).
    pub payload: serde_json::Value,
    pub progress_current: i64,
    pub progress_total: i64,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub updated_at: Timestamp,
    pub heartbeat_at: Option<Timestamp>,
}

/// One file within a [`Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobItem {
    pub id: String,
    pub job_id: String,
    pub kind: JobItemKind,
    pub source_path: String,
    pub status: JobItemStatus,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

/// One imported file or authored note.
///
/// A file document whose `sha256` is still `None` is an import in flight
/// (or one interrupted by a crash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub kind: DocumentKind,
    pub title: String,
    pub source_path: Option<String>,
    pub blob_relative_path: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub sha256: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A contiguous slice of a document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: i64,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub created_at: Timestamp,
}

/// Human-facing identity of a knowledge base, stored as `kb.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

/// A requested import source, as sent by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImportSource {
    Files {
        paths: Vec<String>,
    },
    Directory {
        paths: Vec<String>,
        #[serde(default)]
        recursive: bool,
    },
}

/// A ranked full-text match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk_id: i64,
    pub document_id: String,
    pub document_title: String,
    pub document_kind: DocumentKind,
    pub snippet: String,
    /// Negated BM25; higher is better.
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KbStats {
    pub documents: i64,
    pub chunks: i64,
    pub jobs: i64,
}
