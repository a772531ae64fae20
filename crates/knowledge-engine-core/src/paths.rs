//! On-disk layout of a knowledge base.
//!
//! Every path the engine touches is built here; nothing else joins path
//! segments for a knowledge base by hand.
//!
//! ```text
//! <data_root>/knowledge-bases/<kb_id>/
//!     kb.json          manifest
//!     meta.sqlite      metadata database (+ -wal / -shm)
//!     blobs/           <document_id><ext>
//!     index/
//!     staging/
//! ```

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const KNOWLEDGE_BASES_DIR: &str = "knowledge-bases";
pub const MANIFEST_FILE: &str = "kb.json";
pub const META_DB_FILE: &str = "meta.sqlite";
pub const BLOBS_DIR: &str = "blobs";
pub const INDEX_DIR: &str = "index";
pub const STAGING_DIR: &str = "staging";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KbIdError {
    #[error("kbId must not be empty")]
    Empty,
    #[error("kbId '{0}' contains characters not allowed in a directory name")]
    InvalidCharacters(String),
}

/// Reject ids that would escape or alias the knowledge-bases directory.
pub fn validate_kb_id(kb_id: &str) -> Result<(), KbIdError> {
    if kb_id.trim().is_empty() {
        return Err(KbIdError::Empty);
    }
    let bad = kb_id == "."
        || kb_id == ".."
        || kb_id
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control());
    if bad {
        return Err(KbIdError::InvalidCharacters(kb_id.to_string()));
    }
    Ok(())
}

/// Directory holding every knowledge base under a data root.
pub fn knowledge_bases_dir(data_root: &Path) -> PathBuf {
    data_root.join(KNOWLEDGE_BASES_DIR)
}

/// Resolved paths for one knowledge base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbPaths {
    pub kb_id: String,
    pub root: PathBuf,
    pub blobs: PathBuf,
    pub index: PathBuf,
    pub staging: PathBuf,
    pub manifest: PathBuf,
    pub meta_db: PathBuf,
}

impl KbPaths {
    pub fn resolve(data_root: &Path, kb_id: &str) -> Result<Self, KbIdError> {
        validate_kb_id(kb_id)?;
        let root = knowledge_bases_dir(data_root).join(kb_id);
        Ok(Self {
            kb_id: kb_id.to_string(),
            blobs: root.join(BLOBS_DIR),
            index: root.join(INDEX_DIR),
            staging: root.join(STAGING_DIR),
            manifest: root.join(MANIFEST_FILE),
            meta_db: root.join(META_DB_FILE),
            root,
        })
    }

    /// Create the root and its fixed subdirectories.
    pub fn create_dirs(&self) -> io::Result<()> {
        for dir in [&self.root, &self.blobs, &self.index, &self.staging] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Blob location relative to [`KbPaths::root`], as stored on the document row.
    pub fn blob_relative_path(document_id: &str, extension: Option<&str>) -> String {
        match extension {
            Some(ext) if !ext.is_empty() => format!("{}/{}.{}", BLOBS_DIR, document_id, ext),
            _ => format!("{}/{}", BLOBS_DIR, document_id),
        }
    }

    /// Absolute location of a stored relative blob path.
    pub fn blob_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}
