//! Error categories surfaced to callers.
//!
//! Internal code propagates `anyhow::Error`; the variants here are raised
//! where the category matters to the caller (validation, missing input,
//! guarded operations) and can be recovered with `downcast_ref::<KbError>()`.

use knowledge_engine_core::paths::KbIdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    /// A required parameter is missing or malformed. Raised before any I/O.
    #[error("{0}")]
    Validation(String),

    /// The import sources resolved to zero files; no job was created.
    #[error("no files found in the given sources")]
    NoFilesFound,

    /// A guarded operation was called without its precondition.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A schema migration failed; the store is unusable.
    #[error("migration {version} ({name}) failed: {message}")]
    Migration {
        version: i64,
        name: &'static str,
        message: String,
    },
}

impl KbError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<KbIdError> for KbError {
    fn from(err: KbIdError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Fail with [`KbError::Validation`] when a required string is blank.
pub fn require_non_empty(field: &str, value: &str) -> Result<(), KbError> {
    if value.trim().is_empty() {
        return Err(KbError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_are_rejected() {
        assert!(require_non_empty("title", "T").is_ok());
        let err = require_non_empty("title", "   ").unwrap_err();
        assert_eq!(err.to_string(), "title is required");
    }

    #[test]
    fn kb_id_errors_become_validation() {
        let err: KbError = KbIdError::Empty.into();
        assert!(matches!(err, KbError::Validation(_)));
    }

    #[test]
    fn downcast_through_anyhow() {
        let err: anyhow::Error = KbError::NoFilesFound.into();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::NoFilesFound)));
    }
}
