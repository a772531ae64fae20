//! # Knowledge Engine Core
//!
//! Shared building blocks for Knowledge Engine: the data model,
//! the streaming text chunker, the per-knowledge-base path layout, and the
//! controller/worker wire protocol.
//!
//! This crate contains no tokio or sqlx. Its only filesystem access is
//! [`paths::KbPaths::create_dirs`].

pub mod chunk;
pub mod models;
pub mod paths;
pub mod protocol;
