//! # Knowledge Engine
//!
//! A local-first knowledge-base ingestion and retrieval engine. Files are
//! streamed into per-knowledge-base SQLite databases (content hash, blob
//! copy, and full-text chunks in one pass) by durable, pausable import
//! jobs. All of that runs inside a dedicated worker process that the
//! controller talks to over a JSON request/response/event pipe.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  requests   ┌──────────────────────────────────────┐
//! │  kb (CLI)    │────────────▶│ kb-worker                            │
//! │ WorkerClient │◀────────────│  WorkerHost ─▶ JobScheduler ─▶ ingest │
//! └──────────────┘ responses + │       │             │          │     │
//!                   job:update │       ▼             ▼          ▼     │
//!                              │  ManifestStore   MetaStore (SQLite)  │
//!                              └──────────────────────────────────────┘
//! ```
//!
//! ## On-disk layout
//!
//! ```text
//! <data_root>/knowledge-bases/<kb_id>/{kb.json, meta.sqlite, blobs/, index/, staging/}
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML config for the controller, environment for the worker |
//! | [`error`] | Error categories surfaced to callers |
//! | [`logging`] | `tracing` subscriber setup (stderr only) |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema migrations and crash recovery |
//! | [`store`] | Metadata Store queries |
//! | [`registry`] | Cache of open stores per knowledge base |
//! | [`manifest`] | `kb.json` manifest store |
//! | [`sources`] | Import source resolution |
//! | [`ingest`] | Streaming single-file import |
//! | [`jobs`] | Durable job scheduler |
//! | [`host`] | Worker-side request dispatch and pipe loop |
//! | [`client`] | Controller-side worker client |
//! | [`progress`] | CLI progress rendering |
//!
//! Pure data types, the chunker, the path resolver, and the wire protocol
//! live in the `knowledge-engine-core` crate.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod ingest;
pub mod jobs;
pub mod logging;
pub mod manifest;
pub mod migrate;
pub mod progress;
pub mod registry;
pub mod sources;
pub mod store;
