//! # Worker process (`kb-worker`)
//!
//! Serves the knowledge-base protocol on stdin/stdout. Spawned by the `kb`
//! controller, which sets `KB_DATA_ROOT` (required), `KB_LOG`, and
//! optionally `KB_ITEM_TIMEOUT_SECS`. Logs go to stderr; stdout carries
//! protocol frames only.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use knowledge_engine::config::WorkerEnv;
use knowledge_engine::host::{self, WorkerHost};
use knowledge_engine::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let env = WorkerEnv::from_env()?;
    logging::init(&env.log_level)?;
    info!(
        data_root = %env.data_root.display(),
        item_timeout_secs = env.item_timeout.map(|d| d.as_secs()),
        "worker starting"
    );

    let (host, events) = WorkerHost::new(env.data_root, env.item_timeout);
    host::serve(Arc::new(host), events, tokio::io::stdin(), tokio::io::stdout()).await?;
    info!("worker stopped");
    Ok(())
}
