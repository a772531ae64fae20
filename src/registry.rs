//! Per-knowledge-base cache of open [`MetaStore`] handles.
//!
//! The first request for a knowledge base opens its database (migrations
//! and recovery included); later requests reuse the same pool. Opening is
//! serialized through the registry lock, so two concurrent first calls
//! never migrate the same file twice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::info;

use knowledge_engine_core::paths::KbPaths;

use crate::error::KbError;
use crate::store::MetaStore;

pub struct StoreRegistry {
    data_root: PathBuf,
    stores: Mutex<HashMap<String, MetaStore>>,
}

impl StoreRegistry {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn paths(&self, kb_id: &str) -> Result<KbPaths, KbError> {
        Ok(KbPaths::resolve(&self.data_root, kb_id)?)
    }

    /// The open store for `kb_id`, opening it on first use.
    pub async fn get(&self, kb_id: &str) -> Result<MetaStore> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(kb_id) {
            return Ok(store.clone());
        }

        let (store, report) = MetaStore::open(self.paths(kb_id)?).await?;
        if !report.is_empty() {
            info!(
                kb_id = %kb_id,
                jobs_paused = report.jobs_paused,
                items_reset = report.items_reset,
                orphaned_blobs = report.orphaned_blobs.len(),
                "recovered interrupted work"
            );
        }
        stores.insert(kb_id.to_string(), store.clone());
        Ok(store)
    }

    /// Close and forget the handle for `kb_id`, if open.
    pub async fn close(&self, kb_id: &str) {
        let store = self.stores.lock().await.remove(kb_id);
        if let Some(store) = store {
            store.close().await;
        }
    }

    pub async fn close_all(&self) {
        let stores: Vec<MetaStore> = self.stores.lock().await.drain().map(|(_, s)| s).collect();
        for store in stores {
            store.close().await;
        }
    }

    pub async fn is_open(&self, kb_id: &str) -> bool {
        self.stores.lock().await.contains_key(kb_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reuses_open_handles() {
        let tmp = TempDir::new().unwrap();
        let registry = StoreRegistry::new(tmp.path());

        let a = registry.get("kb1").await.unwrap();
        a.create_note("n", "body").await.unwrap();
        let b = registry.get("kb1").await.unwrap();
        assert_eq!(b.stats().await.unwrap().documents, 1);
        assert!(registry.is_open("kb1").await);

        registry.close("kb1").await;
        assert!(!registry.is_open("kb1").await);

        let reopened = registry.get("kb1").await.unwrap();
        assert_eq!(reopened.stats().await.unwrap().documents, 1);
        registry.close_all().await;
        assert!(!registry.is_open("kb1").await);
    }

    #[tokio::test]
    async fn rejects_bad_ids() {
        let tmp = TempDir::new().unwrap();
        let registry = StoreRegistry::new(tmp.path());
        let err = registry.get("../escape").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::Validation(_))));
    }
}
