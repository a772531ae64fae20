//! Manifest Store: the `kb.json` sidecar holding a knowledge base's name
//! and description.
//!
//! Stored beside the metadata database, never inside it. A missing or
//! corrupt manifest is regenerated with defaults. Writes go to a temporary
//! file in the same directory which is then renamed over `kb.json`.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use uuid::Uuid;

use knowledge_engine_core::models::{Manifest, MANIFEST_SCHEMA_VERSION};
use knowledge_engine_core::paths::{knowledge_bases_dir, KbPaths, MANIFEST_FILE};

use crate::error::{require_non_empty, KbError};
use crate::store::now_ms;

/// Fields a caller may change with [`ManifestStore::update`].
#[derive(Debug, Clone, Default)]
pub struct ManifestPatch {
    pub name: Option<String>,
    /// `Some("")` clears the description.
    pub description: Option<String>,
}

pub struct ManifestStore {
    data_root: PathBuf,
}

impl ManifestStore {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// Create the directory layout and a default manifest if needed.
    pub fn ensure_initialized(&self, kb_id: &str) -> Result<Manifest> {
        let paths = KbPaths::resolve(&self.data_root, kb_id).map_err(KbError::from)?;
        paths
            .create_dirs()
            .with_context(|| format!("Failed to create {}", paths.root.display()))?;

        if let Some(manifest) = read_manifest(&paths.manifest)? {
            return Ok(manifest);
        }

        let now = now_ms();
        let manifest = Manifest {
            id: kb_id.to_string(),
            name: kb_id.to_string(),
            description: None,
            created_at: now,
            updated_at: now,
            schema_version: MANIFEST_SCHEMA_VERSION,
        };
        write_manifest(&paths.manifest, &manifest)?;
        Ok(manifest)
    }

    /// Allocate a new knowledge base. The caller opens its database.
    pub fn create(&self, name: &str, description: Option<&str>) -> Result<Manifest> {
        require_non_empty("name", name)?;
        let id = Uuid::new_v4().to_string();
        let paths = KbPaths::resolve(&self.data_root, &id).map_err(KbError::from)?;
        paths
            .create_dirs()
            .with_context(|| format!("Failed to create {}", paths.root.display()))?;

        let now = now_ms();
        let manifest = Manifest {
            id,
            name: name.trim().to_string(),
            description: clean_description(description),
            created_at: now,
            updated_at: now,
            schema_version: MANIFEST_SCHEMA_VERSION,
        };
        write_manifest(&paths.manifest, &manifest)?;
        info!(kb_id = %manifest.id, name = %manifest.name, "created knowledge base");
        Ok(manifest)
    }

    /// Every readable manifest, most recently updated first.
    pub fn list(&self) -> Result<Vec<Manifest>> {
        let dir = knowledge_bases_dir(&self.data_root);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
        };

        let mut manifests = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(MANIFEST_FILE);
            match read_manifest(&path) {
                Ok(Some(manifest)) => manifests.push(manifest),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable manifest"),
            }
        }
        manifests.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(manifests)
    }

    pub fn update(&self, kb_id: &str, patch: ManifestPatch) -> Result<Manifest> {
        if let Some(name) = &patch.name {
            require_non_empty("name", name)?;
        }
        let paths = KbPaths::resolve(&self.data_root, kb_id).map_err(KbError::from)?;
        if !paths.root.is_dir() {
            return Err(KbError::NotFound(format!("knowledge base {}", kb_id)).into());
        }
        let mut manifest = self.ensure_initialized(kb_id)?;
        if let Some(name) = patch.name {
            manifest.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            manifest.description = clean_description(Some(&description));
        }
        manifest.updated_at = now_ms().max(manifest.updated_at);
        write_manifest(&paths.manifest, &manifest)?;
        Ok(manifest)
    }

    /// Remove the whole knowledge-base directory. Irreversible, so it
    /// refuses to run unless `confirmed` is set.
    pub fn delete_directory(&self, kb_id: &str, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(KbError::PreconditionFailed(
                "deleting a knowledge base requires confirmed = true".into(),
            )
            .into());
        }
        let paths = KbPaths::resolve(&self.data_root, kb_id).map_err(KbError::from)?;
        match fs::remove_dir_all(&paths.root) {
            Ok(()) => {
                info!(kb_id = %kb_id, "deleted knowledge base");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", paths.root.display())),
        }
    }
}

fn clean_description(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

/// `Ok(None)` when the file is missing or not a valid manifest.
fn read_manifest(path: &Path) -> Result<Option<Manifest>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    match serde_json::from_str(&raw) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt manifest");
            Ok(None)
        }
    }
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, manifest)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_initialized_is_stable() {
        let tmp = TempDir::new().unwrap();
        let store = ManifestStore::new(tmp.path());
        let first = store.ensure_initialized("kb1").unwrap();
        assert_eq!(first.name, "kb1");
        assert_eq!(first.schema_version, MANIFEST_SCHEMA_VERSION);
        let again = store.ensure_initialized("kb1").unwrap();
        assert_eq!(first, again);
        assert!(tmp.path().join("knowledge-bases/kb1/blobs").is_dir());
    }

    #[test]
    fn corrupt_manifest_is_regenerated_and_skipped_by_list() {
        let tmp = TempDir::new().unwrap();
        let store = ManifestStore::new(tmp.path());
        store.create("Good", None).unwrap();

        let bad = tmp.path().join("knowledge-bases/broken");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("kb.json"), "{ not json").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Good");

        let regenerated = store.ensure_initialized("broken").unwrap();
        assert_eq!(regenerated.name, "broken");
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn list_sorts_by_updated_desc() {
        let tmp = TempDir::new().unwrap();
        let store = ManifestStore::new(tmp.path());
        let a = store.create("A", None).unwrap();
        let b = store.create("B", Some("second")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .update(
                &a.id,
                ManifestPatch {
                    name: Some("A2".into()),
                    description: None,
                },
            )
            .unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["A2".to_string(), "B".to_string()]);
        assert_eq!(store.list().unwrap()[1].description.as_deref(), Some("second"));
        assert_eq!(store.list().unwrap()[1].id, b.id);
    }

    #[test]
    fn create_and_update_validate_name() {
        let tmp = TempDir::new().unwrap();
        let store = ManifestStore::new(tmp.path());
        let err = store.create("  ", None).unwrap_err();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::Validation(_))));

        let kb = store.create("X", None).unwrap();
        let err = store
            .update(
                &kb.id,
                ManifestPatch {
                    name: Some(String::new()),
                    description: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::Validation(_))));
    }

    #[test]
    fn update_of_unknown_kb_is_not_found_and_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = ManifestStore::new(tmp.path());
        let err = store
            .update(
                "ghost",
                ManifestPatch {
                    name: Some("Renamed".into()),
                    description: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::NotFound(_))));
        assert!(!tmp.path().join("knowledge-bases").join("ghost").exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn delete_requires_confirmation() {
        let tmp = TempDir::new().unwrap();
        let store = ManifestStore::new(tmp.path());
        let kb = store.create("Doomed", None).unwrap();

        let err = store.delete_directory(&kb.id, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::PreconditionFailed(_))
        ));
        assert!(tmp.path().join("knowledge-bases").join(&kb.id).exists());

        store.delete_directory(&kb.id, true).unwrap();
        assert!(!tmp.path().join("knowledge-bases").join(&kb.id).exists());
        assert!(store.list().unwrap().is_empty());
    }
}
