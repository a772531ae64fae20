//! Import source resolution.
//!
//! Flattens the `sources` of a `kb.importFiles` request into an ordered,
//! de-duplicated list of file paths. Explicit file paths are taken as given,
//! even when they do not exist (the item fails later with a clear error).
//! Directories are walked in file-name order without following symlinks,
//! skipping hidden entries and common build/dependency directories.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

use knowledge_engine_core::models::ImportSource;

use crate::error::KbError;

/// Entry names never descended into or imported. Matched against the file
/// name only, so they apply at any depth.
const NOISE_PATTERNS: &[&str] = &[
    ".*",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    "Thumbs.db",
    "desktop.ini",
];

/// Fail with [`KbError::Validation`] unless at least one source names a
/// non-blank path.
pub fn require_sources(sources: &[ImportSource]) -> Result<(), KbError> {
    let has_path = sources.iter().any(|source| {
        let paths = match source {
            ImportSource::Files { paths } => paths,
            ImportSource::Directory { paths, .. } => paths,
        };
        paths.iter().any(|p| !p.trim().is_empty())
    });
    if !has_path {
        return Err(KbError::Validation("sources is required".into()));
    }
    Ok(())
}

pub fn resolve_sources(sources: &[ImportSource]) -> Result<Vec<String>> {
    let noise = build_globset(NOISE_PATTERNS)?;
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    let mut push = |path: String| {
        if seen.insert(path.clone()) {
            files.push(path);
        }
    };

    for source in sources {
        match source {
            ImportSource::Files { paths } => {
                for path in paths.iter().filter(|p| !p.trim().is_empty()) {
                    push(path.clone());
                }
            }
            ImportSource::Directory { paths, recursive } => {
                for dir in paths.iter().filter(|p| !p.trim().is_empty()) {
                    for path in walk_directory(Path::new(dir), *recursive, &noise) {
                        push(path);
                    }
                }
            }
        }
    }

    Ok(files)
}

fn walk_directory(root: &Path, recursive: bool, noise: &GlobSet) -> Vec<String> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_noise(entry, noise));

    let mut out = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() {
            out.push(entry.path().to_string_lossy().to_string());
        }
    }
    out
}

/// The walk root itself is never noise, even if its own name is hidden.
fn is_noise(entry: &DirEntry, noise: &GlobSet) -> bool {
    entry.depth() > 0 && noise.is_match(entry.file_name())
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
