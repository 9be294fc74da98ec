//! Manifest load/save with a per-store save lock.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use super::atomic::write_atomic;
use crate::core::feature::Manifest;

/// Handle on `.autopilot/manifest.json`.
///
/// Saves through the same store are serialized and each one replaces the file
/// atomically, so concurrent writers never interleave partial documents.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    save_lock: Mutex<()>,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<Manifest> {
        load_manifest(&self.path)
    }

    /// Stamp `updated_at` and write the manifest.
    #[instrument(skip_all, fields(path = %self.path.display(), features = manifest.features.len()))]
    pub fn save(&self, manifest: &mut Manifest) -> Result<()> {
        let _guard = self.save_lock.lock();
        manifest.updated_at = Utc::now();
        write_manifest(&self.path, manifest)
    }

    /// Take a snapshot and write it while holding the save lock, so snapshots
    /// reach disk in the order they were taken.
    pub fn save_from(&self, snapshot: impl FnOnce() -> Manifest) -> Result<()> {
        let _guard = self.save_lock.lock();
        let mut manifest = snapshot();
        manifest.updated_at = Utc::now();
        write_manifest(&self.path, &manifest)
    }

    /// Load, mutate and save while holding the save lock.
    pub fn update<R>(&self, apply: impl FnOnce(&mut Manifest) -> Result<R>) -> Result<R> {
        let _guard = self.save_lock.lock();
        let mut manifest = load_manifest(&self.path)?;
        let result = apply(&mut manifest)?;
        manifest.updated_at = Utc::now();
        write_manifest(&self.path, &manifest)?;
        Ok(result)
    }

    /// Like [`ManifestStore::update`], but nothing is written when `apply`
    /// returns `None`.
    pub fn update_if<R>(
        &self,
        apply: impl FnOnce(&mut Manifest) -> Result<Option<R>>,
    ) -> Result<Option<R>> {
        let _guard = self.save_lock.lock();
        let mut manifest = load_manifest(&self.path)?;
        let Some(result) = apply(&mut manifest)? else {
            return Ok(None);
        };
        manifest.updated_at = Utc::now();
        write_manifest(&self.path, &manifest)?;
        Ok(Some(result))
    }
}

/// Load and structurally check a manifest.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    debug!(path = %path.display(), "loading manifest");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&contents)
        .with_context(|| format!("parse manifest {}", path.display()))?;
    let errors = structural_errors(&manifest);
    if !errors.is_empty() {
        return Err(anyhow!(
            "manifest {} is invalid: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    debug!(features = manifest.features.len(), "manifest loaded");
    Ok(manifest)
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn structural_errors(manifest: &Manifest) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for feature in &manifest.features {
        if feature.id.trim().is_empty() {
            errors.push("feature with empty id".to_string());
        } else if !seen.insert(feature.id.as_str()) {
            errors.push(format!("duplicate feature id '{}'", feature.id));
        }
    }
    for feature in &manifest.features {
        if !feature.is_root() && !seen.contains(feature.parent_id.as_str()) {
            errors.push(format!(
                "feature '{}' has unknown parent '{}'",
                feature.id, feature.parent_id
            ));
        }
    }
    errors
}
