//! Manifest generation from a feature-drafts document.
//!
//! The drafts document is TOML:
//!
//! ```toml
//! title = "Shop"
//!
//! [[features]]
//! title = "Database schema"
//! body = "Create tables."
//!
//! [[features]]
//! title = "Login page"
//! body = """
//! Build the login form.
//! Depends: 1
//! """
//! ```
//!
//! Every feature gets a directory under `features_dir` before dependencies are
//! validated. A dependency cycle removes everything this attempt created and
//! no manifest is written.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::config::AutopilotConfig;
use super::init::ProjectPaths;
use super::manifest_store::ManifestStore;
use crate::core::feature::{Feature, Manifest};
use crate::core::resolve::{ordinal_id, parse_depends, validate_dependencies};

#[derive(Debug, Clone, Deserialize)]
pub struct DraftDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub features: Vec<FeatureDraft>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureDraft {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Replace an existing manifest.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub manifest: Manifest,
    /// Dropped dependency references.
    pub warnings: Vec<String>,
}

pub fn parse_drafts(contents: &str) -> Result<DraftDocument> {
    let doc: DraftDocument = toml::from_str(contents).context("parse feature drafts")?;
    if doc.features.is_empty() {
        return Err(anyhow!("feature drafts contain no [[features]] entries"));
    }
    if let Some(n) = doc.features.iter().position(|f| f.title.trim().is_empty()) {
        return Err(anyhow!("feature draft {} has an empty title", n + 1));
    }
    Ok(doc)
}

/// Lowercase ASCII slug for directory names.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_end_matches('-').chars().take(40).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "feature".to_string()
    } else {
        slug
    }
}

/// Paths created by one generation attempt, removed again on failure.
#[derive(Debug, Default)]
struct Created {
    paths: Vec<PathBuf>,
}

impl Created {
    fn dir_all(&mut self, dir: &Path) -> Result<()> {
        let missing: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|ancestor| !ancestor.exists())
            .map(Path::to_path_buf)
            .collect();
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        self.paths.extend(missing.into_iter().rev());
        Ok(())
    }

    fn file(&mut self, path: &Path, contents: &str) -> Result<()> {
        let existed = path.exists();
        fs::write(path, contents).with_context(|| format!("write file {}", path.display()))?;
        if !existed {
            self.paths.push(path.to_path_buf());
        }
        Ok(())
    }

    fn rollback(self) {
        for path in self.paths.into_iter().rev() {
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(err) = removed {
                warn!(path = %path.display(), error = %err, "rollback could not remove path");
            }
        }
    }
}

/// Generate and persist the manifest for `source`.
#[instrument(skip_all, fields(source = %source.display(), force = options.force))]
pub fn generate_manifest(
    paths: &ProjectPaths,
    config: &AutopilotConfig,
    source: &Path,
    options: &PlanOptions,
) -> Result<PlanOutcome> {
    let store = ManifestStore::new(&paths.manifest_path);
    if store.exists() && !options.force {
        return Err(anyhow!(
            "manifest already exists at {} (use --force to overwrite)",
            paths.manifest_path.display()
        ));
    }

    let contents =
        fs::read_to_string(source).with_context(|| format!("read {}", source.display()))?;
    let doc = parse_drafts(&contents).with_context(|| format!("load {}", source.display()))?;

    let mut created = Created::default();
    match build(paths, config, source, doc, &mut created, &store) {
        Ok(outcome) => {
            info!(features = outcome.manifest.features.len(), "manifest generated");
            Ok(outcome)
        }
        Err(err) => {
            created.rollback();
            Err(err)
        }
    }
}

fn build(
    paths: &ProjectPaths,
    config: &AutopilotConfig,
    source: &Path,
    doc: DraftDocument,
    created: &mut Created,
    store: &ManifestStore,
) -> Result<PlanOutcome> {
    let mut features = Vec::with_capacity(doc.features.len());
    for (n, draft) in doc.features.iter().enumerate() {
        let id = ordinal_id(n + 1);
        let dir = format!("{}/{id}-{}", config.features_dir, slugify(&draft.title));
        let abs_dir = paths.resolve(&dir);
        created.dir_all(&abs_dir)?;
        let body = format!("# {}\n\n{}\n", draft.title.trim(), draft.body.trim_end());
        created.file(&abs_dir.join("FEATURE.md"), &body)?;

        let mut feature = Feature::new(id, draft.title.trim());
        feature.dir = dir;
        feature.depends_on = parse_depends(&draft.body);
        feature.model = config.default_model;
        feature.context_budget = config.default_context_budget;
        features.push(feature);
    }

    let warnings = validate_dependencies(&mut features).into_result()?;
    for warning in &warnings {
        warn!("{warning}");
    }

    let source_ref = source
        .strip_prefix(&paths.root)
        .unwrap_or(source)
        .display()
        .to_string();
    let title = if doc.title.trim().is_empty() {
        source_ref.clone()
    } else {
        doc.title.trim().to_string()
    };
    let mut manifest = Manifest::new(source_ref, title);
    manifest.max_depth = config.max_depth;
    manifest.features = features;
    store.save(&mut manifest)?;
    Ok(PlanOutcome { manifest, warnings })
}
