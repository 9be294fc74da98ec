//! `autopilot plan`: turn a feature-drafts document into the manifest.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::io::config::load_config;
use crate::io::generate::{PlanOptions, PlanOutcome, generate_manifest};
use crate::io::init::ProjectPaths;

/// Generate the manifest for `source` using the project's config.
///
/// `source` is resolved against the project root when relative.
pub fn plan_project(root: &Path, source: &Path, options: &PlanOptions) -> Result<PlanOutcome> {
    let paths = ProjectPaths::new(root);
    let config = load_config(&paths.config_path).with_context(|| "load config.toml")?;
    let source = if source.is_absolute() {
        source.to_path_buf()
    } else {
        root.join(source)
    };
    let outcome = generate_manifest(&paths, &config, &source, options)?;
    info!(
        features = outcome.manifest.features.len(),
        warnings = outcome.warnings.len(),
        "plan written"
    );
    Ok(outcome)
}
