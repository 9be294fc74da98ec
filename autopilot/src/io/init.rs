//! Project paths and `.autopilot/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{AutopilotConfig, write_config};

/// All canonical paths within `.autopilot/` for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub manifest_path: PathBuf,
    pub config_path: PathBuf,
    pub adjustments_path: PathBuf,
    pub timeline_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".autopilot");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: state_dir.join(".gitignore"),
            manifest_path: state_dir.join("manifest.json"),
            config_path: state_dir.join("config.toml"),
            adjustments_path: state_dir.join("adjustments.json"),
            timeline_path: state_dir.join("timeline.jsonl"),
        }
    }

    /// Resolve a path stored relative to the project root.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the existing config.
    pub force: bool,
}

/// Create `.autopilot/` scaffolding in `root`.
///
/// Fails if `.autopilot/` already exists unless `options.force` is set. An
/// existing manifest is never touched.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "autopilot init: .autopilot exists but is not a directory"
        ));
    }
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "autopilot init: .autopilot already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    fs::write(&paths.gitignore_path, STATE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &AutopilotConfig::default())?;
    Ok(paths)
}

const STATE_GITIGNORE: &str = "*.tmp\ntimeline.jsonl\n";
