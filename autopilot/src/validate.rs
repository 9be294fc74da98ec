//! Validation for `.autopilot/` layout, config and manifest.

use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::feature::{Manifest, index_features};
use crate::core::resolve::validate_dependencies;
use crate::io::config::load_config;
use crate::io::init::ProjectPaths;
use crate::io::manifest_store::load_manifest;

/// High-level validation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub features: usize,
    /// Dependency references that would be dropped.
    pub warnings: Vec<String>,
}

/// Validate layout, config and manifest of the project at `root`.
///
/// A dependency cycle fails with a [`crate::core::error::SchedulerError`];
/// dangling references and tree inconsistencies are returned as warnings.
pub fn validate_project(root: &Path) -> Result<ValidateOutcome> {
    let paths = ProjectPaths::new(root);

    ensure_dir(&paths.state_dir)?;
    ensure_file(&paths.gitignore_path)?;
    ensure_file(&paths.manifest_path)?;
    ensure_gitignore(&paths.gitignore_path)?;

    load_config(&paths.config_path).with_context(|| "load config.toml")?;
    let manifest = load_manifest(&paths.manifest_path).with_context(|| "load manifest.json")?;

    let mut features = manifest.features.clone();
    let mut warnings = validate_dependencies(&mut features).into_result()?;
    warnings.extend(tree_warnings(&manifest));
    Ok(ValidateOutcome {
        features: manifest.features.len(),
        warnings,
    })
}

/// Parent/child references that disagree with each other or with `max_depth`.
pub fn tree_warnings(manifest: &Manifest) -> Vec<String> {
    let index = index_features(&manifest.features);
    let mut warnings = Vec::new();
    for feature in &manifest.features {
        if feature.depth > manifest.max_depth {
            warnings.push(format!(
                "feature '{}' has depth {} beyond max_depth {}",
                feature.id, feature.depth, manifest.max_depth
            ));
        }
        for child in &feature.children {
            match index.get(child.as_str()) {
                None => warnings.push(format!(
                    "feature '{}' lists unknown child '{child}'",
                    feature.id
                )),
                Some(found) if found.parent_id != feature.id => warnings.push(format!(
                    "feature '{}' lists child '{child}' whose parent is '{}'",
                    feature.id, found.parent_id
                )),
                Some(_) => {}
            }
        }
        if let Some(parent) = index.get(feature.parent_id.as_str()) {
            if !parent.children.contains(&feature.id) {
                warnings.push(format!(
                    "feature '{}' is missing from the children of '{}'",
                    feature.id, parent.id
                ));
            }
            if feature.depth != parent.depth + 1 {
                warnings.push(format!(
                    "feature '{}' has depth {} under parent depth {}",
                    feature.id, feature.depth, parent.depth
                ));
            }
        }
    }
    warnings
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing directory {}", path.display()));
    }
    if !path.is_dir() {
        return Err(anyhow!("expected directory {}", path.display()));
    }
    Ok(())
}

fn ensure_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing file {}", path.display()));
    }
    if !path.is_file() {
        return Err(anyhow!("expected file {}", path.display()));
    }
    Ok(())
}

fn ensure_gitignore(path: &Path) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if !contents.lines().any(|line| line.trim() == "*.tmp") {
        return Err(anyhow!("missing '*.tmp' in {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SchedulerError;
    use crate::core::tree::add_child;
    use crate::test_support::{TestProject, feature, manifest_with};

    #[test]
    fn validate_reports_dangling_references_as_warnings() {
        let project = TestProject::new().expect("project");
        project
            .write_manifest(vec![feature("01", &[]), feature("02", &["01", "09"])])
            .expect("manifest");

        let outcome = validate_project(project.root()).expect("validate");
        assert_eq!(outcome.features, 2);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("'09'"));
    }

    #[test]
    fn validate_fails_on_cycle() {
        let project = TestProject::new().expect("project");
        project
            .write_manifest(vec![feature("01", &["02"]), feature("02", &["01"])])
            .expect("manifest");

        let err = validate_project(project.root()).expect_err("cycle");
        assert!(matches!(
            err.downcast_ref::<SchedulerError>(),
            Some(SchedulerError::Cycle { .. })
        ));
    }

    #[test]
    fn validate_errors_without_manifest() {
        let project = TestProject::new().expect("project");
        let err = validate_project(project.root()).expect_err("missing manifest");
        assert!(err.to_string().contains("missing file"));
    }

    #[test]
    fn tree_warnings_flag_orphaned_child_links() {
        let mut manifest = manifest_with(vec![feature("01", &[])]);
        let child = add_child(&mut manifest, "01", "Sub", None).expect("child");
        assert!(tree_warnings(&manifest).is_empty());

        manifest.features[0].children.clear();
        let warnings = tree_warnings(&manifest);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains(&format!("'{child}' is missing")));
    }
}
