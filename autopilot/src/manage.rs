//! Manifest edits made outside an attempt: `spawn` and `tier`.

use anyhow::Result;
use tracing::{info, instrument};

use crate::attempt::log_timeline;
use crate::core::error::SchedulerError;
use crate::core::escalation::{EscalationTracker, ModelSwitch};
use crate::core::tree::add_child;
use crate::core::types::ModelTier;
use crate::io::config::AutopilotConfig;
use crate::io::init::ProjectPaths;
use crate::io::manifest_store::ManifestStore;
use crate::io::timeline::{Timeline, TimelineEvent};

/// Add a child feature under `parent_id` and persist it; returns the child id.
///
/// Depth and missing-parent failures surface as [`SchedulerError`] and leave
/// the manifest untouched.
#[instrument(skip_all, fields(parent_id = %parent_id))]
pub fn spawn_child(
    paths: &ProjectPaths,
    parent_id: &str,
    title: &str,
    context_budget: Option<u64>,
) -> Result<String> {
    let store = ManifestStore::new(&paths.manifest_path);
    let id = store.update(|manifest| Ok(add_child(manifest, parent_id, title, context_budget)?))?;
    info!(child_id = %id, "child feature spawned");
    Ok(id)
}

/// Pin a feature to `tier`; returns the recorded switch, or `None` when the
/// feature already runs on it.
#[instrument(skip_all, fields(feature_id = %feature_id, tier = %tier))]
pub fn set_tier(
    paths: &ProjectPaths,
    config: &AutopilotConfig,
    feature_id: &str,
    tier: ModelTier,
) -> Result<Option<ModelSwitch>> {
    let store = ManifestStore::new(&paths.manifest_path);
    let switch = store.update(|manifest| {
        let escalation = config.escalation_for(manifest);
        let feature = manifest
            .find_mut(feature_id)
            .ok_or_else(|| SchedulerError::not_found(feature_id))?;
        let mut tracker = EscalationTracker::new(&feature.id, feature.model, escalation);
        let switch = tracker.override_tier(tier);
        feature.model = tracker.current();
        Ok(switch)
    })?;

    if let Some(switch) = &switch {
        info!(from = %switch.from, to = %switch.to, "tier overridden");
        log_timeline(
            &Timeline::new(&paths.timeline_path),
            TimelineEvent::ModelSwitch {
                feature_id: feature_id.to_string(),
                switch: switch.clone(),
            },
        );
    }
    Ok(switch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::escalation::SwitchReason;
    use crate::core::types::ExecutionMode;
    use crate::io::timeline::read_timeline;
    use crate::test_support::{TestProject, feature};

    #[test]
    fn spawn_persists_child_with_inherited_fields() {
        let project = TestProject::new().expect("project");
        let mut parent = feature("01", &[]);
        parent.context_budget = 1_001;
        parent.model = ModelTier::Opus;
        project.write_manifest(vec![parent]).expect("manifest");

        let id = spawn_child(project.paths(), "01", "Split out parser", None).expect("spawn");
        assert_eq!(id, "01.1");

        let manifest = project.read_manifest().expect("read");
        let child = manifest.find("01.1").expect("child");
        assert_eq!(child.parent_id, "01");
        assert_eq!(child.depth, 1);
        assert_eq!(child.context_budget, 500);
        assert_eq!(child.model, ModelTier::Opus);
        assert_eq!(child.mode, ExecutionMode::Recursive);
        assert_eq!(manifest.find("01").expect("parent").children, vec!["01.1"]);
    }

    #[test]
    fn spawn_beyond_max_depth_leaves_manifest_unchanged() {
        let project = TestProject::new().expect("project");
        let mut deep = feature("01", &[]);
        deep.depth = 3;
        project.write_manifest(vec![deep]).expect("manifest");

        let err = spawn_child(project.paths(), "01", "Too deep", None).expect_err("depth");
        assert!(matches!(
            err.downcast_ref::<SchedulerError>(),
            Some(SchedulerError::DepthExceeded { depth: 4, .. })
        ));
        assert_eq!(project.read_manifest().expect("read").features.len(), 1);
    }

    #[test]
    fn set_tier_persists_and_logs_user_switch() {
        let project = TestProject::new().expect("project");
        project.write_manifest(vec![feature("01", &[])]).expect("manifest");

        let switch = set_tier(project.paths(), &project.config(), "01", ModelTier::Haiku)
            .expect("tier")
            .expect("switch");
        assert_eq!(switch.reason, SwitchReason::ConfiguredByUser);
        assert_eq!(switch.to, ModelTier::Haiku);
        assert_eq!(
            project.read_manifest().expect("read").find("01").expect("01").model,
            ModelTier::Haiku
        );
        assert_eq!(read_timeline(&project.paths().timeline_path).expect("timeline").len(), 1);

        let again = set_tier(project.paths(), &project.config(), "01", ModelTier::Haiku);
        assert_eq!(again.expect("tier"), None);
    }

    #[test]
    fn set_tier_on_unknown_feature_is_not_found() {
        let project = TestProject::new().expect("project");
        project.write_manifest(vec![feature("01", &[])]).expect("manifest");
        let err = set_tier(project.paths(), &project.config(), "07", ModelTier::Opus)
            .expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<SchedulerError>(),
            Some(SchedulerError::NotFound { .. })
        ));
    }
}
