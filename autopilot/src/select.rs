//! Read-only queries for `autopilot order`, `next` and `status`.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::feature::{Feature, Manifest};
use crate::core::graph::DependencyGraph;
use crate::core::selector::{
    BlockedFeature, NoWorkReport, Summary, blocked_features, classify_no_work, next_runnable,
};
use crate::core::types::{FeatureStatus, ModelTier};
use crate::io::init::ProjectPaths;
use crate::io::manifest_store::load_manifest;

/// Row of the status listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureLine {
    pub id: String,
    pub title: String,
    pub status: FeatureStatus,
    pub model: ModelTier,
    pub depth: u32,
    pub attempts: u32,
}

impl From<&Feature> for FeatureLine {
    fn from(feature: &Feature) -> Self {
        Self {
            id: feature.id.clone(),
            title: feature.title.clone(),
            status: feature.status,
            model: feature.model,
            depth: feature.depth,
            attempts: feature.attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub title: String,
    pub summary: Summary,
    pub features: Vec<FeatureLine>,
    pub blocked: Vec<BlockedFeature>,
}

/// Next runnable feature or the reason there is none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextOutcome {
    Runnable(FeatureLine),
    NoWork(NoWorkReport),
}

pub fn load_project_manifest(paths: &ProjectPaths) -> Result<Manifest> {
    load_manifest(&paths.manifest_path)
        .with_context(|| format!("load {}", paths.manifest_path.display()))
}

/// Deterministic run order; fails with a cycle error.
pub fn run_order(manifest: &Manifest) -> Result<Vec<String>> {
    let order = DependencyGraph::from_features(&manifest.features).topological_order()?;
    Ok(order)
}

pub fn next_feature(manifest: &Manifest) -> NextOutcome {
    match next_runnable(&manifest.features) {
        Some(feature) => NextOutcome::Runnable(FeatureLine::from(feature)),
        None => NextOutcome::NoWork(classify_no_work(&manifest.features)),
    }
}

pub fn status_report(manifest: &Manifest) -> StatusReport {
    StatusReport {
        title: manifest.title.clone(),
        summary: Summary::of(&manifest.features),
        features: manifest.features.iter().map(FeatureLine::from).collect(),
        blocked: blocked_features(&manifest.features),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SchedulerError;
    use crate::core::selector::NoWorkStatus;
    use crate::test_support::{feature, manifest_with, with_status};

    #[test]
    fn order_breaks_ties_by_id() {
        let manifest = manifest_with(vec![
            feature("03", &["01"]),
            feature("02", &[]),
            feature("01", &[]),
        ]);
        assert_eq!(run_order(&manifest).expect("order"), ["01", "02", "03"]);
    }

    #[test]
    fn order_surfaces_cycle_as_scheduler_error() {
        let manifest = manifest_with(vec![feature("01", &["02"]), feature("02", &["01"])]);
        let err = run_order(&manifest).expect_err("cycle");
        assert!(matches!(
            err.downcast_ref::<SchedulerError>(),
            Some(SchedulerError::Cycle { .. })
        ));
    }

    #[test]
    fn next_reports_runnable_or_reason() {
        let mut manifest = manifest_with(vec![
            with_status(feature("01", &[]), FeatureStatus::Running),
            feature("02", &["01"]),
        ]);
        match next_feature(&manifest) {
            NextOutcome::NoWork(report) => {
                assert_eq!(report.status, NoWorkStatus::RunningElsewhere);
            }
            other => panic!("expected no work, got {other:?}"),
        }

        manifest.features[0].status = FeatureStatus::Completed;
        match next_feature(&manifest) {
            NextOutcome::Runnable(line) => assert_eq!(line.id, "02"),
            other => panic!("expected runnable, got {other:?}"),
        }
    }

    #[test]
    fn status_lists_blocked_dependencies() {
        let manifest = manifest_with(vec![feature("01", &[]), feature("02", &["01"])]);
        let report = status_report(&manifest);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.blocked, 1);
        assert_eq!(report.features.len(), 2);
        assert_eq!(report.blocked[0].id, "02");
        assert_eq!(report.blocked[0].unmet[0].id, "01");
    }
}
