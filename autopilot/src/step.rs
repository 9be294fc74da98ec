//! Orchestration for a single-shot `autopilot run`.
//!
//! One invocation performs at most one unit of work: pick the next runnable
//! feature, run one attempt on it, persist the outcome and, once every feature
//! is completed, archive the source document.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::attempt::{
    AttemptEnv, archive_if_complete, log_settlement, log_started, run_attempt, settle,
};
use crate::core::error::SchedulerError;
use crate::core::escalation::TrackerRegistry;
use crate::core::feature::{Feature, index_features};
use crate::core::retry::RetryDecision;
use crate::core::selector::{NoWorkReport, classify_no_work, is_runnable, next_runnable};
use crate::exit_codes;
use crate::io::adjustments::{load_registry, save_registry};
use crate::io::config::AutopilotConfig;
use crate::io::executor::Executor;
use crate::io::init::ProjectPaths;
use crate::io::manifest_store::ManifestStore;
use crate::io::timeline::Timeline;

/// Result of a single step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing was runnable.
    NoWork(NoWorkReport),
    /// The selected feature completed.
    Completed {
        feature_id: String,
        /// Archived source document, when this completion finished the manifest.
        archived: Option<PathBuf>,
    },
    /// The attempt failed; the decision says whether the feature went back to pending.
    Failed {
        feature_id: String,
        decision: RetryDecision,
    },
}

impl StepOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoWork(_) | Self::Completed { .. } => exit_codes::OK,
            Self::Failed { .. } => exit_codes::FAILURE,
        }
    }
}

/// Execute one step against the project at `paths`.
///
/// Once a feature is claimed, its settlement is persisted before any
/// bookkeeping error is returned, so a failed step never leaves it `running`.
#[instrument(skip_all, fields(root = %paths.root.display()))]
pub fn run_step<E: Executor>(
    paths: &ProjectPaths,
    config: &AutopilotConfig,
    executor: &E,
) -> Result<StepOutcome> {
    let store = ManifestStore::new(&paths.manifest_path);
    let manifest = store
        .load()
        .with_context(|| format!("load {}", paths.manifest_path.display()))?;

    let Some(selected) = next_runnable(&manifest.features) else {
        return Ok(no_work(&manifest.features));
    };
    let feature_id = selected.id.clone();
    let escalation = config.escalation_for(&manifest);
    let registry = load_registry(&paths.adjustments_path, config.retry.clone())?;

    let Some(feature) = claim_feature(&store, &feature_id)? else {
        info!(feature_id = %feature_id, "feature claimed by another run");
        let manifest = store.load()?;
        return Ok(no_work(&manifest.features));
    };
    info!(feature_id = %feature.id, attempt = feature.attempts, model = %feature.model, "feature running");

    let timeline = Timeline::new(&paths.timeline_path);
    log_started(&timeline, &feature);

    let trackers = TrackerRegistry::new();
    let env = AttemptEnv {
        paths,
        executor,
        timeline: &timeline,
        trackers: &trackers,
        escalation,
        poll_interval: config.poll_interval(),
    };
    let result = run_attempt(&env, &feature);

    let settlement = settle(&feature, &result, &registry);
    let registry_saved = save_registry(&paths.adjustments_path, &registry);

    let manifest = store.update(|manifest| {
        let persisted = manifest
            .find_mut(&feature_id)
            .ok_or_else(|| SchedulerError::not_found(&feature_id))?;
        settlement.apply(persisted);
        Ok(manifest.clone())
    })?;
    log_settlement(&timeline, &feature_id, &settlement);
    info!(feature_id = %feature_id, status = %settlement.status, "feature settled");
    registry_saved?;

    if let Some(decision) = settlement.decision {
        return Ok(StepOutcome::Failed {
            feature_id,
            decision,
        });
    }

    let archived = archive_if_complete(paths, &timeline, &manifest)?;

    Ok(StepOutcome::Completed {
        feature_id,
        archived,
    })
}

fn no_work(features: &[Feature]) -> StepOutcome {
    let report = classify_no_work(features);
    info!(status = %report.status, blocked = report.blocked.len(), "no runnable feature");
    StepOutcome::NoWork(report)
}

/// Mark `feature_id` running if it is still runnable in the stored manifest.
///
/// Returns `None` without writing when another run got there first.
fn claim_feature(store: &ManifestStore, feature_id: &str) -> Result<Option<Feature>> {
    store.update_if(|manifest| {
        let index = index_features(&manifest.features);
        let runnable = index
            .get(feature_id)
            .is_some_and(|feature| is_runnable(feature, &index));
        if !runnable {
            return Ok(None);
        }
        let feature = manifest
            .find_mut(feature_id)
            .ok_or_else(|| SchedulerError::not_found(feature_id))?;
        feature.begin_attempt();
        Ok(Some(feature.clone()))
    })
}
