//! Deterministic selection logic over the feature list.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::core::feature::{Feature, index_features};
use crate::core::types::FeatureStatus;

fn dependencies_completed(feature: &Feature, index: &HashMap<&str, &Feature>) -> bool {
    feature.depends_on.iter().all(|dep| {
        index
            .get(dep.as_str())
            .is_some_and(|found| found.status == FeatureStatus::Completed)
    })
}

/// Pending with every dependency completed. A dependency id that names no
/// feature counts as unsatisfied.
pub fn is_runnable(feature: &Feature, index: &HashMap<&str, &Feature>) -> bool {
    feature.status == FeatureStatus::Pending && dependencies_completed(feature, index)
}

/// First runnable feature in input order.
pub fn next_runnable(features: &[Feature]) -> Option<&Feature> {
    let index = index_features(features);
    features.iter().find(|feature| is_runnable(feature, &index))
}

/// Every runnable feature in input order.
pub fn runnable_features(features: &[Feature]) -> Vec<&Feature> {
    let index = index_features(features);
    features
        .iter()
        .filter(|feature| is_runnable(feature, &index))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmetDependency {
    pub id: String,
    /// Empty when the id names no feature.
    pub title: String,
    /// `None` when the id names no feature.
    pub status: Option<FeatureStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedFeature {
    pub id: String,
    pub title: String,
    /// `Unknown` when the feature's own status text was unrecognized.
    pub status: FeatureStatus,
    pub unmet: Vec<UnmetDependency>,
}

/// Pending features with at least one incomplete dependency, plus features
/// whose status is unrecognized.
pub fn blocked_features(features: &[Feature]) -> Vec<BlockedFeature> {
    let index = index_features(features);
    features
        .iter()
        .filter(|feature| {
            matches!(feature.status, FeatureStatus::Pending | FeatureStatus::Unknown)
        })
        .filter_map(|feature| {
            let unmet: Vec<UnmetDependency> = feature
                .depends_on
                .iter()
                .filter_map(|dep| match index.get(dep.as_str()) {
                    Some(found) if found.status == FeatureStatus::Completed => None,
                    Some(found) => Some(UnmetDependency {
                        id: found.id.clone(),
                        title: found.title.clone(),
                        status: Some(found.status),
                    }),
                    None => Some(UnmetDependency {
                        id: dep.clone(),
                        title: String::new(),
                        status: None,
                    }),
                })
                .collect();
            let held = feature.status == FeatureStatus::Unknown;
            (held || !unmet.is_empty()).then(|| BlockedFeature {
                id: feature.id.clone(),
                title: feature.title.clone(),
                status: feature.status,
                unmet,
            })
        })
        .collect()
}

/// Aggregate status counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub completed: usize,
    pub running: usize,
    pub failed: usize,
    pub pending: usize,
    pub stopped: usize,
    /// Pending features with at least one incomplete dependency, plus
    /// features with an unrecognized status.
    pub blocked: usize,
}

impl Summary {
    pub fn of(features: &[Feature]) -> Self {
        let index = index_features(features);
        let mut summary = Self {
            total: features.len(),
            ..Self::default()
        };
        for feature in features {
            match feature.status {
                FeatureStatus::Completed => summary.completed += 1,
                FeatureStatus::Running => summary.running += 1,
                FeatureStatus::Failed => summary.failed += 1,
                FeatureStatus::Stopped => summary.stopped += 1,
                FeatureStatus::Pending => {
                    summary.pending += 1;
                    if !dependencies_completed(feature, &index) {
                        summary.blocked += 1;
                    }
                }
                FeatureStatus::Unknown => {
                    summary.pending += 1;
                    summary.blocked += 1;
                }
            }
        }
        summary
    }

    /// Pending features that could start now.
    pub fn ready(&self) -> usize {
        self.pending - self.blocked
    }
}

/// Why there is nothing to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoWorkStatus {
    AllCompleted,
    RunningElsewhere,
    BlockedByFailures,
    AllBlocked,
    Unknown,
}

impl NoWorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllCompleted => "all_completed",
            Self::RunningElsewhere => "running_elsewhere",
            Self::BlockedByFailures => "blocked_by_failures",
            Self::AllBlocked => "all_blocked",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NoWorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoWorkReport {
    pub status: NoWorkStatus,
    pub summary: Summary,
    /// Filled for `blocked_by_failures` and `all_blocked` only.
    pub blocked: Vec<BlockedFeature>,
}

/// Classify an empty selection; the first matching row wins.
///
/// "Pending" in the blocked rows means runnable pending: when nothing is
/// runnable every pending feature is blocked.
pub fn classify_no_work(features: &[Feature]) -> NoWorkReport {
    let summary = Summary::of(features);
    let status = if summary.total > 0 && summary.completed == summary.total {
        NoWorkStatus::AllCompleted
    } else if summary.running > 0 {
        NoWorkStatus::RunningElsewhere
    } else if summary.failed > 0 && summary.ready() == 0 && summary.blocked > 0 {
        NoWorkStatus::BlockedByFailures
    } else if summary.blocked > 0 && summary.ready() == 0 {
        NoWorkStatus::AllBlocked
    } else {
        NoWorkStatus::Unknown
    };
    let blocked = match status {
        NoWorkStatus::BlockedByFailures | NoWorkStatus::AllBlocked => blocked_features(features),
        _ => Vec::new(),
    };
    NoWorkReport {
        status,
        summary,
        blocked,
    }
}
