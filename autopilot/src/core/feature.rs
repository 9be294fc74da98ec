//! Feature and manifest data model.
//!
//! The manifest is the persisted source of truth. Features live in one flat,
//! ordered list; the recursive tree is expressed through `parent_id` and
//! `children` id references into that list. Every recursive field defaults on
//! read so manifests written before decomposition existed still load.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::escalation::EscalationConfig;
use crate::core::types::{ExecutionMode, FeatureStatus, ModelTier};

pub const DEFAULT_MAX_DEPTH: u32 = 3;

/// Optional resource ceiling, carried as data for the accounting layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

/// Last known resource usage reported by the accounting layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    /// Directory hint relative to the project root.
    #[serde(default)]
    pub dir: String,
    pub title: String,
    #[serde(default)]
    pub status: FeatureStatus,
    /// Dependency tokens; canonical ids once the manifest has been validated.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub model: ModelTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Budget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    /// Empty for root features.
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub context_budget: u64,
    /// Attempts started so far.
    #[serde(default)]
    pub attempts: u32,
    /// Scope was reduced by a task-simplify adjustment.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub simplified: bool,
}

impl Feature {
    /// A pending root feature with default tier and mode.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dir: String::new(),
            title: title.into(),
            status: FeatureStatus::Pending,
            depends_on: Vec::new(),
            mode: ExecutionMode::Standard,
            model: ModelTier::default(),
            budget: None,
            usage: None,
            parent_id: String::new(),
            depth: 0,
            children: Vec::new(),
            context_budget: 0,
            attempts: 0,
            simplified: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }

    /// Mark the feature running and count the attempt; returns its number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.status = FeatureStatus::Running;
        self.attempts += 1;
        self.attempts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Path of the source document the features were generated from.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Budget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationConfig>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}

impl Manifest {
    pub fn new(source: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            source: source.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            max_depth: DEFAULT_MAX_DEPTH,
            budget: None,
            escalation: None,
            features: Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|feature| feature.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Feature> {
        self.features.iter_mut().find(|feature| feature.id == id)
    }

    /// True when the manifest has features and every one is completed.
    pub fn all_completed(&self) -> bool {
        !self.features.is_empty()
            && self
                .features
                .iter()
                .all(|feature| feature.status == FeatureStatus::Completed)
    }
}

/// Id-indexed view over a feature list.
pub fn index_features(features: &[Feature]) -> HashMap<&str, &Feature> {
    features
        .iter()
        .map(|feature| (feature.id.as_str(), feature))
        .collect()
}
