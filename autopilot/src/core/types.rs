//! Closed enumerations for the open text fields of the persisted manifest.
//!
//! The manifest stores status, tier and mode as plain strings so humans can
//! edit it. On read, every value is mapped onto a closed enum; unknown text
//! never fails a load but falls back to a conservative default.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FeatureStatus {
    /// Not started yet.
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    /// Unrecognized status text. Counted as blocked-pending and never picked
    /// up until someone sets a known status.
    Unknown,
}

impl FeatureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    /// Parse leniently; unrecognized values map to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "pending" => Self::Pending,
            "running" | "in_progress" => Self::Running,
            "completed" | "complete" | "done" => Self::Completed,
            "failed" => Self::Failed,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl From<String> for FeatureStatus {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<FeatureStatus> for String {
    fn from(status: FeatureStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution-capability ladder: `Haiku` (lowest) < `Sonnet` (mid) < `Opus` (top).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(from = "String", into = "String")]
pub enum ModelTier {
    Haiku,
    #[default]
    Sonnet,
    Opus,
}

impl ModelTier {
    pub const LOWEST: Self = Self::Haiku;
    pub const TOP: Self = Self::Opus;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
        }
    }

    /// Parse a tier name, accepting both model names and rung names.
    pub fn from_name(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "haiku" | "lowest" | "low" => Some(Self::Haiku),
            "sonnet" | "mid" | "middle" => Some(Self::Sonnet),
            "opus" | "top" | "high" => Some(Self::Opus),
            _ => None,
        }
    }

    /// One rung up; saturates at the top rung.
    pub fn escalated(self) -> Self {
        match self {
            Self::Haiku => Self::Sonnet,
            Self::Sonnet | Self::Opus => Self::Opus,
        }
    }

    /// One rung down; saturates at the lowest rung.
    pub fn deescalated(self) -> Self {
        match self {
            Self::Opus => Self::Sonnet,
            Self::Sonnet | Self::Haiku => Self::Haiku,
        }
    }

    pub fn is_top(self) -> bool {
        self == Self::TOP
    }

    pub fn is_lowest(self) -> bool {
        self == Self::LOWEST
    }
}

impl From<String> for ModelTier {
    fn from(raw: String) -> Self {
        Self::from_name(&raw).unwrap_or_default()
    }
}

impl From<ModelTier> for String {
    fn from(tier: ModelTier) -> Self {
        tier.as_str().to_string()
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a feature entered the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExecutionMode {
    /// Generated from the source document.
    #[default]
    Standard,
    /// Spawned by a running feature through recursive decomposition.
    Recursive,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Recursive => "recursive",
        }
    }
}

impl From<String> for ExecutionMode {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "recursive" => Self::Recursive,
            _ => Self::Standard,
        }
    }
}

impl From<ExecutionMode> for String {
    fn from(mode: ExecutionMode) -> Self {
        mode.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_status_reads_as_unknown() {
        let status: FeatureStatus = serde_json::from_str("\"exploded\"").expect("parse");
        assert_eq!(status, FeatureStatus::Unknown);
        let status: FeatureStatus = serde_json::from_str("\"pending\"").expect("parse");
        assert_eq!(status, FeatureStatus::Pending);
        let status: FeatureStatus = serde_json::from_str("\"Completed\"").expect("parse");
        assert_eq!(status, FeatureStatus::Completed);
    }

    #[test]
    fn unknown_tier_reads_as_mid_rung() {
        let tier: ModelTier = serde_json::from_str("\"gpt-9\"").expect("parse");
        assert_eq!(tier, ModelTier::Sonnet);
        assert_eq!(serde_json::to_string(&ModelTier::Opus).expect("ser"), "\"opus\"");
    }

    #[test]
    fn escalation_saturates_at_top() {
        let once = ModelTier::Haiku.escalated();
        let twice = once.escalated();
        assert_eq!(once, ModelTier::Sonnet);
        assert_eq!(twice, ModelTier::Opus);
        assert_eq!(twice.escalated(), ModelTier::Opus);
    }

    #[test]
    fn deescalation_moves_one_rung() {
        assert_eq!(ModelTier::Opus.deescalated(), ModelTier::Sonnet);
        assert_eq!(ModelTier::Sonnet.deescalated(), ModelTier::Haiku);
        assert_eq!(ModelTier::Haiku.deescalated(), ModelTier::Haiku);
    }
}
