//! Autopilot configuration stored under `.autopilot/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::write_atomic;
use crate::core::escalation::EscalationConfig;
use crate::core::feature::{DEFAULT_MAX_DEPTH, Manifest};
use crate::core::retry::RetryConfig;
use crate::core::types::ModelTier;

/// Autopilot configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Fixed polling interval of the single-shot loop.
    pub poll_interval_ms: u64,

    /// Concurrency limit of `supervise`.
    pub max_parallel: usize,

    /// Tier assigned to generated root features.
    pub default_model: ModelTier,

    /// Context budget of generated root features.
    pub default_context_budget: u64,

    /// `max_depth` written into generated manifests.
    pub max_depth: u32,

    /// Parent directory of per-feature directories, relative to the project root.
    pub features_dir: String,

    pub retry: RetryConfig,

    pub escalation: EscalationConfig,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command that runs one attempt; the prompt is written to its stdin.
    pub command: Vec<String>,

    /// Wall-clock limit per attempt in seconds.
    pub attempt_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: ["claude", "-p", "--output-format", "stream-json", "--verbose"]
                .map(String::from)
                .to_vec(),
            attempt_timeout_secs: 60 * 60,
        }
    }
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_parallel: 1,
            default_model: ModelTier::Sonnet,
            default_context_budget: 100_000,
            max_depth: DEFAULT_MAX_DEPTH,
            features_dir: "features".to_string(),
            retry: RetryConfig::default(),
            escalation: EscalationConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if self.features_dir.trim().is_empty() {
            return Err(anyhow!("features_dir must not be empty"));
        }
        if self.retry.max_retries == 0 {
            return Err(anyhow!("retry.max_retries must be > 0"));
        }
        if self.escalation.error_threshold == 0 {
            return Err(anyhow!("escalation.error_threshold must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.attempt_timeout_secs == 0 {
            return Err(anyhow!("agent.attempt_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.attempt_timeout_secs)
    }

    /// Tracker settings for a project; the manifest's section wins when present.
    pub fn escalation_for(&self, manifest: &Manifest) -> EscalationConfig {
        manifest
            .escalation
            .clone()
            .unwrap_or_else(|| self.escalation.clone())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutopilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = AutopilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutopilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AutopilotConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = AutopilotConfig::default();
        cfg.default_model = ModelTier::Haiku;
        cfg.retry.max_adjustments = 1;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_parallel = 4\n[escalation]\nerror_threshold = 2\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_parallel, 4);
        assert_eq!(cfg.escalation.error_threshold, 2);
        assert!(cfg.escalation.enabled);
        assert_eq!(cfg.retry, RetryConfig::default());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[escalation]\nerror_threshold = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("error_threshold"));
    }

    #[test]
    fn manifest_escalation_overrides_config() {
        let cfg = AutopilotConfig::default();
        let mut manifest = Manifest::new("PRD.md", "Demo");
        assert_eq!(cfg.escalation_for(&manifest), cfg.escalation);

        let custom = EscalationConfig {
            error_threshold: 7,
            ..EscalationConfig::default()
        };
        manifest.escalation = Some(custom.clone());
        assert_eq!(cfg.escalation_for(&manifest), custom);
    }
}
