//! Persisted retry-strategy histories (`.autopilot/adjustments.json`).
//!
//! Single-shot invocations are separate processes; persisting the registry is
//! what lets the third failure see the escalation recorded by the second.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use super::atomic::write_atomic;
use crate::core::retry::{AdjustmentHistory, AdjustmentRegistry, RetryConfig};

/// Load the registry; a missing file yields an empty one.
pub fn load_registry(path: &Path, config: RetryConfig) -> Result<AdjustmentRegistry> {
    if !path.exists() {
        return Ok(AdjustmentRegistry::new(config));
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let histories: BTreeMap<String, AdjustmentHistory> =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(features = histories.len(), "adjustment histories loaded");
    Ok(AdjustmentRegistry::restore(config, histories))
}

pub fn save_registry(path: &Path, registry: &AdjustmentRegistry) -> Result<()> {
    let mut buf =
        serde_json::to_string_pretty(&registry.snapshot()).context("serialize adjustments")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
