//! Append-only observability timeline (`.autopilot/timeline.jsonl`).
//!
//! Both decision engines append here. The timeline is product output: it is
//! always written and independent of `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::escalation::ModelSwitch;
use crate::core::retry::AdjustmentRecord;
use crate::core::types::FeatureStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineEvent {
    StatusChanged {
        feature_id: String,
        from: FeatureStatus,
        to: FeatureStatus,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        detail: String,
    },
    Adjustment {
        feature_id: String,
        record: AdjustmentRecord,
    },
    ModelSwitch {
        feature_id: String,
        switch: ModelSwitch,
    },
    Archived {
        source: String,
        target: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TimelineEvent,
}

#[derive(Debug)]
pub struct Timeline {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Timeline {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single JSON line.
    pub fn append(&self, event: TimelineEvent) -> Result<()> {
        let entry = TimelineEntry {
            timestamp: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&entry).context("serialize timeline entry")?;
        line.push('\n');

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open timeline {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append timeline {}", self.path.display()))
    }
}

/// Read every entry; a missing timeline is empty.
pub fn read_timeline(path: &Path) -> Result<Vec<TimelineEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read timeline {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse timeline {} line {}", path.display(), n + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::escalation::SwitchReason;
    use crate::core::types::ModelTier;

    #[test]
    fn appended_events_read_back_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let timeline = Timeline::new(temp.path().join(".autopilot/timeline.jsonl"));

        timeline
            .append(TimelineEvent::StatusChanged {
                feature_id: "01".to_string(),
                from: FeatureStatus::Pending,
                to: FeatureStatus::Running,
                detail: String::new(),
            })
            .expect("append");
        timeline
            .append(TimelineEvent::ModelSwitch {
                feature_id: "01".to_string(),
                switch: ModelSwitch {
                    timestamp: Utc::now(),
                    from: ModelTier::Haiku,
                    to: ModelTier::Sonnet,
                    reason: SwitchReason::ErrorThreshold,
                    detail: "2 tool errors".to_string(),
                },
            })
            .expect("append");

        let entries = read_timeline(timeline.path()).expect("read");
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[0].event,
            TimelineEvent::StatusChanged {
                to: FeatureStatus::Running,
                ..
            }
        ));
        let raw = fs::read_to_string(timeline.path()).expect("raw");
        assert!(raw.lines().nth(1).expect("line").contains(r#""event":"model_switch""#));
    }

    #[test]
    fn missing_timeline_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_timeline(&temp.path().join("none.jsonl")).expect("read").is_empty());
    }
}
