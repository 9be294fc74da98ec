//! Test-only builders and a scripted execution collaborator.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::core::feature::{Feature, Manifest};
use crate::core::types::FeatureStatus;
use crate::io::config::{AutopilotConfig, write_config};
use crate::io::executor::{ExecutionInstance, Executor, InstanceStatus, StartRequest};
use crate::io::init::{InitOptions, ProjectPaths, init_project};
use crate::io::manifest_store::{ManifestStore, load_manifest};

/// Pending root feature titled `"<id> title"` depending on `deps`.
pub fn feature(id: &str, deps: &[&str]) -> Feature {
    let mut feature = Feature::new(id, format!("{id} title"));
    feature.depends_on = deps.iter().map(|dep| dep.to_string()).collect();
    feature
}

/// Pending root feature with an explicit title and no dependencies.
pub fn titled(id: &str, title: &str) -> Feature {
    Feature::new(id, title)
}

pub fn with_status(mut feature: Feature, status: FeatureStatus) -> Feature {
    feature.status = status;
    feature
}

/// Manifest with source `PRD.md` holding `features`.
pub fn manifest_with(features: Vec<Feature>) -> Manifest {
    let mut manifest = Manifest::new("PRD.md", "Test project");
    manifest.features = features;
    manifest
}

/// One scripted attempt: output lines, then a terminal status.
#[derive(Debug, Clone)]
pub struct ScriptedAttempt {
    pub lines: Vec<String>,
    pub outcome: InstanceStatus,
    pub error: Option<String>,
}

impl ScriptedAttempt {
    pub fn completed() -> Self {
        Self::completed_after(Vec::new())
    }

    pub fn completed_after(lines: Vec<String>) -> Self {
        Self {
            lines,
            outcome: InstanceStatus::Completed,
            error: None,
        }
    }

    pub fn failed(error: &str) -> Self {
        Self::failed_after(Vec::new(), error)
    }

    pub fn failed_after(lines: Vec<String>, error: &str) -> Self {
        Self {
            lines,
            outcome: InstanceStatus::Failed,
            error: Some(error.to_string()),
        }
    }

    /// A stream-json tool result flagged as an error.
    pub fn tool_error_line() -> String {
        r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","is_error":true,"content":"command failed"}]}}"#
            .to_string()
    }

    /// A stream-json assistant text block.
    pub fn assistant_line(text: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }
}

/// Instance replaying a [`ScriptedAttempt`]; reports running for one poll.
#[derive(Debug)]
pub struct ScriptedInstance {
    lines: VecDeque<String>,
    polls_left: u32,
    outcome: InstanceStatus,
    error: Option<String>,
}

impl ExecutionInstance for ScriptedInstance {
    fn status(&mut self) -> InstanceStatus {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return InstanceStatus::Running;
        }
        self.outcome
    }

    fn error(&self) -> Option<String> {
        self.error.clone()
    }

    fn drain_output(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }
}

/// Executor handing out scripted attempts in order.
///
/// Starting an attempt after the script is exhausted fails, like a missing
/// agent binary would.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<ScriptedAttempt>>,
    requests: Mutex<Vec<StartRequest>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<ScriptedAttempt>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every start request received, in order.
    pub fn requests(&self) -> Vec<StartRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl Executor for ScriptedExecutor {
    type Instance = ScriptedInstance;

    fn start(&self, request: &StartRequest) -> Result<Self::Instance> {
        self.requests.lock().push(request.clone());
        let attempt = self
            .script
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor has no attempt for {}", request.feature_id))?;
        Ok(ScriptedInstance {
            lines: attempt.lines.into(),
            polls_left: 1,
            outcome: attempt.outcome,
            error: attempt.error,
        })
    }
}

/// Initialized project in a temporary directory.
pub struct TestProject {
    temp: TempDir,
    paths: ProjectPaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let paths = init_project(temp.path(), &InitOptions { force: false })?;
        Ok(Self { temp, paths })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Defaults with a 1ms poll interval.
    pub fn config(&self) -> AutopilotConfig {
        AutopilotConfig {
            poll_interval_ms: 1,
            ..AutopilotConfig::default()
        }
    }

    pub fn write_config(&self, config: &AutopilotConfig) -> Result<()> {
        write_config(&self.paths.config_path, config)
    }

    /// Save a manifest sourced from `PRD.md` holding `features`.
    pub fn write_manifest(&self, features: Vec<Feature>) -> Result<()> {
        ManifestStore::new(&self.paths.manifest_path).save(&mut manifest_with(features))
    }

    pub fn read_manifest(&self) -> Result<Manifest> {
        load_manifest(&self.paths.manifest_path)
    }

    /// Create a placeholder source document at `name`.
    pub fn write_source(&self, name: &str) -> Result<()> {
        let path = self.root().join(name);
        fs::write(&path, "# Product requirements\n")
            .with_context(|| format!("write {}", path.display()))
    }
}
