//! One attempt on one feature, shared by `run` and `supervise`.
//!
//! [`run_attempt`] drives the execution collaborator and the live tracker
//! until the attempt terminates. [`settle`] then turns the result into the
//! feature's next persisted state, consulting the retry strategy on failure.
//! The two decision engines never see each other's history; they meet only in
//! the timeline and in the tier written back at the attempt boundary.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use tracing::{debug, info, instrument, warn};

use crate::core::escalation::{EscalationConfig, TrackerRegistry};
use crate::core::feature::{Feature, Manifest};
use crate::core::retry::{
    AdjustmentRecord, AdjustmentRegistry, AdjustmentType, RetryContext, RetryDecision,
};
use crate::core::types::{FeatureStatus, ModelTier};
use crate::io::archive::archive_source;
use crate::io::executor::{AttemptReport, ExecutionInstance, Executor, InstanceStatus, StartRequest};
use crate::io::init::ProjectPaths;
use crate::io::timeline::{Timeline, TimelineEvent};

/// Everything an attempt needs besides the feature itself.
pub struct AttemptEnv<'a, E: Executor> {
    pub paths: &'a ProjectPaths,
    pub executor: &'a E,
    pub timeline: &'a Timeline,
    pub trackers: &'a TrackerRegistry,
    pub escalation: EscalationConfig,
    pub poll_interval: Duration,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub status: InstanceStatus,
    pub report: AttemptReport,
    /// Tier held by the live tracker when the attempt ended.
    pub tier: ModelTier,
}

fn attempt_prompt(feature: &Feature) -> String {
    let mut prompt = format!("Implement feature {}: {}\n", feature.id, feature.title);
    if !feature.dir.is_empty() {
        prompt.push_str(&format!("Feature notes: {}/FEATURE.md\n", feature.dir));
    }
    if feature.simplified {
        prompt.push_str(
            "Scope was reduced after repeated failures: deliver the smallest working subset.\n",
        );
    }
    prompt.push_str("List any remaining work as unchecked `- [ ]` items.\n");
    prompt
}

pub(crate) fn log_timeline(timeline: &Timeline, event: TimelineEvent) {
    if let Err(err) = timeline.append(event) {
        warn!(error = %format!("{err:#}"), "timeline append failed");
    }
}

/// Run one attempt to completion, polling at `env.poll_interval`.
///
/// A collaborator that fails to start yields a failed attempt rather than an
/// error, so the feature never stays stuck in `running`.
#[instrument(skip_all, fields(feature_id = %feature.id, model = %feature.model))]
pub fn run_attempt<E: Executor>(env: &AttemptEnv<'_, E>, feature: &Feature) -> AttemptResult {
    let tracker = env
        .trackers
        .start(&feature.id, feature.model, env.escalation.clone());
    let request = StartRequest {
        feature_id: feature.id.clone(),
        model: feature.model,
        prompt: attempt_prompt(feature),
        workdir: env.paths.root.clone(),
    };

    let mut instance = match env.executor.start(&request) {
        Ok(instance) => instance,
        Err(err) => {
            let error = format!("start agent: {err:#}");
            warn!(%error, "attempt could not start");
            env.trackers.remove(&feature.id);
            return AttemptResult {
                status: InstanceStatus::Failed,
                report: AttemptReport::from_error(Some(error)),
                tier: feature.model,
            };
        }
    };

    let observe = |instance: &mut E::Instance| {
        for line in instance.drain_output() {
            let switch = tracker.write().observe_line(&line);
            if let Some(switch) = switch {
                info!(from = %switch.from, to = %switch.to, reason = ?switch.reason, "live tier switch");
                log_timeline(
                    env.timeline,
                    TimelineEvent::ModelSwitch {
                        feature_id: feature.id.clone(),
                        switch,
                    },
                );
            }
        }
    };

    let status = loop {
        observe(&mut instance);
        let status = instance.status();
        if status.is_terminal() {
            break status;
        }
        thread::sleep(env.poll_interval);
    };
    observe(&mut instance);

    let report = match status {
        InstanceStatus::Completed => AttemptReport::default(),
        _ => instance.report(),
    };
    let tier = tracker.read().current();
    env.trackers.remove(&feature.id);
    debug!(?status, %tier, "attempt finished");
    AttemptResult {
        status,
        report,
        tier,
    }
}

/// The feature state an attempt leads to.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub status: FeatureStatus,
    pub model: ModelTier,
    pub simplify: bool,
    pub decision: Option<RetryDecision>,
    pub record: Option<AdjustmentRecord>,
}

impl Settlement {
    /// Write the settlement into the persisted feature.
    pub fn apply(&self, feature: &mut Feature) {
        feature.status = self.status;
        feature.model = self.model;
        if self.simplify {
            feature.simplified = true;
        }
    }
}

/// Decide the next state of `feature` after `result`.
///
/// The live tracker's tier is folded back first; a retry escalation then
/// starts from that tier. Applied adjustments are recorded in `registry`.
pub fn settle(
    feature: &Feature,
    result: &AttemptResult,
    registry: &AdjustmentRegistry,
) -> Settlement {
    if result.status == InstanceStatus::Completed {
        return Settlement {
            status: FeatureStatus::Completed,
            model: result.tier,
            simplify: false,
            decision: None,
            record: None,
        };
    }

    let report = &result.report;
    let ctx = RetryContext {
        feature_id: feature.id.clone(),
        attempt: feature.attempts,
        last_error: report.error.clone(),
        failed_checks: report.failed_checks,
        passed_checks: report.passed_checks,
        build_error: report.build_error,
        timed_out: report.timed_out,
        open_tasks: report.open_tasks,
        current_model: result.tier,
    };
    let decision = registry.decide(&ctx);
    let record = if decision.should_retry {
        registry.record(&ctx, &decision)
    } else {
        None
    };
    info!(
        feature_id = %feature.id,
        attempt = ctx.attempt,
        retry = decision.should_retry,
        adjustment = ?decision.adjustment,
        reason = %decision.reason,
        "retry decision"
    );

    Settlement {
        status: if decision.should_retry {
            FeatureStatus::Pending
        } else {
            FeatureStatus::Failed
        },
        model: decision.new_model.unwrap_or(result.tier),
        simplify: record
            .as_ref()
            .is_some_and(|record| record.kind == AdjustmentType::TaskSimplify),
        decision: Some(decision),
        record,
    }
}

/// Timeline entries for a settled attempt.
pub fn log_settlement(timeline: &Timeline, feature_id: &str, settlement: &Settlement) {
    if let Some(record) = &settlement.record {
        log_timeline(
            timeline,
            TimelineEvent::Adjustment {
                feature_id: feature_id.to_string(),
                record: record.clone(),
            },
        );
    }
    let ended = if settlement.status == FeatureStatus::Completed {
        FeatureStatus::Completed
    } else {
        FeatureStatus::Failed
    };
    log_timeline(
        timeline,
        TimelineEvent::StatusChanged {
            feature_id: feature_id.to_string(),
            from: FeatureStatus::Running,
            to: ended,
            detail: String::new(),
        },
    );
    if settlement.status == FeatureStatus::Pending {
        let detail = settlement
            .decision
            .as_ref()
            .map(|decision| format!("retry: {}", decision.reason))
            .unwrap_or_default();
        log_timeline(
            timeline,
            TimelineEvent::StatusChanged {
                feature_id: feature_id.to_string(),
                from: FeatureStatus::Failed,
                to: FeatureStatus::Pending,
                detail,
            },
        );
    }
}

/// Timeline entry for the pending -> running transition.
pub fn log_started(timeline: &Timeline, feature: &Feature) {
    log_timeline(
        timeline,
        TimelineEvent::StatusChanged {
            feature_id: feature.id.clone(),
            from: FeatureStatus::Pending,
            to: FeatureStatus::Running,
            detail: format!("attempt {} on {}", feature.attempts, feature.model),
        },
    );
}

/// Archive the source document once every feature is completed.
pub fn archive_if_complete(
    paths: &ProjectPaths,
    timeline: &Timeline,
    manifest: &Manifest,
) -> Result<Option<PathBuf>> {
    if !manifest.all_completed() {
        return Ok(None);
    }
    let source = paths.resolve(&manifest.source);
    let archived = archive_source(&source)?;
    if let Some(target) = &archived {
        info!(source = %source.display(), target = %target.display(), "source archived");
        log_timeline(
            timeline,
            TimelineEvent::Archived {
                source: source.display().to_string(),
                target: target.display().to_string(),
            },
        );
    }
    Ok(archived)
}
