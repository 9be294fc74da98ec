//! Post-failure retry strategy.
//!
//! [`decide_retry`] is a pure function of the configuration, the feature's
//! adjustment history and the failed attempt's context. It never mutates the
//! history; callers record applied adjustments through
//! [`AdjustmentRegistry::record`], and that log is the source of truth for
//! "already escalated" and "already simplified".

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::ModelTier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts allowed per feature; the attempt that reaches this stops retrying.
    pub max_retries: u32,
    /// Adjustments allowed per feature.
    pub max_adjustments: u32,
    pub enable_model_escalation: bool,
    pub enable_task_simplify: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_adjustments: 3,
            enable_model_escalation: true,
            enable_task_simplify: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    None,
    ModelEscalation,
    TaskSimplify,
    ContextExpand,
    PromptRefine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    RepeatedFailures,
    TestFailures,
    CompilationErrors,
    Timeout,
    ComplexTask,
    MaxAttemptsReached,
}

impl AdjustmentReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RepeatedFailures => "repeated_failures",
            Self::TestFailures => "test_failures",
            Self::CompilationErrors => "compilation_errors",
            Self::Timeout => "timeout",
            Self::ComplexTask => "complex_task",
            Self::MaxAttemptsReached => "max_attempts_reached",
        }
    }
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AdjustmentType,
    pub reason: AdjustmentReason,
    pub from: String,
    pub to: String,
    pub attempt: u32,
    #[serde(default)]
    pub detail: String,
}

/// Append-only adjustment log of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentHistory {
    pub feature_id: String,
    #[serde(default)]
    pub records: Vec<AdjustmentRecord>,
    pub current_model: ModelTier,
    pub original_model: ModelTier,
    #[serde(default)]
    pub simplified: bool,
}

impl AdjustmentHistory {
    pub fn new(feature_id: impl Into<String>, model: ModelTier) -> Self {
        Self {
            feature_id: feature_id.into(),
            records: Vec::new(),
            current_model: model,
            original_model: model,
            simplified: false,
        }
    }

    /// Applied adjustments; `none` entries do not count.
    pub fn adjustment_count(&self) -> u32 {
        let count = self
            .records
            .iter()
            .filter(|record| record.kind != AdjustmentType::None)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn has_escalated(&self) -> bool {
        self.records
            .iter()
            .any(|record| record.kind == AdjustmentType::ModelEscalation)
    }

    pub fn has_simplified(&self) -> bool {
        self.simplified
            || self
                .records
                .iter()
                .any(|record| record.kind == AdjustmentType::TaskSimplify)
    }

    fn append(&mut self, record: AdjustmentRecord) {
        match record.kind {
            AdjustmentType::ModelEscalation => {
                if let Some(tier) = ModelTier::from_name(&record.to) {
                    self.current_model = tier;
                }
            }
            AdjustmentType::TaskSimplify => self.simplified = true,
            AdjustmentType::None | AdjustmentType::ContextExpand | AdjustmentType::PromptRefine => {}
        }
        self.records.push(record);
    }
}

/// Facts about the attempt that just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub feature_id: String,
    /// 1-based number of the failed attempt.
    pub attempt: u32,
    pub last_error: Option<String>,
    pub failed_checks: u32,
    pub passed_checks: u32,
    pub build_error: bool,
    pub timed_out: bool,
    pub open_tasks: u32,
    pub current_model: ModelTier,
}

impl RetryContext {
    pub fn new(feature_id: impl Into<String>, attempt: u32, current_model: ModelTier) -> Self {
        Self {
            feature_id: feature_id.into(),
            attempt,
            last_error: None,
            failed_checks: 0,
            passed_checks: 0,
            build_error: false,
            timed_out: false,
            open_tasks: 0,
            current_model,
        }
    }

    fn failure_reason(&self) -> AdjustmentReason {
        if self.build_error {
            AdjustmentReason::CompilationErrors
        } else if self.failed_checks > 0 {
            AdjustmentReason::TestFailures
        } else if self.timed_out {
            AdjustmentReason::Timeout
        } else {
            AdjustmentReason::RepeatedFailures
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub should_adjust: bool,
    pub adjustment: AdjustmentType,
    pub reason: AdjustmentReason,
    pub from: String,
    pub to: String,
    /// Tier to run the next attempt on, when the adjustment changes it.
    pub new_model: Option<ModelTier>,
    pub remaining_retries: u32,
    pub remaining_adjustments: u32,
    pub detail: String,
}

impl RetryDecision {
    fn plain(retry: bool, reason: AdjustmentReason, retries: u32, adjustments: u32) -> Self {
        Self {
            should_retry: retry,
            should_adjust: false,
            adjustment: AdjustmentType::None,
            reason,
            from: String::new(),
            to: String::new(),
            new_model: None,
            remaining_retries: retries,
            remaining_adjustments: adjustments,
            detail: String::new(),
        }
    }

    /// The log entry for this decision, if it applies an adjustment.
    pub fn to_record(&self, attempt: u32) -> Option<AdjustmentRecord> {
        if !self.should_adjust {
            return None;
        }
        Some(AdjustmentRecord {
            timestamp: Utc::now(),
            kind: self.adjustment,
            reason: self.reason,
            from: self.from.clone(),
            to: self.to.clone(),
            attempt,
            detail: self.detail.clone(),
        })
    }
}

/// Decide what to do after a failed attempt.
pub fn decide_retry(
    config: &RetryConfig,
    history: Option<&AdjustmentHistory>,
    ctx: &RetryContext,
) -> RetryDecision {
    if ctx.attempt >= config.max_retries {
        let mut decision = RetryDecision::plain(false, AdjustmentReason::MaxAttemptsReached, 0, 0);
        decision.detail = format!("attempt {} of {}", ctx.attempt, config.max_retries);
        return decision;
    }

    let remaining_retries = config.max_retries - ctx.attempt;
    let used = history.map(AdjustmentHistory::adjustment_count).unwrap_or(0);
    let remaining_adjustments = config.max_adjustments.saturating_sub(used);
    if remaining_adjustments == 0 {
        return RetryDecision::plain(
            true,
            AdjustmentReason::RepeatedFailures,
            remaining_retries,
            0,
        );
    }

    let escalated = history.is_some_and(AdjustmentHistory::has_escalated);
    let simplified = history.is_some_and(AdjustmentHistory::has_simplified);
    let tier = ctx.current_model;

    let escalate = config.enable_model_escalation
        && !tier.is_top()
        && ((ctx.build_error && tier.is_lowest())
            || (ctx.failed_checks > 0 && ctx.attempt >= 2)
            || (!escalated && ctx.attempt >= 2));
    if escalate {
        let target = tier.escalated();
        let reason = ctx.failure_reason();
        debug!(feature_id = %ctx.feature_id, from = %tier, to = %target, %reason, "retry escalates tier");
        return RetryDecision {
            should_retry: true,
            should_adjust: true,
            adjustment: AdjustmentType::ModelEscalation,
            reason,
            from: tier.to_string(),
            to: target.to_string(),
            new_model: Some(target),
            remaining_retries,
            remaining_adjustments: remaining_adjustments - 1,
            detail: format!("escalating {tier} -> {target} after attempt {}", ctx.attempt),
        };
    }

    let simplify = config.enable_task_simplify
        && ctx.open_tasks > 2
        && !simplified
        && escalated
        && ctx.attempt >= 3;
    if simplify {
        debug!(feature_id = %ctx.feature_id, open_tasks = ctx.open_tasks, "retry simplifies scope");
        return RetryDecision {
            should_retry: true,
            should_adjust: true,
            adjustment: AdjustmentType::TaskSimplify,
            reason: AdjustmentReason::ComplexTask,
            from: format!("{} open tasks", ctx.open_tasks),
            to: "reduced scope".to_string(),
            new_model: None,
            remaining_retries,
            remaining_adjustments: remaining_adjustments - 1,
            detail: format!("{} tasks still open after escalation", ctx.open_tasks),
        };
    }

    debug!(feature_id = %ctx.feature_id, attempt = ctx.attempt, "retry without adjustment");
    RetryDecision::plain(
        true,
        AdjustmentReason::RepeatedFailures,
        remaining_retries,
        remaining_adjustments,
    )
}

/// Per-feature adjustment histories, passed by handle to callers.
#[derive(Debug, Default)]
pub struct AdjustmentRegistry {
    config: RetryConfig,
    histories: RwLock<HashMap<String, Arc<RwLock<AdjustmentHistory>>>>,
}

impl AdjustmentRegistry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild a registry from persisted histories.
    pub fn restore(config: RetryConfig, histories: BTreeMap<String, AdjustmentHistory>) -> Self {
        let histories = histories
            .into_iter()
            .map(|(id, history)| (id, Arc::new(RwLock::new(history))))
            .collect();
        Self {
            config,
            histories: RwLock::new(histories),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn handle(&self, feature_id: &str) -> Option<Arc<RwLock<AdjustmentHistory>>> {
        self.histories.read().get(feature_id).cloned()
    }

    pub fn history(&self, feature_id: &str) -> Option<AdjustmentHistory> {
        self.handle(feature_id).map(|history| history.read().clone())
    }

    /// Decide without touching the history.
    pub fn decide(&self, ctx: &RetryContext) -> RetryDecision {
        match self.handle(&ctx.feature_id) {
            Some(history) => decide_retry(&self.config, Some(&*history.read()), ctx),
            None => decide_retry(&self.config, None, ctx),
        }
    }

    /// Append the adjustment a decision applied; returns the stored record.
    pub fn record(&self, ctx: &RetryContext, decision: &RetryDecision) -> Option<AdjustmentRecord> {
        let record = decision.to_record(ctx.attempt)?;
        let history = {
            let mut histories = self.histories.write();
            Arc::clone(histories.entry(ctx.feature_id.clone()).or_insert_with(|| {
                Arc::new(RwLock::new(AdjustmentHistory::new(
                    ctx.feature_id.clone(),
                    ctx.current_model,
                )))
            }))
        };
        history.write().append(record.clone());
        Some(record)
    }

    /// Copy of every history, keyed by feature id.
    pub fn snapshot(&self) -> BTreeMap<String, AdjustmentHistory> {
        let handles: Vec<(String, Arc<RwLock<AdjustmentHistory>>)> = self
            .histories
            .read()
            .iter()
            .map(|(id, history)| (id.clone(), Arc::clone(history)))
            .collect();
        handles
            .into_iter()
            .map(|(id, history)| (id, history.read().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: &str, attempt: u32, tier: ModelTier) -> RetryContext {
        RetryContext::new(id, attempt, tier)
    }

    #[test]
    fn first_failure_retries_without_adjustment() {
        let registry = AdjustmentRegistry::new(RetryConfig::default());
        let decision = registry.decide(&failure("01", 1, ModelTier::Haiku));
        assert!(decision.should_retry);
        assert!(!decision.should_adjust);
        assert_eq!(decision.reason, AdjustmentReason::RepeatedFailures);
        assert_eq!(decision.remaining_retries, 4);
    }

    #[test]
    fn escalates_then_simplifies_across_failures() {
        let registry = AdjustmentRegistry::new(RetryConfig::default());

        let mut second = failure("01", 2, ModelTier::Haiku);
        second.build_error = true;
        let decision = registry.decide(&second);
        assert_eq!(decision.adjustment, AdjustmentType::ModelEscalation);
        assert_eq!(decision.reason, AdjustmentReason::CompilationErrors);
        assert_eq!(decision.new_model, Some(ModelTier::Sonnet));
        registry.record(&second, &decision).expect("recorded");

        let mut third = failure("01", 3, ModelTier::Sonnet);
        third.open_tasks = 5;
        let decision = registry.decide(&third);
        assert!(decision.should_retry);
        assert_eq!(decision.adjustment, AdjustmentType::TaskSimplify);
        assert_eq!(decision.reason, AdjustmentReason::ComplexTask);
        registry.record(&third, &decision).expect("recorded");

        let history = registry.history("01").expect("history");
        assert_eq!(history.adjustment_count(), 2);
        assert_eq!(history.original_model, ModelTier::Haiku);
        assert_eq!(history.current_model, ModelTier::Sonnet);
        assert!(history.simplified);
    }

    #[test]
    fn stops_at_max_retries() {
        let registry = AdjustmentRegistry::new(RetryConfig::default());
        let decision = registry.decide(&failure("01", 5, ModelTier::Sonnet));
        assert!(!decision.should_retry);
        assert!(!decision.should_adjust);
        assert_eq!(decision.reason, AdjustmentReason::MaxAttemptsReached);
    }

    #[test]
    fn escalation_reason_prefers_checks_over_timeout() {
        let config = RetryConfig::default();
        let mut ctx = failure("01", 2, ModelTier::Sonnet);
        ctx.failed_checks = 3;
        ctx.timed_out = true;
        let decision = decide_retry(&config, None, &ctx);
        assert_eq!(decision.reason, AdjustmentReason::TestFailures);
        assert_eq!(decision.new_model, Some(ModelTier::Opus));

        ctx.failed_checks = 0;
        let decision = decide_retry(&config, None, &ctx);
        assert_eq!(decision.reason, AdjustmentReason::Timeout);
    }

    #[test]
    fn top_tier_never_escalates() {
        let mut ctx = failure("01", 2, ModelTier::Opus);
        ctx.failed_checks = 1;
        let decision = decide_retry(&RetryConfig::default(), None, &ctx);
        assert!(decision.should_retry);
        assert_eq!(decision.adjustment, AdjustmentType::None);
    }

    #[test]
    fn disabled_escalation_falls_through() {
        let config = RetryConfig {
            enable_model_escalation: false,
            ..RetryConfig::default()
        };
        let mut ctx = failure("01", 2, ModelTier::Haiku);
        ctx.build_error = true;
        let decision = decide_retry(&config, None, &ctx);
        assert_eq!(decision.adjustment, AdjustmentType::None);
    }

    #[test]
    fn decide_does_not_mutate_history() {
        let registry = AdjustmentRegistry::new(RetryConfig::default());
        let mut ctx = failure("01", 2, ModelTier::Haiku);
        ctx.build_error = true;
        let first = registry.decide(&ctx);
        let second = registry.decide(&ctx);
        assert_eq!(first, second);
        assert!(registry.history("01").is_none());
    }

    /// Once the cap is reached no further adjustment is proposed.
    #[test]
    fn adjustment_cap_is_never_exceeded() {
        let config = RetryConfig {
            max_retries: 50,
            max_adjustments: 2,
            ..RetryConfig::default()
        };
        let registry = AdjustmentRegistry::new(config);
        let mut tier = ModelTier::Haiku;
        let mut adjusted = 0;
        for attempt in 1..50 {
            let mut ctx = failure("01", attempt, tier);
            ctx.build_error = true;
            ctx.failed_checks = 1;
            ctx.open_tasks = 6;
            let decision = registry.decide(&ctx);
            if decision.should_adjust {
                adjusted += 1;
                assert!(adjusted <= 2, "adjusted on attempt {attempt}");
                if let Some(next) = decision.new_model {
                    tier = next;
                }
                registry.record(&ctx, &decision);
            }
        }
        assert_eq!(adjusted, 2);
        assert_eq!(registry.history("01").expect("history").adjustment_count(), 2);
    }

    #[test]
    fn snapshot_restores_histories() {
        let registry = AdjustmentRegistry::new(RetryConfig::default());
        let mut ctx = failure("02", 2, ModelTier::Haiku);
        ctx.build_error = true;
        let decision = registry.decide(&ctx);
        registry.record(&ctx, &decision);

        let json = serde_json::to_string(&registry.snapshot()).expect("serialize");
        let restored = AdjustmentRegistry::restore(
            RetryConfig::default(),
            serde_json::from_str(&json).expect("parse"),
        );
        assert_eq!(restored.history("02"), registry.history("02"));
        assert!(json.contains("\"type\":\"model_escalation\""));
    }
}
