//! Live escalation tracker.
//!
//! Watches the output stream of one in-flight attempt and moves the feature's
//! tier mid-run. This engine is independent of the post-failure retry
//! strategy: it has its own triggers and its own switch log.
//!
//! De-escalation is gated by a sticky `ever_errored` flag rather than by the
//! resettable error counter. Once a tool error has been observed, no later
//! de-escalation happens for the lifetime of the tracker, even after the
//! counter was reset by an escalation.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::ModelTier;

static EXPLICIT_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:needs?|requires?|switch(?:ing)?\s+to)\s+(?:the\s+)?(haiku|sonnet|opus|lowest|mid|top)\b",
    )
    .expect("explicit request regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub enabled: bool,
    /// Tool errors needed to escalate one rung.
    pub error_threshold: u32,
    pub escalate_keywords: Vec<String>,
    pub deescalate_keywords: Vec<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold: 3,
            escalate_keywords: [
                "architecture",
                "architectural",
                "refactor",
                "trade-off",
                "tradeoff",
                "schema migration",
                "design pattern",
            ]
            .map(String::from)
            .to_vec(),
            deescalate_keywords: ["run the tests", "formatting", "format", "lint", "typo"]
                .map(String::from)
                .to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    Initial,
    ErrorThreshold,
    ExplicitRequest,
    ArchitecturalPattern,
    Deescalate,
    ConfiguredByUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSwitch {
    pub timestamp: DateTime<Utc>,
    pub from: ModelTier,
    pub to: ModelTier,
    pub reason: SwitchReason,
    #[serde(default)]
    pub detail: String,
}

/// What one stream line means to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Signal {
    ToolError,
    AssistantText(String),
    Ignored,
}

fn classify_line(line: &str) -> Signal {
    let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
        return Signal::Ignored;
    };
    let blocks = value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    match value.get("type").and_then(Value::as_str) {
        Some("user") => {
            let errored = blocks.iter().any(|block| {
                block.get("type").and_then(Value::as_str) == Some("tool_result")
                    && block.get("is_error").and_then(Value::as_bool) == Some(true)
            });
            if errored {
                Signal::ToolError
            } else {
                Signal::Ignored
            }
        }
        Some("assistant") => {
            let text: Vec<&str> = blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                Signal::Ignored
            } else {
                Signal::AssistantText(text.join("\n"))
            }
        }
        _ => Signal::Ignored,
    }
}

/// Case-insensitive whole-word matcher over a keyword list.
#[derive(Debug, Clone)]
struct KeywordSet {
    pattern: Option<Regex>,
}

impl KeywordSet {
    fn new(keywords: &[String]) -> Self {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|keyword| keyword.trim())
            .filter(|keyword| !keyword.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Self { pattern: None };
        }
        let pattern = match Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                warn!(error = %err, "ignoring unusable keyword list");
                None
            }
        };
        Self { pattern }
    }

    fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.pattern
            .as_ref()
            .and_then(|pattern| pattern.find(text))
            .map(|found| found.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct EscalationTracker {
    feature_id: String,
    config: EscalationConfig,
    current: ModelTier,
    error_count: u32,
    ever_errored: bool,
    switches: Vec<ModelSwitch>,
    escalate: KeywordSet,
    deescalate: KeywordSet,
}

impl EscalationTracker {
    /// Start tracking at `initial`; the log opens with an `initial` entry.
    pub fn new(feature_id: impl Into<String>, initial: ModelTier, config: EscalationConfig) -> Self {
        let escalate = KeywordSet::new(&config.escalate_keywords);
        let deescalate = KeywordSet::new(&config.deescalate_keywords);
        Self {
            feature_id: feature_id.into(),
            config,
            current: initial,
            error_count: 0,
            ever_errored: false,
            switches: vec![ModelSwitch {
                timestamp: Utc::now(),
                from: initial,
                to: initial,
                reason: SwitchReason::Initial,
                detail: String::new(),
            }],
            escalate,
            deescalate,
        }
    }

    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    pub fn current(&self) -> ModelTier {
        self.current
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn ever_errored(&self) -> bool {
        self.ever_errored
    }

    pub fn switches(&self) -> &[ModelSwitch] {
        &self.switches
    }

    /// Feed one output line; returns the switch it caused, if any.
    pub fn observe_line(&mut self, line: &str) -> Option<ModelSwitch> {
        if !self.config.enabled {
            return None;
        }
        match classify_line(line) {
            Signal::Ignored => None,
            Signal::ToolError => self.on_tool_error(),
            Signal::AssistantText(text) => self.on_assistant_text(&text),
        }
    }

    fn on_tool_error(&mut self) -> Option<ModelSwitch> {
        self.error_count += 1;
        self.ever_errored = true;
        debug!(
            feature_id = %self.feature_id,
            errors = self.error_count,
            threshold = self.config.error_threshold,
            "tool error observed"
        );
        if self.error_count < self.config.error_threshold {
            return None;
        }
        self.error_count = 0;
        let target = self.current.escalated();
        let detail = format!("{} tool errors", self.config.error_threshold);
        self.switch_to(target, SwitchReason::ErrorThreshold, detail)
    }

    fn on_assistant_text(&mut self, text: &str) -> Option<ModelSwitch> {
        let requested = EXPLICIT_REQUEST
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|name| ModelTier::from_name(name.as_str()).map(|tier| (tier, name.as_str())));
        if let Some((tier, name)) = requested {
            let detail = format!("assistant requested {name}");
            if tier >= self.current {
                return self.switch_to(tier, SwitchReason::ExplicitRequest, detail);
            }
            // Downward requests obey the de-escalation rules.
            if !self.may_deescalate() {
                return None;
            }
            let target = self.current.deescalated();
            return self.switch_to(target, SwitchReason::ExplicitRequest, detail);
        }

        if let Some(keyword) = self.escalate.find(text) {
            let detail = format!("matched '{keyword}'");
            let target = self.current.escalated();
            return self.switch_to(target, SwitchReason::ArchitecturalPattern, detail);
        }

        if let Some(keyword) = self.deescalate.find(text) {
            if !self.may_deescalate() {
                return None;
            }
            let detail = format!("matched '{keyword}'");
            let target = self.current.deescalated();
            return self.switch_to(target, SwitchReason::Deescalate, detail);
        }
        None
    }

    /// One rung down is allowed only above the lowest rung and before any error.
    fn may_deescalate(&self) -> bool {
        if self.current.is_lowest() || self.ever_errored || self.error_count > 0 {
            debug!(feature_id = %self.feature_id, tier = %self.current, "de-escalation suppressed");
            return false;
        }
        true
    }

    /// Manual override; bypasses every heuristic and the enabled flag.
    pub fn override_tier(&mut self, tier: ModelTier) -> Option<ModelSwitch> {
        self.switch_to(tier, SwitchReason::ConfiguredByUser, "manual override".to_string())
    }

    fn switch_to(
        &mut self,
        target: ModelTier,
        reason: SwitchReason,
        detail: String,
    ) -> Option<ModelSwitch> {
        if target == self.current {
            return None;
        }
        let switch = ModelSwitch {
            timestamp: Utc::now(),
            from: self.current,
            to: target,
            reason,
            detail,
        };
        debug!(
            feature_id = %self.feature_id,
            from = %switch.from,
            to = %switch.to,
            reason = ?switch.reason,
            "tier switch"
        );
        self.current = target;
        self.switches.push(switch.clone());
        Some(switch)
    }
}

/// Per-feature trackers behind individual read/write locks.
///
/// The outer lock only guards the map; a tracker update never blocks reads of
/// another feature's tracker.
#[derive(Debug, Default)]
pub struct TrackerRegistry {
    trackers: RwLock<HashMap<String, Arc<RwLock<EscalationTracker>>>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) tracking a feature.
    pub fn start(
        &self,
        feature_id: &str,
        initial: ModelTier,
        config: EscalationConfig,
    ) -> Arc<RwLock<EscalationTracker>> {
        let tracker = Arc::new(RwLock::new(EscalationTracker::new(
            feature_id, initial, config,
        )));
        self.trackers
            .write()
            .insert(feature_id.to_string(), Arc::clone(&tracker));
        tracker
    }

    pub fn get(&self, feature_id: &str) -> Option<Arc<RwLock<EscalationTracker>>> {
        self.trackers.read().get(feature_id).cloned()
    }

    pub fn current_tier(&self, feature_id: &str) -> Option<ModelTier> {
        self.get(feature_id).map(|tracker| tracker.read().current())
    }

    pub fn remove(&self, feature_id: &str) -> Option<Arc<RwLock<EscalationTracker>>> {
        self.trackers.write().remove(feature_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOL_ERROR: &str = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","is_error":true,"content":"boom"}]}}"#;
    const TOOL_OK: &str = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t2","content":"ok"}]}}"#;

    fn say(text: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    fn config(threshold: u32) -> EscalationConfig {
        EscalationConfig {
            error_threshold: threshold,
            ..EscalationConfig::default()
        }
    }

    #[test]
    fn error_threshold_escalates_and_resets_counter() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Haiku, config(2));

        assert_eq!(tracker.observe_line(TOOL_ERROR), None);
        assert_eq!(tracker.error_count(), 1);

        let switch = tracker.observe_line(TOOL_ERROR).expect("switch");
        assert_eq!(switch.from, ModelTier::Haiku);
        assert_eq!(switch.to, ModelTier::Sonnet);
        assert_eq!(switch.reason, SwitchReason::ErrorThreshold);
        assert_eq!(tracker.current(), ModelTier::Sonnet);
        assert_eq!(tracker.error_count(), 0);
        assert_eq!(tracker.switches().len(), 2);
        assert_eq!(tracker.switches()[0].reason, SwitchReason::Initial);
    }

    #[test]
    fn successful_tool_results_do_not_count() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Haiku, config(1));
        assert_eq!(tracker.observe_line(TOOL_OK), None);
        assert_eq!(tracker.error_count(), 0);
    }

    #[test]
    fn unparsable_and_disabled_lines_change_nothing() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Sonnet, config(1));
        assert_eq!(tracker.observe_line("not json at all"), None);
        assert_eq!(tracker.observe_line(r#"{"type":"system"}"#), None);

        let disabled = EscalationConfig {
            enabled: false,
            ..config(1)
        };
        let mut tracker = EscalationTracker::new("01", ModelTier::Sonnet, disabled);
        assert_eq!(tracker.observe_line(TOOL_ERROR), None);
        assert_eq!(tracker.error_count(), 0);
        assert_eq!(tracker.current(), ModelTier::Sonnet);
    }

    #[test]
    fn explicit_request_switches_directly() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Haiku, config(3));
        let switch = tracker
            .observe_line(&say("This change needs opus to get right."))
            .expect("switch");
        assert_eq!(switch.to, ModelTier::Opus);
        assert_eq!(switch.reason, SwitchReason::ExplicitRequest);
    }

    #[test]
    fn downward_request_steps_one_rung_and_respects_errors() {
        let mut clean = EscalationTracker::new("01", ModelTier::Opus, config(3));
        let switch = clean
            .observe_line(&say("This only needs haiku now."))
            .expect("switch");
        assert_eq!(switch.to, ModelTier::Sonnet);
        assert_eq!(switch.reason, SwitchReason::ExplicitRequest);

        let mut errored = EscalationTracker::new("02", ModelTier::Opus, config(3));
        errored.observe_line(TOOL_ERROR);
        assert_eq!(errored.observe_line(&say("This only needs haiku now.")), None);
        assert_eq!(errored.current(), ModelTier::Opus);
    }

    #[test]
    fn architectural_vocabulary_escalates_one_rung() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Haiku, config(3));
        let switch = tracker
            .observe_line(&say("We should Refactor the storage layer first."))
            .expect("switch");
        assert_eq!(switch.to, ModelTier::Sonnet);
        assert_eq!(switch.reason, SwitchReason::ArchitecturalPattern);
    }

    #[test]
    fn escalation_at_top_rung_is_a_no_op() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Opus, config(1));
        assert_eq!(tracker.observe_line(TOOL_ERROR), None);
        assert_eq!(tracker.current(), ModelTier::Opus);
        assert_eq!(tracker.error_count(), 0);
    }

    #[test]
    fn simple_task_vocabulary_deescalates_when_clean() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Opus, config(3));
        let switch = tracker
            .observe_line(&say("Now I just need to fix a typo."))
            .expect("switch");
        assert_eq!(switch.to, ModelTier::Sonnet);
        assert_eq!(switch.reason, SwitchReason::Deescalate);

        let mut lowest = EscalationTracker::new("02", ModelTier::Haiku, config(3));
        assert_eq!(lowest.observe_line(&say("fix a typo")), None);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Sonnet, config(3));
        assert_eq!(
            tracker.observe_line(&say("Gathering information about the module.")),
            None
        );
    }

    /// De-escalation stays off after any error, even once the counter reset.
    #[test]
    fn deescalation_never_fires_after_an_error() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Sonnet, config(2));
        tracker.observe_line(TOOL_ERROR);
        assert_eq!(tracker.observe_line(&say("run the tests")), None);

        tracker.observe_line(TOOL_ERROR);
        assert_eq!(tracker.current(), ModelTier::Opus);
        assert_eq!(tracker.error_count(), 0);
        assert!(tracker.ever_errored());
        assert_eq!(tracker.observe_line(&say("only formatting left")), None);
        assert_eq!(tracker.current(), ModelTier::Opus);
    }

    #[test]
    fn override_records_user_switch_unless_unchanged() {
        let mut tracker = EscalationTracker::new("01", ModelTier::Sonnet, config(3));
        assert_eq!(tracker.override_tier(ModelTier::Sonnet), None);
        let switch = tracker.override_tier(ModelTier::Haiku).expect("switch");
        assert_eq!(switch.reason, SwitchReason::ConfiguredByUser);
        assert_eq!(tracker.current(), ModelTier::Haiku);
    }

    #[test]
    fn registry_keeps_trackers_per_feature() {
        let registry = TrackerRegistry::new();
        let first = registry.start("01", ModelTier::Haiku, config(1));
        registry.start("02", ModelTier::Opus, config(1));

        first.write().observe_line(TOOL_ERROR);
        assert_eq!(registry.current_tier("01"), Some(ModelTier::Sonnet));
        assert_eq!(registry.current_tier("02"), Some(ModelTier::Opus));
        assert!(registry.remove("01").is_some());
        assert_eq!(registry.current_tier("01"), None);
    }
}
