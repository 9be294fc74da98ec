//! Dependency token resolution, pruning and validation.
//!
//! Authors reference dependencies with `Depends: 1, 3, Login page` lines. A token
//! is either an ordinal (normalized to the 2-digit root id form) or a
//! case-insensitive exact title. Tokens that resolve to nothing are pruned with
//! a warning before cycle detection runs.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::error::SchedulerError;
use crate::core::feature::Feature;
use crate::core::graph::DependencyGraph;

static DEPENDS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*depends[ \t]*:[ \t]*(.*?)[ \t]*$").expect("depends regex is valid")
});

/// Extract dependency tokens from every `Depends:` line in `text`.
pub fn parse_depends(text: &str) -> Vec<String> {
    DEPENDS_LINE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .flat_map(|list| list.as_str().split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Format a root ordinal as a canonical 2-digit id.
pub fn ordinal_id(ordinal: usize) -> String {
    format!("{ordinal:02}")
}

/// Resolve one dependency token against `features`.
///
/// Resolution order: exact id, bare ordinal (normalized to 2 digits, falling back
/// to the literal token when no such id exists), case-insensitive exact title.
/// Unresolved tokens are returned unchanged so they can be pruned later.
pub fn resolve_token(token: &str, features: &[Feature]) -> String {
    let token = token.trim();
    if features.iter().any(|feature| feature.id == token) {
        return token.to_string();
    }

    if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(ordinal) = token.parse::<usize>() {
            let id = ordinal_id(ordinal);
            if features.iter().any(|feature| feature.id == id) {
                return id;
            }
        }
        return token.to_string();
    }

    let lowered = token.to_lowercase();
    features
        .iter()
        .find(|feature| feature.title.to_lowercase() == lowered)
        .map(|feature| feature.id.clone())
        .unwrap_or_else(|| token.to_string())
}

/// Rewrite every feature's dependency tokens into canonical ids (where possible).
///
/// Duplicate references collapse to the first occurrence.
pub fn resolve_dependencies(features: &mut [Feature]) {
    let resolved: Vec<Vec<String>> = features
        .iter()
        .map(|feature| {
            feature
                .depends_on
                .iter()
                .map(|token| resolve_token(token, features))
                .fold(Vec::new(), |mut deps: Vec<String>, dep| {
                    if !deps.contains(&dep) {
                        deps.push(dep);
                    }
                    deps
                })
        })
        .collect();
    for (feature, deps) in features.iter_mut().zip(resolved) {
        feature.depends_on = deps;
    }
}

/// Drop dependency references that name no known feature.
///
/// Returns one human-readable warning per dropped reference, in feature order.
pub fn prune_unresolved(features: &mut [Feature]) -> Vec<String> {
    let known: HashSet<String> = features.iter().map(|f| f.id.clone()).collect();
    let mut warnings = Vec::new();
    for feature in features.iter_mut() {
        let id = feature.id.clone();
        feature.depends_on.retain(|dep| {
            if known.contains(dep) {
                return true;
            }
            warnings.push(format!(
                "feature '{id}' depends on unknown feature '{dep}'; dependency dropped"
            ));
            false
        });
    }
    warnings
}

/// Outcome of dependency validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Non-fatal reference warnings (dropped dependencies).
    pub warnings: Vec<String>,
    /// Fatal cycle, if any, as returned by [`DependencyGraph::detect_cycle`].
    pub cycle: Option<Vec<String>>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.cycle.is_none()
    }

    /// Convert into a result, keeping warnings on success.
    pub fn into_result(self) -> Result<Vec<String>, SchedulerError> {
        match self.cycle {
            Some(cycle) => Err(SchedulerError::Cycle { cycle }),
            None => Ok(self.warnings),
        }
    }
}

/// Resolve, prune, then check the cleaned graph for cycles.
///
/// Pruning must precede cycle detection: a dangling edge is not a cycle risk.
pub fn validate_dependencies(features: &mut [Feature]) -> ValidationReport {
    resolve_dependencies(features);
    let warnings = prune_unresolved(features);
    let cycle = DependencyGraph::from_features(features).detect_cycle();
    ValidationReport { warnings, cycle }
}
