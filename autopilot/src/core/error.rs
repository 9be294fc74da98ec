//! Typed failures raised by the scheduler core.

use thiserror::Error;

/// Hard errors from graph validation and tree mutation.
///
/// Dangling dependency references are not errors; they are reported as
/// warnings by [`crate::core::resolve::validate_dependencies`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The dependency relation contains a directed cycle.
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("feature '{id}' not found")]
    NotFound { id: String },

    #[error("cannot spawn under '{parent_id}': depth {depth} exceeds max_depth {max_depth}")]
    DepthExceeded {
        parent_id: String,
        depth: u32,
        max_depth: u32,
    },
}

impl SchedulerError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}
