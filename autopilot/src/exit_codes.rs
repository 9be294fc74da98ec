//! Stable exit codes for autopilot CLI commands.

/// Command succeeded, or `autopilot run` found no work or completed a feature.
pub const OK: i32 = 0;
/// Command failed, or the attempt made by `autopilot run`/`supervise` failed.
pub const FAILURE: i32 = 1;
