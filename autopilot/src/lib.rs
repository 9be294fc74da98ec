//! Autonomous multi-feature project driver.
//!
//! A project is a manifest of features with dependencies. Autopilot picks the
//! next runnable feature, hands it to an external coding agent, watches the
//! agent's output to move it between model tiers mid-run, and decides after a
//! failure whether and how to retry. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (graph, selection, recursive tree,
//!   retry strategy, live escalation tracker). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, manifest store, generation,
//!   archival, agent processes, timeline). Isolated to enable scripting in tests.
//!
//! Orchestration modules ([`step`], [`supervise`], [`select`], [`plan`],
//! [`manage`], [`validate`]) coordinate core logic with I/O to implement CLI
//! commands.

pub mod attempt;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod manage;
pub mod plan;
pub mod select;
pub mod step;
pub mod supervise;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
