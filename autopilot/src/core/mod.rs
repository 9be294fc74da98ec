//! Deterministic, pure logic shared by the autopilot.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests. The
//! two decision engines ([`retry`] and [`escalation`]) live side by side but
//! never share decision logic or history.

pub mod error;
pub mod escalation;
pub mod feature;
pub mod graph;
pub mod resolve;
pub mod retry;
pub mod selector;
pub mod shared;
pub mod tree;
pub mod types;
