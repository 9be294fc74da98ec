//! I/O helpers for autopilot commands.

pub mod adjustments;
pub mod archive;
pub mod atomic;
pub mod config;
pub mod executor;
pub mod generate;
pub mod init;
pub mod manifest_store;
pub mod timeline;
