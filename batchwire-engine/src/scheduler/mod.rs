//! Scheduler module
//!
//! Drives the engine in the background: periodic refreshes of every backend,
//! staleness sweeps, reconciliation of finished jobs and checkpoints.

pub mod poller;

pub use poller::{CycleSummary, TrackerLoop};
