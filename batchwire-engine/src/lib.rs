//! Batchwire engine
//!
//! Submits jobs to batch schedulers (PBS, SGE, LSF, Slurm), to the local
//! machine, or to an in-memory double, and keeps an authoritative record of
//! every job's state.
//!
//! Architecture:
//! - Backends: one integration per scheduler, single attempts only
//! - Registry: the in-memory source of truth for job records
//! - Services: submission with retries, state tracking, reconciliation
//! - Engine: the facade callers use
//! - Scheduler: background refresh, staleness sweeps and checkpoints

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod service;

pub use config::EngineConfig;
pub use engine::{JobEngine, StateReport};
pub use registry::{JobFilter, JobRegistry};
pub use scheduler::TrackerLoop;
