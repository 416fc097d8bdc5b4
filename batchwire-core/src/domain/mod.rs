//! Core domain types
//!
//! This module contains the core domain structures used across Batchwire.
//! These types describe what a job is and where it stands; the engine owns
//! the only mutable copy of job state (its registry).

pub mod handle;
pub mod job;
pub mod record;
pub mod state;
