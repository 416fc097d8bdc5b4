//! Batchwire Core
//!
//! Core types and abstractions for the Batchwire job-submission layer.
//!
//! This crate contains:
//! - Domain types: jobs, handles, states and records
//! - Processing commands: backend-specific rendering of resource requests
//! - Errors: the taxonomy shared by submission, tracking and cancellation
//! - DTOs: registry snapshots for checkpointing
//!
//! Nothing here performs I/O; execution lives in `batchwire-engine`.

pub mod command;
pub mod domain;
pub mod dto;
pub mod error;
