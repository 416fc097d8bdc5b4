//! Data Transfer Objects
//!
//! Serializable shapes that leave the process: registry snapshots written to
//! durable storage so a restarted tracker can resume.

pub mod snapshot;
