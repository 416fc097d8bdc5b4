//! Backend kinds and job handles

use serde::{Deserialize, Serialize};
use std::fmt;

/// The backend family a job is submitted to
///
/// The known schedulers are closed variants; `Custom` names a backend that
/// was registered at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    Pbs,
    Sge,
    Lsf,
    Slurm,
    Direct,
    Dummy,
    Custom(String),
}

impl BackendKind {
    /// Parses a backend name as used in configuration (case-insensitive)
    ///
    /// Unrecognized names become `Custom` so extension backends can be
    /// addressed by the name they were registered under.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pbs" | "torque" => BackendKind::Pbs,
            "sge" | "uge" => BackendKind::Sge,
            "lsf" => BackendKind::Lsf,
            "slurm" => BackendKind::Slurm,
            "direct" | "local" => BackendKind::Direct,
            "dummy" => BackendKind::Dummy,
            _ => BackendKind::Custom(name.trim().to_string()),
        }
    }

    /// Whether this backend is a real cluster scheduler
    pub fn is_cluster(&self) -> bool {
        matches!(
            self,
            BackendKind::Pbs | BackendKind::Sge | BackendKind::Lsf | BackendKind::Slurm
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Pbs => write!(f, "pbs"),
            BackendKind::Sge => write!(f, "sge"),
            BackendKind::Lsf => write!(f, "lsf"),
            BackendKind::Slurm => write!(f, "slurm"),
            BackendKind::Direct => write!(f, "direct"),
            BackendKind::Dummy => write!(f, "dummy"),
            BackendKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Backend-assigned identity of a submitted job
///
/// Created once the backend acknowledges a submission and never changed
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// Backend that issued the id
    pub backend: BackendKind,
    /// Scheduler job id (e.g. `4711.pbs-server`) or local execution id
    pub id: String,
}

impl JobHandle {
    pub fn new(backend: BackendKind, id: impl Into<String>) -> Self {
        Self {
            backend,
            id: id.into(),
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}
