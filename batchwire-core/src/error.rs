//! Error types shared across Batchwire
//!
//! Transient conditions (`Transient`, `Timeout`, `SourceUnavailable`) are
//! absorbed by retries inside the engine; everything else is surfaced to the
//! caller verbatim.

use std::time::Duration;
use thiserror::Error;

use crate::domain::handle::{BackendKind, JobHandle};
use crate::domain::job::JobId;
use crate::domain::state::JobState;

/// A state change the job state machine does not permit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for job {job}: {from} -> {to}")]
pub struct InvalidTransition {
    pub job: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// Errors raised while submitting a job
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    /// Backend could not be reached; worth retrying
    #[error("backend temporarily unavailable: {0}")]
    Transient(String),

    /// Scheduler refused the job; retrying the same spec cannot help
    #[error("rejected by scheduler: {0}")]
    Rejected(String),

    /// Submission call did not finish in time
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),

    #[error("job {0} has already been submitted")]
    AlreadySubmitted(JobId),

    #[error("no backend registered for {0}")]
    NoBackend(BackendKind),
}

impl SubmissionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Errors raised while tracking job state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    /// Status source could not be consulted
    #[error("status source unavailable: {0}")]
    SourceUnavailable(String),

    /// Status source answered with something unparseable
    #[error("malformed status response: {0}")]
    MalformedResponse(String),

    #[error("job {0} is not tracked")]
    NotTracked(JobHandle),

    #[error("no backend registered for {0}")]
    NoBackend(BackendKind),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// Errors raised while cancelling a job
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("job {0} already reached a terminal state")]
    AlreadyTerminal(JobHandle),

    #[error("backend refused cancellation: {0}")]
    BackendRejected(String),

    /// Backend could not be reached; worth retrying
    #[error("backend unavailable for cancellation: {0}")]
    Unavailable(String),

    #[error("cancellation timed out after {0:?}")]
    Timeout(Duration),

    #[error("job {0} is not tracked")]
    NotTracked(JobHandle),
}

impl CancelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Errors raised by the job registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("job {0} is already registered")]
    DuplicateJob(JobId),

    #[error("handle {0} is already registered")]
    DuplicateHandle(JobHandle),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("no job registered for handle {0}")]
    UnknownHandle(JobHandle),

    #[error("job {0} is not in a terminal state")]
    NotTerminal(JobId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("unsupported snapshot version {found} (expected {expected})")]
    SnapshotVersion { expected: u32, found: u32 },
}

/// Reasons a job spec is rejected before it reaches any backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("job id cannot be empty")]
    EmptyId,

    #[error("job id '{0}' contains whitespace or '/'")]
    InvalidId(JobId),

    #[error("job {0} has an empty command")]
    EmptyCommand(JobId),

    #[error("invalid resource request: {0}")]
    InvalidResource(String),

    #[error("job {0} depends on itself")]
    SelfDependency(JobId),

    #[error("dependency {0} is listed more than once")]
    DuplicateDependency(JobId),

    #[error("invalid environment variable name '{0}'")]
    InvalidEnvName(String),
}

impl From<SpecError> for SubmissionError {
    fn from(err: SpecError) -> Self {
        SubmissionError::Rejected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SubmissionError::Transient("down".to_string()).is_retryable());
        assert!(SubmissionError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!SubmissionError::Rejected("bad queue".to_string()).is_retryable());
        assert!(!SubmissionError::AlreadySubmitted(JobId::new("a")).is_retryable());

        assert!(CancelError::Unavailable("down".to_string()).is_retryable());
        assert!(!CancelError::BackendRejected("no".to_string()).is_retryable());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = InvalidTransition {
            job: JobId::new("j1"),
            from: JobState::Completed,
            to: JobState::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for job j1: Completed -> Running"
        );
    }
}
