//! Dummy backend
//!
//! In-memory scheduler accepting Dummy processing commands. Every job starts
//! as `QUEUED`; tests script what the scheduler reports afterwards with
//! status lines:
//!
//! ```text
//! PENDING | QUEUED | RUNNING | DONE, exit=<n> | FAILED, exit=<n> | ABORTED
//! ```
//!
//! Submission failures, cancellation failures and scheduler outages can be
//! scripted too.

use async_trait::async_trait;
use batchwire_core::command::ProcessingCommand;
use batchwire_core::domain::handle::{BackendKind, JobHandle};
use batchwire_core::domain::job::{JobSpec, StatusObservation};
use batchwire_core::domain::state::JobState;
use batchwire_core::error::{CancelError, SubmissionError, TrackingError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{JobSubmissionBackend, StatusMap, ensure_command_matches};

/// Parses a scripted status line
pub fn parse_status_line(line: &str) -> Result<StatusObservation, TrackingError> {
    let line = line.trim();
    let (status, exit) = match line.split_once(',') {
        Some((status, rest)) => {
            let code = rest
                .trim()
                .strip_prefix("exit=")
                .and_then(|c| c.trim().parse::<i32>().ok())
                .ok_or_else(|| {
                    TrackingError::MalformedResponse(format!("bad exit clause in '{}'", line))
                })?;
            (status.trim(), Some(code))
        }
        None => (line, None),
    };

    let observation = match (status, exit) {
        ("PENDING", None) => StatusObservation::new(JobState::Pending),
        ("QUEUED", None) => StatusObservation::new(JobState::Queued),
        ("RUNNING", None) => StatusObservation::new(JobState::Running),
        ("DONE", Some(code)) => StatusObservation::from_exit_code(code),
        ("DONE", None) => StatusObservation::new(JobState::Completed),
        ("FAILED", Some(code)) => StatusObservation::finished(JobState::Failed, code),
        ("FAILED", None) => StatusObservation::new(JobState::Failed),
        ("ABORTED", code) => StatusObservation {
            state: JobState::Aborted,
            exit_code: code,
        },
        _ => {
            return Err(TrackingError::MalformedResponse(format!(
                "unknown dummy status '{}'",
                line
            )));
        }
    };
    Ok(observation)
}

/// A job as the dummy scheduler sees it
#[derive(Debug, Clone)]
pub struct DummyJob {
    pub spec: JobSpec,
    /// Rendered submission tokens, dependencies included
    pub tokens: Vec<String>,
    pub status: String,
}

#[derive(Default)]
struct DummyState {
    next_id: u64,
    jobs: HashMap<String, DummyJob>,
    submit_failures: VecDeque<SubmissionError>,
    cancel_failures: VecDeque<CancelError>,
    submit_attempts: u32,
    unreachable: bool,
}

/// Scriptable in-memory scheduler
#[derive(Default)]
pub struct DummyBackend {
    state: Mutex<DummyState>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the line the scheduler reports for a job from now on
    pub fn set_status(&self, handle: &JobHandle, line: impl Into<String>) {
        if let Some(job) = self.state().jobs.get_mut(&handle.id) {
            job.status = line.into();
        }
    }

    /// Makes the next submission attempt fail with `error`
    pub fn fail_next_submit(&self, error: SubmissionError) {
        self.state().submit_failures.push_back(error);
    }

    /// Makes the next cancellation fail with `error`
    pub fn fail_next_cancel(&self, error: CancelError) {
        self.state().cancel_failures.push_back(error);
    }

    /// While unreachable, polls fail with SourceUnavailable
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Removes a job so it no longer shows up in listings
    pub fn forget(&self, handle: &JobHandle) {
        self.state().jobs.remove(&handle.id);
    }

    pub fn job(&self, handle: &JobHandle) -> Option<DummyJob> {
        self.state().jobs.get(&handle.id).cloned()
    }

    /// Submission attempts seen so far, failed ones included
    pub fn submit_attempts(&self) -> u32 {
        self.state().submit_attempts
    }

    pub fn job_count(&self) -> usize {
        self.state().jobs.len()
    }
}

#[async_trait]
impl JobSubmissionBackend for DummyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Dummy
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        command: &ProcessingCommand,
        predecessors: &[JobHandle],
    ) -> Result<JobHandle, SubmissionError> {
        ensure_command_matches(&self.kind(), command)?;

        let mut state = self.state();
        state.submit_attempts += 1;

        if let Some(error) = state.submit_failures.pop_front() {
            debug!("Dummy submission of {} fails: {}", spec.id, error);
            return Err(error);
        }

        if let Some(missing) = predecessors.iter().find(|h| !state.jobs.contains_key(&h.id)) {
            return Err(SubmissionError::Rejected(format!(
                "unknown predecessor {}",
                missing
            )));
        }

        let mut tokens = command.render(spec);
        tokens.extend(command.render_dependencies(predecessors));

        state.next_id += 1;
        let id = format!("dummy-{}", state.next_id);
        state.jobs.insert(
            id.clone(),
            DummyJob {
                spec: spec.clone(),
                tokens,
                status: "QUEUED".to_string(),
            },
        );

        Ok(JobHandle::new(BackendKind::Dummy, id))
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<StatusMap, TrackingError> {
        let state = self.state();
        if state.unreachable {
            return Err(TrackingError::SourceUnavailable(
                "dummy scheduler is unreachable".to_string(),
            ));
        }

        let mut map = StatusMap::new();
        for handle in handles {
            if let Some(job) = state.jobs.get(&handle.id) {
                map.insert(handle.id.clone(), parse_status_line(&job.status)?);
            }
        }
        Ok(map)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        let mut state = self.state();
        if let Some(error) = state.cancel_failures.pop_front() {
            return Err(error);
        }

        let job = state
            .jobs
            .get_mut(&handle.id)
            .ok_or_else(|| CancelError::BackendRejected(format!("unknown job {}", handle)))?;

        let finished = parse_status_line(&job.status).is_ok_and(|o| o.state.is_terminal());
        if finished {
            return Err(CancelError::BackendRejected(format!(
                "job {} has already finished",
                handle
            )));
        }

        job.status = "ABORTED".to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_lines() {
        assert_eq!(
            parse_status_line("RUNNING").unwrap(),
            StatusObservation::new(JobState::Running)
        );
        assert_eq!(
            parse_status_line("DONE, exit=0").unwrap(),
            StatusObservation::finished(JobState::Completed, 0)
        );
        assert_eq!(
            parse_status_line("FAILED, exit=2").unwrap(),
            StatusObservation::finished(JobState::Failed, 2)
        );
        assert_eq!(
            parse_status_line("ABORTED").unwrap(),
            StatusObservation::new(JobState::Aborted)
        );
        assert!(parse_status_line("DONE, exit=zero").is_err());
        assert!(parse_status_line("SLEEPING").is_err());
    }

    #[tokio::test]
    async fn test_submit_renders_dummy_label() {
        let backend = DummyBackend::new();
        let first = backend
            .submit(&JobSpec::new("a", "true"), &ProcessingCommand::dummy("step a"), &[])
            .await
            .unwrap();
        let second = backend
            .submit(
                &JobSpec::new("b", "true"),
                &ProcessingCommand::dummy("step b"),
                &[first.clone()],
            )
            .await
            .unwrap();

        assert_eq!(backend.job(&first).unwrap().tokens, vec!["Dummy: step a"]);
        assert_eq!(
            backend.job(&second).unwrap().tokens,
            vec!["Dummy: step b", "after:dummy-1"]
        );
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let backend = DummyBackend::new();
        backend.fail_next_submit(SubmissionError::Transient("flaky".to_string()));

        let spec = JobSpec::new("a", "true");
        let cmd = ProcessingCommand::dummy("a");
        assert!(backend.submit(&spec, &cmd, &[]).await.is_err());
        let handle = backend.submit(&spec, &cmd, &[]).await.unwrap();
        assert_eq!(backend.submit_attempts(), 2);

        backend.set_unreachable(true);
        assert!(matches!(
            backend.poll(&[handle.clone()]).await,
            Err(TrackingError::SourceUnavailable(_))
        ));

        backend.set_unreachable(false);
        backend.set_status(&handle, "DONE, exit=0");
        assert!(matches!(
            backend.cancel(&handle).await,
            Err(CancelError::BackendRejected(_))
        ));
    }
}
