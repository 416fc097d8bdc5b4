//! Direct backend
//!
//! Runs a job on the local machine to completion inside `submit`. The
//! outcome is stored and handed out once by the next `poll`, so synchronous
//! jobs flow through the same Pending -> terminal path as cluster jobs.
//! Jobs this process did not run (restored from a checkpoint) are answered
//! from their exit-code artifact.

use async_trait::async_trait;
use batchwire_core::command::ProcessingCommand;
use batchwire_core::domain::handle::{BackendKind, JobHandle};
use batchwire_core::domain::job::{JobSpec, StatusObservation};
use batchwire_core::domain::record::JobRecord;
use batchwire_core::domain::state::JobState;
use batchwire_core::error::{CancelError, SubmissionError, TrackingError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobSubmissionBackend, StatusMap, ensure_command_matches};
use crate::process::{CommandExecutor, Invocation, InvocationError};

/// Exit code reported for jobs killed by the job timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Backend executing jobs synchronously on this host
pub struct DirectBackend {
    executor: Arc<dyn CommandExecutor>,
    job_timeout: Duration,
    outcomes: Mutex<HashMap<String, StatusObservation>>,
}

impl DirectBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>, job_timeout: Duration) -> Self {
        Self {
            executor,
            job_timeout,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    fn outcomes(&self) -> MutexGuard<'_, HashMap<String, StatusObservation>> {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Outcomes not yet handed to the tracker
    pub fn pending_outcomes(&self) -> usize {
        self.outcomes().len()
    }

    /// Local jobs cannot wait, so every predecessor must already have succeeded
    ///
    /// Outcomes already reported are no longer held here; the registry vets
    /// those predecessors before submission.
    fn check_predecessors(&self, predecessors: &[JobHandle]) -> Result<(), SubmissionError> {
        let outcomes = self.outcomes();
        for handle in predecessors {
            if let Some(outcome) = outcomes.get(&handle.id) {
                if outcome.state != JobState::Completed {
                    return Err(SubmissionError::Rejected(format!(
                        "predecessor {} has not completed successfully",
                        handle
                    )));
                }
            }
        }
        Ok(())
    }
}

async fn write_artifact(path: Option<impl AsRef<Path>>, contents: &str) {
    let Some(path) = path else {
        return;
    };
    let path = path.as_ref();
    if let Err(e) = tokio::fs::write(path, contents).await {
        warn!("Failed to write {}: {}", path.display(), e);
    }
}

async fn read_exit_code(record: &JobRecord) -> Option<i32> {
    let path = record.spec.exit_code_path()?;
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents.trim().parse().ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

#[async_trait]
impl JobSubmissionBackend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        command: &ProcessingCommand,
        predecessors: &[JobHandle],
    ) -> Result<JobHandle, SubmissionError> {
        ensure_command_matches(&self.kind(), command)?;
        self.check_predecessors(predecessors)?;

        let mut tokens = command.render(spec).into_iter();
        let program = tokens
            .next()
            .ok_or_else(|| SubmissionError::Rejected("empty local invocation".to_string()))?;
        let invocation = Invocation::new(program)
            .args(tokens)
            .env(spec.environment.clone())
            .working_dir(spec.working_dir.clone());

        if let Some(dir) = &spec.log_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("Failed to create log directory {}: {}", dir.display(), e);
            }
        }

        info!("Running job {} locally", spec.id);

        let (observation, stdout) = match self.executor.execute(&invocation, self.job_timeout).await {
            Ok(output) => {
                let observation = match output.exit_code {
                    Some(code) => StatusObservation::from_exit_code(code),
                    None => StatusObservation::new(JobState::Aborted),
                };
                (observation, output.stdout)
            }
            Err(InvocationError::TimedOut { timeout, .. }) => {
                warn!("Job {} exceeded its {:?} limit and was killed", spec.id, timeout);
                (
                    StatusObservation::finished(JobState::Failed, TIMEOUT_EXIT_CODE),
                    String::new(),
                )
            }
            Err(e) => return Err(SubmissionError::Transient(e.to_string())),
        };

        write_artifact(spec.stdout_path(), &stdout).await;
        if let Some(code) = observation.exit_code {
            write_artifact(spec.exit_code_path(), &format!("{}\n", code)).await;
        }

        let handle = JobHandle::new(BackendKind::Direct, format!("direct-{}", Uuid::new_v4()));
        info!(
            "Job {} finished locally as {}: {}",
            spec.id, handle, observation.state
        );

        self.outcomes().insert(handle.id.clone(), observation);
        Ok(handle)
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<StatusMap, TrackingError> {
        let mut outcomes = self.outcomes();
        Ok(handles
            .iter()
            .filter_map(|h| outcomes.remove(&h.id).map(|o| (h.id.clone(), o)))
            .collect())
    }

    async fn poll_records(&self, records: &[JobRecord]) -> Result<StatusMap, TrackingError> {
        let handles: Vec<JobHandle> = records.iter().map(|r| r.handle.clone()).collect();
        let mut status = self.poll(&handles).await?;

        for record in records {
            if status.contains_key(&record.handle.id) {
                continue;
            }
            if let Some(code) = read_exit_code(record).await {
                debug!("Recovered outcome of {} from its artifact", record.handle);
                status.insert(record.handle.id.clone(), StatusObservation::from_exit_code(code));
            }
        }
        Ok(status)
    }

    fn release(&self, handle: &JobHandle) {
        self.outcomes().remove(&handle.id);
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        Err(CancelError::BackendRejected(format!(
            "{} ran to completion at submission and cannot be cancelled",
            handle
        )))
    }
}
