//! Cluster scheduler backends
//!
//! PBS, SGE, LSF and Slurm differ only in their command-line tools and the
//! text those tools print. [`ClusterBackend`] owns the process handling and
//! failure classification; a [`SchedulerDialect`] supplies the pure text
//! layer (which program to run with which arguments, how to read its output).
//!
//! Jobs are submitted by piping a generated shell script on stdin. When the
//! spec has a log directory, the script records the command's exit status in
//! `<log_dir>/<id>.exitcode` for the reconciler.

mod lsf;
mod pbs;
mod sge;
mod slurm;

pub use lsf::LsfDialect;
pub use pbs::PbsDialect;
pub use sge::SgeDialect;
pub use slurm::SlurmDialect;

use async_trait::async_trait;
use batchwire_core::command::ProcessingCommand;
use batchwire_core::domain::handle::{BackendKind, JobHandle};
use batchwire_core::domain::job::{JobSpec, StatusObservation};
use batchwire_core::error::{CancelError, SubmissionError, TrackingError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{JobSubmissionBackend, StatusMap, ensure_command_matches};
use crate::process::{self, CommandExecutor, Invocation, InvocationError, InvocationOutput};

/// Pure text layer of one scheduler family
pub trait SchedulerDialect: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Submission call; `script` goes to stdin
    fn submit_invocation(&self, args: Vec<String>, script: String) -> Invocation;

    /// Extracts the scheduler job id from the submission output
    fn parse_submit(&self, stdout: &str) -> Option<String>;

    /// Bulk status call for the given job ids
    fn status_invocation(&self, ids: &[&str]) -> Invocation;

    /// Whether a failing status call only complained about finished or
    /// unknown jobs, so its stdout is still usable
    fn tolerates_status_failure(&self, _stderr: &str) -> bool {
        false
    }

    /// Parses the status listing into observations keyed by job id
    fn parse_status(&self, stdout: &str) -> Result<StatusMap, TrackingError>;

    /// Accounting query for a job that left the live listing
    fn history_invocation(&self, _id: &str) -> Option<Invocation> {
        None
    }

    fn parse_history(&self, _stdout: &str) -> Option<StatusObservation> {
        None
    }

    fn cancel_invocation(&self, id: &str) -> Invocation;

    /// Cheap call proving the tools are installed
    fn version_invocation(&self) -> Invocation;
}

/// Backend driving a cluster scheduler through its command-line tools
pub struct ClusterBackend<D> {
    dialect: D,
    executor: Arc<dyn CommandExecutor>,
    call_timeout: Duration,
}

impl<D: SchedulerDialect> ClusterBackend<D> {
    pub fn new(dialect: D, executor: Arc<dyn CommandExecutor>, call_timeout: Duration) -> Self {
        Self {
            dialect,
            executor,
            call_timeout,
        }
    }

    async fn execute(&self, invocation: &Invocation) -> Result<InvocationOutput, InvocationError> {
        self.executor.execute(invocation, self.call_timeout).await
    }

    /// Looks up a handle id in a status map, tolerating scheduler host suffixes
    ///
    /// `qsub` may answer `12.server` while `qstat` reports `12.server.domain`.
    fn find<'a>(map: &'a StatusMap, id: &str) -> Option<&'a StatusObservation> {
        map.get(id).or_else(|| {
            let short = short_id(id);
            map.iter()
                .find(|(key, _)| short_id(key) == short)
                .map(|(_, observation)| observation)
        })
    }
}

fn short_id(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

#[async_trait]
impl<D: SchedulerDialect> JobSubmissionBackend for ClusterBackend<D> {
    fn kind(&self) -> BackendKind {
        self.dialect.kind()
    }

    async fn submit(
        &self,
        spec: &JobSpec,
        command: &ProcessingCommand,
        predecessors: &[JobHandle],
    ) -> Result<JobHandle, SubmissionError> {
        ensure_command_matches(&self.kind(), command)?;

        let mut args = command.render(spec);
        args.extend(command.render_dependencies(predecessors));
        let invocation = self.dialect.submit_invocation(args, job_script(spec));

        let output = self
            .execute(&invocation)
            .await
            .map_err(classify_submit_error)?;

        if !output.success() {
            return Err(classify_submit_failure(&output));
        }

        let id = self.dialect.parse_submit(&output.stdout).ok_or_else(|| {
            SubmissionError::Rejected(format!(
                "unrecognized submission output: '{}'",
                output.stdout.trim()
            ))
        })?;

        let handle = JobHandle::new(self.kind(), id);
        info!("Submitted job {} as {}", spec.id, handle);
        Ok(handle)
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<StatusMap, TrackingError> {
        if handles.is_empty() {
            return Ok(StatusMap::new());
        }

        let ids: Vec<&str> = handles.iter().map(|h| h.id.as_str()).collect();
        let invocation = self.dialect.status_invocation(&ids);

        let output = self
            .execute(&invocation)
            .await
            .map_err(|e| TrackingError::SourceUnavailable(e.to_string()))?;

        if !output.success() && !self.dialect.tolerates_status_failure(&output.stderr) {
            return Err(TrackingError::SourceUnavailable(format!(
                "'{}' exited with {:?}: {}",
                invocation.program,
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let listing = self.dialect.parse_status(&output.stdout)?;

        let mut observations = StatusMap::new();
        for id in ids {
            if let Some(observation) = Self::find(&listing, id) {
                observations.insert(id.to_string(), *observation);
                continue;
            }

            let Some(history) = self.dialect.history_invocation(id) else {
                continue;
            };
            match self.execute(&history).await {
                Ok(output) if output.success() => {
                    if let Some(observation) = self.dialect.parse_history(&output.stdout) {
                        observations.insert(id.to_string(), observation);
                    }
                }
                Ok(output) => {
                    debug!("No accounting record for {}: {}", id, output.stderr.trim());
                }
                Err(e) => {
                    debug!("Accounting query for {} failed: {}", id, e);
                }
            }
        }

        debug!(
            "{} reported {}/{} job(s)",
            self.kind(),
            observations.len(),
            handles.len()
        );
        Ok(observations)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        let invocation = self.dialect.cancel_invocation(&handle.id);

        let output = self.execute(&invocation).await.map_err(|e| match e {
            InvocationError::TimedOut { timeout, .. } => CancelError::Timeout(timeout),
            other => CancelError::Unavailable(other.to_string()),
        })?;

        if !output.success() {
            let reason = failure_reason(&output);
            if looks_transient(&output.stderr) {
                return Err(CancelError::Unavailable(reason));
            }
            return Err(CancelError::BackendRejected(reason));
        }

        info!("Cancellation of {} accepted", handle);
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let invocation = self.dialect.version_invocation();
        process::probe(self.executor.as_ref(), &invocation, self.call_timeout).await
    }
}

fn classify_submit_error(err: InvocationError) -> SubmissionError {
    match err {
        InvocationError::TimedOut { timeout, .. } => SubmissionError::Timeout(timeout),
        other => {
            warn!("Submission call failed: {}", other);
            SubmissionError::Transient(other.to_string())
        }
    }
}

fn classify_submit_failure(output: &InvocationOutput) -> SubmissionError {
    let reason = failure_reason(output);
    if looks_transient(&output.stderr) {
        SubmissionError::Transient(reason)
    } else {
        SubmissionError::Rejected(reason)
    }
}

fn failure_reason(output: &InvocationOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("exit code {:?}", output.exit_code)
    } else {
        stderr.to_string()
    }
}

/// Whether scheduler stderr describes a condition that may clear by itself
pub(crate) fn looks_transient(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "connection",
        "try again",
        "temporarily",
        "socket",
        "timed out",
        "unable to contact",
        "communication error",
    ];
    let lower = stderr.to_ascii_lowercase();
    MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Quotes a value for a POSIX shell
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Builds the script piped to the submission tool
pub(crate) fn job_script(spec: &JobSpec) -> String {
    let mut script = String::from("#!/bin/sh\n");

    if let Some(dir) = &spec.working_dir {
        script.push_str(&format!(
            "cd {} || exit 1\n",
            shell_quote(&dir.to_string_lossy())
        ));
    }
    for (key, value) in &spec.environment {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }

    script.push_str(&spec.command);
    script.push('\n');

    if let Some(path) = spec.exit_code_path() {
        script.push_str("status=$?\n");
        script.push_str(&format!(
            "echo $status > {}\n",
            shell_quote(&path.to_string_lossy())
        ));
        script.push_str("exit $status\n");
    }

    script
}
