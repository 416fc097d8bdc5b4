//! Slurm dialect: `sbatch`, `sacct`, `scancel`

use batchwire_core::domain::handle::BackendKind;
use batchwire_core::domain::job::StatusObservation;
use batchwire_core::domain::state::JobState;
use batchwire_core::error::TrackingError;

use super::SchedulerDialect;
use crate::backend::StatusMap;
use crate::process::Invocation;

#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmDialect;

/// Parses a `sacct` ExitCode field (`code:signal`)
fn parse_exit_field(field: &str) -> Option<(i32, i32)> {
    let (code, signal) = field.split_once(':')?;
    Some((code.trim().parse().ok()?, signal.trim().parse().ok()?))
}

fn observation(state: &str, exit: Option<(i32, i32)>) -> Option<StatusObservation> {
    // "CANCELLED by 1000" carries the cancelling uid
    let state = state.split_whitespace().next().unwrap_or_default();
    // Shell convention: death by signal N reads as 128 + N; "0:0" carries nothing
    let code = exit.and_then(|(code, signal)| match (code, signal) {
        (0, 0) => None,
        (_, 0) => Some(code),
        (_, signal) => Some(128 + signal),
    });

    let observation = match state {
        "PENDING" => StatusObservation::new(JobState::Queued),
        // Requeued jobs stay Running; Queued would move the record backwards
        "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" => StatusObservation::new(JobState::Running),
        "RUNNING" | "COMPLETING" | "CONFIGURING" | "SUSPENDED" | "STOPPED" | "RESIZING"
        | "SIGNALING" | "STAGE_OUT" => StatusObservation::new(JobState::Running),
        "COMPLETED" => match exit {
            Some((code, 0)) => StatusObservation::from_exit_code(code),
            Some((_, signal)) => StatusObservation::finished(JobState::Aborted, 128 + signal),
            None => StatusObservation::new(JobState::Completed),
        },
        "CANCELLED" | "PREEMPTED" | "REVOKED" => StatusObservation {
            state: JobState::Aborted,
            exit_code: code,
        },
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE" => {
            StatusObservation {
                state: JobState::Failed,
                exit_code: code,
            }
        }
        _ => return None,
    };
    Some(observation)
}

impl SchedulerDialect for SlurmDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    fn submit_invocation(&self, args: Vec<String>, script: String) -> Invocation {
        Invocation::new("sbatch")
            .arg("--parsable")
            .args(args)
            .stdin(script)
    }

    fn parse_submit(&self, stdout: &str) -> Option<String> {
        // `--parsable` prints `<id>` or `<id>;<cluster>`
        let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
        let id = line.split(';').next()?.trim();
        if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
            Some(id.to_string())
        } else {
            None
        }
    }

    fn status_invocation(&self, ids: &[&str]) -> Invocation {
        Invocation::new("sacct")
            .args(["-X", "-n", "-P", "-o", "JobID,State,ExitCode", "-j"])
            .arg(ids.join(","))
    }

    fn parse_status(&self, stdout: &str) -> Result<StatusMap, TrackingError> {
        let mut map = StatusMap::new();

        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() < 3 {
                return Err(TrackingError::MalformedResponse(format!(
                    "unexpected sacct line: '{}'",
                    line
                )));
            }

            let observation = observation(fields[1], parse_exit_field(fields[2])).ok_or_else(|| {
                TrackingError::MalformedResponse(format!("unknown Slurm state '{}'", fields[1]))
            })?;
            map.insert(fields[0].to_string(), observation);
        }

        Ok(map)
    }

    fn cancel_invocation(&self, id: &str) -> Invocation {
        Invocation::new("scancel").arg(id)
    }

    fn version_invocation(&self) -> Invocation {
        Invocation::new("sbatch").arg("--version")
    }
}
