//! LSF dialect: `bsub`, `bjobs`, `bkill`

use batchwire_core::domain::handle::BackendKind;
use batchwire_core::domain::job::StatusObservation;
use batchwire_core::domain::state::JobState;
use batchwire_core::error::TrackingError;

use super::SchedulerDialect;
use crate::backend::StatusMap;
use crate::process::Invocation;

#[derive(Debug, Clone, Copy, Default)]
pub struct LsfDialect;

impl SchedulerDialect for LsfDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Lsf
    }

    fn submit_invocation(&self, args: Vec<String>, script: String) -> Invocation {
        Invocation::new("bsub").args(args).stdin(script)
    }

    fn parse_submit(&self, stdout: &str) -> Option<String> {
        // Job <4711> is submitted to queue <normal>.
        let start = stdout.find("Job <")? + "Job <".len();
        let len = stdout[start..].find('>')?;
        let id = &stdout[start..start + len];
        if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
            Some(id.to_string())
        } else {
            None
        }
    }

    fn status_invocation(&self, ids: &[&str]) -> Invocation {
        Invocation::new("bjobs")
            .args(["-a", "-noheader", "-o", "jobid stat exit_code"])
            .args(ids.iter().copied())
    }

    fn tolerates_status_failure(&self, stderr: &str) -> bool {
        let mut lines = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();
        lines.peek().is_some() && lines.all(|line| line.contains("is not found"))
    }

    fn parse_status(&self, stdout: &str) -> Result<StatusMap, TrackingError> {
        let mut map = StatusMap::new();

        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // Not-found notices can land on stdout too
            if line.contains("is not found") {
                continue;
            }

            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 2 {
                return Err(TrackingError::MalformedResponse(format!(
                    "unexpected bjobs line: '{}'",
                    line
                )));
            }
            let exit_code: Option<i32> = columns.get(2).and_then(|c| c.parse().ok());

            let observation = match columns[1] {
                "PEND" | "PSUSP" | "WAIT" => StatusObservation::new(JobState::Queued),
                "RUN" | "USUSP" | "SSUSP" | "PROV" => StatusObservation::new(JobState::Running),
                "DONE" => StatusObservation::finished(JobState::Completed, 0),
                "EXIT" => match exit_code {
                    Some(code) => StatusObservation::from_exit_code(code),
                    None => StatusObservation::new(JobState::Failed),
                },
                "ZOMBI" => StatusObservation::new(JobState::Aborted),
                "UNKWN" => StatusObservation::new(JobState::Unknown),
                other => {
                    return Err(TrackingError::MalformedResponse(format!(
                        "unknown LSF state '{}'",
                        other
                    )));
                }
            };
            map.insert(columns[0].to_string(), observation);
        }

        Ok(map)
    }

    fn cancel_invocation(&self, id: &str) -> Invocation {
        Invocation::new("bkill").arg(id)
    }

    fn version_invocation(&self) -> Invocation {
        Invocation::new("lsid")
    }
}
