//! PBS / Torque dialect: `qsub`, `qstat -f`, `qdel`

use batchwire_core::domain::handle::BackendKind;
use batchwire_core::domain::job::StatusObservation;
use batchwire_core::domain::state::JobState;
use batchwire_core::error::TrackingError;

use super::SchedulerDialect;
use crate::backend::StatusMap;
use crate::process::Invocation;

#[derive(Debug, Clone, Copy, Default)]
pub struct PbsDialect;

#[derive(Default)]
struct JobBlock {
    id: String,
    state: Option<String>,
    exit_status: Option<i32>,
}

impl JobBlock {
    /// `None` when the job finished but its exit status is not known yet
    fn observation(&self) -> Result<Option<StatusObservation>, TrackingError> {
        let state = self.state.as_deref().ok_or_else(|| {
            TrackingError::MalformedResponse(format!("no job_state for job {}", self.id))
        })?;

        let observation = match state {
            "Q" | "W" | "H" | "T" | "S" | "B" => Some(StatusObservation::new(JobState::Queued)),
            "R" | "E" | "X" => Some(StatusObservation::new(JobState::Running)),
            "C" | "F" => self.exit_status.map(|code| match code {
                // Torque reports death by signal N as 256 + N
                code if code >= 256 => StatusObservation::finished(JobState::Aborted, code - 128),
                // Negative values are PBS-internal failures (could not start, ...)
                code if code < 0 => StatusObservation::finished(JobState::Failed, code),
                code => StatusObservation::from_exit_code(code),
            }),
            other => {
                return Err(TrackingError::MalformedResponse(format!(
                    "unknown PBS job_state '{}' for job {}",
                    other, self.id
                )));
            }
        };
        Ok(observation)
    }
}

impl SchedulerDialect for PbsDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Pbs
    }

    fn submit_invocation(&self, args: Vec<String>, script: String) -> Invocation {
        Invocation::new("qsub").args(args).stdin(script)
    }

    fn parse_submit(&self, stdout: &str) -> Option<String> {
        let id = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
        let starts_with_digit = id.chars().next().is_some_and(|c| c.is_ascii_digit());
        if starts_with_digit && !id.contains(char::is_whitespace) {
            Some(id.to_string())
        } else {
            None
        }
    }

    fn status_invocation(&self, ids: &[&str]) -> Invocation {
        Invocation::new("qstat").arg("-f").args(ids.iter().copied())
    }

    fn tolerates_status_failure(&self, stderr: &str) -> bool {
        let mut lines = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();
        lines.peek().is_some()
            && lines.all(|line| {
                line.contains("Unknown Job Id") || line.contains("Job has finished")
            })
    }

    fn parse_status(&self, stdout: &str) -> Result<StatusMap, TrackingError> {
        let mut blocks: Vec<JobBlock> = Vec::new();

        for line in stdout.lines() {
            let trimmed = line.trim();
            if let Some(id) = trimmed.strip_prefix("Job Id:") {
                blocks.push(JobBlock {
                    id: id.trim().to_string(),
                    ..JobBlock::default()
                });
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                continue;
            };
            let Some(block) = blocks.last_mut() else {
                return Err(TrackingError::MalformedResponse(format!(
                    "attribute outside a job block: '{}'",
                    trimmed
                )));
            };

            match key.trim() {
                "job_state" => block.state = Some(value.trim().to_string()),
                "exit_status" | "Exit_status" => {
                    let code = value.trim().parse().map_err(|_| {
                        TrackingError::MalformedResponse(format!(
                            "invalid exit status '{}' for job {}",
                            value.trim(),
                            block.id
                        ))
                    })?;
                    block.exit_status = Some(code);
                }
                _ => {}
            }
        }

        let mut map = StatusMap::new();
        for block in &blocks {
            if let Some(observation) = block.observation()? {
                map.insert(block.id.clone(), observation);
            }
        }
        Ok(map)
    }

    fn cancel_invocation(&self, id: &str) -> Invocation {
        Invocation::new("qdel").arg(id)
    }

    fn version_invocation(&self) -> Invocation {
        Invocation::new("qstat").arg("--version")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT: &str = "\
Job Id: 101.pbs-server
    Job_Name = align-1
    job_state = R
    queue = batch

Job Id: 102.pbs-server
    Job_Name = align-2
    job_state = C
    exit_status = 0

Job Id: 103.pbs-server
    job_state = C
    exit_status = 271

Job Id: 104.pbs-server
    job_state = Q

Job Id: 105.pbs-server
    job_state = F
    Exit_status = 1
";

    #[test]
    fn test_parse_submit() {
        assert_eq!(
            PbsDialect.parse_submit("4711.pbs-server\n"),
            Some("4711.pbs-server".to_string())
        );
        assert_eq!(PbsDialect.parse_submit("qsub: submit error"), None);
    }

    #[test]
    fn test_parse_status() {
        let map = PbsDialect.parse_status(QSTAT).unwrap();

        assert_eq!(map["101.pbs-server"].state, JobState::Running);
        assert_eq!(
            map["102.pbs-server"],
            StatusObservation::finished(JobState::Completed, 0)
        );
        // 256 + SIGTERM
        assert_eq!(
            map["103.pbs-server"],
            StatusObservation::finished(JobState::Aborted, 143)
        );
        assert_eq!(map["104.pbs-server"].state, JobState::Queued);
        assert_eq!(
            map["105.pbs-server"],
            StatusObservation::finished(JobState::Failed, 1)
        );
    }

    #[test]
    fn test_finished_without_exit_status_is_not_reported() {
        let map = PbsDialect
            .parse_status("Job Id: 7.srv\n    job_state = C\n")
            .unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_malformed_status() {
        assert!(matches!(
            PbsDialect.parse_status("Job Id: 7.srv\n    Job_Name = x\n"),
            Err(TrackingError::MalformedResponse(_))
        ));
        assert!(matches!(
            PbsDialect.parse_status("    job_state = R\n"),
            Err(TrackingError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_tolerated_failures() {
        assert!(PbsDialect.tolerates_status_failure("qstat: Unknown Job Id 9.srv\n"));
        assert!(PbsDialect.tolerates_status_failure(
            "qstat: 9.srv Job has finished, use -x or -H to obtain historical job information\n"
        ));
        assert!(!PbsDialect.tolerates_status_failure(
            "Connection refused\nqstat: cannot connect to server srv (errno=111)\n"
        ));
        assert!(!PbsDialect.tolerates_status_failure(""));
    }
}
