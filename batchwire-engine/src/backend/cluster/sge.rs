//! SGE / UGE dialect: `qsub -terse`, `qstat`, `qacct`, `qdel`
//!
//! Grid Engine drops finished jobs from `qstat` immediately, so jobs missing
//! from the live listing are looked up in the accounting file with `qacct`.

use batchwire_core::domain::handle::BackendKind;
use batchwire_core::domain::job::StatusObservation;
use batchwire_core::domain::state::JobState;
use batchwire_core::error::TrackingError;

use super::SchedulerDialect;
use crate::backend::StatusMap;
use crate::process::Invocation;

#[derive(Debug, Clone, Copy, Default)]
pub struct SgeDialect;

fn live_state(code: &str) -> Option<JobState> {
    if code.contains('E') {
        return Some(JobState::Failed);
    }
    if code.contains("qw") {
        return Some(JobState::Queued);
    }
    if code.chars().any(|c| matches!(c, 'r' | 't' | 'R' | 's' | 'S' | 'T' | 'd')) {
        return Some(JobState::Running);
    }
    None
}

impl SchedulerDialect for SgeDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Sge
    }

    fn submit_invocation(&self, args: Vec<String>, script: String) -> Invocation {
        Invocation::new("qsub").arg("-terse").args(args).stdin(script)
    }

    fn parse_submit(&self, stdout: &str) -> Option<String> {
        // Array jobs answer `4711.1-10:1`
        let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
        let id = line.split('.').next()?;
        if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
            Some(id.to_string())
        } else {
            None
        }
    }

    fn status_invocation(&self, _ids: &[&str]) -> Invocation {
        // qstat cannot filter by job list; the caller picks its jobs out
        Invocation::new("qstat").args(["-u", "*"])
    }

    fn parse_status(&self, stdout: &str) -> Result<StatusMap, TrackingError> {
        let mut map = StatusMap::new();

        for line in stdout.lines().map(str::trim) {
            if line.is_empty() || line.starts_with("job-ID") || line.starts_with("---") {
                continue;
            }

            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 5 {
                return Err(TrackingError::MalformedResponse(format!(
                    "unexpected qstat line: '{}'",
                    line
                )));
            }

            let state = live_state(columns[4]).ok_or_else(|| {
                TrackingError::MalformedResponse(format!("unknown SGE state '{}'", columns[4]))
            })?;
            map.insert(columns[0].to_string(), StatusObservation::new(state));
        }

        Ok(map)
    }

    fn history_invocation(&self, id: &str) -> Option<Invocation> {
        Some(Invocation::new("qacct").args(["-j", id]))
    }

    fn parse_history(&self, stdout: &str) -> Option<StatusObservation> {
        let mut exit_status: Option<i32> = None;
        let mut failed: Option<String> = None;

        // Several records (array tasks, reruns) may be listed; the last one wins
        for line in stdout.lines() {
            let Some((key, value)) = line.trim().split_once(char::is_whitespace) else {
                continue;
            };
            match key {
                "exit_status" => {
                    exit_status = value.split_whitespace().next().and_then(|v| v.parse().ok());
                }
                "failed" => failed = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let code = exit_status?;
        let failed = failed.unwrap_or_else(|| "0".to_string());

        let observation = if failed.starts_with("100") || code == 137 {
            // failed 100 is "assumedly after job", i.e. killed by qdel
            StatusObservation::finished(JobState::Aborted, code)
        } else if failed != "0" {
            StatusObservation::finished(JobState::Failed, code)
        } else {
            StatusObservation::from_exit_code(code)
        };
        Some(observation)
    }

    fn cancel_invocation(&self, id: &str) -> Invocation {
        Invocation::new("qdel").arg(id)
    }

    fn version_invocation(&self) -> Invocation {
        Invocation::new("qstat").arg("-help")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JobSubmissionBackend;
    use crate::backend::cluster::ClusterBackend;
    use crate::process::testing::{ScriptedExecutor, fail, ok};
    use batchwire_core::domain::handle::JobHandle;
    use std::sync::Arc;
    use std::time::Duration;

    const QSTAT: &str = "\
job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
    201 0.55500 align-1    alice        r     05/02/2024 10:01:10 all.q@node01                       4
    202 0.00000 align-2    alice        qw    05/02/2024 10:01:12                                    1
    203 0.00000 align-3    alice        hqw   05/02/2024 10:01:13                                    1
    204 0.55500 align-4    alice        Eqw   05/02/2024 10:01:14                                    1
";

    const QACCT: &str = "\
==============================================================
qname        all.q
hostname     node01
jobnumber    205
failed       0
exit_status  0
";

    #[test]
    fn test_parse_submit() {
        assert_eq!(SgeDialect.parse_submit("4711\n"), Some("4711".to_string()));
        assert_eq!(SgeDialect.parse_submit("4712.1-10:1\n"), Some("4712".to_string()));
        assert_eq!(
            SgeDialect.parse_submit("Your job 4711 (\"x\") has been submitted"),
            None
        );
    }

    #[test]
    fn test_parse_status() {
        let map = SgeDialect.parse_status(QSTAT).unwrap();
        assert_eq!(map["201"].state, JobState::Running);
        assert_eq!(map["202"].state, JobState::Queued);
        assert_eq!(map["203"].state, JobState::Queued);
        assert_eq!(map["204"].state, JobState::Failed);
    }

    #[test]
    fn test_parse_history() {
        assert_eq!(
            SgeDialect.parse_history(QACCT),
            Some(StatusObservation::finished(JobState::Completed, 0))
        );
        assert_eq!(
            SgeDialect.parse_history("failed       100 : assumedly after job\nexit_status  137\n"),
            Some(StatusObservation::finished(JobState::Aborted, 137))
        );
        assert_eq!(
            SgeDialect.parse_history("failed       0\nexit_status  2\n"),
            Some(StatusObservation::finished(JobState::Failed, 2))
        );
        assert_eq!(SgeDialect.parse_history("nothing useful"), None);
    }

    #[tokio::test]
    async fn test_poll_falls_back_to_accounting() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.push(ok(QSTAT));
        executor.push(ok(QACCT));
        executor.push(fail(1, "error: job id 206 not found"));
        let backend = ClusterBackend::new(SgeDialect, executor.clone(), Duration::from_secs(5));

        let handles: Vec<JobHandle> = ["201", "205", "206"]
            .into_iter()
            .map(|id| JobHandle::new(BackendKind::Sge, id))
            .collect();
        let result = backend.poll(&handles).await.unwrap();

        assert_eq!(result["201"].state, JobState::Running);
        assert_eq!(result["205"].state, JobState::Completed);
        assert!(!result.contains_key("206"));

        let calls: Vec<String> = executor.calls().iter().map(|c| c.display()).collect();
        assert_eq!(calls, vec!["qstat -u *", "qacct -j 205", "qacct -j 206"]);
    }
}
