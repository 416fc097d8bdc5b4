//! Slurm submission arguments

use crate::domain::handle::{BackendKind, JobHandle};
use crate::domain::job::JobSpec;

use super::{CommandRenderer, format_hms};

/// `sbatch` arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlurmCommand {
    pub account: Option<String>,
    pub qos: Option<String>,
}

impl SlurmCommand {
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_qos(mut self, qos: impl Into<String>) -> Self {
        self.qos = Some(qos.into());
        self
    }
}

impl CommandRenderer for SlurmCommand {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    fn render(&self, spec: &JobSpec) -> Vec<String> {
        let res = &spec.resources;
        let mut tokens = vec![
            format!("--job-name={}", spec.id),
            format!("--cpus-per-task={}", res.cpus),
        ];

        if let Some(queue) = &res.queue {
            tokens.push(format!("--partition={}", queue));
        }
        if let Some(mem) = res.memory_mb {
            tokens.push(format!("--mem={}M", mem));
        }
        if let Some(walltime) = res.walltime {
            tokens.push(format!("--time={}", format_hms(walltime)));
        }
        if let Some(account) = &self.account {
            tokens.push(format!("--account={}", account));
        }
        if let Some(qos) = &self.qos {
            tokens.push(format!("--qos={}", qos));
        }
        if let Some(out) = spec.stdout_path() {
            tokens.push(format!("--output={}", out.display()));
        }

        tokens
    }

    fn render_dependencies(&self, predecessors: &[JobHandle]) -> Vec<String> {
        let ids: Vec<&str> = predecessors.iter().map(|h| h.id.as_str()).collect();
        vec![format!("--dependency=afterok:{}", ids.join(":"))]
    }

    fn label(&self) -> String {
        let mut parts = Vec::new();
        if let Some(account) = &self.account {
            parts.push(format!("account={}", account));
        }
        if let Some(qos) = &self.qos {
            parts.push(format!("qos={}", qos));
        }
        if parts.is_empty() {
            "Slurm".to_string()
        } else {
            format!("Slurm({})", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_render_request() {
        let spec = JobSpec::new("qc-9", "fastqc")
            .with_cpus(4)
            .with_memory_mb(4096)
            .with_walltime(Duration::from_secs(600))
            .with_queue("gpu")
            .with_log_dir("/scratch");
        let cmd = SlurmCommand::default().with_account("lab").with_qos("high");

        assert_eq!(
            cmd.render(&spec),
            vec![
                "--job-name=qc-9",
                "--cpus-per-task=4",
                "--partition=gpu",
                "--mem=4096M",
                "--time=00:10:00",
                "--account=lab",
                "--qos=high",
                "--output=/scratch/qc-9.out",
            ]
        );
        assert_eq!(cmd.label(), "Slurm(account=lab, qos=high)");
    }

    #[test]
    fn test_render_dependencies() {
        let deps = vec![
            JobHandle::new(BackendKind::Slurm, "100"),
            JobHandle::new(BackendKind::Slurm, "101"),
        ];
        assert_eq!(
            SlurmCommand::default().render_dependencies(&deps),
            vec!["--dependency=afterok:100:101"]
        );
    }
}
