//! LSF submission arguments

use crate::domain::handle::{BackendKind, JobHandle};
use crate::domain::job::JobSpec;

use super::{CommandRenderer, format_hm, push_pair};

/// `bsub` arguments for IBM Spectrum LSF
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LsfCommand {
    /// Project (`-P`)
    pub project: Option<String>,
}

impl LsfCommand {
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

impl CommandRenderer for LsfCommand {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Lsf
    }

    fn render(&self, spec: &JobSpec) -> Vec<String> {
        let mut tokens = Vec::new();
        let res = &spec.resources;

        push_pair(&mut tokens, "-J", spec.id.as_str());
        if let Some(queue) = &res.queue {
            push_pair(&mut tokens, "-q", queue.as_str());
        }
        push_pair(&mut tokens, "-n", res.cpus.to_string());
        if let Some(mem) = res.memory_mb {
            push_pair(&mut tokens, "-R", format!("rusage[mem={}]", mem));
        }
        if let Some(walltime) = res.walltime {
            push_pair(&mut tokens, "-W", format_hm(walltime));
        }
        if let Some(project) = &self.project {
            push_pair(&mut tokens, "-P", project.as_str());
        }
        if let Some(out) = spec.stdout_path() {
            push_pair(&mut tokens, "-o", out.to_string_lossy());
        }

        tokens
    }

    fn render_dependencies(&self, predecessors: &[JobHandle]) -> Vec<String> {
        let conditions: Vec<String> = predecessors
            .iter()
            .map(|h| format!("done({})", h.id))
            .collect();
        vec!["-w".to_string(), conditions.join(" && ")]
    }

    fn label(&self) -> String {
        match &self.project {
            Some(project) => format!("LSF(project={})", project),
            None => "LSF".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_render_request() {
        let spec = JobSpec::new("merge-2", "samtools merge")
            .with_cpus(2)
            .with_memory_mb(1000)
            .with_walltime(Duration::from_secs(3 * 3600 + 30))
            .with_queue("normal")
            .with_log_dir("/logs");

        assert_eq!(
            LsfCommand::default().with_project("p1").render(&spec),
            vec![
                "-J", "merge-2", "-q", "normal", "-n", "2", "-R", "rusage[mem=1000]", "-W",
                "03:01", "-P", "p1", "-o", "/logs/merge-2.out",
            ]
        );
    }

    #[test]
    fn test_render_dependencies() {
        let deps = vec![
            JobHandle::new(BackendKind::Lsf, "5"),
            JobHandle::new(BackendKind::Lsf, "6"),
        ];
        assert_eq!(
            LsfCommand::default().render_dependencies(&deps),
            vec!["-w", "done(5) && done(6)"]
        );
    }
}
