//! SGE / UGE submission arguments

use crate::domain::handle::{BackendKind, JobHandle};
use crate::domain::job::JobSpec;

use super::{CommandRenderer, format_hms, push_pair};

/// `qsub` arguments for Sun/Univa Grid Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgeCommand {
    /// Parallel environment used for multi-slot jobs (`-pe <name> N`)
    pub parallel_environment: String,
    /// Project (`-P`)
    pub project: Option<String>,
}

impl Default for SgeCommand {
    fn default() -> Self {
        Self {
            parallel_environment: "smp".to_string(),
            project: None,
        }
    }
}

impl SgeCommand {
    pub fn with_parallel_environment(mut self, pe: impl Into<String>) -> Self {
        self.parallel_environment = pe.into();
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

impl CommandRenderer for SgeCommand {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Sge
    }

    fn render(&self, spec: &JobSpec) -> Vec<String> {
        let mut tokens = Vec::new();
        let res = &spec.resources;

        push_pair(&mut tokens, "-N", spec.id.as_str());
        if let Some(queue) = &res.queue {
            push_pair(&mut tokens, "-q", queue.as_str());
        }
        if res.cpus > 1 {
            tokens.push("-pe".to_string());
            tokens.push(self.parallel_environment.clone());
            tokens.push(res.cpus.to_string());
        }
        if let Some(mem) = res.memory_mb {
            push_pair(&mut tokens, "-l", format!("h_vmem={}M", mem));
        }
        if let Some(walltime) = res.walltime {
            push_pair(&mut tokens, "-l", format!("h_rt={}", format_hms(walltime)));
        }
        if let Some(project) = &self.project {
            push_pair(&mut tokens, "-P", project.as_str());
        }
        if let Some(out) = spec.stdout_path() {
            push_pair(&mut tokens, "-o", out.to_string_lossy());
            push_pair(&mut tokens, "-j", "y");
        }

        tokens
    }

    fn render_dependencies(&self, predecessors: &[JobHandle]) -> Vec<String> {
        let ids: Vec<&str> = predecessors.iter().map(|h| h.id.as_str()).collect();
        vec!["-hold_jid".to_string(), ids.join(",")]
    }

    fn label(&self) -> String {
        format!("SGE(pe={})", self.parallel_environment)
    }
}
