//! PBS / Torque submission arguments

use crate::domain::handle::{BackendKind, JobHandle};
use crate::domain::job::JobSpec;

use super::{CommandRenderer, format_hms, push_pair};

/// `qsub` arguments for PBS Pro and Torque
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PbsCommand {
    /// Accounting string (`-A`)
    pub account: Option<String>,
    /// Additional `-l` resource entries, e.g. `gpus=1`
    pub extra_resources: Vec<String>,
}

impl PbsCommand {
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.extra_resources.push(resource.into());
        self
    }
}

impl CommandRenderer for PbsCommand {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Pbs
    }

    fn render(&self, spec: &JobSpec) -> Vec<String> {
        let mut tokens = Vec::new();
        let res = &spec.resources;

        push_pair(&mut tokens, "-N", spec.id.as_str());
        if let Some(queue) = &res.queue {
            push_pair(&mut tokens, "-q", queue.as_str());
        }
        push_pair(&mut tokens, "-l", format!("nodes=1:ppn={}", res.cpus));
        if let Some(mem) = res.memory_mb {
            push_pair(&mut tokens, "-l", format!("mem={}mb", mem));
        }
        if let Some(walltime) = res.walltime {
            push_pair(&mut tokens, "-l", format!("walltime={}", format_hms(walltime)));
        }
        for extra in &self.extra_resources {
            push_pair(&mut tokens, "-l", extra.as_str());
        }
        if let Some(account) = &self.account {
            push_pair(&mut tokens, "-A", account.as_str());
        }
        if let Some(out) = spec.stdout_path() {
            push_pair(&mut tokens, "-o", out.to_string_lossy());
            push_pair(&mut tokens, "-j", "oe");
        }

        tokens
    }

    fn render_dependencies(&self, predecessors: &[JobHandle]) -> Vec<String> {
        let ids: Vec<&str> = predecessors.iter().map(|h| h.id.as_str()).collect();
        vec!["-W".to_string(), format!("depend=afterok:{}", ids.join(":"))]
    }

    fn label(&self) -> String {
        match &self.account {
            Some(account) => format!("PBS(account={})", account),
            None => "PBS".to_string(),
        }
    }
}
