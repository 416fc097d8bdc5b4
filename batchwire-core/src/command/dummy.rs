//! Dummy processing command
//!
//! Stands in for any real backend when exercising the submission pipeline:
//! it renders a fixed descriptive label and never touches a scheduler.

use std::fmt;

use crate::domain::handle::{BackendKind, JobHandle};
use crate::domain::job::JobSpec;

use super::CommandRenderer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyCommand {
    text: String,
}

impl DummyCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for DummyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dummy: {}", self.text)
    }
}

impl CommandRenderer for DummyCommand {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Dummy
    }

    fn render(&self, _spec: &JobSpec) -> Vec<String> {
        vec![self.to_string()]
    }

    fn render_dependencies(&self, predecessors: &[JobHandle]) -> Vec<String> {
        let ids: Vec<&str> = predecessors.iter().map(|h| h.id.as_str()).collect();
        vec![format!("after:{}", ids.join(","))]
    }

    fn label(&self) -> String {
        self.to_string()
    }
}
