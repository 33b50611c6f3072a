//! Playbook template compilation.
//!
//! A template body is Jinja-style text that renders to a YAML list of step
//! specifications. Compilation resolves entity-id arguments, renders the
//! body in a sandboxed environment, parses the result, and validates every
//! step — collecting all step errors instead of stopping at the first.

pub mod compiler;
pub mod spec;

pub use compiler::{entity_ref, TemplateCompiler};
pub use spec::{JobKind, ModifierSpec, StepArgument, TemplateStep};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A validation failure on one rendered step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Zero-based index of the step in the rendered list.
    pub index: usize,
    pub message: String,
}

/// Why a template failed to compile. Always surfaced to the caller, never
/// fatal to the process.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("template syntax error: {0}")]
    Syntax(String),

    #[error("undefined template variable: {0}")]
    UndefinedVariable(String),

    #[error("rendered steps are not valid YAML: {0}")]
    Parse(String),

    #[error("step validation failed: {}", format_step_errors(.0))]
    Validation(Vec<StepError>),

    #[error("missing required argument: {0}")]
    MissingArgument(String),
}

fn format_step_errors(errors: &[StepError]) -> String {
    errors
        .iter()
        .map(|e| format!("step {}: {}", e.index, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of a dry-run compile. Mirrors what a UI needs to show: the
/// rendered text, whether it validated, and every error found.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplatePreview {
    /// Rendered step list as text (empty when rendering itself failed).
    pub steps: String,
    pub valid: bool,
    /// Render/parse error, if any.
    #[serde(default)]
    pub errors: String,
    /// Per-step schema validation errors.
    #[serde(default)]
    pub steps_errors: Vec<StepError>,
}
