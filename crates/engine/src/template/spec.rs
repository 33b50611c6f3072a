//! Rendered template body grammar.
//!
//! A rendered body is a YAML list of maps. Each item names a job template
//! (`name`), a job kind (`type: c2 | socks`), and optional wiring: extra
//! arguments, delay, label/depends_on overrides, terminal-capture flags
//! (proxy jobs only), and modifier declarations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::OnErrorPolicy;
use crate::template::{CompileError, StepError};

/// Which execution backend a step's job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    C2,
    Socks,
}

/// One named argument passed to the step's job template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepArgument {
    pub name: String,
    pub value: Value,
}

/// Modifier declaration inside a template body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifierSpec {
    pub input_path: String,
    pub output_path: String,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub on_error: OnErrorPolicy,
}

/// One step specification produced by rendering a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStep {
    #[serde(rename = "type")]
    pub kind: JobKind,

    /// Target job-template name.
    pub name: String,

    #[serde(default)]
    pub args: Option<Vec<StepArgument>>,

    /// Post-dependency wait in seconds.
    #[serde(default)]
    pub delay: Option<i64>,

    /// Label override; empty string means "derive from number".
    #[serde(default)]
    pub label: Option<String>,

    /// Dependency override; empty string means "auto-chain if enabled".
    #[serde(default)]
    pub depends_on: Option<String>,

    // Terminal capture and routing flags, proxy jobs only.
    #[serde(default = "default_true")]
    pub tmate: bool,
    #[serde(default = "default_true")]
    pub asciinema: bool,
    #[serde(default = "default_true")]
    pub proxychains: bool,

    #[serde(default)]
    pub modifiers: Option<Vec<ModifierSpec>>,
}

fn default_true() -> bool {
    true
}

impl TemplateStep {
    /// Label override, with the empty string treated as unset.
    pub fn label_override(&self) -> Option<&str> {
        self.label.as_deref().filter(|s| !s.is_empty())
    }

    /// Dependency override, with the empty string treated as unset.
    pub fn depends_on_override(&self) -> Option<&str> {
        self.depends_on.as_deref().filter(|s| !s.is_empty())
    }
}

/// Parse a rendered body into step specifications.
///
/// Schema failures are collected per step so the caller can surface all of
/// them at once; only a malformed document (not a YAML list) fails whole.
pub fn parse_steps(rendered: &str) -> Result<Vec<TemplateStep>, CompileError> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(rendered).map_err(|e| CompileError::Parse(e.to_string()))?;

    let items = match doc {
        serde_yaml::Value::Sequence(items) => items,
        serde_yaml::Value::Null => Vec::new(),
        other => {
            return Err(CompileError::Parse(format!(
                "expected a list of steps, got {}",
                yaml_kind(&other)
            )))
        }
    };

    let mut steps = Vec::with_capacity(items.len());
    let mut errors = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        match serde_yaml::from_value::<TemplateStep>(item) {
            Ok(step) => {
                if let Err(message) = validate_step(&step) {
                    errors.push(StepError { index, message });
                } else {
                    steps.push(step);
                }
            }
            Err(e) => errors.push(StepError {
                index,
                message: e.to_string(),
            }),
        }
    }

    if !errors.is_empty() {
        return Err(CompileError::Validation(errors));
    }
    Ok(steps)
}

fn validate_step(step: &TemplateStep) -> Result<(), String> {
    if step.name.trim().is_empty() {
        return Err("step name must not be empty".to_string());
    }
    // Labels are free-form strings; only depends_on lists with a missing
    // entry are malformed. Unknown labels surface at graph validation.
    if let Some(depends_on) = step.depends_on_override() {
        for label in depends_on.split(',').map(str::trim) {
            if label.is_empty() {
                return Err(format!("empty label in depends_on {depends_on:?}"));
            }
        }
    }
    for modifier in step.modifiers.as_deref().unwrap_or_default() {
        if modifier.input_path.trim().is_empty() {
            return Err("modifier input_path must not be empty".to_string());
        }
        if modifier.output_path.trim().is_empty() {
            return Err("modifier output_path must not be empty".to_string());
        }
        if let Some(ref regex) = modifier.regex {
            regex::Regex::new(regex).map_err(|e| format!("invalid modifier regex: {e}"))?;
        }
    }
    Ok(())
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a list",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}
