//! Step modifier evaluation.
//!
//! A modifier moves data between steps: once the upstream step named by
//! `input_path` has produced output, the pipeline extracts a value from it
//! (optionally refined by a regex) and records the value under `output_path`
//! for the owning step's argument resolution. Evaluation never panics and
//! never fails the owning step directly; the outcome says whether the
//! configured policy blocks the step.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use crate::model::{OnErrorPolicy, Status, StepModifier};

/// Recorded result of one modifier evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierOutcome {
    pub status: Status,
    pub message: Option<String>,
    pub data: Option<String>,
    /// True only when extraction failed under the `abort` policy; the
    /// caller must not start the owning step.
    pub block_step: bool,
}

impl ModifierOutcome {
    fn success(data: String) -> Self {
        Self {
            status: Status::Completed,
            message: None,
            data: Some(data),
            block_step: false,
        }
    }

    fn failure(modifier: &StepModifier, message: String) -> Self {
        warn!(
            input_path = %modifier.input_path,
            policy = ?modifier.on_error,
            "modifier extraction failed: {message}"
        );
        match modifier.on_error {
            OnErrorPolicy::Abort => Self {
                status: Status::Error,
                message: Some(message),
                data: None,
                block_step: true,
            },
            // Proceed with an empty value as if nothing was extracted.
            OnErrorPolicy::Continue => Self {
                status: Status::Completed,
                message: Some(message),
                data: Some(String::new()),
                block_step: false,
            },
            OnErrorPolicy::Warn => Self {
                status: Status::Error,
                message: Some(message),
                data: None,
                block_step: false,
            },
        }
    }
}

/// Evaluate one modifier against the collected upstream outputs, keyed by
/// step label.
pub fn apply(modifier: &StepModifier, outputs: &HashMap<String, String>) -> ModifierOutcome {
    let (label, path) = match modifier.input_path.split_once('.') {
        Some((label, path)) => (label, Some(path)),
        None => (modifier.input_path.as_str(), None),
    };

    let output = match outputs.get(label) {
        Some(output) => output,
        None => {
            return ModifierOutcome::failure(
                modifier,
                format!("no output recorded for step {label:?}"),
            )
        }
    };

    let located = match path {
        Some(path) => match locate(output, path) {
            Ok(located) => located,
            Err(message) => return ModifierOutcome::failure(modifier, message),
        },
        None => output.clone(),
    };

    match modifier.regex.as_deref() {
        Some(pattern) => match refine(pattern, &located) {
            Ok(refined) => ModifierOutcome::success(refined),
            Err(message) => ModifierOutcome::failure(modifier, message),
        },
        None => ModifierOutcome::success(located),
    }
}

/// Walk a dot path into the JSON form of an upstream output.
fn locate(output: &str, path: &str) -> Result<String, String> {
    let root: Value = serde_json::from_str(output)
        .map_err(|e| format!("output is not JSON but a path was given: {e}"))?;

    let mut current = &root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| format!("path segment {segment:?} not found"))?,
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| format!("path segment {segment:?} is not an array index"))?;
                items
                    .get(index)
                    .ok_or_else(|| format!("index {index} out of bounds"))?
            }
            other => {
                return Err(format!(
                    "cannot descend into {} at segment {segment:?}",
                    json_kind(other)
                ))
            }
        };
    }

    Ok(match current {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Apply the regex refinement: first capture group when the pattern has
/// one, whole match otherwise.
fn refine(pattern: &str, text: &str) -> Result<String, String> {
    let regex = Regex::new(pattern).map_err(|e| format!("invalid regex: {e}"))?;
    let captures = regex
        .captures(text)
        .ok_or_else(|| format!("regex {pattern:?} did not match"))?;
    let matched = captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Ok(matched)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
