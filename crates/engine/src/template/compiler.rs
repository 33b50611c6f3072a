//! Sandboxed template rendering and compilation.
//!
//! Templates render with minijinja: no loader, so no filesystem access, and
//! strict undefined behavior so a missing variable is an error instead of
//! empty output. The `shuffle` filter lets templates randomize iteration
//! order when building diversified attack sequences.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};
use rand::seq::SliceRandom;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::model::{EntityKind, PlaybookTemplate};
use crate::template::spec::{self, TemplateStep};
use crate::template::{CompileError, TemplatePreview};

/// Stateless template compiler. Construct once and share; rendering is
/// side-effect-free and safe to run concurrently.
pub struct TemplateCompiler {
    env: Environment<'static>,
}

impl Default for TemplateCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateCompiler {
    /// Create a compiler with the engine's filter set.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("shuffle", filter_shuffle);
        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        Self { env }
    }

    /// Render a template body against a context map.
    pub fn render_steps(
        &self,
        body: &str,
        context: &HashMap<String, JsonValue>,
    ) -> Result<String, CompileError> {
        let tmpl = self
            .env
            .template_from_str(body)
            .map_err(|e| CompileError::Syntax(e.to_string()))?;

        tmpl.render(Value::from_serialize(context)).map_err(|e| {
            if e.kind() == ErrorKind::UndefinedError {
                CompileError::UndefinedVariable(e.to_string())
            } else {
                CompileError::Syntax(e.to_string())
            }
        })
    }

    /// Compile a template against a fully prepared context (arguments plus
    /// resolved entities and capability labels) into step specifications.
    pub fn compile(
        &self,
        template: &PlaybookTemplate,
        context: &HashMap<String, JsonValue>,
    ) -> Result<Vec<TemplateStep>, CompileError> {
        check_declared_arguments(template, context)?;
        let rendered = self.render_steps(&template.steps, context)?;
        spec::parse_steps(&rendered)
    }

    /// Dry-run compile. Identical resolution/rendering/validation, but all
    /// failures are folded into the preview instead of an error, and the
    /// caller is expected to persist nothing.
    pub fn preview(
        &self,
        template: &PlaybookTemplate,
        context: &HashMap<String, JsonValue>,
    ) -> TemplatePreview {
        if let Err(e) = check_declared_arguments(template, context) {
            return TemplatePreview {
                errors: e.to_string(),
                ..Default::default()
            };
        }

        let rendered = match self.render_steps(&template.steps, context) {
            Ok(rendered) => rendered,
            Err(e) => {
                return TemplatePreview {
                    errors: e.to_string(),
                    ..Default::default()
                }
            }
        };

        match spec::parse_steps(&rendered) {
            Ok(_) => TemplatePreview {
                steps: rendered,
                valid: true,
                ..Default::default()
            },
            Err(CompileError::Validation(steps_errors)) => TemplatePreview {
                steps: rendered,
                steps_errors,
                ..Default::default()
            },
            Err(e) => TemplatePreview {
                steps: rendered,
                errors: e.to_string(),
                ..Default::default()
            },
        }
    }
}

/// Verify every required declared argument (without a default) is present.
fn check_declared_arguments(
    template: &PlaybookTemplate,
    context: &HashMap<String, JsonValue>,
) -> Result<(), CompileError> {
    for arg in &template.args {
        if arg.required && arg.default.is_none() && !context.contains_key(&arg.name) {
            return Err(CompileError::MissingArgument(arg.name.clone()));
        }
    }
    Ok(())
}

/// Match an argument key of the form `<entity>_id<digits?>`.
///
/// Returns the entity kind and the numeric suffix, so `credential_id2`
/// resolves into the context as `credential2`. Anything else is left alone.
pub fn entity_ref(key: &str) -> Option<(EntityKind, &str)> {
    for kind in EntityKind::ALL {
        if let Some(rest) = key.strip_prefix(kind.as_str()) {
            if let Some(suffix) = rest.strip_prefix("_id") {
                if suffix.chars().all(|c| c.is_ascii_digit()) {
                    return Some((kind, suffix));
                }
            }
        }
    }
    None
}

// ============================================================================
// Filters
// ============================================================================

/// Randomize the order of a sequence.
fn filter_shuffle(value: &Value) -> Result<Vec<Value>, Error> {
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "shuffle requires a sequence"))?;
    let mut items: Vec<Value> = iter.collect();
    items.shuffle(&mut rand::thread_rng());
    Ok(items)
}

/// Base64 encode filter.
fn filter_b64encode(value: &Value) -> Result<String, Error> {
    let s = value.to_string();
    Ok(BASE64.encode(s.as_bytes()))
}

/// Base64 decode filter.
fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let s = value.to_string();
    let decoded = BASE64.decode(s.as_bytes()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64decode error: {}", e),
        )
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}
