//! Error types for the Opchain orchestration engine.

use thiserror::Error;

use crate::template::CompileError;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Referenced playbook/step/entity does not exist
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Template compile error (syntax, undefined variable, schema)
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Dependency graph inconsistency (cycle, dangling label)
    #[error("Graph consistency error: {0}")]
    GraphConsistency(String),

    /// Conflicting concurrent or out-of-order mutation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// NATS messaging error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parse error (YAML, labels, paths)
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = EngineError::NotFound("playbook 42".to_string());
        assert_eq!(err.to_string(), "Resource not found: playbook 42");
    }

    #[test]
    fn test_conflict_error() {
        let err = EngineError::Conflict("playbook already started".to_string());
        assert_eq!(err.to_string(), "Conflict: playbook already started");
    }
}
