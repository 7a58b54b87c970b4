//! Core error types.

use std::fmt;
use thiserror::Error;

/// Errors from the rules engine core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("automaton not found: {automaton}")]
    AutomatonNotFound { automaton: String },

    #[error("state not found: {automaton} has no state '{state}'")]
    StateNotFound { automaton: String, state: String },

    #[error("invalid rule definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("bad expression '{expr}': {reason}")]
    Parse { expr: String, reason: String },

    #[error("evaluation failed: {reason}")]
    Eval { reason: String },

    #[error("expression '{expr}' did not evaluate to a boolean")]
    NotBoolean { expr: String },

    #[error("{function}: expected {expected} arguments, but got {got}")]
    Arity {
        function: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{function}: expected {expected} for argument {position}, but got {got}")]
    ArgumentType {
        function: &'static str,
        position: usize,
        expected: &'static str,
        got: String,
    },

    #[error("{function}: {reason}")]
    Function {
        function: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Compile(CompileErrors),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns an error code suitable for administrative responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::AutomatonNotFound { .. } => "AUTOMATON_NOT_FOUND",
            CoreError::StateNotFound { .. } => "STATE_NOT_FOUND",
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::Parse { .. } => "BAD_EXPRESSION",
            CoreError::Eval { .. } => "EVAL_FAILED",
            CoreError::NotBoolean { .. } => "EVAL_FAILED",
            CoreError::Arity { .. } => "BAD_ARGUMENTS",
            CoreError::ArgumentType { .. } => "BAD_ARGUMENTS",
            CoreError::Function { .. } => "FUNCTION_FAILED",
            CoreError::Compile(_) => "INVALID_RULES",
            CoreError::Yaml(_) => "INVALID_RULES",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }

    /// Returns true for errors raised while validating a rule document.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            CoreError::Parse { .. }
                | CoreError::InvalidDefinition { .. }
                | CoreError::Compile(_)
                | CoreError::Yaml(_)
        )
    }
}

/// Every error collected while compiling one rule document.
#[derive(Debug, Default)]
pub struct CompileErrors(Vec<CoreError>);

impl CompileErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: CoreError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[CoreError] {
        &self.0
    }

    /// Converts into `Err(CoreError::Compile)` when anything was collected.
    pub fn into_result(self) -> Result<(), CoreError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Compile(self))
        }
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_errors_display() {
        let mut errors = CompileErrors::new();
        assert!(errors.is_empty());

        errors.push(CoreError::Parse {
            expr: "a ==".to_string(),
            reason: "unexpected end of expression".to_string(),
        });
        errors.push(CoreError::InvalidDefinition {
            reason: "automaton 'x' has no states".to_string(),
        });

        assert_eq!(errors.len(), 2);
        let err = errors.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "bad expression 'a ==': unexpected end of expression, \
             invalid rule definition: automaton 'x' has no states"
        );
        assert_eq!(err.error_code(), "INVALID_RULES");
        assert!(err.is_compile_error());
    }

    #[test]
    fn test_empty_compile_errors_ok() {
        assert!(CompileErrors::new().into_result().is_ok());
    }
}
