//! Error types for the QLC core library.
//!
//! Only engine faults and rejected inputs are errors. Failures of the learner's
//! program at run time are data (`RaisedError` inside `DynamicFacts`), never
//! values of these types.

/// A syntax error in learner source. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[error("line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Rejected `GenerationConfig` values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_questions must be between 1 and {max}, got {value}")]
    MaxQuestions { value: i64, max: i64 },

    #[error("dynamic_timeout_ms must be between 1 and {max}, got {value}")]
    Timeout { value: u64, max: u64 },

    #[error("max_stack_depth must be between 1 and {max}, got {value}")]
    StackDepth { value: usize, max: usize },

    #[error("static and dynamic analysis are both disabled")]
    NothingEnabled,

    #[error("unknown selection strategy: {0}")]
    UnknownStrategy(String),
}

/// A failure inside one template's generation logic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("template {template_id} failed: {message}")]
pub struct TemplateError {
    pub template_id: String,
    pub message: String,
}

impl TemplateError {
    pub fn new(template_id: &str, message: impl Into<String>) -> Self {
        Self {
            template_id: template_id.to_string(),
            message: message.into(),
        }
    }
}

/// Top-level error enum for the QLC core library.
#[derive(Debug, thiserror::Error)]
pub enum QlcError {
    #[error("Syntax error in code: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Parser error: {0}")]
    Parser(String),

    #[error("Source too large: {size} bytes (limit {limit})")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(feature = "python")]
impl From<QlcError> for pyo3::PyErr {
    fn from(err: QlcError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyRuntimeError, PyValueError};
        match &err {
            QlcError::Syntax(_)
            | QlcError::Config(_)
            | QlcError::SourceTooLarge { .. }
            | QlcError::Json(_) => PyValueError::new_err(err.to_string()),
            QlcError::Parser(_) => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

pub type QlcResult<T> = Result<T, QlcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let err = SyntaxError::new(3, 7, "unbalanced parenthesis");
        assert_eq!(err.to_string(), "line 3, column 7: unbalanced parenthesis");
        let wrapped = QlcError::from(err);
        assert!(wrapped.to_string().starts_with("Syntax error in code: line 3"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MaxQuestions { value: 0, max: 50 };
        assert_eq!(
            err.to_string(),
            "max_questions must be between 1 and 50, got 0"
        );
    }
}
