//! Error types for flowpilot.
//!
//! Load-time errors (parse, validation, input) carry structured location
//! information that callers can surface verbatim. Executor failures never
//! leave the scheduler; they are captured in per-node state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for flowpilot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// flowpilot error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Input error: {0}")]
    Input(String),

    #[error("{0}")]
    Template(#[from] TemplateError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for machine parsing.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Input(_) => "INPUT_ERROR",
            Error::Template(_) => "TEMPLATE_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

/// Position in the YAML source, when the underlying decoder provides one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Category of a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// YAML scan/syntax failure.
    Syntax,
    /// Duplicate mapping key in the source document.
    DuplicateKey,
    /// A required key is missing.
    MissingField,
    /// A value has the wrong shape (mapping where scalar expected, etc).
    TypeMismatch,
    /// Node `type` not known and not claimed by any registered executor.
    UnknownNodeType,
    /// Unparseable duration literal.
    BadDuration,
}

impl ParseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseErrorKind::Syntax => "syntax",
            ParseErrorKind::DuplicateKey => "duplicate_key",
            ParseErrorKind::MissingField => "missing_field",
            ParseErrorKind::TypeMismatch => "type_mismatch",
            ParseErrorKind::UnknownNodeType => "unknown_node_type",
            ParseErrorKind::BadDuration => "bad_duration",
        }
    }
}

/// Malformed workflow document.
///
/// `path` is a JSON-Pointer-style path into the document
/// (e.g. `/nodes/3/depends_on/1`); `location` is the YAML source position
/// when the decoder reported one.
#[derive(Error, Debug)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub path: String,
    pub location: Option<SourceLocation>,
    pub message: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            location: None,
            message: message.into(),
        }
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error ({})", self.kind.as_str())?;
        if !self.path.is_empty() {
            write!(f, " at {}", self.path)?;
        }
        if let Some(loc) = &self.location {
            write!(f, " ({})", loc)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Structural violation in a parsed workflow.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("workflow has a dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("node '{node}' references undefined node '{target}' in {field}")]
    DanglingRef {
        node: String,
        target: String,
        field: String,
    },

    #[error("duplicate node id '{0}'")]
    DuplicateId(String),

    #[error("invalid workflow name '{0}': must match ^[a-z][a-z0-9-]*$")]
    BadName(String),

    #[error("invalid node id '{0}': must match ^[a-z][a-z0-9-]*$")]
    BadNodeId(String),

    #[error("input '{name}': {message}")]
    BadInputSpec { name: String, message: String },

    #[error("node '{node}': invalid expression in {field}: {message}")]
    Expression {
        node: String,
        field: String,
        message: String,
    },

    #[error("node '{node}': {message}")]
    Node { node: String, message: String },

    #[error("workflow must have at least one node")]
    Empty,
}

/// Failure while evaluating a `${...}` expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("syntax error in expression '{expr}': {message}")]
    Syntax { expr: String, message: String },

    #[error("unknown reference '{path}'")]
    MissingReference { path: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("cannot interpolate structured value '{expr}' into a string")]
    StructuredInterpolation { expr: String },
}

impl TemplateError {
    pub fn syntax(expr: &str, message: impl Into<String>) -> Self {
        TemplateError::Syntax {
            expr: expr.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new(
            ParseErrorKind::TypeMismatch,
            "/nodes/3/depends_on/1",
            "expected a string",
        )
        .with_location(SourceLocation { line: 12, column: 5 });

        let msg = err.to_string();
        assert!(msg.contains("/nodes/3/depends_on/1"));
        assert!(msg.contains("line 12, column 5"));
        assert!(msg.contains("expected a string"));
    }

    #[test]
    fn test_cycle_error_reports_path() {
        let err = ValidationError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "workflow has a dependency cycle: a -> b -> a"
        );
    }

    #[test]
    fn test_error_codes() {
        let err: Error = ValidationError::Empty.into();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err: Error = TemplateError::MissingReference {
            path: "inputs.x".into(),
        }
        .into();
        assert_eq!(err.code(), "TEMPLATE_ERROR");
    }
}
