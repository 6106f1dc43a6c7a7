//! Error types for the rules crate.

/// Errors raised while compiling or running rules.
///
/// Compile-time variants abort loading of the whole DSL source; everything
/// raised during evaluation is logged by the engine and degraded to a no-op.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("line {line}: no WITH <dbType> <dbConnection> DO binding before rule definitions")]
    MissingDbBinding { line: usize },

    #[error("line {line}: malformed WITH clause: {message}")]
    MalformedWith { line: usize, message: String },

    #[error("line {line}: malformed IF clause: {message}")]
    MalformedIf { line: usize, message: String },

    #[error("line {line}: rule is missing THEN")]
    MissingThen { line: usize },

    #[error("unterminated quote starting at offset {offset}")]
    UnterminatedQuote { offset: usize },

    #[error("unbalanced '{delimiter}' at offset {offset}")]
    UnbalancedParen { delimiter: char, offset: usize },

    #[error("line {line}: invalid update action: {message}")]
    InvalidUpdate { line: usize, message: String },

    #[error("line {line}: unknown entity '{entity}'")]
    UnknownEntity { line: usize, entity: String },

    #[error("line {line}: unknown action '{action}'")]
    UnknownAction { line: usize, action: String },

    #[error("action name '{name}' is reserved")]
    ReservedAction { name: String },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RuleError {
    /// Attach a source line to scanner, condition and expression errors.
    pub(crate) fn at_line(self, line: usize) -> Self {
        match self {
            Self::UnterminatedQuote { offset } => {
                Self::Parse(format!("line {line}: unterminated quote at offset {offset}"))
            }
            Self::UnbalancedParen { delimiter, offset } => Self::Parse(format!(
                "line {line}: unbalanced '{delimiter}' at offset {offset}"
            )),
            Self::Expression(message) | Self::Parse(message) => {
                Self::Parse(format!("line {line}: {message}"))
            }
            other => other,
        }
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(e: serde_json::Error) -> Self {
        RuleError::Serialization(e.to_string())
    }
}

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Error returned by an action handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    /// The handler deliberately rejects the record; processing of the record stops.
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The handler failed; the failure is logged and the next action runs.
    #[error("action failed: {0}")]
    Failed(String),
}

impl ActionError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
