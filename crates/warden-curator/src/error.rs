//! Error types for the curator
//!
//! Review outcomes are never errors: a failed review is a rejecting
//! [`Decision`](crate::Decision). These types cover gate construction and
//! the parser used by both the curator and the applier.

/// Errors while constructing a [`CuratorGate`](crate::CuratorGate)
#[derive(Debug, thiserror::Error)]
pub enum CuratorError {
    /// A secret pattern is not a valid regular expression
    #[error("invalid secret pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// Offending pattern
        pattern: String,
        /// Compilation error
        #[source]
        source: regex::Error,
    },
}

/// Errors while parsing Python source
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Source does not parse
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// What went wrong
        message: String,
    },

    /// Grammar could not be loaded into the parser
    #[error("python grammar unavailable: {0}")]
    Language(String),

    /// Parser returned no tree (cancelled or timed out)
    #[error("parser produced no tree")]
    NoTree,
}

impl ParseError {
    /// Create syntax error at a 1-based position
    pub fn syntax_error(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            column,
            message: message.into(),
        }
    }

    /// Whether this is a genuine syntax error rather than a parser failure
    #[must_use]
    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }
}
