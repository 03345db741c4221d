//! Error types for the simulator
//!
//! Defines a unified error type that can represent errors from all
//! components. Expected conditions such as lock waits, deadlock victims and
//! commit-time aborts are not errors; they flow through the coordinator's
//! normal control flow and the run continues.

use std::fmt;
use std::io;

/// Unified error type for simulator operations
#[derive(Debug)]
pub enum ReplikvError {
    /// I/O error (script file operations)
    Io(io::Error),
    /// Malformed script line
    Parse(String),
    /// Lock table misuse (lookup on a variable with no lock entry)
    Lock(String),
    /// Transaction bookkeeping error (unknown id, duplicate begin)
    Transaction(String),
    /// Generic internal error
    Internal(String),
}

impl ReplikvError {
    /// Parse error carrying the offending line number.
    pub fn parse_at(line: usize, msg: impl fmt::Display) -> Self {
        ReplikvError::Parse(format!("Error in line {}: {}", line, msg))
    }

    /// Arity error for a script operation.
    /// Matches the driver contract: the message names the operation and line.
    pub fn arity(line: usize, op: &str, expected: usize) -> Self {
        ReplikvError::Parse(format!(
            "Error in line {}: operation {} requires exactly {} argument(s)",
            line, op, expected
        ))
    }

    /// Error for an operation on a transaction the coordinator does not know.
    pub fn unknown_transaction(id: impl fmt::Display) -> Self {
        ReplikvError::Transaction(format!("Transaction T{} does not exist", id))
    }
}

impl fmt::Display for ReplikvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplikvError::Io(e) => write!(f, "{}", e),
            ReplikvError::Parse(msg) => write!(f, "{}", msg),
            ReplikvError::Lock(msg) => write!(f, "{}", msg),
            ReplikvError::Transaction(msg) => write!(f, "{}", msg),
            ReplikvError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ReplikvError {}

impl From<io::Error> for ReplikvError {
    fn from(e: io::Error) -> Self {
        ReplikvError::Io(e)
    }
}

/// Result type alias for simulator operations
pub type Result<T> = std::result::Result<T, ReplikvError>;
