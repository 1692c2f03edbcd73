//! Error handling for the PLC mirror
//!
//! Build-time errors (`Address`, `DuplicateName`, `Parse`, `Config`) abort context
//! construction. Runtime errors on direct calls are returned to the caller; errors
//! inside a polling cycle are logged by the scheduler and never escape the task.

use thiserror::Error;

use crate::transport::TransportError;

/// PLC mirror error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlcError {
    /// Descriptor out of bounds or malformed address
    #[error("Address error: {0}")]
    Address(String),

    /// Alias or variable name collision at registry build time
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    /// Write to a read-only variable without `force`
    #[error("Read-only violation: {0}")]
    ReadOnlyViolation(String),

    /// Transport call failed after the retry policy was exhausted
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A read completed after its polling group was asked to stop
    #[error("Stale data discarded: {0}")]
    StaleData(String),

    /// Lookup of a name that the registry does not know
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// Value variant does not fit the variable kind
    #[error("Type mismatch for {name}: expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Numeric value wider than the variable
    #[error("Value out of range for {name}: {value} exceeds {max}")]
    ValueOutOfRange { name: String, value: u64, max: u64 },

    /// Polling group registration and removal errors
    #[error("Polling group error: {0}")]
    PollingGroup(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Declaration file parse errors
    #[error("Parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Result type alias for the PLC mirror
pub type Result<T> = std::result::Result<T, PlcError>;

impl PlcError {
    pub fn address(msg: impl Into<String>) -> Self {
        PlcError::Address(msg.into())
    }

    pub fn duplicate_name(name: impl Into<String>) -> Self {
        PlcError::DuplicateName(name.into())
    }

    pub fn read_only(name: impl Into<String>) -> Self {
        PlcError::ReadOnlyViolation(name.into())
    }

    pub fn unknown_variable(name: impl Into<String>) -> Self {
        PlcError::UnknownVariable(name.into())
    }

    pub fn polling(msg: impl Into<String>) -> Self {
        PlcError::PollingGroup(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        PlcError::Config(msg.into())
    }

    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        PlcError::Parse {
            line,
            reason: reason.into(),
        }
    }

    pub fn type_mismatch(
        name: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        PlcError::TypeMismatch {
            name: name.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the error is fatal for context construction
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            PlcError::Address(_)
                | PlcError::DuplicateName(_)
                | PlcError::Parse { .. }
                | PlcError::Config(_)
        )
    }
}
