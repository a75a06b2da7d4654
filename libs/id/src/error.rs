//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating resource names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The name string is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name exceeds the provider's length limit.
    #[error("name too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    /// The name is missing the required prefix.
    #[error("name missing prefix: expected '{expected}', got '{actual}'")]
    MissingPrefix { expected: &'static str, actual: String },

    /// The name contains a character the provider rejects.
    #[error("invalid character {ch:?} in name '{name}'")]
    InvalidCharacter { ch: char, name: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::MissingPrefix { .. })
    }
}
