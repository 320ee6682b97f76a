//! Parse errors.

use thiserror::Error;

/// Errors produced when parsing schema values from their textual form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A `group:name` coordinate is malformed.
    #[error("Invalid coordinate '{input}': {reason}")]
    Coordinate {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A version string contains no usable parts.
    #[error("Invalid version '{0}'")]
    Version(String),

    /// A version constraint could not be parsed.
    #[error("Invalid version constraint '{input}': {reason}")]
    Constraint {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An exclusion rule could not be parsed.
    #[error("Invalid exclusion '{input}': {reason}")]
    Exclusion {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An artifact classifier or extension is not a safe file name part.
    #[error("Invalid artifact {field} '{input}': {reason}")]
    Artifact {
        /// `classifier` or `extension`.
        field: &'static str,
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A digest string has an unknown algorithm or bad hex.
    #[error("Invalid digest '{input}': {reason}")]
    Digest {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
}
