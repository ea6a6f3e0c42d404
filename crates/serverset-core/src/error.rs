//! Error types shared by the serverset discovery crates.
//!
//! Configuration problems are the only failures that originate here; the
//! watch engine defines its own taxonomy in `serverset-discovery`. All errors
//! are serializable so they can be reported verbatim by the binary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using ServersetError as the error type.
pub type Result<T> = std::result::Result<T, ServersetError>;

/// Top-level error type for core operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum ServersetError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors related to configuration.
///
/// These errors occur when loading, parsing, or validating configuration files.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// No coordination-store servers configured
    #[error("No coordination-store servers configured")]
    NoServers,

    /// No serverset paths configured
    #[error("No serverset paths configured")]
    NoPaths,

    /// The same root path is configured twice
    #[error("Duplicate serverset path: {path}")]
    DuplicatePath { path: String },

    /// A root path is not an absolute store path
    #[error("Invalid serverset path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
