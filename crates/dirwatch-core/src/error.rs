//! Error types for the dirwatch-core crate.
//!
//! This module provides [`PathError`] for path parsing failures and
//! [`ConfigError`] for configuration loading and validation failures.

use std::path::PathBuf;

use camino::Utf8PathBuf;

/// Errors produced while constructing a [`WatchPath`](crate::WatchPath).
///
/// # Examples
///
/// ```
/// use dirwatch_core::{PathError, WatchPath};
///
/// let err = WatchPath::new("relative/dir").unwrap_err();
/// assert!(matches!(err, PathError::NotAbsolute(_)));
/// assert!(err.to_string().contains("relative/dir"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// The path is not absolute.
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),

    /// The path is not valid UTF-8.
    #[error("path is not valid UTF-8: {}", _0.display())]
    NonUtf8(PathBuf),

    /// A child name is empty, `.`, `..`, or contains a separator.
    #[error("invalid entry name: {0:?}")]
    InvalidName(String),
}

/// Errors that can occur during configuration loading and validation.
///
/// # Examples
///
/// ```
/// use dirwatch_core::ConfigError;
/// use camino::Utf8PathBuf;
///
/// let error = ConfigError::InvalidPath {
///     path: Utf8PathBuf::from("proc"),
///     reason: "ignored roots must be absolute".to_owned(),
/// };
/// assert!(error.to_string().contains("proc"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The provided path is invalid or malformed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The invalid path.
        path: Utf8PathBuf,
        /// Explanation of why the path is invalid.
        reason: String,
    },

    /// A configuration option has an invalid value.
    #[error("invalid configuration option '{option}': {reason}")]
    InvalidOption {
        /// The name of the invalid option.
        option: String,
        /// Explanation of why the option is invalid.
        reason: String,
    },

    /// An I/O error occurred while reading configuration.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
