//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading the server-list document.
///
/// Per-entry problems (bad regex, unknown server reference, malformed
/// server block) are not errors: the offender is dropped with a warning
/// and loading continues.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is not valid JSON: {0}")]
    Parse(String),

    #[error("config root must be a JSON object")]
    NotAnObject,
}
