//! Daemon-level error types (SPEC_FULL.md §2 Error Handling).
//!
//! Config parsing and validation are a daemon concern, not a library one —
//! `xyzconnect-protocol`'s `ProtocolError` never grows a config variant —
//! so this type lives here instead, the same split the teacher draws
//! between `kdeconnect-protocol/src/error.rs` and a daemon-local config
//! path.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

impl ConfigError {
    /// The tag used in logs, matching spec.md's Config `kind` family.
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::NotFound(_) => "not_found",
            ConfigError::Io(_) => "parse_error",
            ConfigError::ParseError(_) => "parse_error",
            ConfigError::ValidationError(_) => "validation_error",
        }
    }
}
