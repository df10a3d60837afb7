//! Configuration error types.
//!
//! This module defines error types for configuration loading and validation.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::job::JobError;
use crate::core::retry::RetryError;
use crate::core::schedule::ScheduleError;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to read a specific file with context.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read a directory with context.
    #[error("failed to read directory '{path}': {source}")]
    DirReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Two job files declare the same id.
    #[error("duplicate job id '{id}' in '{path}'")]
    DuplicateJob { id: String, path: PathBuf },
}

impl From<ScheduleError> for ConfigError {
    fn from(e: ScheduleError) -> Self {
        ConfigError::InvalidConfig(format!("invalid schedule: {}", e))
    }
}

impl From<RetryError> for ConfigError {
    fn from(e: RetryError) -> Self {
        ConfigError::InvalidConfig(format!("invalid retry policy: {}", e))
    }
}

impl From<JobError> for ConfigError {
    fn from(e: JobError) -> Self {
        ConfigError::InvalidConfig(e.to_string())
    }
}
