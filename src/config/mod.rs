//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for jobs and global settings.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::{JobConfigBuilder, load_jobs_from_directory, load_jobs_from_directory_with};
pub use error::ConfigError;
pub use types::{
    BackoffConfig, BackoffStrategyConfig, GlobalConfig, JobConfig, RetryConfig, ScheduleConfig,
    StorageConfig, UrlConfig,
};
pub use yaml::YamlLoader;
