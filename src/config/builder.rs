//! Job builder from YAML configuration.
//!
//! This module converts JobConfig into JobDefinitions backed by a
//! CommandHandler or a UrlHandler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::job::{JobDefinition, JobHandler};
use crate::core::retry::RetryPolicy;
use crate::core::schedule::{RecurrenceRule, parse_duration};
use crate::execution::{CommandHandler, UrlHandler};

use super::error::ConfigError;
use super::types::{
    BackoffStrategyConfig, GlobalConfig, JobConfig, RetryConfig, ScheduleConfig, UrlConfig,
};
use super::yaml::YamlLoader;

const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Builder for creating JobDefinitions from YAML configuration.
pub struct JobConfigBuilder;

impl JobConfigBuilder {
    /// Build a JobDefinition from a JobConfig.
    pub fn build(config: JobConfig) -> Result<JobDefinition, ConfigError> {
        Self::build_with(config, &GlobalConfig::default())
    }

    /// Build a JobDefinition, filling unset fields from global defaults.
    pub fn build_with(
        config: JobConfig,
        defaults: &GlobalConfig,
    ) -> Result<JobDefinition, ConfigError> {
        let rule = Self::build_rule(&config.schedule, defaults.default_timezone.as_deref())?;

        let handler = Self::build_handler(&config)?;

        let mut job = JobDefinition::new(config.id.as_str(), rule, handler)
            .with_overlap(config.overlap)
            .with_environments(&config.environments)
            .with_enabled(config.enabled);

        if let Some(name) = &config.name {
            job = job.with_name(name);
        }
        if let Some(description) = &config.description {
            job = job.with_description(description);
        }
        if let Some(secs) = config.timeout_secs {
            job = job.with_max_duration(Duration::from_secs(secs));
        }
        if let Some(retry) = config.retry.as_ref().or(defaults.default_retry.as_ref()) {
            job = job.with_retry(Self::build_retry_policy(retry)?);
        }
        for dep in &config.depends_on {
            job = job.depends_on(dep.as_str());
        }

        job.validate()?;
        Ok(job)
    }

    /// Build the command or HTTP handler the job runs.
    fn build_handler(config: &JobConfig) -> Result<Arc<dyn JobHandler>, ConfigError> {
        match (&config.command, &config.url) {
            (Some(command), None) => {
                let mut handler = CommandHandler::builder(command)
                    .args(&config.args)
                    .envs(&config.env);
                if let Some(dir) = &config.working_dir {
                    handler = handler.working_dir(dir);
                }
                Ok(Arc::new(handler.build()))
            }
            (None, Some(url)) => {
                let mut handler = UrlHandler::builder(url.endpoint());
                if let UrlConfig::Request {
                    method,
                    headers,
                    body,
                    ..
                } = url
                {
                    if let Some(method) = method {
                        handler = handler.method(method);
                    }
                    handler = handler.headers(headers);
                    if let Some(body) = body {
                        handler = handler.body(body);
                    }
                }
                if let Some(secs) = config.timeout_secs {
                    handler = handler.timeout(Duration::from_secs(secs));
                }
                Ok(Arc::new(handler.build()?))
            }
            _ => Err(ConfigError::InvalidConfig(format!(
                "job '{}' must set exactly one of command and url",
                config.id
            ))),
        }
    }

    /// Build a RecurrenceRule from ScheduleConfig.
    fn build_rule(
        config: &ScheduleConfig,
        default_timezone: Option<&str>,
    ) -> Result<RecurrenceRule, ConfigError> {
        let tz = config.timezone().or(default_timezone).unwrap_or("UTC");
        let rule = match config {
            ScheduleConfig::Simple(expr) => RecurrenceRule::parse_in(expr, tz)?,
            ScheduleConfig::Cron { cron, .. } => RecurrenceRule::parse_in(cron, tz)?,
            ScheduleConfig::Interval { every, align } => {
                let every = parse_duration(every)?;
                match align {
                    Some(align) => RecurrenceRule::aligned(every, parse_duration(align)?),
                    None => RecurrenceRule::every(every),
                }
            }
            ScheduleConfig::Once { at } => RecurrenceRule::once(*at),
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Build a RetryPolicy from RetryConfig.
    fn build_retry_policy(config: &RetryConfig) -> Result<RetryPolicy, ConfigError> {
        let mut policy = match &config.backoff {
            None => RetryPolicy {
                max_attempts: config.max_attempts,
                ..RetryPolicy::none()
            },
            Some(backoff) => {
                let base = Duration::from_secs(backoff.base_secs);
                match backoff.strategy {
                    BackoffStrategyConfig::None => RetryPolicy {
                        max_attempts: config.max_attempts,
                        ..RetryPolicy::none()
                    },
                    BackoffStrategyConfig::Fixed => RetryPolicy::fixed(config.max_attempts, base),
                    BackoffStrategyConfig::Exponential => {
                        let mut policy = RetryPolicy::exponential(
                            config.max_attempts,
                            base,
                            backoff.multiplier.unwrap_or(DEFAULT_MULTIPLIER),
                        );
                        if let Some(max) = backoff.max_delay_secs {
                            policy = policy.with_max_delay(Duration::from_secs(max));
                        }
                        if backoff.jitter {
                            policy = policy.with_jitter();
                        }
                        policy
                    }
                }
            }
        };
        policy = policy.with_condition(config.condition);
        policy.validate()?;
        Ok(policy)
    }
}

/// Load all job configurations from a directory.
pub fn load_jobs_from_directory(dir: impl AsRef<Path>) -> Result<Vec<JobDefinition>, ConfigError> {
    load_jobs_from_directory_with(dir, &GlobalConfig::default())
}

/// Load all job configurations from a directory, applying global defaults.
///
/// Files are read in name order. The result lists every job after the jobs
/// it depends on, so it can be registered front to back.
pub fn load_jobs_from_directory_with(
    dir: impl AsRef<Path>,
    defaults: &GlobalConfig,
) -> Result<Vec<JobDefinition>, ConfigError> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let dir_error = |source| ConfigError::DirReadError {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(dir_error)? {
        let path = entry.map_err(dir_error)?.path();

        // Only process .yaml and .yml files
        if let Some(ext) = path.extension()
            && (ext == "yaml" || ext == "yml")
        {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        let config = YamlLoader::load_job_config(&path)?;
        if seen.contains_key(&config.id) {
            return Err(ConfigError::DuplicateJob {
                id: config.id,
                path,
            });
        }
        seen.insert(config.id.clone(), path);
        configs.push(config);
    }

    YamlLoader::order_by_dependencies(configs)?
        .into_iter()
        .map(|config| JobConfigBuilder::build_with(config, defaults))
        .collect()
}
