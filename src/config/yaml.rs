//! YAML configuration parsing.
//!
//! Parses job definitions and global configuration from YAML files.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use super::error::ConfigError;
use super::types::{GlobalConfig, JobConfig};

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load global configuration from a file.
    pub fn load_global_config(path: impl AsRef<Path>) -> Result<GlobalConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            }
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse global configuration from a YAML string.
    pub fn parse_global_config(yaml: &str) -> Result<GlobalConfig, ConfigError> {
        let config: GlobalConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load a job configuration from a file.
    pub fn load_job_config(path: impl AsRef<Path>) -> Result<JobConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let config: JobConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_job_config(&config)?;
        Ok(config)
    }

    /// Parse a job configuration from a YAML string.
    pub fn parse_job_config(yaml: &str) -> Result<JobConfig, ConfigError> {
        let config: JobConfig = serde_yaml::from_str(yaml)?;
        Self::validate_job_config(&config)?;
        Ok(config)
    }

    /// Validate a job configuration.
    fn validate_job_config(config: &JobConfig) -> Result<(), ConfigError> {
        if config.id.trim().is_empty() {
            return Err(ConfigError::MissingField("id".into()));
        }

        match (&config.command, &config.url) {
            (Some(command), None) if command.trim().is_empty() => {
                return Err(ConfigError::MissingField("command".into()));
            }
            (None, Some(url)) if url.endpoint().trim().is_empty() => {
                return Err(ConfigError::MissingField("url".into()));
            }
            (None, None) => {
                return Err(ConfigError::MissingField("command".into()));
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "job '{}' sets both command and url",
                    config.id
                )));
            }
            _ => {}
        }

        if config.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "timeout_secs cannot be zero".into(),
            ));
        }

        if let Some(retry) = &config.retry
            && retry.max_attempts == 0
        {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        let mut seen_deps = HashSet::new();
        for dep in &config.depends_on {
            if dep == &config.id {
                return Err(ConfigError::InvalidConfig(format!(
                    "job '{}' cannot depend on itself",
                    config.id
                )));
            }
            if !seen_deps.insert(dep) {
                return Err(ConfigError::InvalidConfig(format!(
                    "job '{}' has duplicate dependency '{}'",
                    config.id, dep
                )));
            }
        }

        if config.environments.iter().any(|e| e.trim().is_empty()) {
            return Err(ConfigError::InvalidConfig(format!(
                "job '{}' lists an empty environment name",
                config.id
            )));
        }

        Ok(())
    }

    /// Order jobs so every job comes after the jobs it depends on.
    ///
    /// Fails on dependencies that name no loaded job and on dependency cycles.
    /// Jobs with no ordering constraint between them keep their input order.
    pub fn order_by_dependencies(configs: Vec<JobConfig>) -> Result<Vec<JobConfig>, ConfigError> {
        let ids: HashSet<&str> = configs.iter().map(|c| c.id.as_str()).collect();
        for config in &configs {
            for dep in &config.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "job '{}' depends on unknown job '{}'",
                        config.id, dep
                    )));
                }
            }
        }

        let position: HashMap<&str, usize> = configs
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        // Kahn's algorithm over indices into `configs`.
        let mut in_degree: Vec<usize> = configs.iter().map(|c| c.depends_on.len()).collect();
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); configs.len()];
        for (i, config) in configs.iter().enumerate() {
            for dep in &config.depends_on {
                downstream[position[dep.as_str()]].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..configs.len())
            .filter(|i| in_degree[*i] == 0)
            .collect();
        let mut order = Vec::with_capacity(configs.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &downstream[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != configs.len() {
            let cycle_jobs: Vec<&str> = configs
                .iter()
                .zip(&in_degree)
                .filter(|(_, degree)| **degree > 0)
                .map(|(c, _)| c.id.as_str())
                .collect();

            return Err(ConfigError::InvalidConfig(format!(
                "dependency cycle detected involving jobs: {}",
                cycle_jobs.join(", ")
            )));
        }

        let mut slots: Vec<Option<JobConfig>> = configs.into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{BackoffStrategyConfig, ScheduleConfig, StorageConfig, UrlConfig};
    use crate::core::job::OverlapPolicy;
    use crate::core::retry::RetryCondition;
    use crate::scheduler::MissedTickPolicy;

    fn job(id: &str, deps: &[&str]) -> JobConfig {
        let yaml = format!(
            "id: {}\nschedule: \"@hourly\"\ncommand: \"true\"\ndepends_on: [{}]\n",
            id,
            deps.join(", ")
        );
        YamlLoader::parse_job_config(&yaml).unwrap()
    }

    fn ids(configs: &[JobConfig]) -> Vec<&str> {
        configs.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_parse_minimal_job_yaml() {
        let yaml = r#"
id: minimal_job
schedule: "*/5 * * * *"
command: echo
args: ["hello"]
"#;
        let config = YamlLoader::parse_job_config(yaml).unwrap();
        assert_eq!(config.id, "minimal_job");
        assert!(config.name.is_none());
        assert_eq!(config.command.as_deref(), Some("echo"));
        assert!(config.url.is_none());
        assert_eq!(config.args, vec!["hello"]);
        assert_eq!(config.overlap, OverlapPolicy::Skip);
        assert!(config.enabled);
    }

    #[test]
    fn test_parse_job_with_all_fields() {
        let yaml = r#"
id: nightly_report
name: Nightly Report
description: Builds the nightly report
schedule:
  cron: "0 2 * * *"
  timezone: Europe/Berlin
command: ./report.sh
args: ["--full"]
working_dir: /srv/reports
env:
  REPORT_DIR: /tmp/reports
timeout_secs: 900
retry:
  max_attempts: 3
  backoff:
    strategy: exponential
    base_secs: 5
    multiplier: 2.0
    max_delay_secs: 60
    jitter: true
  condition: transient_only
overlap: queue
depends_on: [ingest]
environments: [prod, staging]
enabled: false
"#;
        let config = YamlLoader::parse_job_config(yaml).unwrap();
        assert_eq!(config.name.as_deref(), Some("Nightly Report"));
        assert_eq!(config.schedule.timezone(), Some("Europe/Berlin"));
        assert_eq!(config.working_dir.as_deref(), Some("/srv/reports"));
        assert_eq!(config.env.get("REPORT_DIR").map(String::as_str), Some("/tmp/reports"));
        assert_eq!(config.timeout_secs, Some(900));
        assert_eq!(config.overlap, OverlapPolicy::Queue);
        assert_eq!(config.depends_on, vec!["ingest"]);
        assert_eq!(config.environments, vec!["prod", "staging"]);
        assert!(!config.enabled);

        let retry = config.retry.unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.condition, RetryCondition::TransientOnly);
        let backoff = retry.backoff.unwrap();
        assert_eq!(backoff.strategy, BackoffStrategyConfig::Exponential);
        assert_eq!(backoff.base_secs, 5);
        assert_eq!(backoff.multiplier, Some(2.0));
        assert_eq!(backoff.max_delay_secs, Some(60));
        assert!(backoff.jitter);
    }

    #[test]
    fn test_parse_schedule_variants() {
        let every = YamlLoader::parse_job_config(
            "id: a\ncommand: x\nschedule:\n  every: 15m\n  align: 1h\n",
        )
        .unwrap();
        assert!(matches!(
            every.schedule,
            ScheduleConfig::Interval { ref every, align: Some(ref align) }
                if every == "15m" && align == "1h"
        ));

        let once = YamlLoader::parse_job_config(
            "id: b\ncommand: x\nschedule:\n  at: \"2030-01-01T00:00:00Z\"\n",
        )
        .unwrap();
        assert!(matches!(once.schedule, ScheduleConfig::Once { .. }));

        let simple =
            YamlLoader::parse_job_config("id: c\ncommand: x\nschedule: \"@daily\"\n").unwrap();
        assert!(matches!(simple.schedule, ScheduleConfig::Simple(ref s) if s == "@daily"));
        assert!(simple.schedule.timezone().is_none());
    }

    #[test]
    fn test_validation_error_missing_id() {
        let result = YamlLoader::parse_job_config("id: \"\"\nschedule: \"@daily\"\ncommand: x\n");
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "id"));
    }

    #[test]
    fn test_validation_error_missing_command() {
        let result = YamlLoader::parse_job_config("id: a\nschedule: \"@daily\"\ncommand: \" \"\n");
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "command"));
    }

    #[test]
    fn test_url_job_forms() {
        let simple = YamlLoader::parse_job_config(
            "id: ping\nschedule: \"@hourly\"\nurl: https://status.example.com/ping\n",
        )
        .unwrap();
        assert!(simple.command.is_none());
        assert!(matches!(simple.url, Some(UrlConfig::Simple(ref u)) if u == "https://status.example.com/ping"));

        let yaml = r#"
id: warm_cache
schedule: "*/10 * * * *"
url:
  endpoint: https://app.example.com/cache/warm
  method: POST
  headers:
    authorization: Bearer abc
  body: '{"scope":"all"}'
"#;
        let config = YamlLoader::parse_job_config(yaml).unwrap();
        match config.url {
            Some(UrlConfig::Request {
                endpoint,
                method,
                headers,
                body,
            }) => {
                assert_eq!(endpoint, "https://app.example.com/cache/warm");
                assert_eq!(method.as_deref(), Some("POST"));
                assert_eq!(headers["authorization"], "Bearer abc");
                assert_eq!(body.as_deref(), Some("{\"scope\":\"all\"}"));
            }
            other => panic!("expected request form, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_requires_one_action() {
        let neither = YamlLoader::parse_job_config("id: a\nschedule: \"@daily\"\n");
        assert!(matches!(neither, Err(ConfigError::MissingField(f)) if f == "command"));

        let both = YamlLoader::parse_job_config(
            "id: a\nschedule: \"@daily\"\ncommand: x\nurl: http://localhost/\n",
        );
        assert!(matches!(both, Err(ConfigError::InvalidConfig(_))));

        let blank = YamlLoader::parse_job_config("id: a\nschedule: \"@daily\"\nurl: \" \"\n");
        assert!(matches!(blank, Err(ConfigError::MissingField(f)) if f == "url"));
    }

    #[test]
    fn test_validation_error_missing_schedule() {
        let result = YamlLoader::parse_job_config("id: a\ncommand: x\n");
        assert!(matches!(result, Err(ConfigError::YamlError(_))));
    }

    #[test]
    fn test_validation_error_zero_timeout() {
        let result = YamlLoader::parse_job_config(
            "id: a\nschedule: \"@daily\"\ncommand: x\ntimeout_secs: 0\n",
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_error_zero_attempts() {
        let result = YamlLoader::parse_job_config(
            "id: a\nschedule: \"@daily\"\ncommand: x\nretry:\n  max_attempts: 0\n",
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_error_self_dependency() {
        let result = YamlLoader::parse_job_config(
            "id: a\nschedule: \"@daily\"\ncommand: x\ndepends_on: [a]\n",
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("cannot depend on itself")
        ));
    }

    #[test]
    fn test_validation_error_duplicate_dependency() {
        let result = YamlLoader::parse_job_config(
            "id: a\nschedule: \"@daily\"\ncommand: x\ndepends_on: [b, b]\n",
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("duplicate dependency")
        ));
    }

    #[test]
    fn test_validation_error_blank_environment() {
        let result = YamlLoader::parse_job_config(
            "id: a\nschedule: \"@daily\"\ncommand: x\nenvironments: [\"\"]\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_global_config() {
        let yaml = r#"
tick_interval_secs: 2
missed_ticks: catch_up
shutdown_grace_secs: 10
environment: staging
default_timezone: America/New_York
default_retry:
  max_attempts: 2
  backoff:
    strategy: fixed
    base_secs: 30
storage:
  type: sqlite
  path: /var/lib/tickwork/runs.db
"#;
        let config = YamlLoader::parse_global_config(yaml).unwrap();
        assert_eq!(config.tick_interval_secs, Some(2));
        assert_eq!(config.missed_ticks, Some(MissedTickPolicy::CatchUp));
        assert_eq!(config.environment.as_deref(), Some("staging"));
        assert_eq!(config.default_timezone.as_deref(), Some("America/New_York"));
        assert_eq!(config.default_retry.unwrap().max_attempts, 2);
        assert_eq!(
            config.storage,
            Some(StorageConfig::Sqlite {
                path: "/var/lib/tickwork/runs.db".into()
            })
        );
    }

    #[test]
    fn test_parse_empty_global_config() {
        let config = YamlLoader::parse_global_config("{}").unwrap();
        assert!(config.tick_interval_secs.is_none());
        assert!(config.storage.is_none());
    }

    #[test]
    fn test_load_job_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "id: [unclosed").unwrap();

        let err = YamlLoader::load_job_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::YamlFileError { path: p, .. } if p == path));
    }

    #[test]
    fn test_load_missing_global_config() {
        let err = YamlLoader::load_global_config("/nonexistent/tickwork.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }

    #[test]
    fn test_order_puts_dependencies_first() {
        let configs = vec![
            job("report", &["transform"]),
            job("cleanup", &[]),
            job("transform", &["extract"]),
            job("extract", &[]),
        ];
        let ordered = YamlLoader::order_by_dependencies(configs).unwrap();
        let order = ids(&ordered);

        let pos = |id: &str| order.iter().position(|o| *o == id).unwrap();
        assert!(pos("extract") < pos("transform"));
        assert!(pos("transform") < pos("report"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_order_keeps_input_order_without_dependencies() {
        let configs = vec![job("c", &[]), job("a", &[]), job("b", &[])];
        let ordered = YamlLoader::order_by_dependencies(configs).unwrap();
        assert_eq!(ids(&ordered), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_order_rejects_unknown_dependency() {
        let configs = vec![job("a", &["ghost"])];
        let result = YamlLoader::order_by_dependencies(configs);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("unknown job 'ghost'")
        ));
    }

    #[test]
    fn test_order_rejects_cycle() {
        let configs = vec![job("a", &["c"]), job("b", &["a"]), job("c", &["b"]), job("d", &[])];
        let result = YamlLoader::order_by_dependencies(configs);
        match result {
            Err(ConfigError::InvalidConfig(msg)) => {
                assert!(msg.ends_with("involving jobs: a, b, c"), "{}", msg);
            }
            other => panic!("expected cycle error, got {:?}", other.map(|c| c.len())),
        }
    }
}
