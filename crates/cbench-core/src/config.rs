//! Configuration for the orchestrator service.
//!
//! Loaded from YAML. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration.

use cbench_proto::BuildTarget;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Inbound queue of webhook summaries.
    #[serde(default = "default_event_queue")]
    pub event_queue: String,

    /// Inbound queue of worker results.
    #[serde(default = "default_result_queue")]
    pub result_queue: String,

    /// Outbound queue of build requests for workers.
    #[serde(default = "default_work_queue")]
    pub work_queue: String,

    /// Outbound queue of finished results for the publisher.
    #[serde(default = "default_output_queue")]
    pub output_queue: String,

    /// Refs to build, as regular expressions matched against the whole ref.
    /// Empty means build everything.
    #[serde(default)]
    pub target_patterns: Vec<String>,

    /// Turn every request into a job, skipping the per-target backlog.
    #[serde(default)]
    pub admit_all: bool,

    /// Upper bound on messages handled at the same time.
    #[serde(default = "default_handler_concurrency")]
    pub handler_concurrency: usize,
}

fn default_event_queue() -> String {
    "cbench.events".to_string()
}

fn default_result_queue() -> String {
    "cbench.results".to_string()
}

fn default_work_queue() -> String {
    "cbench.requests".to_string()
}

fn default_output_queue() -> String {
    "cbench.outputs".to_string()
}

fn default_handler_concurrency() -> usize {
    4
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            event_queue: default_event_queue(),
            result_queue: default_result_queue(),
            work_queue: default_work_queue(),
            output_queue: default_output_queue(),
            target_patterns: Vec::new(),
            admit_all: false,
            handler_concurrency: default_handler_concurrency(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        let config: Self = serde_yaml::from_str(&content)?;
        debug!(
            patterns = config.target_patterns.len(),
            admit_all = config.admit_all,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Validates the configuration and returns warnings.
    ///
    /// Empty or shared queue names and patterns that do not compile are
    /// errors. Suspicious but usable values come back as warnings.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut warnings = Vec::new();

        let queues = [
            ("event_queue", &self.event_queue),
            ("result_queue", &self.result_queue),
            ("work_queue", &self.work_queue),
            ("output_queue", &self.output_queue),
        ];
        let mut seen = HashSet::new();
        for (field, name) in queues {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyQueueName { field });
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::SharedQueue {
                    queue: name.clone(),
                });
            }
        }

        compile_patterns(&self.target_patterns)?;

        if self.handler_concurrency == 0 {
            warnings.push(ConfigWarning::InvalidValue {
                field: "handler_concurrency".to_string(),
                message: "must be at least 1; using 1".to_string(),
            });
        }

        if self.admit_all {
            warnings.push(ConfigWarning::Note {
                field: "admit_all".to_string(),
                message: "every event becomes a job; pushes to the same ref will not be coalesced"
                    .to_string(),
            });
        }

        Ok(warnings)
    }

    /// Compiles the configuration into the immutable settings a running
    /// service uses.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        Ok(Settings {
            event_queue: self.event_queue.clone(),
            result_queue: self.result_queue.clone(),
            work_queue: self.work_queue.clone(),
            output_queue: self.output_queue.clone(),
            target_patterns: compile_patterns(&self.target_patterns)?,
            admit_all: self.admit_all,
            handler_concurrency: self.handler_concurrency.max(1),
        })
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(&format!("^(?:{pattern})$")).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

/// Validated, compiled configuration of one service instance.
#[derive(Debug, Clone)]
pub struct Settings {
    pub event_queue: String,
    pub result_queue: String,
    pub work_queue: String,
    pub output_queue: String,
    pub target_patterns: Vec<Regex>,
    pub admit_all: bool,
    pub handler_concurrency: usize,
}

impl Settings {
    /// True if the target should be built under the configured patterns.
    pub fn matches(&self, target: &BuildTarget) -> bool {
        self.target_patterns.is_empty()
            || self
                .target_patterns
                .iter()
                .any(|pattern| pattern.is_match(target.as_str()))
    }
}

/// Configuration warnings emitted during validation.
#[derive(Debug, Clone)]
pub enum ConfigWarning {
    /// Field has an invalid value that was corrected.
    InvalidValue { field: String, message: String },
    /// Field changes behavior in a way worth pointing out.
    Note { field: String, message: String },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::InvalidValue { field, message } => {
                write!(f, "Warning [{}]: {}", field, message)
            }
            ConfigWarning::Note { field, message } => write!(f, "Note [{}]: {}", field, message),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Queue name for '{field}' is empty")]
    EmptyQueueName { field: &'static str },

    #[error("Queue '{queue}' is configured for more than one role")]
    SharedQueue { queue: String },

    #[error("Invalid target pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.event_queue, "cbench.events");
        assert_eq!(config.work_queue, "cbench.requests");
        assert!(config.target_patterns.is_empty());
        assert!(!config.admit_all);
        assert_eq!(config.handler_concurrency, 4);
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: OrchestratorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
event_queue: "hooks"
target_patterns:
  - "refs/heads/main"
  - "refs/heads/release/.*"
admit_all: true
"#;
        let config: OrchestratorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.event_queue, "hooks");
        assert_eq!(config.result_queue, "cbench.results");
        assert_eq!(config.target_patterns.len(), 2);
        assert!(config.admit_all);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "work_queue: jobs\nhandler_concurrency: 8").unwrap();

        let config = OrchestratorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.work_queue, "jobs");
        assert_eq!(config.handler_concurrency, 8);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = OrchestratorConfig::from_file("/definitely/not/here.yml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_patterns_match_whole_ref() {
        let config = OrchestratorConfig {
            target_patterns: vec!["refs/heads/main".to_string(), "refs/tags/v.*".to_string()],
            ..OrchestratorConfig::default()
        };
        let settings = config.settings().unwrap();

        assert!(settings.matches(&BuildTarget::from("refs/heads/main")));
        assert!(settings.matches(&BuildTarget::from("refs/tags/v1.2.0")));
        assert!(!settings.matches(&BuildTarget::from("refs/heads/main-backup")));
        assert!(!settings.matches(&BuildTarget::from("refs/heads/feature")));
    }

    #[test]
    fn test_no_patterns_match_everything() {
        let settings = OrchestratorConfig::default().settings().unwrap();
        assert!(settings.matches(&BuildTarget::from("refs/heads/anything")));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = OrchestratorConfig {
            target_patterns: vec!["refs/heads/(".to_string()],
            ..OrchestratorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(config.settings().is_err());
    }

    #[test]
    fn test_shared_queue_rejected() {
        let config = OrchestratorConfig {
            output_queue: "cbench.requests".to_string(),
            ..OrchestratorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SharedQueue { .. })
        ));
    }

    #[test]
    fn test_empty_queue_rejected() {
        let config = OrchestratorConfig {
            event_queue: " ".to_string(),
            ..OrchestratorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyQueueName {
                field: "event_queue"
            })
        ));
    }

    #[test]
    fn test_zero_concurrency_warns_and_clamps() {
        let config = OrchestratorConfig {
            handler_concurrency: 0,
            ..OrchestratorConfig::default()
        };
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("handler_concurrency"));
        assert_eq!(config.settings().unwrap().handler_concurrency, 1);
    }
}
