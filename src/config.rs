use crate::decoder::{AcousticModel, Dictionary, ResourceContext, ResourceGroup};
use crate::defaults;
use crate::error::{PipelineError, Result};
use crate::recognizer::{RecognizerSettings, RunMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub recognizer: RecognizerConfig,
    pub queue: QueueConfig,
    pub diagnostics: DiagnosticsConfig,
    pub log: LogConfig,
    pub resources: ResourcesConfig,
}

/// Recognizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Comma-separated run-mode flags, e.g. "continuous,flush-speech,result-end".
    pub mode: String,
    pub nbest: usize,
    pub traceback_interval: u64,
    /// Resource group for the first utterance; `resources.default_group` if unset.
    pub group: Option<String>,
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct QueueConfig {
    /// Bound for data queues. Unbounded when absent.
    pub max_len: Option<usize>,
}

/// Diagnostic log configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `env_logger` filter used when `RUST_LOG` is not set.
    pub level: String,
}

/// Resource groups available to the recognizer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourcesConfig {
    pub default_group: String,
    pub groups: Vec<GroupConfig>,
}

/// One resource group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    /// Groups naming the same model share it.
    #[serde(default = "default_model_name")]
    pub model: String,
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
    #[serde(default)]
    pub words: Vec<String>,
}

fn default_model_name() -> String {
    "default".to_string()
}

fn default_feature_dim() -> usize {
    defaults::FEATURE_DIM
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            mode: defaults::RUN_MODE.to_string(),
            nbest: defaults::NBEST,
            traceback_interval: defaults::TRACEBACK_INTERVAL,
            group: None,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::DIAGNOSTIC_CAPACITY,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            default_group: defaults::DEFAULT_GROUP.to_string(),
            groups: vec![GroupConfig {
                name: defaults::DEFAULT_GROUP.to_string(),
                model: default_model_name(),
                feature_dim: defaults::FEATURE_DIM,
                words: defaults::VOCABULARY.iter().map(|w| w.to_string()).collect(),
            }],
        }
    }
}

impl RecognizerConfig {
    /// Parses and range-checks the section into stage settings.
    pub fn settings(&self) -> Result<RecognizerSettings> {
        let mode: RunMode = self.mode.parse()?;
        let max = defaults::MAX_NBEST as usize;
        if !(1..=max).contains(&self.nbest) {
            return Err(PipelineError::ConfigInvalidValue {
                key: "recognizer.nbest".to_string(),
                message: format!("{} is outside 1..={}", self.nbest, max),
            });
        }
        if self.traceback_interval == 0 {
            return Err(PipelineError::ConfigInvalidValue {
                key: "recognizer.traceback_interval".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(RecognizerSettings {
            mode,
            nbest: self.nbest,
            traceback_interval: self.traceback_interval,
            group: self.group.clone(),
        })
    }
}

impl ResourcesConfig {
    /// Builds the resource context; models are shared between groups by name.
    pub fn build(&self) -> Result<ResourceContext> {
        let mut models: HashMap<&str, Arc<AcousticModel>> = HashMap::new();
        let mut context = ResourceContext::new(&self.default_group);

        for group in &self.groups {
            let model = models
                .entry(group.model.as_str())
                .or_insert_with(|| {
                    Arc::new(AcousticModel {
                        name: group.model.clone(),
                        feature_dim: group.feature_dim,
                    })
                })
                .clone();
            if model.feature_dim != group.feature_dim {
                return Err(PipelineError::ConfigInvalidValue {
                    key: format!("resources.groups.{}.feature_dim", group.name),
                    message: format!(
                        "model '{}' already has feature_dim {}",
                        model.name, model.feature_dim
                    ),
                });
            }
            context.add_group(ResourceGroup::new(
                &group.name,
                model,
                Arc::new(Dictionary::new(group.words.iter().cloned())),
            ));
        }
        Ok(context)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file is missing or contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                PipelineError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(PipelineError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - SPEECHFLOW_MODE → recognizer.mode
    /// - SPEECHFLOW_GROUP → recognizer.group
    /// - SPEECHFLOW_LOG → log.level
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(mode) = std::env::var("SPEECHFLOW_MODE")
            && !mode.is_empty()
        {
            self.recognizer.mode = mode;
        }

        if let Ok(group) = std::env::var("SPEECHFLOW_GROUP")
            && !group.is_empty()
        {
            self.recognizer.group = Some(group);
        }

        if let Ok(level) = std::env::var("SPEECHFLOW_LOG")
            && !level.is_empty()
        {
            self.log.level = level;
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/speechflow/config.toml on Linux, `None` if the
    /// platform has no config directory.
    #[cfg(feature = "cli")]
    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("speechflow").join("config.toml"))
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_speechflow_env() {
        remove_env("SPEECHFLOW_MODE");
        remove_env("SPEECHFLOW_GROUP");
        remove_env("SPEECHFLOW_LOG");
    }

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(contents.as_bytes()).unwrap();
        temp_file
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.recognizer.mode, "continuous,result-end");
        assert_eq!(config.recognizer.nbest, 1);
        assert_eq!(config.recognizer.traceback_interval, 10);
        assert_eq!(config.recognizer.group, None);
        assert_eq!(config.queue.max_len, None);
        assert_eq!(config.diagnostics.capacity, 64);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.resources.default_group, "default");
        assert_eq!(config.resources.groups.len(), 1);
        assert_eq!(config.resources.groups[0].words.len(), 10);
    }

    #[test]
    fn test_load_from_toml_file() {
        let temp_file = write_temp(
            r#"
            [recognizer]
            mode = "flush-marker,stop-marker,result-asap"
            nbest = 4
            traceback_interval = 2
            group = "colors"

            [queue]
            max_len = 256

            [diagnostics]
            capacity = 8

            [log]
            level = "debug"

            [resources]
            default_group = "digits"

            [[resources.groups]]
            name = "digits"
            model = "mono"
            feature_dim = 2
            words = ["zero", "one"]

            [[resources.groups]]
            name = "colors"
            model = "mono"
            feature_dim = 2
            words = ["red", "green"]
        "#,
        );

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.recognizer.nbest, 4);
        assert_eq!(config.recognizer.group, Some("colors".to_string()));
        assert_eq!(config.queue.max_len, Some(256));
        assert_eq!(config.diagnostics.capacity, 8);
        assert_eq!(config.log.level, "debug");

        let settings = config.recognizer.settings().unwrap();
        assert!(settings.mode.contains(RunMode::RESULT_END));
        assert_eq!(settings.traceback_interval, 2);

        let resources = config.resources.build().unwrap();
        assert_eq!(resources.default_group_name(), "digits");
        let digits = resources.group("digits").unwrap();
        let colors = resources.group("colors").unwrap();
        assert!(Arc::ptr_eq(&digits.model, &colors.model));
        assert_eq!(colors.dictionary.words, vec!["red", "green"]);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let temp_file = write_temp(
            r#"
            [recognizer]
            nbest = 3
        "#,
        );

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.recognizer.nbest, 3);
        assert_eq!(config.recognizer.mode, "continuous,result-end");
        assert_eq!(config.diagnostics, DiagnosticsConfig::default());
        assert_eq!(config.resources, ResourcesConfig::default());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = RecognizerConfig {
            nbest: 0,
            ..RecognizerConfig::default()
        };
        assert!(config.settings().is_err());

        config.nbest = 1;
        config.traceback_interval = 0;
        assert!(config.settings().is_err());

        config.traceback_interval = 1;
        config.mode = "continuous,sometimes".to_string();
        let err = config.settings().unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_conflicting_model_dimensions_rejected() {
        let resources = ResourcesConfig {
            default_group: "a".to_string(),
            groups: vec![
                GroupConfig {
                    name: "a".to_string(),
                    model: "shared".to_string(),
                    feature_dim: 2,
                    words: Vec::new(),
                },
                GroupConfig {
                    name: "b".to_string(),
                    model: "shared".to_string(),
                    feature_dim: 3,
                    words: Vec::new(),
                },
            ],
        };
        assert!(resources.build().is_err());
    }

    #[test]
    fn test_env_override_mode() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_speechflow_env();

        set_env("SPEECHFLOW_MODE", "stop-silence");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.recognizer.mode, "stop-silence");
        assert_eq!(config.log.level, "info"); // Not overridden

        clear_speechflow_env();
    }

    #[test]
    fn test_env_override_all() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_speechflow_env();

        set_env("SPEECHFLOW_MODE", "result-asap");
        set_env("SPEECHFLOW_GROUP", "colors");
        set_env("SPEECHFLOW_LOG", "trace");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.recognizer.mode, "result-asap");
        assert_eq!(config.recognizer.group, Some("colors".to_string()));
        assert_eq!(config.log.level, "trace");

        clear_speechflow_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_speechflow_env();

        set_env("SPEECHFLOW_MODE", "");
        let config = Config::default().with_env_overrides();

        // Empty string should not override default
        assert_eq!(config.recognizer.mode, "continuous,result-end");

        clear_speechflow_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let temp_file = write_temp(
            r#"
            [recognizer
            mode = "broken
        "#,
        );

        let result = Config::load(temp_file.path());

        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn test_default_path_ends_with_config_toml() {
        if let Some(path) = Config::default_path() {
            let path_str = path.to_string_lossy();
            assert!(path_str.contains("speechflow"));
            assert!(path_str.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_or_default_errors_on_invalid_toml() {
        let temp_file = write_temp("[recognizer\n");

        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
