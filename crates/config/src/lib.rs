//! Configuration loading, validation, and management for promptloom.
//!
//! Loads configuration from `~/.promptloom/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.promptloom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Token budget defaults for renders
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Render behaviour
    #[serde(default)]
    pub render: RenderConfig,
}

/// Token budget for a single render call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetConfig {
    /// Global token ceiling for the whole prompt
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Characters per estimated token
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

fn default_max_tokens() -> usize {
    4096
}
fn default_chars_per_token() -> usize {
    4
}

impl BudgetConfig {
    /// A budget with the given ceiling and the default estimator ratio.
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Treat compile lints (e.g. unreferenced slots) as failures
    #[serde(default)]
    pub strict_lints: bool,
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load configuration from the default path (~/.promptloom/config.toml).
    ///
    /// Environment overrides:
    /// - `PROMPTLOOM_MAX_TOKENS`
    /// - `PROMPTLOOM_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = std::env::var("PROMPTLOOM_MAX_TOKENS") {
            self.budget.max_tokens = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "PROMPTLOOM_MAX_TOKENS must be a non-negative integer, got '{raw}'"
                ))
            })?;
        }
        if let Ok(level) = std::env::var("PROMPTLOOM_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// `~/.promptloom`
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".promptloom")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.chars_per_token == 0 {
            return Err(ConfigError::ValidationError(
                "budget.chars_per_token must be greater than 0".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join("/"),
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// `$HOME` (or `%USERPROFILE%`), falling back to the working directory.
fn dirs_home() -> PathBuf {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(var).map_or_else(|| PathBuf::from("."), PathBuf::from)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("invalid TOML in {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.budget.max_tokens, 4096);
        assert_eq!(config.budget.chars_per_token, 4);
        assert_eq!(config.logging.level, "info");
        assert!(!config.render.strict_lints);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.budget, config.budget);
        assert_eq!(parsed.logging.level, config.logging.level);
    }

    #[test]
    fn zero_chars_per_token_rejected() {
        let config = AppConfig {
            budget: BudgetConfig {
                max_tokens: 100,
                chars_per_token: 0,
            },
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_log_level_rejected() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
[budget]
max_tokens = 512
"#,
        )
        .unwrap();
        assert_eq!(config.budget.max_tokens, 512);
        assert_eq!(config.budget.chars_per_token, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[budget]
max_tokens = 2048
chars_per_token = 3

[render]
strict_lints = true
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.budget.chars_per_token, 3);
        assert!(config.render.strict_lints);
    }

    #[test]
    fn malformed_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[budget\nmax_tokens = ").unwrap();

        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("max_tokens = 4096"));
        assert!(toml_str.contains("[logging]"));
    }

    #[test]
    fn budget_with_max_tokens_keeps_ratio() {
        let budget = BudgetConfig::with_max_tokens(10);
        assert_eq!(budget.max_tokens, 10);
        assert_eq!(budget.chars_per_token, 4);
    }
}
