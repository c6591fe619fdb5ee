//! Configuration management for oiva.
//!
//! Configuration is read from `config.toml` next to the oiva executable,
//! falling back to `~/.config/oiva/config.toml`. A path given on the command
//! line takes precedence over both.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the configuration file.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while locating or loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: '{}'", path.display())]
    NotFound { path: PathBuf },

    #[error("could not determine the executable path: {0}")]
    Locate(#[source] std::io::Error),

    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Endpoint and model settings.
    #[serde(default)]
    pub api: ApiConfig,
    /// How the answer is generated and printed.
    #[serde(default)]
    pub output: OutputConfig,
    /// System prompt sent ahead of every question.
    #[serde(default)]
    pub system: SystemConfig,
}

/// The `[api]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API key (falls back to OPENAI_API_KEY when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL of an OpenAI-compatible API (default: https://api.openai.com/v1).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name (default: gpt-4o-mini).
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
        }
    }
}

/// The `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Strip markdown code fences from the answer.
    #[serde(default = "default_true")]
    pub clean_output: bool,
    /// Sampling temperature, 0.0 to 2.0.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            clean_output: true,
            temperature: default_temperature(),
        }
    }
}

/// The `[system]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.3
}

fn default_prompt() -> String {
    "You are a shell assistant running in the user's terminal. Answer with the \
     command that does what they ask, followed by at most one short line of \
     explanation. Keep answers brief."
        .to_string()
}

impl Config {
    /// Places searched for the config file, most preferred first.
    pub fn candidate_paths() -> Result<Vec<PathBuf>, ConfigError> {
        let exe = std::env::current_exe().map_err(ConfigError::Locate)?;
        let mut paths = Vec::new();
        if let Some(dir) = exe.parent() {
            paths.push(dir.join(CONFIG_FILE_NAME));
        }
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("oiva").join(CONFIG_FILE_NAME));
        }
        Ok(paths)
    }

    /// Load the configuration, from `explicit` when given.
    ///
    /// Without an explicit path the first existing candidate is used; if
    /// none exists the error names the file next to the executable.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        let candidates = Self::candidate_paths()?;
        match candidates.iter().find(|path| path.is_file()) {
            Some(path) => Self::load_from(path),
            None => Err(ConfigError::NotFound {
                path: candidates
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME)),
            }),
        }
    }

    /// Load and validate the configuration at `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let temperature = self.output.temperature;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid(format!(
                "output.temperature must be between 0.0 and 2.0, got {}",
                temperature
            )));
        }
        if self.api.model.trim().is_empty() {
            return Err(ConfigError::Invalid("api.model must not be empty".to_string()));
        }
        let base_url = self.api.base_url.as_str();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "api.base_url must be an http(s) URL, got '{}'",
                base_url
            )));
        }
        Ok(())
    }

    /// Render a starter config file.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        let mut config = Self::default();
        config.api.api_key = Some("sk-...".to_string());
        toml::to_string_pretty(&config)
    }
}
