use crate::error::ConfigError;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// LLM completion endpoint
    #[serde(default)]
    pub llm: LlmConfig,

    /// Pipeline run settings
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// An OpenAI-compatible chat-completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the completion API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model to use for all prompts
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key. The key itself is never
    /// written to the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout (in seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Total attempts per request before giving up on transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before the first retry (in milliseconds); doubles per retry
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
}

impl LlmConfig {
    /// Resolve the API key from the environment.
    ///
    /// Local endpoints typically run without authentication, so a missing
    /// key is only an error when the endpoint is remote.
    pub fn api_key(&self) -> Result<Option<String>, ConfigError> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.is_empty() => Ok(Some(key)),
            _ if self.is_local() => Ok(None),
            _ => Err(ConfigError::MissingApiKey(self.api_key_env.clone())),
        }
    }

    fn is_local(&self) -> bool {
        self.base_url.contains("localhost") || self.base_url.contains("127.0.0.1")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of concurrent workers (each gets its own repository copy)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Full generate-verify attempts per chunk before giving up on it
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_chunk: u32,

    /// Timeout for one sandboxed test run (in seconds)
    #[serde(default = "default_test_timeout")]
    pub test_timeout_seconds: u64,

    /// Where surviving mutants and killer tests are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Where oracle bug reports are written
    #[serde(default = "default_oracle_output_dir")]
    pub oracle_output_dir: PathBuf,

    /// Throwaway mutants requested per chunk in oracle mode
    #[serde(default = "default_mutants_per_oracle")]
    pub mutants_per_oracle: usize,

    /// Cap on validated mutants fed into oracle inference
    #[serde(default = "default_max_valid_mutants")]
    pub max_valid_mutants: usize,

    /// Python interpreter used to run tests
    #[serde(default = "default_python")]
    pub python: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "qwen2.5-coder".to_string()
}

fn default_api_key_env() -> String {
    "FAULTLINE_API_KEY".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_workers() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_test_timeout() -> u64 {
    20
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_oracle_output_dir() -> PathBuf {
    PathBuf::from("oracle_outputs")
}

fn default_mutants_per_oracle() -> usize {
    10
}

fn default_max_valid_mutants() -> usize {
    5
}

fn default_python() -> String {
    "python3".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            request_timeout_seconds: default_request_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_attempts_per_chunk: default_max_attempts(),
            test_timeout_seconds: default_test_timeout(),
            output_dir: default_output_dir(),
            oracle_output_dir: default_oracle_output_dir(),
            mutants_per_oracle: default_mutants_per_oracle(),
            max_valid_mutants: default_max_valid_mutants(),
            python: default_python(),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = if let Some(ref path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "faultline", "faultline")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
