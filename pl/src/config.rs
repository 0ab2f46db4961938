//! Planner configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ErrorCode, PlanError};
use crate::expand::ReconcileScope;
use crate::repair::{RepairConfig, SelectionPolicy};

const LOCAL_CONFIG: &str = ".planner.yml";

/// Main planner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Repair loop settings for `ai-expand`
    pub repair: RepairSettings,

    /// Deterministic expansion defaults
    pub expand: ExpandSettings,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        debug!(?config_path, "Config::load: called");
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::search_paths() {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only `log-level`, before logging is set up
    ///
    /// Any failure reads as "not configured"; the full load reports it later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let paths = match config_path {
            Some(path) => vec![path.clone()],
            None => Self::search_paths(),
        };
        paths
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| Self::load_from_file(p).ok())
            .and_then(|config| config.log_level)
    }

    /// `./.planner.yml`, then `<config dir>/planner/planner.yml`
    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("planner").join("planner.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "openai" supported)
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4.1-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: "https://api.openai.com".to_string(),
            max_tokens: 4096,
            timeout_ms: 120_000,
        }
    }
}

impl LlmConfig {
    /// The API key from the configured environment variable
    pub fn api_key(&self) -> std::result::Result<String, PlanError> {
        debug!(env = %self.api_key_env, "LlmConfig::api_key: called");
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(PlanError::new(
                ErrorCode::AiExpandNoApiKey,
                format!("{} is not set", self.api_key_env),
            )
            .at(self.api_key_env.clone())),
        }
    }
}

/// Repair loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairSettings {
    /// Concurrent suggestion requests
    pub workers: usize,

    /// Requests per round; defaults to `workers`
    #[serde(rename = "requests-per-round")]
    pub requests_per_round: Option<usize>,

    #[serde(rename = "max-fix-rounds")]
    pub max_fix_rounds: usize,

    /// Minimum additions plus updates for a candidate to count
    #[serde(rename = "min-changes")]
    pub min_changes: usize,

    #[serde(rename = "round-timeout-ms")]
    pub round_timeout_ms: u64,

    pub selection: SelectionPolicy,

    /// Template whose steps describe the expansion intent
    pub template: String,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            requests_per_round: None,
            max_fix_rounds: 3,
            min_changes: 1,
            round_timeout_ms: 180_000,
            selection: SelectionPolicy::default(),
            template: "dev".to_string(),
        }
    }
}

impl RepairSettings {
    pub fn to_repair_config(&self) -> RepairConfig {
        RepairConfig {
            workers: self.workers,
            requests_per_round: self.requests_per_round.unwrap_or(self.workers),
            max_fix_rounds: self.max_fix_rounds,
            min_changes: self.min_changes,
            round_timeout: Duration::from_millis(self.round_timeout_ms),
            selection: self.selection,
        }
    }
}

/// Deterministic expansion defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpandSettings {
    pub template: String,

    /// YAML file adding or overriding templates
    #[serde(rename = "template-file")]
    pub template_file: Option<PathBuf>,

    /// Reconcile only claims tasks already under the chosen deliverable
    #[serde(rename = "reconcile-strict")]
    pub reconcile_strict: bool,
}

impl Default for ExpandSettings {
    fn default() -> Self {
        Self {
            template: "simple".to_string(),
            template_file: None,
            reconcile_strict: true,
        }
    }
}

impl ExpandSettings {
    pub fn scope(&self) -> ReconcileScope {
        ReconcileScope::from_strict(self.reconcile_strict)
    }
}
