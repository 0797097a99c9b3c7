#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use askdb_domain::ensure_non_empty;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gemma3:4b";
const DEFAULT_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
    #[serde(default = "default_trace_dir")]
    pub trace_dir: PathBuf,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub key_entities: KeyEntityConfig,
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            trace_dir: default_trace_dir(),
            reasoning: ReasoningConfig::default(),
            key_entities: KeyEntityConfig::default(),
            preview_rows: default_preview_rows(),
        }
    }
}

/// Where and how to reach the natural-language-to-SQL service.
///
/// Without an `endpoint` every question is planned by the fallback heuristics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReasoningConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_model(),
            timeout_ms: default_timeout_ms(),
            auth_bearer_env: None,
        }
    }
}

/// Table names worth describing up front. These are dataset-specific.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeyEntityConfig {
    #[serde(default = "default_key_entity_names")]
    pub names: Vec<String>,
    #[serde(default = "default_key_entity_limit")]
    pub limit: usize,
}

impl Default for KeyEntityConfig {
    fn default() -> Self {
        Self {
            names: default_key_entity_names(),
            limit: default_key_entity_limit(),
        }
    }
}

impl KeyEntityConfig {
    /// Pick up to `limit` recognised names, keeping the order they were discovered in.
    #[must_use]
    pub fn select<'a>(&self, discovered: &'a [String]) -> Vec<&'a str> {
        discovered
            .iter()
            .filter(|table| self.names.iter().any(|name| name == *table))
            .take(self.limit)
            .map(String::as_str)
            .collect()
    }
}

/// Load an agent configuration file. `.json` files are parsed as JSON, anything
/// else as YAML.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_config_from_path(path: &Path) -> Result<AgentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        parse_config_json(&content)
    } else {
        parse_config_yaml(&content)
    }
}

/// # Errors
/// Returns an error when YAML parsing or validation fails.
pub fn parse_config_yaml(yaml: &str) -> Result<AgentConfig> {
    let config: AgentConfig =
        serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid config YAML structure: {err}"))?;
    validate_config(&config)?;
    Ok(config)
}

/// # Errors
/// Returns an error when JSON parsing or validation fails.
pub fn parse_config_json(json: &str) -> Result<AgentConfig> {
    let config: AgentConfig =
        serde_json::from_str(json).map_err(|err| anyhow!("invalid config JSON structure: {err}"))?;
    validate_config(&config)?;
    Ok(config)
}

/// # Errors
/// Returns an error describing the first invalid field.
pub fn validate_config(config: &AgentConfig) -> Result<()> {
    ensure_non_empty("dataset_path", &config.dataset_path.to_string_lossy())?;
    ensure_non_empty("trace_dir", &config.trace_dir.to_string_lossy())?;
    ensure_non_empty("reasoning.model", &config.reasoning.model)?;
    if let Some(endpoint) = &config.reasoning.endpoint {
        ensure_non_empty("reasoning.endpoint", endpoint)?;
    }
    if config.reasoning.timeout_ms == 0 {
        return Err(anyhow!("reasoning.timeout_ms MUST be positive"));
    }
    for name in &config.key_entities.names {
        ensure_non_empty("key_entities.names[]", name)?;
    }
    if config.key_entities.limit == 0 {
        return Err(anyhow!("key_entities.limit MUST be at least 1"));
    }
    if config.preview_rows == 0 {
        return Err(anyhow!("preview_rows MUST be at least 1"));
    }
    Ok(())
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("db/olist.db")
}

fn default_trace_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_key_entity_names() -> Vec<String> {
    ["orders", "customers", "order_items", "payments"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_key_entity_limit() -> usize {
    2
}

fn default_preview_rows() -> usize {
    5
}
