//! Pipeline configuration
//!
//! Read from the environment (after loading `.env`) or from a JSON file.
//! Every field has a default, so an empty environment yields a working
//! keyword-only configuration.

use crate::error::{NlqError, Result};
use crate::executor::ExecutionLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bearer token for the chat-completions endpoint; no key means no model tiers
    pub api_key: Option<String>,
    pub base_url: String,
    pub primary_model: String,
    pub secondary_model: Option<String>,
    pub model_timeout_ms: u64,
    pub summary_timeout_ms: u64,
    pub statement_timeout_ms: u64,
    pub max_rows: usize,
    pub database_url: Option<String>,
    pub audit_log: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://router.huggingface.co/v1".to_string(),
            primary_model: "openai/gpt-oss-120b:cerebras".to_string(),
            secondary_model: Some("mistralai/Mistral-7B-Instruct-v0.2".to_string()),
            model_timeout_ms: 20_000,
            summary_timeout_ms: 15_000,
            statement_timeout_ms: 30_000,
            max_rows: 1000,
            database_url: None,
            audit_log: None,
        }
    }
}

impl PipelineConfig {
    /// Load `.env` if present, then read `NLQ_*` variables over the defaults
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(key) = get("OPENAI_API_KEY") {
            config.api_key = Some(key);
        }
        if let Some(url) = get("NLQ_BASE_URL") {
            config.base_url = url;
        }
        if let Some(model) = get("NLQ_PRIMARY_MODEL") {
            config.primary_model = model;
        }
        if let Some(model) = get("NLQ_SECONDARY_MODEL") {
            config.secondary_model = match model.to_lowercase().as_str() {
                "none" | "off" => None,
                _ => Some(model),
            };
        }
        if let Some(v) = get("NLQ_MODEL_TIMEOUT_MS") {
            config.model_timeout_ms = parse_number("NLQ_MODEL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("NLQ_SUMMARY_TIMEOUT_MS") {
            config.summary_timeout_ms = parse_number("NLQ_SUMMARY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("NLQ_STATEMENT_TIMEOUT_MS") {
            config.statement_timeout_ms = parse_number("NLQ_STATEMENT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("NLQ_MAX_ROWS") {
            config.max_rows = parse_number("NLQ_MAX_ROWS", &v)?;
        }
        if let Some(url) = get("DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(path) = get("NLQ_AUDIT_LOG") {
            config.audit_log = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| NlqError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_rows == 0 {
            return Err(NlqError::Config("max_rows must be at least 1".to_string()));
        }
        if self.model_timeout_ms == 0 || self.statement_timeout_ms == 0 {
            return Err(NlqError::Config("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_millis(self.summary_timeout_ms)
    }

    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            statement_timeout: Duration::from_millis(self.statement_timeout_ms),
            max_rows: self.max_rows,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| NlqError::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}
