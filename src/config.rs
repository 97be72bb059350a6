//! Pipeline configuration
//!
//! Model endpoints come from the environment, one prefix per role:
//!
//! ```text
//! SUPPORT_QA_PRIMARY_PROVIDER   anthropic | openai | azure
//! SUPPORT_QA_PRIMARY_ENDPOINT   full URL (anthropic/openai) or resource URL (azure)
//! SUPPORT_QA_PRIMARY_API_KEY
//! SUPPORT_QA_PRIMARY_MODEL      model name or azure deployment
//! SUPPORT_QA_PRIMARY_API_VERSION  (azure only)
//! SUPPORT_QA_PRIMARY_TIMEOUT_SECS
//! SUPPORT_QA_PRIMARY_TEMPERATURE
//! ```
//!
//! The verifier reads the same keys under `SUPPORT_QA_VERIFIER_`. The two
//! roles must resolve to different models.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PRIMARY_ENV_PREFIX: &str = "SUPPORT_QA_PRIMARY";
pub const VERIFIER_ENV_PREFIX: &str = "SUPPORT_QA_VERIFIER";

/// Which wire protocol an endpoint speaks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Azure,
}

impl Provider {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "anthropic" => Ok(Provider::Anthropic),
            "openai" => Ok(Provider::OpenAi),
            "azure" => Ok(Provider::Azure),
            other => Err(PipelineError::Config(format!("unknown provider '{}'", other))),
        }
    }

    fn default_endpoint(&self) -> &'static str {
        match self {
            Provider::Anthropic => "https://api.anthropic.com/v1/messages",
            Provider::OpenAi => "https://api.openai.com/v1/chat/completions",
            Provider::Azure => "",
        }
    }
}

/// Configuration for one chat model endpoint
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub provider: Provider,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Required by Azure deployments
    pub api_version: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-call timeout, independent of retries
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            endpoint: Provider::Anthropic.default_endpoint().to_string(),
            api_key: String::new(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            api_version: None,
            temperature: 0.0,
            max_tokens: 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

impl ModelConfig {
    /// Default for the verifier role: a smaller model than the analyzer
    pub fn verifier_default() -> Self {
        Self {
            model: "claude-3-haiku-20240307".to_string(),
            ..Self::default()
        }
    }

    /// Read `{prefix}_*` variables on top of `base`
    pub fn from_env(prefix: &str, base: ModelConfig) -> Result<Self> {
        Self::from_lookup(prefix, base, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(prefix: &str, base: ModelConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&format!("{}_{}", prefix, suffix)).filter(|v| !v.trim().is_empty())
        };

        let mut config = base;
        if let Some(provider) = get("PROVIDER") {
            config.provider = Provider::parse(&provider)?;
            config.endpoint = config.provider.default_endpoint().to_string();
        }
        if let Some(endpoint) = get("ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(key) = get("API_KEY") {
            config.api_key = key;
        }
        if let Some(model) = get("MODEL") {
            config.model = model;
        }
        if let Some(version) = get("API_VERSION") {
            config.api_version = Some(version);
        }
        if let Some(secs) = get("TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                PipelineError::Config(format!("{}_TIMEOUT_SECS must be an integer", prefix))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(temp) = get("TEMPERATURE") {
            config.temperature = temp.parse().map_err(|_| {
                PipelineError::Config(format!("{}_TEMPERATURE must be a number", prefix))
            })?;
        }
        Ok(config)
    }

    /// Check the configuration is usable for live calls
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(PipelineError::Config(format!(
                "API key not set for model '{}'",
                self.model
            )));
        }
        if self.endpoint.is_empty() {
            return Err(PipelineError::Config(format!(
                "endpoint not set for model '{}'",
                self.model
            )));
        }
        if self.provider == Provider::Azure && self.api_version.is_none() {
            return Err(PipelineError::Config(
                "azure deployments require an API version".to_string(),
            ));
        }
        Ok(())
    }

    /// Stable identity of the model behind this configuration
    pub fn identity(&self) -> String {
        format!("{}:{}", self.endpoint.trim_end_matches('/'), self.model)
    }
}

/// The verifier must never be the same model as the analyzer
pub fn ensure_distinct(primary: &ModelConfig, verifier: &ModelConfig) -> Result<()> {
    if primary.identity() == verifier.identity() {
        return Err(PipelineError::Config(format!(
            "verifier model must differ from the primary model ({})",
            primary.identity()
        )));
    }
    Ok(())
}

/// Retry policy settings for model calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first call
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 16_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Where stage files live and how much parallelism to use
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Worker pool size for concurrent model calls
    pub workers: usize,
    pub retry: RetryConfig,
    /// Persist the three raw rounds next to each consensus
    pub keep_raw_rounds: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            workers: 5,
            retry: RetryConfig::default(),
            keep_raw_rounds: true,
        }
    }
}

impl PipelineConfig {
    pub fn dataset_path(&self) -> PathBuf {
        self.data_dir.join("dataset.json")
    }

    pub fn analysis_path(&self) -> PathBuf {
        self.data_dir.join("analysis.json")
    }

    pub fn verified_path(&self) -> PathBuf {
        self.data_dir.join("analysis_verified.json")
    }

    /// `analysis.json` -> `evaluation.json`, anything else -> `evaluation_<stem>.json`
    pub fn evaluation_path_for(&self, predictions: &Path) -> PathBuf {
        let stem = predictions
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("analysis");
        if stem == "analysis" {
            self.data_dir.join("evaluation.json")
        } else {
            self.data_dir.join(format!("evaluation_{}.json", stem))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let config = ModelConfig::from_lookup(
            "TEST",
            ModelConfig::default(),
            lookup_from(&[
                ("TEST_PROVIDER", "openai"),
                ("TEST_API_KEY", "sk-test"),
                ("TEST_MODEL", "gpt-4o"),
                ("TEST_TIMEOUT_SECS", "15"),
            ]),
        )
        .unwrap();

        assert_eq!(config.provider, Provider::OpenAi);
        assert_eq!(config.endpoint, "https://api.openai.com/v1/chat/completions");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_provider = ModelConfig::from_lookup(
            "TEST",
            ModelConfig::default(),
            lookup_from(&[("TEST_PROVIDER", "carrier-pigeon")]),
        );
        assert!(matches!(bad_provider, Err(PipelineError::Config(_))));

        let bad_timeout = ModelConfig::from_lookup(
            "TEST",
            ModelConfig::default(),
            lookup_from(&[("TEST_TIMEOUT_SECS", "soon")]),
        );
        assert!(bad_timeout.is_err());
    }

    #[test]
    fn test_missing_key_fails_validation() {
        let config = ModelConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_azure_requires_api_version() {
        let config = ModelConfig {
            provider: Provider::Azure,
            endpoint: "https://example.openai.azure.com".into(),
            api_key: "key".into(),
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_verifier_must_differ() {
        let primary = ModelConfig::default();
        assert!(ensure_distinct(&primary, &primary.clone()).is_err());
        assert!(ensure_distinct(&primary, &ModelConfig::verifier_default()).is_ok());
    }

    #[test]
    fn test_evaluation_paths() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.evaluation_path_for(&config.analysis_path()),
            PathBuf::from("data/evaluation.json")
        );
        assert_eq!(
            config.evaluation_path_for(&config.verified_path()),
            PathBuf::from("data/evaluation_analysis_verified.json")
        );
    }
}
