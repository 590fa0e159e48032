use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::Amount;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub summarization: SummarizationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/paperline.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Documents processed concurrently by one worker process.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Calls per external-service request before a stage gives up.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Attempts per document before a retryable failure becomes terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_ceiling: default_retry_ceiling(),
            max_attempts: default_max_attempts(),
            lease_secs: default_lease_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            stage_timeout_secs: default_stage_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

fn default_workers() -> usize {
    4
}
fn default_retry_ceiling() -> u32 {
    3
}
fn default_max_attempts() -> i64 {
    3
}
fn default_lease_secs() -> u64 {
    300
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_stage_timeout_secs() -> u64 {
    60
}
fn default_poll_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_fixture_dir")]
    pub fixture_dir: PathBuf,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_extraction_provider(),
            url: None,
            fixture_dir: default_fixture_dir(),
            model: None,
        }
    }
}

fn default_extraction_provider() -> String {
    "fixture".to_string()
}
fn default_fixture_dir() -> PathBuf {
    PathBuf::from("./extractions")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_max_input_chars() -> usize {
    12_000
}

/// Rule-engine tuning. Amounts are in major currency units in the file.
#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Canonical field names whose low confidence is an error, not a warning.
    #[serde(default = "default_critical_fields")]
    pub critical_fields: Vec<String>,
    #[serde(default = "default_unmatched_amount_threshold")]
    pub unmatched_amount_threshold: f64,
    /// Minimum token-overlap score for a description match.
    #[serde(default = "default_description_match_threshold")]
    pub description_match_threshold: f32,
    /// Two amounts within this many major units count as equal.
    #[serde(default = "default_amount_match_tolerance")]
    pub amount_match_tolerance: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            critical_fields: default_critical_fields(),
            unmatched_amount_threshold: default_unmatched_amount_threshold(),
            description_match_threshold: default_description_match_threshold(),
            amount_match_tolerance: default_amount_match_tolerance(),
        }
    }
}

impl ValidationConfig {
    pub fn unmatched_threshold(&self) -> Amount {
        Amount::from_major(self.unmatched_amount_threshold)
    }

    pub fn amount_tolerance(&self) -> Amount {
        Amount::from_major(self.amount_match_tolerance)
    }

    pub fn is_critical(&self, field: &str) -> bool {
        self.critical_fields.iter().any(|f| f == field)
    }
}

fn default_confidence_threshold() -> f32 {
    0.8
}
fn default_critical_fields() -> Vec<String> {
    vec!["total".to_string(), "dueDate".to_string()]
}
fn default_unmatched_amount_threshold() -> f64 {
    100.0
}
fn default_description_match_threshold() -> f32 {
    0.5
}
fn default_amount_match_tolerance() -> f64 {
    0.01
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be > 0");
    }
    if config.pipeline.retry_ceiling == 0 {
        anyhow::bail!("pipeline.retry_ceiling must be >= 1");
    }
    if config.pipeline.max_attempts < 1 {
        anyhow::bail!("pipeline.max_attempts must be >= 1");
    }
    if config.pipeline.lease_secs == 0 {
        anyhow::bail!("pipeline.lease_secs must be > 0");
    }
    let retried_call = config.pipeline.stage_timeout_secs * config.pipeline.retry_ceiling as u64;
    if config.pipeline.lease_secs < retried_call {
        anyhow::bail!(
            "pipeline.lease_secs ({}) must cover one retried call (stage_timeout_secs x retry_ceiling = {})",
            config.pipeline.lease_secs,
            retried_call
        );
    }

    if !(0.0..=1.0).contains(&config.validation.confidence_threshold) {
        anyhow::bail!("validation.confidence_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.validation.description_match_threshold) {
        anyhow::bail!("validation.description_match_threshold must be in [0.0, 1.0]");
    }
    if config.validation.unmatched_amount_threshold < 0.0 {
        anyhow::bail!("validation.unmatched_amount_threshold must be >= 0");
    }

    match config.extraction.provider.as_str() {
        "fixture" => {}
        "http" => {
            if config.extraction.url.is_none() {
                anyhow::bail!("extraction.url must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be fixture or http.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.summarization.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if config.summarization.model.is_none() {
                anyhow::bail!("summarization.model must be specified when provider is 'ollama'");
            }
        }
        other => anyhow::bail!(
            "Unknown summarization provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.pipeline.retry_ceiling, 3);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.validation.critical_fields, vec!["total", "dueDate"]);
        assert_eq!(config.validation.unmatched_threshold(), Amount(10_000));
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let config: Config =
            toml::from_str("[validation]\nconfidence_threshold = 1.5\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"openai\"\n").unwrap();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("embedding.dims"), "{}", err);
    }

    #[test]
    fn test_lease_must_cover_a_retried_call() {
        let config: Config =
            toml::from_str("[pipeline]\nlease_secs = 100\nstage_timeout_secs = 60\nretry_ceiling = 2\n")
                .unwrap();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("lease_secs"), "{}", err);

        let config: Config =
            toml::from_str("[pipeline]\nlease_secs = 120\nstage_timeout_secs = 60\nretry_ceiling = 2\n")
                .unwrap();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_http_extraction_requires_url() {
        let config: Config = toml::from_str("[extraction]\nprovider = \"http\"\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("paperline.toml");
        std::fs::write(&path, "[pipeline]\nworkers = 2\nlease_secs = 30\nstage_timeout_secs = 10\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.pipeline.lease(), Duration::from_secs(30));
    }
}
