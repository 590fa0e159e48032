//! Whole-document summarization for statements of work.
//!
//! A SOW's summary is embedded alongside its chunks. The summarizer is an
//! external collaborator like the embedding provider: one request per call,
//! retries applied by the caller.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::SummarizationConfig;
use crate::error::ServiceError;

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn summarize(&self, text: &str) -> Result<String, ServiceError>;
}

pub fn create_summarizer(config: &SummarizationConfig) -> Result<Box<dyn Summarizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledSummarizer)),
        "ollama" => Ok(Box::new(OllamaSummarizer::new(config)?)),
        other => bail!("Unknown summarization provider: {}", other),
    }
}

pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn summarize(&self, _text: &str) -> Result<String, ServiceError> {
        Err(ServiceError::permanent(
            "summarization_disabled",
            "summarization provider is disabled",
        ))
    }
}

/// Calls `POST {url}/api/generate` with streaming off.
pub struct OllamaSummarizer {
    model: String,
    url: String,
    max_input_chars: usize,
    client: reqwest::Client,
}

impl OllamaSummarizer {
    pub fn new(config: &SummarizationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("summarization.model required for Ollama provider"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_input_chars: config.max_input_chars,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Summarizer for OllamaSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": build_prompt(text, self.max_input_chars),
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        let summary = json
            .get("response")
            .and_then(|r| r.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ServiceError::permanent("malformed_response", "missing or empty response")
            })?;
        Ok(summary.to_string())
    }
}

fn build_prompt(text: &str, max_chars: usize) -> String {
    let excerpt: String = text.chars().take(max_chars).collect();
    format!(
        "Summarize the following statement of work in one paragraph. \
         Name the vendor, scope, milestones, and total value if present.\n\n{}",
        excerpt
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_truncates_input() {
        let prompt = build_prompt(&"x".repeat(100), 10);
        assert!(prompt.ends_with(&"x".repeat(10)));
        assert!(!prompt.contains(&"x".repeat(11)));
    }

    #[test]
    fn test_disabled_by_default() {
        let summarizer = create_summarizer(&SummarizationConfig::default()).unwrap();
        assert!(!summarizer.is_enabled());
    }
}
