//! Embedding provider abstraction and implementations.
//!
//! - **[`DisabledProvider`]** — embeds nothing; the embedding stage records no vectors.
//! - **[`OpenAIProvider`]** — `POST https://api.openai.com/v1/embeddings` (needs `OPENAI_API_KEY`).
//! - **[`OllamaProvider`]** — `POST {url}/api/embed` on a local Ollama instance.
//!
//! Providers make exactly one request per call. Retries, backoff, and
//! timeouts are applied by the caller through [`crate::retry::RetryPolicy`],
//! so every failure is returned as a classified [`ServiceError`].
//!
//! Vectors are stored as little-endian `f32` BLOBs ([`vec_to_blob`] /
//! [`blob_to_vec`]).

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::ServiceError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier stored alongside each vector (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Embed a batch. On success the result has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn is_enabled(&self) -> bool {
        false
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Err(ServiceError::permanent(
            "embeddings_disabled",
            "embedding provider is disabled",
        ))
    }
}

// ============ OpenAI Provider ============

pub struct OpenAIProvider {
    model: String,
    dims: usize,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        Ok(Self {
            model,
            dims,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ServiceError::permanent("missing_api_key", "OPENAI_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        let vectors = parse_openai_response(&json)?;
        check_batch(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ServiceError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| malformed("missing embedding"))?;
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ServiceError::transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| malformed("missing embeddings array"))?;
        let vectors = embeddings
            .iter()
            .map(parse_vector)
            .collect::<Result<Vec<_>, _>>()?;
        check_batch(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

// ============ Helpers ============

fn malformed(message: &str) -> ServiceError {
    ServiceError::permanent("malformed_response", message)
}

fn parse_vector(value: &serde_json::Value) -> Result<Vec<f32>, ServiceError> {
    value
        .as_array()
        .ok_or_else(|| malformed("embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| malformed("embedding contains a non-number"))
        })
        .collect()
}

/// A response must carry one vector of the configured width per input.
pub fn check_batch(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<(), ServiceError> {
    if vectors.len() != expected {
        return Err(malformed(&format!(
            "expected {} vectors, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(malformed(&format!(
            "expected {} dimensions, got {}",
            dims,
            bad.len()
        )));
    }
    Ok(())
}

/// Encode a float vector as a little-endian BLOB.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_encoding() {
        let v = vec![0.5f32, -1.25, 3.0];
        assert_eq!(vec_to_blob(&v).len(), 12);
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn test_openai_response_sorted_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.2, 0.2]},
                {"index": 0, "embedding": [0.1, 0.1]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors[0], vec![0.1f32, 0.1]);
        assert_eq!(vectors[1], vec![0.2f32, 0.2]);
    }

    #[test]
    fn test_malformed_response_is_permanent() {
        let err = parse_openai_response(&serde_json::json!({"oops": true})).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_check_batch_dimensions() {
        assert!(check_batch(&[vec![0.0; 3]], 1, 3).is_ok());
        assert!(check_batch(&[vec![0.0; 2]], 1, 3).is_err());
        assert!(check_batch(&[], 1, 3).is_err());
    }

    #[test]
    fn test_create_disabled_provider() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        assert!(!provider.is_enabled());
    }
}
