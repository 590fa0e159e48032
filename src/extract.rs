//! Extraction service adapter.
//!
//! The OCR/NLP engine is a black box that turns a stored document into a
//! [`RawExtraction`]. Two adapters are provided:
//!
//! - **[`HttpExtractionService`]** — `POST {url}/extract` with the document reference.
//! - **[`FixtureExtractionService`]** — reads `<fixture_dir>/<document_ref>.json`.
//!   Used for local runs and tests.
//!
//! Both accept a failure body of the form
//! `{"error": {"code": "...", "message": "..."}}`, whose code is classified by
//! [`ServiceError::from_code`]: a fixture can therefore simulate a timeout or
//! an unsupported format as faithfully as a live service.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::ExtractionConfig;
use crate::error::ServiceError;
use crate::models::{DocumentType, RawExtraction};

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRequest {
    pub document_ref: String,
    pub storage_ref: String,
    pub declared_type: Option<DocumentType>,
}

#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction, ServiceError>;
}

pub fn create_service(config: &ExtractionConfig) -> Result<Box<dyn ExtractionService>> {
    match config.provider.as_str() {
        "fixture" => Ok(Box::new(FixtureExtractionService::new(
            config.fixture_dir.clone(),
        ))),
        "http" => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("extraction.url required for http provider"))?;
            Ok(Box::new(HttpExtractionService::new(url, config.model.clone())))
        }
        other => bail!("Unknown extraction provider: {}", other),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    #[serde(default)]
    message: String,
}

/// Parse a service response body: an extraction, or a classified error.
fn parse_body(body: &str) -> Result<RawExtraction, ServiceError> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return Err(ServiceError::from_code(
            &envelope.error.code,
            envelope.error.message,
        ));
    }
    serde_json::from_str(body)
        .map_err(|e| ServiceError::permanent("malformed_response", e.to_string()))
}

// ============ HTTP ============

pub struct HttpExtractionService {
    url: String,
    model: Option<String>,
    client: reqwest::Client,
}

impl HttpExtractionService {
    pub fn new(url: String, model: Option<String>) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionService {
    async fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction, ServiceError> {
        let body = serde_json::json!({
            "document_ref": request.document_ref,
            "storage_ref": request.storage_ref,
            "document_type": request.declared_type,
            "model": self.model,
        });

        let response = self
            .client
            .post(format!("{}/extract", self.url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return parse_body(&text);
        }
        match serde_json::from_str::<ErrorEnvelope>(&text) {
            Ok(envelope) if status.as_u16() != 429 && !status.is_server_error() => Err(
                ServiceError::from_code(&envelope.error.code, envelope.error.message),
            ),
            _ => Err(ServiceError::from_status(status.as_u16(), &text)),
        }
    }
}

// ============ Fixture ============

pub struct FixtureExtractionService {
    dir: PathBuf,
}

impl FixtureExtractionService {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, document_ref: &str) -> Result<PathBuf, ServiceError> {
        if document_ref.is_empty()
            || document_ref.contains(['/', '\\'])
            || document_ref.starts_with('.')
        {
            return Err(ServiceError::permanent(
                "invalid_ref",
                format!("not a fixture name: {:?}", document_ref),
            ));
        }
        Ok(self.dir.join(format!("{}.json", document_ref)))
    }
}

#[async_trait]
impl ExtractionService for FixtureExtractionService {
    async fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction, ServiceError> {
        let path = self.path_for(&request.document_ref)?;
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::permanent(
                    "not_found",
                    format!("no extraction fixture at {}", path.display()),
                ))
            }
            Err(e) => return Err(ServiceError::transient(e.to_string())),
        };
        parse_body(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(document_ref: &str) -> ExtractionRequest {
        ExtractionRequest {
            document_ref: document_ref.to_string(),
            storage_ref: format!("store://{}", document_ref),
            declared_type: None,
        }
    }

    #[tokio::test]
    async fn test_fixture_reads_extraction() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("inv-1.json"),
            r#"{"document_type":"invoice","fields":[{"name":"Total","value":"$10.00","confidence":0.95}],"text":"Invoice"}"#,
        )
        .unwrap();
        let service = FixtureExtractionService::new(dir.path().to_path_buf());
        let raw = service.extract(&request("inv-1")).await.unwrap();
        assert_eq!(raw.document_type.as_deref(), Some("invoice"));
        assert_eq!(raw.fields[0].name, "Total");
    }

    #[tokio::test]
    async fn test_fixture_missing_is_permanent() {
        let dir = TempDir::new().unwrap();
        let service = FixtureExtractionService::new(dir.path().to_path_buf());
        let err = service.extract(&request("nope")).await.unwrap_err();
        assert_eq!(err, ServiceError::permanent("not_found", err_message(&err)));
    }

    #[tokio::test]
    async fn test_fixture_error_envelope_is_classified() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("busy.json"),
            r#"{"error":{"code":"service_unavailable","message":"try later"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("tiff.json"),
            r#"{"error":{"code":"unsupported_format","message":"tiff"}}"#,
        )
        .unwrap();
        let service = FixtureExtractionService::new(dir.path().to_path_buf());
        assert!(service.extract(&request("busy")).await.unwrap_err().is_transient());
        assert!(!service.extract(&request("tiff")).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_fixture_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let service = FixtureExtractionService::new(dir.path().to_path_buf());
        let err = service.extract(&request("../etc/passwd")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_malformed_body_is_permanent() {
        assert!(!parse_body("not json").unwrap_err().is_transient());
    }

    fn err_message(err: &ServiceError) -> String {
        match err {
            ServiceError::Permanent { message, .. } => message.clone(),
            ServiceError::Transient(m) => m.clone(),
        }
    }
}
