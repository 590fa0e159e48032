//! Core data models used throughout paperline.
//!
//! These types represent the documents, extraction snapshots, chunks,
//! embeddings, findings, and reference entities that flow through the
//! ingestion and validation pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::state::ProcessingState;

/// Declared or inferred kind of a financial document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    Sow,
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Sow => "sow",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invoice" => Ok(Self::Invoice),
            "sow" | "statement_of_work" | "statement-of-work" => Ok(Self::Sow),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown document type: {}", other)),
        }
    }
}

/// Upload notification that starts (or re-triggers) processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEvent {
    pub document_ref: String,
    #[serde(default)]
    pub document_type: Option<DocumentType>,
    #[serde(default = "Utc::now")]
    pub uploaded_at: DateTime<Utc>,
}

impl UploadEvent {
    pub fn new(document_ref: impl Into<String>, document_type: Option<DocumentType>) -> Self {
        Self {
            document_ref: document_ref.into(),
            document_type,
            uploaded_at: Utc::now(),
        }
    }
}

/// A document row. Never deleted; reprocessing adds attempts.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub document_ref: String,
    pub declared_type: Option<DocumentType>,
    pub doc_type: DocumentType,
    pub storage_ref: String,
    pub current_attempt_id: Option<String>,
    pub attempt_count: i64,
    /// Time of the most recent upload event, in seconds.
    pub uploaded_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One pass of a document through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub id: String,
    pub document_id: String,
    pub attempt_no: i64,
    pub state: ProcessingState,
    pub failure_reason: Option<String>,
    pub retryable: bool,
    pub started_at: i64,
    pub updated_at: i64,
}

// ============ Raw extraction ============

/// One `(fieldName, value, confidence)` triple from the extraction service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawField {
    pub name: String,
    pub value: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCell {
    pub text: String,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

/// An extracted table: ordered rows of cells, with the character span it
/// occupies in the document text when the service reports one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub rows: Vec<Vec<RawCell>>,
    #[serde(default)]
    pub span: Option<(usize, usize)>,
}

/// `(entityRefA, entityRefB, relationKind)` link between extracted entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLink {
    pub from: String,
    pub to: String,
    pub kind: String,
}

/// Structural marker supplied by extraction. `offset` is a character offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heading {
    pub text: String,
    pub offset: usize,
    #[serde(default = "default_heading_level")]
    pub level: u8,
}

fn default_heading_level() -> u8 {
    1
}

/// Snapshot of extraction-service output for one attempt. Immutable once stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub fields: Vec<RawField>,
    #[serde(default)]
    pub tables: Vec<RawTable>,
    #[serde(default)]
    pub links: Vec<RawLink>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub headings: Vec<Heading>,
}

// ============ Chunks, embeddings, findings ============

/// An ordered segment of document text. `start`/`end` are character offsets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub chunk_index: i64,
    pub heading: Option<String>,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub hash: String,
}

/// What an embedding is keyed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmbeddingSubject {
    Chunk(i64),
    Summary,
}

impl EmbeddingSubject {
    pub fn key(&self) -> String {
        match self {
            Self::Chunk(index) => format!("chunk:{}", index),
            Self::Summary => "summary".to_string(),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        if key == "summary" {
            return Some(Self::Summary);
        }
        key.strip_prefix("chunk:")
            .and_then(|n| n.parse().ok())
            .map(Self::Chunk)
    }
}

/// A vector for one subject, or a failure flag with a null vector.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub subject: EmbeddingSubject,
    pub model: String,
    pub text_hash: String,
    pub vector: Option<Vec<f32>>,
    pub failure: Option<String>,
}

impl EmbeddingRecord {
    pub fn is_failed(&self) -> bool {
        self.vector.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// One graded finding from the rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub rule_id: String,
    pub severity: Severity,
    pub subject: String,
    pub message: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Counts of findings per severity, as exposed by the status query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub errors: i64,
    pub warnings: i64,
    pub infos: i64,
}

// ============ Money ============

/// Currency amount in minor units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub i64);

impl Amount {
    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn from_major(value: f64) -> Self {
        Self((value * 100.0).round() as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl std::ops::Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        Amount(iter.map(|a| a.0).sum())
    }
}

// ============ Reference entities ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sow {
    pub id: String,
    pub vendor_id: String,
    #[serde(default)]
    pub sow_number: Option<String>,
    pub title: String,
    #[serde(default)]
    pub total_value: Option<Amount>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub sow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// `None` leaves the milestone uncapped.
    #[serde(default)]
    pub budget: Option<Amount>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: String,
    pub sow_id: String,
    #[serde(default)]
    pub milestone_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_display() {
        assert_eq!(Amount(125_000).to_string(), "1250.00");
        assert_eq!(Amount(-5).to_string(), "-0.05");
        assert_eq!(Amount::from_major(400.0), Amount(40_000));
    }

    #[test]
    fn test_severity_orders_error_highest() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_embedding_subject_keys() {
        assert_eq!(EmbeddingSubject::Chunk(3).key(), "chunk:3");
        assert_eq!(EmbeddingSubject::parse("chunk:3"), Some(EmbeddingSubject::Chunk(3)));
        assert_eq!(EmbeddingSubject::parse("summary"), Some(EmbeddingSubject::Summary));
        assert_eq!(EmbeddingSubject::parse("chunk:x"), None);
    }

    #[test]
    fn test_raw_extraction_defaults() {
        let raw: RawExtraction =
            serde_json::from_str(r#"{"fields":[{"name":"Total","value":"$5","confidence":0.9}]}"#)
                .unwrap();
        assert_eq!(raw.fields.len(), 1);
        assert!(raw.tables.is_empty());
        assert!(raw.text.is_empty());
    }
}
