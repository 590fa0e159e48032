//! Persistence gateway.
//!
//! All pipeline writes go through here. Three rules hold for every method:
//!
//! - **Claims.** A stage commit first renews the caller's lease. If another
//!   holder has taken the lease, the commit fails with
//!   [`PipelineError::ConcurrencyConflict`] and nothing is written.
//! - **Compare-and-set.** State only moves along a [`Transition`], and only
//!   when the stored state equals the transition's source.
//! - **Artifact before state.** A stage's artifacts and its completing
//!   transition commit in one transaction. A status reader therefore never
//!   sees a state whose artifacts are missing.
//!
//! Artifact rows are keyed by `(document_id, attempt_id, key)` and written with
//! `INSERT ... ON CONFLICT DO UPDATE`, so a stage re-run after a crash
//! overwrites its partial output instead of duplicating it.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::draft::{DraftBody, NormalizedDraft};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{PipelineError, Result};
use crate::models::{
    Attempt, Chunk, Deliverable, Document, DocumentType, EmbeddingRecord, Milestone,
    RawExtraction, Sow, UploadEvent, ValidationResult, ValidationSummary,
};
use crate::reference;
use crate::rules::{self, Evaluation};
use crate::state::{ProcessingState, Transition};

/// Exclusive right to advance one attempt, backed by a row in `leases`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub document_id: String,
    pub attempt_id: String,
    pub holder: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new attempt was created and claimed.
    Started,
    /// A live attempt is claimed by someone else. Nothing to do.
    InProgress,
    /// A live attempt's lease had expired; it is now claimed by the caller.
    Resumed,
    /// The current attempt finished (`validated` or `needs_review`).
    Completed,
    /// The current attempt failed and no further attempt is allowed.
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub document_id: String,
    pub attempt_id: String,
    pub disposition: Disposition,
    pub state: ProcessingState,
    #[serde(skip)]
    pub claim: Option<Claim>,
}

/// Read-only status of a document's current attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub document_ref: String,
    pub document_id: String,
    pub doc_type: DocumentType,
    pub state: ProcessingState,
    pub attempt_id: String,
    pub attempt_no: i64,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub retryable: bool,
    pub validation_summary: Option<ValidationSummary>,
}

#[derive(Clone)]
pub struct Gateway {
    pool: SqlitePool,
    lease: Duration,
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_state(label: &str) -> Result<ProcessingState> {
    label.parse().map_err(PipelineError::Corrupt)
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let declared: Option<String> = row.get("declared_type");
    let doc_type: String = row.get("doc_type");
    Ok(Document {
        id: row.get("id"),
        document_ref: row.get("document_ref"),
        declared_type: declared
            .map(|t| t.parse().map_err(PipelineError::Corrupt))
            .transpose()?,
        doc_type: doc_type.parse().map_err(PipelineError::Corrupt)?,
        storage_ref: row.get("storage_ref"),
        current_attempt_id: row.get("current_attempt_id"),
        attempt_count: row.get("attempt_count"),
        uploaded_at: row.get("uploaded_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<Attempt> {
    let state: String = row.get("state");
    Ok(Attempt {
        id: row.get("id"),
        document_id: row.get("document_id"),
        attempt_no: row.get("attempt_no"),
        state: parse_state(&state)?,
        failure_reason: row.get("failure_reason"),
        retryable: row.get::<i64, _>("retryable") != 0,
        started_at: row.get("started_at"),
        updated_at: row.get("updated_at"),
    })
}

const DOCUMENT_COLUMNS: &str = "id, document_ref, declared_type, doc_type, storage_ref, \
     current_attempt_id, attempt_count, uploaded_at, created_at, updated_at";

const ATTEMPT_COLUMNS: &str =
    "id, document_id, attempt_no, state, failure_reason, retryable, started_at, updated_at";

impl Gateway {
    pub fn new(pool: SqlitePool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn lease_ms(&self) -> i64 {
        self.lease.as_millis() as i64
    }

    // ============ Submission and claims ============

    /// Register an upload and decide what, if anything, the caller should run.
    ///
    /// `holder` identifies this claim; callers use a fresh holder per
    /// submission so that a resubmission never shares a live claim.
    pub async fn submit(
        &self,
        event: &UploadEvent,
        holder: &str,
        force: bool,
        max_attempts: i64,
    ) -> Result<Submission> {
        let mut tx = self.pool.begin().await?;
        let now = now_secs();
        let declared = event.document_type.map(|t| t.as_str());

        sqlx::query(
            r#"
            INSERT INTO documents (id, document_ref, declared_type, doc_type, storage_ref, attempt_count, uploaded_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(document_ref) DO UPDATE SET
                declared_type = COALESCE(excluded.declared_type, documents.declared_type),
                uploaded_at = MAX(documents.uploaded_at, excluded.uploaded_at),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&event.document_ref)
        .bind(declared)
        .bind(declared.unwrap_or(DocumentType::Unknown.as_str()))
        .bind(&event.document_ref)
        .bind(event.uploaded_at.timestamp())
        .bind(event.uploaded_at.timestamp())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE document_ref = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(&event.document_ref)
        .fetch_one(&mut *tx)
        .await?;
        let document = document_from_row(&row)?;

        let current = match &document.current_attempt_id {
            Some(id) => Some(fetch_attempt(&mut tx, id).await?),
            None => None,
        };

        let submission = match current {
            None => self.start_attempt(&mut tx, &document, holder).await?,
            Some(attempt) if !attempt.state.is_terminal() => {
                let claimed = self
                    .try_claim(&mut tx, &document.id, &attempt.id, holder)
                    .await?;
                let (disposition, claim) = if claimed {
                    (
                        Disposition::Resumed,
                        Some(Claim {
                            document_id: document.id.clone(),
                            attempt_id: attempt.id.clone(),
                            holder: holder.to_string(),
                        }),
                    )
                } else {
                    (Disposition::InProgress, None)
                };
                Submission {
                    document_id: document.id.clone(),
                    attempt_id: attempt.id,
                    disposition,
                    state: attempt.state,
                    claim,
                }
            }
            Some(attempt) => {
                let retry_allowed = attempt.state == ProcessingState::Failed
                    && attempt.retryable
                    && document.attempt_count < max_attempts;
                if force || retry_allowed {
                    self.start_attempt(&mut tx, &document, holder).await?
                } else {
                    let disposition = if attempt.state == ProcessingState::Failed {
                        Disposition::Exhausted
                    } else {
                        Disposition::Completed
                    };
                    Submission {
                        document_id: document.id.clone(),
                        attempt_id: attempt.id,
                        disposition,
                        state: attempt.state,
                        claim: None,
                    }
                }
            }
        };

        tx.commit().await?;
        debug!(
            document_ref = %event.document_ref,
            attempt_id = %submission.attempt_id,
            disposition = ?submission.disposition,
            "submission recorded"
        );
        Ok(submission)
    }

    async fn start_attempt(
        &self,
        conn: &mut SqliteConnection,
        document: &Document,
        holder: &str,
    ) -> Result<Submission> {
        let attempt_id = uuid::Uuid::new_v4().to_string();
        let now = now_secs();

        sqlx::query(
            "INSERT INTO attempts (id, document_id, attempt_no, state, retryable, started_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&attempt_id)
        .bind(&document.id)
        .bind(document.attempt_count + 1)
        .bind(ProcessingState::Uploaded.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "UPDATE documents SET current_attempt_id = ?, attempt_count = attempt_count + 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(&attempt_id)
        .bind(now)
        .bind(&document.id)
        .execute(&mut *conn)
        .await?;

        let claimed = self
            .try_claim(conn, &document.id, &attempt_id, holder)
            .await?;

        Ok(Submission {
            document_id: document.id.clone(),
            attempt_id: attempt_id.clone(),
            disposition: if claimed {
                Disposition::Started
            } else {
                Disposition::InProgress
            },
            state: ProcessingState::Uploaded,
            claim: claimed.then(|| Claim {
                document_id: document.id.clone(),
                attempt_id,
                holder: holder.to_string(),
            }),
        })
    }

    /// Conditional upsert: succeeds when no lease exists, it has expired, or
    /// `holder` already owns it.
    async fn try_claim(
        &self,
        conn: &mut SqliteConnection,
        document_id: &str,
        attempt_id: &str,
        holder: &str,
    ) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO leases (document_id, attempt_id, holder, expires_at_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                attempt_id = excluded.attempt_id,
                holder = excluded.holder,
                expires_at_ms = excluded.expires_at_ms
            WHERE leases.expires_at_ms <= ? OR leases.holder = excluded.holder
            "#,
        )
        .bind(document_id)
        .bind(attempt_id)
        .bind(holder)
        .bind(now + self.lease_ms())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give a claim up without a transition (e.g. submit without processing).
    pub async fn release(&self, claim: &Claim) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE document_id = ? AND holder = ?")
            .bind(&claim.document_id)
            .bind(&claim.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Keep a claim alive while a stage runs.
    pub async fn heartbeat(&self, claim: &Claim) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.renew(&mut *conn, claim).await
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Extend the caller's lease. Fails if another holder took it over.
    async fn renew(&self, conn: &mut SqliteConnection, claim: &Claim) -> Result<()> {
        let result = sqlx::query(
            "UPDATE leases SET expires_at_ms = ?
             WHERE document_id = ? AND attempt_id = ? AND holder = ?",
        )
        .bind(now_ms() + self.lease_ms())
        .bind(&claim.document_id)
        .bind(&claim.attempt_id)
        .bind(&claim.holder)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::ConcurrencyConflict {
                document_id: claim.document_id.clone(),
            });
        }
        Ok(())
    }

    /// Compare-and-set the attempt state along `transition`.
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        claim: &Claim,
        transition: Transition,
        failure: Option<(&str, bool)>,
    ) -> Result<()> {
        let from = transition.from();
        let to = transition.to();
        let (reason, retryable) = failure.unwrap_or(("", false));

        let result = sqlx::query(
            "UPDATE attempts SET state = ?, failure_reason = NULLIF(?, ''), retryable = ?, updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(reason)
        .bind(retryable as i64)
        .bind(now_secs())
        .bind(&claim.attempt_id)
        .bind(from.as_str())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<String> =
                sqlx::query_scalar("SELECT state FROM attempts WHERE id = ?")
                    .bind(&claim.attempt_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            return Err(PipelineError::StaleState {
                document_id: claim.document_id.clone(),
                expected: from.to_string(),
                actual: actual.unwrap_or_else(|| "missing".to_string()),
            });
        }

        if to.is_terminal() {
            sqlx::query("DELETE FROM leases WHERE document_id = ? AND holder = ?")
                .bind(&claim.document_id)
                .bind(&claim.holder)
                .execute(&mut *conn)
                .await?;
        }

        sqlx::query("UPDATE documents SET updated_at = ? WHERE id = ?")
            .bind(now_secs())
            .bind(&claim.document_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Apply a transition that carries no artifact (the `Begin*` edges).
    pub async fn transition(&self, claim: &Claim, transition: Transition) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.renew(&mut tx, claim).await?;
        self.apply(&mut tx, claim, transition, None).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Move the attempt from `from` to `Failed`, recording why.
    pub async fn fail(
        &self,
        claim: &Claim,
        from: ProcessingState,
        reason: &str,
        retryable: bool,
    ) -> Result<()> {
        let transition = from.fail().ok_or_else(|| PipelineError::StaleState {
            document_id: claim.document_id.clone(),
            expected: "a non-terminal state".to_string(),
            actual: from.to_string(),
        })?;
        let mut tx = self.pool.begin().await?;
        self.renew(&mut tx, claim).await?;
        self.apply(&mut tx, claim, transition, Some((reason, retryable)))
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Stage commits ============

    pub async fn commit_extraction(
        &self,
        claim: &Claim,
        raw: &RawExtraction,
        draft: &NormalizedDraft,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.renew(&mut tx, claim).await?;
        let now = now_secs();

        sqlx::query(
            r#"
            INSERT INTO raw_extractions (document_id, attempt_id, payload_json, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(document_id, attempt_id) DO UPDATE SET
                payload_json = excluded.payload_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(&claim.document_id)
        .bind(&claim.attempt_id)
        .bind(serde_json::to_string(raw)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO drafts (document_id, attempt_id, doc_type, draft_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_id, attempt_id) DO UPDATE SET
                doc_type = excluded.doc_type,
                draft_json = excluded.draft_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(&claim.document_id)
        .bind(&claim.attempt_id)
        .bind(draft.doc_type.as_str())
        .bind(serde_json::to_string(draft)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE documents SET doc_type = ? WHERE id = ?")
            .bind(draft.doc_type.as_str())
            .bind(&claim.document_id)
            .execute(&mut *tx)
            .await?;

        self.apply(&mut tx, claim, Transition::CompleteExtraction, None)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn commit_chunks(&self, claim: &Claim, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.renew(&mut tx, claim).await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (document_id, attempt_id, chunk_index, heading, start_offset, end_offset, text, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id, attempt_id, chunk_index) DO UPDATE SET
                    heading = excluded.heading,
                    start_offset = excluded.start_offset,
                    end_offset = excluded.end_offset,
                    text = excluded.text,
                    hash = excluded.hash
                "#,
            )
            .bind(&claim.document_id)
            .bind(&claim.attempt_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.heading)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ? AND attempt_id = ? AND chunk_index >= ?")
            .bind(&claim.document_id)
            .bind(&claim.attempt_id)
            .bind(chunks.len() as i64)
            .execute(&mut *tx)
            .await?;

        self.apply(&mut tx, claim, Transition::CompleteChunking, None)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn commit_embeddings(
        &self,
        claim: &Claim,
        summary: Option<&str>,
        records: &[EmbeddingRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.renew(&mut tx, claim).await?;
        let now = now_secs();

        if let Some(text) = summary {
            sqlx::query(
                r#"
                INSERT INTO summaries (document_id, attempt_id, text, hash)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(document_id, attempt_id) DO UPDATE SET
                    text = excluded.text,
                    hash = excluded.hash
                "#,
            )
            .bind(&claim.document_id)
            .bind(&claim.attempt_id)
            .bind(text)
            .bind(crate::chunk::hash_text(text))
            .execute(&mut *tx)
            .await?;
        }

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO embeddings (document_id, attempt_id, subject, model, text_hash, dims, vector, failure, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id, attempt_id, subject, model) DO UPDATE SET
                    text_hash = excluded.text_hash,
                    dims = excluded.dims,
                    vector = excluded.vector,
                    failure = excluded.failure,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&claim.document_id)
            .bind(&claim.attempt_id)
            .bind(record.subject.key())
            .bind(&record.model)
            .bind(&record.text_hash)
            .bind(record.vector.as_ref().map_or(0, |v| v.len() as i64))
            .bind(record.vector.as_deref().map(vec_to_blob))
            .bind(&record.failure)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        self.apply(&mut tx, claim, Transition::CompleteEmbedding, None)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Store findings and finish the attempt: `Accept` (promoting the draft to
    /// canonical tables) when there are no errors, `FlagForReview` otherwise.
    pub async fn commit_validation(
        &self,
        claim: &Claim,
        draft: &NormalizedDraft,
        evaluation: &Evaluation,
    ) -> Result<ProcessingState> {
        let mut tx = self.pool.begin().await?;
        self.renew(&mut tx, claim).await?;

        sqlx::query("DELETE FROM validation_results WHERE document_id = ? AND attempt_id = ?")
            .bind(&claim.document_id)
            .bind(&claim.attempt_id)
            .execute(&mut *tx)
            .await?;
        for (seq, result) in evaluation.results.iter().enumerate() {
            insert_result(&mut tx, claim, seq as i64, result).await?;
        }

        let transition = if evaluation.has_errors() {
            Transition::FlagForReview
        } else {
            promote(&mut tx, claim, draft, evaluation).await?;
            Transition::Accept
        };
        self.apply(&mut tx, claim, transition, None).await?;
        tx.commit().await?;
        Ok(transition.to())
    }

    // ============ Reads ============

    pub async fn document_by_ref(&self, document_ref: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE document_ref = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(document_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn document(&self, document_id: &str) -> Result<Document> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(document_id.to_string()))?;
        document_from_row(&row)
    }

    pub async fn attempt(&self, attempt_id: &str) -> Result<Attempt> {
        let mut conn = self.pool.acquire().await?;
        fetch_attempt(&mut conn, attempt_id).await
    }

    pub async fn attempts(&self, document_id: &str) -> Result<Vec<Attempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attempts WHERE document_id = ? ORDER BY attempt_no",
            ATTEMPT_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    pub async fn load_raw(&self, claim: &Claim) -> Result<RawExtraction> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload_json FROM raw_extractions WHERE document_id = ? AND attempt_id = ?",
        )
        .bind(&claim.document_id)
        .bind(&claim.attempt_id)
        .fetch_optional(&self.pool)
        .await?;
        let payload = payload.ok_or_else(|| {
            PipelineError::NotFound(format!("raw extraction for attempt {}", claim.attempt_id))
        })?;
        Ok(serde_json::from_str(&payload)?)
    }

    pub async fn load_draft(&self, claim: &Claim) -> Result<NormalizedDraft> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT draft_json FROM drafts WHERE document_id = ? AND attempt_id = ?",
        )
        .bind(&claim.document_id)
        .bind(&claim.attempt_id)
        .fetch_optional(&self.pool)
        .await?;
        let payload = payload.ok_or_else(|| {
            PipelineError::NotFound(format!("draft for attempt {}", claim.attempt_id))
        })?;
        Ok(serde_json::from_str(&payload)?)
    }

    pub async fn load_chunks(&self, claim: &Claim) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT chunk_index, heading, start_offset, end_offset, text, hash
             FROM chunks WHERE document_id = ? AND attempt_id = ? ORDER BY chunk_index",
        )
        .bind(&claim.document_id)
        .bind(&claim.attempt_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Chunk {
                chunk_index: row.get("chunk_index"),
                heading: row.get("heading"),
                start: row.get::<i64, _>("start_offset") as usize,
                end: row.get::<i64, _>("end_offset") as usize,
                text: row.get("text"),
                hash: row.get("hash"),
            })
            .collect())
    }

    /// Subject keys stored without a vector for this attempt.
    pub async fn failed_embeddings(&self, claim: &Claim) -> Result<Vec<String>> {
        let subjects = sqlx::query_scalar(
            "SELECT subject FROM embeddings
             WHERE document_id = ? AND attempt_id = ? AND vector IS NULL
             ORDER BY subject",
        )
        .bind(&claim.document_id)
        .bind(&claim.attempt_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subjects)
    }

    /// Vectors from any attempt of this document, by text hash, for one model.
    pub async fn reusable_vectors(
        &self,
        document_id: &str,
        model: &str,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let rows = sqlx::query(
            "SELECT text_hash, vector FROM embeddings
             WHERE document_id = ? AND model = ? AND vector IS NOT NULL",
        )
        .bind(document_id)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let hash: String = row.get("text_hash");
                let blob: Vec<u8> = row.get("vector");
                (hash, blob_to_vec(&blob))
            })
            .collect())
    }

    pub async fn validation_results(&self, attempt_id: &str) -> Result<Vec<ValidationResult>> {
        let rows = sqlx::query(
            "SELECT rule_id, severity, subject, message, evaluated_at
             FROM validation_results WHERE attempt_id = ? ORDER BY seq",
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let severity: String = row.get("severity");
                let evaluated_at: String = row.get("evaluated_at");
                Ok(ValidationResult {
                    rule_id: row.get("rule_id"),
                    severity: severity.parse().map_err(PipelineError::Corrupt)?,
                    subject: row.get("subject"),
                    message: row.get("message"),
                    evaluated_at: evaluated_at
                        .parse()
                        .map_err(|_| PipelineError::Corrupt(format!("bad timestamp {}", evaluated_at)))?,
                })
            })
            .collect()
    }

    /// Status of the current attempt. Reads committed rows only.
    pub async fn status(&self, document_ref: &str) -> Result<Option<StatusReport>> {
        let Some(document) = self.document_by_ref(document_ref).await? else {
            return Ok(None);
        };
        let Some(attempt_id) = document.current_attempt_id.as_deref() else {
            return Ok(None);
        };
        let attempt = self.attempt(attempt_id).await?;

        let validation_summary = match attempt.state {
            ProcessingState::Validated | ProcessingState::NeedsReview => {
                Some(rules::summarize(&self.validation_results(&attempt.id).await?))
            }
            _ => None,
        };

        Ok(Some(StatusReport {
            document_ref: document.document_ref,
            document_id: document.id,
            doc_type: document.doc_type,
            state: attempt.state,
            attempt_id: attempt.id,
            attempt_no: attempt.attempt_no,
            attempt_count: document.attempt_count,
            last_error: attempt.failure_reason,
            retryable: attempt.retryable,
            validation_summary,
        }))
    }

    /// Document refs with work a worker could pick up: live attempts whose
    /// lease is absent or expired, and retryable failures under the ceiling.
    pub async fn claimable(&self, max_attempts: i64, limit: i64) -> Result<Vec<String>> {
        let refs = sqlx::query_scalar(
            r#"
            SELECT d.document_ref
            FROM documents d
            JOIN attempts a ON a.id = d.current_attempt_id
            LEFT JOIN leases l ON l.document_id = d.id
            WHERE (a.state NOT IN ('validated', 'needs_review', 'failed')
                   AND (l.document_id IS NULL OR l.expires_at_ms <= ?))
               OR (a.state = 'failed' AND a.retryable = 1 AND d.attempt_count < ?)
            ORDER BY d.updated_at, d.id
            LIMIT ?
            "#,
        )
        .bind(now_ms())
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(refs)
    }
}

async fn fetch_attempt(conn: &mut SqliteConnection, attempt_id: &str) -> Result<Attempt> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM attempts WHERE id = ?",
        ATTEMPT_COLUMNS
    ))
    .bind(attempt_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| PipelineError::NotFound(format!("attempt {}", attempt_id)))?;
    attempt_from_row(&row)
}

async fn insert_result(
    conn: &mut SqliteConnection,
    claim: &Claim,
    seq: i64,
    result: &ValidationResult,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO validation_results (document_id, attempt_id, seq, rule_id, severity, subject, message, evaluated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(document_id, attempt_id, seq) DO UPDATE SET
            rule_id = excluded.rule_id,
            severity = excluded.severity,
            subject = excluded.subject,
            message = excluded.message,
            evaluated_at = excluded.evaluated_at
        "#,
    )
    .bind(&claim.document_id)
    .bind(&claim.attempt_id)
    .bind(seq)
    .bind(&result.rule_id)
    .bind(result.severity.as_str())
    .bind(&result.subject)
    .bind(&result.message)
    .bind(result.evaluated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn format_date(date: Option<chrono::NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

/// Write an accepted draft into the canonical entity tables.
async fn promote(
    conn: &mut SqliteConnection,
    claim: &Claim,
    draft: &NormalizedDraft,
    evaluation: &Evaluation,
) -> Result<()> {
    match &draft.body {
        DraftBody::Invoice(invoice) => {
            let invoice_id = claim.document_id.clone();
            sqlx::query(
                r#"
                INSERT INTO invoices (id, document_id, attempt_id, vendor_id, sow_id, invoice_number, issue_date, due_date, subtotal, tax, total, currency, accepted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    attempt_id = excluded.attempt_id,
                    vendor_id = excluded.vendor_id,
                    sow_id = excluded.sow_id,
                    invoice_number = excluded.invoice_number,
                    issue_date = excluded.issue_date,
                    due_date = excluded.due_date,
                    subtotal = excluded.subtotal,
                    tax = excluded.tax,
                    total = excluded.total,
                    currency = excluded.currency,
                    accepted_at = excluded.accepted_at
                "#,
            )
            .bind(&invoice_id)
            .bind(&claim.document_id)
            .bind(&claim.attempt_id)
            .bind(&evaluation.vendor_id)
            .bind(&evaluation.sow_id)
            .bind(&invoice.invoice_number.value)
            .bind(format_date(invoice.issue_date.value))
            .bind(format_date(invoice.due_date.value))
            .bind(invoice.subtotal.value.map(|a| a.cents()))
            .bind(invoice.tax.value.map(|a| a.cents()))
            .bind(invoice.total.value.map(|a| a.cents()))
            .bind(&invoice.currency.value)
            .bind(now_secs())
            .execute(&mut *conn)
            .await?;

            sqlx::query("DELETE FROM invoice_line_items WHERE invoice_id = ?")
                .bind(&invoice_id)
                .execute(&mut *conn)
                .await?;
            for item in &invoice.line_items {
                let matched = evaluation.matches.iter().find(|m| m.line_no == item.line_no);
                sqlx::query(
                    "INSERT INTO invoice_line_items (invoice_id, line_no, description, quantity, unit_price, amount, milestone_id, deliverable_id)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&invoice_id)
                .bind(item.line_no as i64)
                .bind(&item.description.value)
                .bind(item.quantity.value)
                .bind(item.unit_price.value.map(|a| a.cents()))
                .bind(item.amount.value.map(|a| a.cents()))
                .bind(matched.and_then(|m| m.milestone_id.clone()))
                .bind(matched.and_then(|m| m.deliverable_id.clone()))
                .execute(&mut *conn)
                .await?;
            }
        }
        DraftBody::Sow(sow) => {
            let Some(vendor_id) = evaluation.vendor_id.clone() else {
                return Err(PipelineError::Corrupt(format!(
                    "accepted SOW {} has no resolved vendor",
                    claim.document_id
                )));
            };
            let sow_id = format!("sow-{}", claim.document_id);
            reference::upsert_sow(
                conn,
                &Sow {
                    id: sow_id.clone(),
                    vendor_id,
                    sow_number: sow.sow_number.value.clone(),
                    title: sow.title.value.clone().unwrap_or_default(),
                    total_value: sow.total_value.value,
                    start_date: sow.start_date.value,
                    end_date: sow.end_date.value,
                    active: true,
                },
                Some(&claim.document_id),
            )
            .await?;

            // Ids are positional, so the whole schedule is replaced.
            for table in ["deliverables", "milestones"] {
                sqlx::query(&format!("DELETE FROM {} WHERE sow_id = ?", table))
                    .bind(&sow_id)
                    .execute(&mut *conn)
                    .await?;
            }

            let mut milestone_ids = Vec::with_capacity(sow.milestones.len());
            for (i, m) in sow.milestones.iter().enumerate() {
                let id = format!("{}-m{}", sow_id, i + 1);
                let name = m
                    .name
                    .value
                    .clone()
                    .unwrap_or_else(|| format!("Milestone {}", i + 1));
                reference::upsert_milestone(
                    conn,
                    &Milestone {
                        id: id.clone(),
                        sow_id: sow_id.clone(),
                        name: name.clone(),
                        description: m.description.value.clone(),
                        budget: m.amount.value,
                        due_date: m.due_date.value,
                    },
                )
                .await?;
                milestone_ids.push((name, id));
            }

            for (i, d) in sow.deliverables.iter().enumerate() {
                let milestone_id = d.milestone.value.as_deref().and_then(|label| {
                    let label = label.to_lowercase();
                    milestone_ids
                        .iter()
                        .find(|(name, _)| name.to_lowercase() == label)
                        .map(|(_, id)| id.clone())
                });
                reference::upsert_deliverable(
                    conn,
                    &Deliverable {
                        id: format!("{}-d{}", sow_id, i + 1),
                        sow_id: sow_id.clone(),
                        milestone_id,
                        name: d
                            .name
                            .value
                            .clone()
                            .unwrap_or_else(|| format!("Deliverable {}", i + 1)),
                        description: d.description.value.clone(),
                        amount: None,
                        due_date: d.due_date.value,
                    },
                )
                .await?;
            }
        }
        DraftBody::Unclassified => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::RawExtractionRef;
    use crate::{db, migrate};
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn setup(lease: Duration) -> (TempDir, Gateway) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("gw.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, Gateway::new(pool, lease))
    }

    fn event(document_ref: &str) -> UploadEvent {
        UploadEvent::new(document_ref, Some(DocumentType::Invoice))
    }

    fn unclassified(claim: &Claim) -> NormalizedDraft {
        NormalizedDraft {
            source: RawExtractionRef {
                document_id: claim.document_id.clone(),
                attempt_id: claim.attempt_id.clone(),
            },
            doc_type: DocumentType::Unknown,
            body: DraftBody::Unclassified,
            unmapped: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_resubmit_while_live_is_noop() {
        let (_tmp, gw) = setup(Duration::from_secs(60)).await;
        let first = gw.submit(&event("inv-1"), "worker-a", false, 3).await.unwrap();
        assert_eq!(first.disposition, Disposition::Started);
        assert!(first.claim.is_some());

        let second = gw.submit(&event("inv-1"), "worker-b", false, 3).await.unwrap();
        assert_eq!(second.disposition, Disposition::InProgress);
        assert_eq!(second.attempt_id, first.attempt_id);
        assert!(second.claim.is_none());

        let doc = gw.document(&first.document_id).await.unwrap();
        assert_eq!(doc.attempt_count, 1);
        assert_eq!(doc.declared_type, Some(DocumentType::Invoice));
    }

    #[tokio::test]
    async fn test_upload_time_is_recorded() {
        let (_tmp, gw) = setup(Duration::from_secs(60)).await;
        let mut upload = event("inv-1");
        upload.uploaded_at = Utc.with_ymd_and_hms(2024, 4, 2, 9, 30, 0).unwrap();
        gw.submit(&upload, "worker-a", false, 3).await.unwrap();

        let document = gw.document_by_ref("inv-1").await.unwrap().unwrap();
        assert_eq!(document.uploaded_at, upload.uploaded_at.timestamp());
        assert_eq!(document.created_at, upload.uploaded_at.timestamp());

        let mut later = event("inv-1");
        later.uploaded_at = Utc.with_ymd_and_hms(2024, 4, 3, 8, 0, 0).unwrap();
        gw.submit(&later, "worker-b", false, 3).await.unwrap();
        let document = gw.document_by_ref("inv-1").await.unwrap().unwrap();
        assert_eq!(document.uploaded_at, later.uploaded_at.timestamp());
        assert_eq!(document.created_at, upload.uploaded_at.timestamp());
    }

    #[tokio::test]
    async fn test_heartbeat_extends_lease_for_holder_only() {
        let (_tmp, gw) = setup(Duration::from_millis(300)).await;
        let claim = gw
            .submit(&event("inv-1"), "worker-a", false, 3)
            .await
            .unwrap()
            .claim
            .unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            gw.heartbeat(&claim).await.unwrap();
        }
        let other = gw.submit(&event("inv-1"), "worker-b", false, 3).await.unwrap();
        assert_eq!(other.disposition, Disposition::InProgress);

        let impostor = Claim {
            holder: "worker-b".to_string(),
            ..claim.clone()
        };
        let err = gw.heartbeat(&impostor).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn test_expired_lease_is_resumed_and_old_holder_conflicts() {
        let (_tmp, gw) = setup(Duration::from_millis(20)).await;
        let first = gw.submit(&event("inv-2"), "worker-a", false, 3).await.unwrap();
        let old_claim = first.claim.unwrap();
        gw.transition(&old_claim, Transition::BeginExtraction)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = gw.submit(&event("inv-2"), "worker-b", false, 3).await.unwrap();
        assert_eq!(second.disposition, Disposition::Resumed);
        assert_eq!(second.state, ProcessingState::Extracting);
        assert_eq!(second.attempt_id, first.attempt_id);

        let err = gw
            .commit_extraction(&old_claim, &RawExtraction::default(), &unclassified(&old_claim))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConcurrencyConflict { .. }));
        assert_eq!(
            gw.attempt(&first.attempt_id).await.unwrap().state,
            ProcessingState::Extracting
        );
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (_tmp, gw) = setup(Duration::from_secs(60)).await;
        let claim = gw
            .submit(&event("inv-3"), "w", false, 3)
            .await
            .unwrap()
            .claim
            .unwrap();
        let err = gw
            .transition(&claim, Transition::BeginChunking)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StaleState { .. }));
    }

    #[tokio::test]
    async fn test_failure_and_reattempt() {
        let (_tmp, gw) = setup(Duration::from_secs(60)).await;
        let first = gw.submit(&event("inv-4"), "w1", false, 2).await.unwrap();
        let claim = first.claim.unwrap();
        gw.transition(&claim, Transition::BeginExtraction).await.unwrap();
        gw.fail(&claim, ProcessingState::Extracting, "service busy", true)
            .await
            .unwrap();

        let status = gw.status("inv-4").await.unwrap().unwrap();
        assert_eq!(status.state, ProcessingState::Failed);
        assert_eq!(status.last_error.as_deref(), Some("service busy"));
        assert_eq!(gw.claimable(2, 10).await.unwrap(), vec!["inv-4".to_string()]);

        let second = gw.submit(&event("inv-4"), "w2", false, 2).await.unwrap();
        assert_eq!(second.disposition, Disposition::Started);
        assert_ne!(second.attempt_id, first.attempt_id);

        let claim = second.claim.unwrap();
        gw.transition(&claim, Transition::BeginExtraction).await.unwrap();
        gw.fail(&claim, ProcessingState::Extracting, "service busy", true)
            .await
            .unwrap();
        let third = gw.submit(&event("inv-4"), "w3", false, 2).await.unwrap();
        assert_eq!(third.disposition, Disposition::Exhausted);
        assert!(gw.claimable(2, 10).await.unwrap().is_empty());
        assert_eq!(gw.attempts(&third.document_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stage_commits_and_status() {
        let (_tmp, gw) = setup(Duration::from_secs(60)).await;
        let claim = gw
            .submit(&event("doc-5"), "w", false, 3)
            .await
            .unwrap()
            .claim
            .unwrap();
        let draft = unclassified(&claim);

        gw.transition(&claim, Transition::BeginExtraction).await.unwrap();
        gw.commit_extraction(&claim, &RawExtraction::default(), &draft)
            .await
            .unwrap();
        assert_eq!(gw.load_draft(&claim).await.unwrap(), draft);

        gw.transition(&claim, Transition::BeginChunking).await.unwrap();
        let chunks = crate::chunk::chunk_document("One.\n\nTwo.", &[], &[], 1);
        gw.commit_chunks(&claim, &chunks).await.unwrap();
        assert_eq!(gw.load_chunks(&claim).await.unwrap(), chunks);

        gw.transition(&claim, Transition::BeginEmbedding).await.unwrap();
        let records = vec![
            EmbeddingRecord {
                subject: crate::models::EmbeddingSubject::Chunk(0),
                model: "m".into(),
                text_hash: chunks[0].hash.clone(),
                vector: Some(vec![1.0, 2.0]),
                failure: None,
            },
            EmbeddingRecord {
                subject: crate::models::EmbeddingSubject::Chunk(1),
                model: "m".into(),
                text_hash: chunks[1].hash.clone(),
                vector: None,
                failure: Some("boom".into()),
            },
        ];
        gw.commit_embeddings(&claim, None, &records).await.unwrap();
        assert_eq!(gw.failed_embeddings(&claim).await.unwrap(), vec!["chunk:1"]);
        let reusable = gw.reusable_vectors(&claim.document_id, "m").await.unwrap();
        assert_eq!(reusable.get(&chunks[0].hash), Some(&vec![1.0, 2.0]));
        assert_eq!(reusable.len(), 1);

        gw.transition(&claim, Transition::BeginValidation).await.unwrap();
        let evaluation = Evaluation {
            results: vec![ValidationResult {
                rule_id: "structural.document_type".into(),
                severity: crate::models::Severity::Error,
                subject: "documentType".into(),
                message: "unknown".into(),
                evaluated_at: Utc::now(),
            }],
            ..Default::default()
        };
        let state = gw.commit_validation(&claim, &draft, &evaluation).await.unwrap();
        assert_eq!(state, ProcessingState::NeedsReview);

        let status = gw.status("doc-5").await.unwrap().unwrap();
        assert_eq!(status.state, ProcessingState::NeedsReview);
        assert_eq!(status.validation_summary.unwrap().errors, 1);

        let again = gw.submit(&event("doc-5"), "w2", false, 3).await.unwrap();
        assert_eq!(again.disposition, Disposition::Completed);
        let forced = gw.submit(&event("doc-5"), "w2", true, 3).await.unwrap();
        assert_eq!(forced.disposition, Disposition::Started);
    }

    #[tokio::test]
    async fn test_status_unknown_ref() {
        let (_tmp, gw) = setup(Duration::from_secs(60)).await;
        assert!(gw.status("missing").await.unwrap().is_none());
    }
}
