//! Pipeline orchestration.
//!
//! Drives a claimed attempt through `extract → chunk → embed → validate`. The
//! stage to run is always derived from the stored state, so a worker that
//! resumes an expired claim re-runs exactly the stage whose artifact never
//! committed.
//!
//! Error handling per stage:
//!
//! - a [`ServiceError`] from an external call (after retries) fails the
//!   attempt; transient errors leave it retryable;
//! - a store error, lost claim, or stale state abandons the run without a
//!   transition, and the lease expiry hands the attempt to another worker.
//!
//! While a stage runs, its lease is renewed every third of the lease period,
//! so only a crashed or stalled worker loses its claim.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::draft::RawExtractionRef;
use crate::embed::EmbeddingCoordinator;
use crate::embedding::create_provider;
use crate::error::{PipelineError, Result};
use crate::extract::{create_service, ExtractionRequest, ExtractionService};
use crate::gateway::{Claim, Disposition, Gateway, StatusReport, Submission};
use crate::models::{DocumentType, UploadEvent};
use crate::normalize::normalize;
use crate::reference::load_snapshot;
use crate::retry::RetryPolicy;
use crate::rules::{EvaluationInput, RuleEngine};
use crate::state::{ProcessingState, Stage};
use crate::summarize::create_summarizer;

/// Counts from one [`Orchestrator::run_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub claimed: usize,
    pub validated: usize,
    pub needs_review: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &Result<ProcessingState>) {
        self.claimed += 1;
        match outcome {
            Ok(ProcessingState::Validated) => self.validated += 1,
            Ok(ProcessingState::NeedsReview) => self.needs_review += 1,
            Ok(ProcessingState::Failed) => self.failed += 1,
            Ok(_) | Err(_) => self.abandoned += 1,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    gateway: Gateway,
    extraction: Arc<dyn ExtractionService>,
    embedder: Arc<EmbeddingCoordinator>,
    rules: Arc<RuleEngine>,
    retry: RetryPolicy,
    config: Arc<Config>,
    worker_id: String,
}

impl Orchestrator {
    /// Wire up the configured extraction, embedding, and summarization services.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let extraction: Arc<dyn ExtractionService> = create_service(&config.extraction)
            .context("failed to set up extraction service")?
            .into();
        let provider = create_provider(&config.embedding)
            .context("failed to set up embedding provider")?;
        let summarizer = create_summarizer(&config.summarization)
            .context("failed to set up summarizer")?;
        let retry = RetryPolicy::from_config(&config.pipeline);
        let embedder = EmbeddingCoordinator::new(
            provider.into(),
            summarizer.into(),
            retry.clone(),
            config.embedding.batch_size,
        );
        Ok(Self::new(config.clone(), pool, extraction, embedder))
    }

    pub fn new(
        config: Config,
        pool: SqlitePool,
        extraction: Arc<dyn ExtractionService>,
        embedder: EmbeddingCoordinator,
    ) -> Self {
        let worker_id = format!(
            "{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            gateway: Gateway::new(pool, config.pipeline.lease()),
            extraction,
            embedder: Arc::new(embedder),
            rules: Arc::new(RuleEngine::new(config.validation.clone())),
            retry: RetryPolicy::from_config(&config.pipeline),
            config: Arc::new(config),
            worker_id,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// A fresh claim holder: the worker id plus a per-claim suffix.
    fn holder(&self) -> String {
        format!("{}:{}", self.worker_id, uuid::Uuid::new_v4().simple())
    }

    /// Record an upload. Idempotent for a live or finished document unless
    /// `force` is set, in which case a new attempt is started.
    pub async fn submit(&self, event: &UploadEvent, force: bool) -> Result<Submission> {
        let holder = self.holder();
        self.gateway
            .submit(event, &holder, force, self.config.pipeline.max_attempts)
            .await
    }

    /// Submit and, when a claim was obtained, run the attempt to a terminal state.
    pub async fn submit_and_process(
        &self,
        event: &UploadEvent,
        force: bool,
    ) -> Result<(Submission, Option<ProcessingState>)> {
        let submission = self.submit(event, force).await?;
        let outcome = match &submission.claim {
            Some(claim) => Some(self.process(claim).await?),
            None => None,
        };
        Ok((submission, outcome))
    }

    pub async fn status(&self, document_ref: &str) -> Result<Option<StatusReport>> {
        self.gateway.status(document_ref).await
    }

    /// Advance a claimed attempt until it reaches a terminal state.
    #[instrument(
        skip(self, claim),
        fields(document_id = %claim.document_id, attempt_id = %claim.attempt_id)
    )]
    pub async fn process(&self, claim: &Claim) -> Result<ProcessingState> {
        loop {
            let state = self.gateway.attempt(&claim.attempt_id).await?.state;
            let Some(stage) = state.next_stage() else {
                info!(state = %state, "attempt finished");
                return Ok(state);
            };

            if state == stage.ready_state() {
                self.gateway.transition(claim, stage.begin()).await?;
            }

            match self.run_stage_held(stage, claim).await {
                Ok(()) => {}
                Err(PipelineError::Service(err)) => {
                    warn!(stage = stage.as_str(), error = %err, "stage failed");
                    self.gateway
                        .fail(
                            claim,
                            stage.running_state(),
                            &format!("{}: {}", stage.as_str(), err),
                            err.is_transient(),
                        )
                        .await?;
                    return Ok(ProcessingState::Failed);
                }
                Err(err) => {
                    warn!(stage = stage.as_str(), error = %err, "abandoning attempt");
                    return Err(err);
                }
            }
        }
    }

    /// Run a stage while renewing the claim. A failed renewal drops the stage.
    async fn run_stage_held(&self, stage: Stage, claim: &Claim) -> Result<()> {
        let period = (self.gateway.lease() / 3).max(Duration::from_millis(50));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let work = self.run_stage(stage, claim);
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                result = &mut work => return result,
                _ = heartbeat.tick() => {
                    if let Err(err) = self.gateway.heartbeat(claim).await {
                        // A terminal commit releases the lease before the stage returns.
                        if self.gateway.attempt(&claim.attempt_id).await?.state.is_terminal() {
                            return work.await;
                        }
                        warn!(stage = stage.as_str(), error = %err, "claim lost mid-stage");
                        return Err(err);
                    }
                    debug!(stage = stage.as_str(), "lease renewed");
                }
            }
        }
    }

    async fn run_stage(&self, stage: Stage, claim: &Claim) -> Result<()> {
        match stage {
            Stage::Extract => self.extract(claim).await,
            Stage::Chunk => self.chunk(claim).await,
            Stage::Embed => self.embed(claim).await,
            Stage::Validate => self.validate(claim).await,
        }
    }

    async fn extract(&self, claim: &Claim) -> Result<()> {
        let document = self.gateway.document(&claim.document_id).await?;
        let request = ExtractionRequest {
            document_ref: document.document_ref.clone(),
            storage_ref: document.storage_ref.clone(),
            declared_type: document.declared_type,
        };

        let raw = self
            .retry
            .run("extract", || self.extraction.extract(&request))
            .await?;

        let draft = normalize(
            &raw,
            document.declared_type,
            RawExtractionRef {
                document_id: claim.document_id.clone(),
                attempt_id: claim.attempt_id.clone(),
            },
        );
        info!(
            doc_type = draft.doc_type.as_str(),
            fields = raw.fields.len(),
            tables = raw.tables.len(),
            unmapped = draft.unmapped.len(),
            "extraction normalized"
        );
        self.gateway.commit_extraction(claim, &raw, &draft).await
    }

    async fn chunk(&self, claim: &Claim) -> Result<()> {
        let raw = self.gateway.load_raw(claim).await?;
        let spans: Vec<(usize, usize)> = raw.tables.iter().filter_map(|t| t.span).collect();
        let chunks = chunk_document(
            &raw.text,
            &raw.headings,
            &spans,
            self.config.chunking.max_tokens,
        );
        info!(chunks = chunks.len(), "document chunked");
        self.gateway.commit_chunks(claim, &chunks).await
    }

    async fn embed(&self, claim: &Claim) -> Result<()> {
        let chunks = self.gateway.load_chunks(claim).await?;
        let draft = self.gateway.load_draft(claim).await?;

        let summary = if draft.doc_type == DocumentType::Sow {
            let raw = self.gateway.load_raw(claim).await?;
            match self.embedder.summarize(&raw.text).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(error = %err, "summarization failed; continuing without summary");
                    None
                }
            }
        } else {
            None
        };

        let reusable = self
            .gateway
            .reusable_vectors(&claim.document_id, self.embedder.model_name())
            .await?;
        let records = self
            .embedder
            .embed_document(&chunks, summary.as_deref(), &reusable)
            .await;
        self.gateway
            .commit_embeddings(claim, summary.as_deref(), &records)
            .await
    }

    async fn validate(&self, claim: &Claim) -> Result<()> {
        let draft = self.gateway.load_draft(claim).await?;
        let reference = load_snapshot(self.gateway.pool()).await?;
        let failed_embeddings = self.gateway.failed_embeddings(claim).await?;

        let evaluation = self.rules.evaluate(&EvaluationInput {
            draft: &draft,
            reference: &reference,
            failed_embeddings: &failed_embeddings,
            evaluated_at: Utc::now(),
        });
        let summary = evaluation.summary();
        let state = self
            .gateway
            .commit_validation(claim, &draft, &evaluation)
            .await?;
        info!(
            state = %state,
            errors = summary.errors,
            warnings = summary.warnings,
            "validation committed"
        );
        Ok(())
    }

    /// Claim and process every document with pending work, up to
    /// `pipeline.workers` at a time.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let workers = self.config.pipeline.workers.max(1);
        let refs = self
            .gateway
            .claimable(self.config.pipeline.max_attempts, (workers * 4) as i64)
            .await?;

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for document_ref in refs {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let orchestrator = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let submission = orchestrator
                    .submit(&UploadEvent::new(document_ref.clone(), None), false)
                    .await?;
                match (&submission.claim, submission.disposition) {
                    (Some(claim), Disposition::Started | Disposition::Resumed) => {
                        orchestrator.process(claim).await.map(Some)
                    }
                    _ => Ok(None),
                }
            });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(None)) => {}
                Ok(Ok(Some(state))) => summary.record(&Ok(state)),
                Ok(Err(err)) => {
                    warn!(error = %err, "document run abandoned");
                    summary.record(&Err(err));
                }
                Err(err) => warn!(error = %err, "worker task panicked"),
            }
        }
        Ok(summary)
    }

    /// Poll for work until Ctrl-C.
    pub async fn run_worker(&self) -> Result<()> {
        let poll = Duration::from_secs(self.config.pipeline.poll_interval_secs.max(1));
        info!(worker_id = %self.worker_id, workers = self.config.pipeline.workers, "worker started");

        loop {
            let summary = self.run_once().await?;
            if summary.claimed > 0 {
                info!(
                    claimed = summary.claimed,
                    validated = summary.validated,
                    needs_review = summary.needs_review,
                    failed = summary.failed,
                    abandoned = summary.abandoned,
                    "worker pass complete"
                );
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    return Ok(());
                }
            }
        }
    }
}
