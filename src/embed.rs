//! Embedding coordinator.
//!
//! Produces one [`EmbeddingRecord`] per chunk (plus one for the document
//! summary, when there is one) and never fails the document:
//!
//! 1. vectors from an earlier attempt with the same model and text hash are reused;
//! 2. remaining texts are deduplicated by hash and sent in batches of `batch_size`;
//! 3. when a batch fails, each of its texts is retried on its own, so one bad
//!    chunk cannot take the others down;
//! 4. a text that still fails is recorded with a null vector and its failure reason.
//!
//! Flagged records surface later as `embedding.coverage` warnings.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use crate::chunk::hash_text;
use crate::embedding::EmbeddingProvider;
use crate::error::ServiceError;
use crate::models::{Chunk, EmbeddingRecord, EmbeddingSubject};
use crate::retry::RetryPolicy;
use crate::summarize::Summarizer;

/// Summary text plus the embedding records for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbedOutcome {
    pub summary: Option<String>,
    pub records: Vec<EmbeddingRecord>,
}

impl EmbedOutcome {
    pub fn failed_subjects(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.is_failed())
            .map(|r| r.subject.key())
            .collect()
    }
}

pub struct EmbeddingCoordinator {
    provider: Arc<dyn EmbeddingProvider>,
    summarizer: Arc<dyn Summarizer>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl EmbeddingCoordinator {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        summarizer: Arc<dyn Summarizer>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            summarizer,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Summarize `text` if a summarizer is configured. Failure leaves no summary.
    pub async fn summarize(&self, text: &str) -> Result<Option<String>, ServiceError> {
        if !self.summarizer.is_enabled() || text.trim().is_empty() {
            return Ok(None);
        }
        self.retry
            .run("summarize", || self.summarizer.summarize(text))
            .await
            .map(Some)
    }

    /// Embed `chunks` and an optional summary. `reusable` maps text hash to a
    /// vector already stored for this document and model.
    pub async fn embed_document(
        &self,
        chunks: &[Chunk],
        summary: Option<&str>,
        reusable: &HashMap<String, Vec<f32>>,
    ) -> Vec<EmbeddingRecord> {
        if !self.provider.is_enabled() {
            return Vec::new();
        }

        let mut items: Vec<(EmbeddingSubject, String, &str)> = chunks
            .iter()
            .map(|c| (EmbeddingSubject::Chunk(c.chunk_index), c.hash.clone(), c.text.as_str()))
            .collect();
        if let Some(text) = summary {
            items.push((EmbeddingSubject::Summary, hash_text(text), text));
        }

        let dims = self.provider.dims();
        let mut vectors: HashMap<String, Result<Vec<f32>, String>> = HashMap::new();
        let mut pending: BTreeMap<String, &str> = BTreeMap::new();
        let mut reused = 0;

        for (_, hash, text) in &items {
            match reusable.get(hash) {
                Some(v) if v.len() == dims => {
                    vectors.insert(hash.clone(), Ok(v.clone()));
                    reused += 1;
                }
                _ => {
                    pending.insert(hash.clone(), *text);
                }
            }
        }

        let pending: Vec<(String, &str)> = pending.into_iter().collect();
        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, t)| t.to_string()).collect();
            match self
                .retry
                .run("embed batch", || self.provider.embed(&texts))
                .await
            {
                Ok(batch_vectors) => {
                    for ((hash, _), vector) in batch.iter().zip(batch_vectors) {
                        vectors.insert(hash.clone(), Ok(vector));
                    }
                }
                Err(err) => {
                    warn!(size = batch.len(), error = %err, "batch embedding failed; retrying texts individually");
                    for (hash, text) in batch {
                        vectors.insert(hash.clone(), self.embed_one(text).await);
                    }
                }
            }
        }

        let model = self.provider.model_name().to_string();
        let mut records: Vec<EmbeddingRecord> = items
            .into_iter()
            .map(|(subject, hash, _)| {
                let (vector, failure) = match vectors.get(&hash) {
                    Some(Ok(v)) => (Some(v.clone()), None),
                    Some(Err(reason)) => (None, Some(reason.clone())),
                    None => (None, Some("no vector produced".to_string())),
                };
                EmbeddingRecord {
                    subject,
                    model: model.clone(),
                    text_hash: hash,
                    vector,
                    failure,
                }
            })
            .collect();
        records.sort_by(|a, b| a.subject.cmp(&b.subject));

        let failed = records.iter().filter(|r| r.is_failed()).count();
        info!(
            total = records.len(),
            reused,
            failed,
            model = %model,
            "embeddings computed"
        );
        records
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, String> {
        let input = vec![text.to_string()];
        match self.retry.run("embed text", || self.provider.embed(&input)).await {
            Ok(mut vectors) if vectors.len() == 1 => Ok(vectors.remove(0)),
            Ok(vectors) => Err(format!("expected 1 vector, got {}", vectors.len())),
            Err(err) => Err(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_document;
    use crate::summarize::DisabledSummarizer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails permanently for any text containing "POISON".
    struct MockProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for MockProvider {
        fn model_name(&self) -> &str {
            "mock-embed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("POISON")) {
                return Err(ServiceError::permanent("invalid_input", "poisoned text"));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn coordinator(provider: Arc<MockProvider>) -> EmbeddingCoordinator {
        EmbeddingCoordinator::new(
            provider,
            Arc::new(DisabledSummarizer),
            RetryPolicy {
                ceiling: 2,
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
                timeout: Duration::from_secs(1),
            },
            32,
        )
    }

    fn chunks(paragraphs: &[&str]) -> Vec<Chunk> {
        chunk_document(&paragraphs.join("\n\n"), &[], &[], 5)
    }

    #[tokio::test]
    async fn test_one_failing_chunk_is_isolated() {
        let provider = Arc::new(MockProvider {
            calls: AtomicUsize::new(0),
        });
        let chunks = chunks(&["Alpha one.", "Beta two.", "POISON three.", "Gamma four.", "Delta five."]);
        assert_eq!(chunks.len(), 5);

        let records = coordinator(provider.clone())
            .embed_document(&chunks, None, &HashMap::new())
            .await;
        assert_eq!(records.len(), 5);
        assert_eq!(records.iter().filter(|r| r.vector.is_some()).count(), 4);
        let failed: Vec<_> = records.iter().filter(|r| r.is_failed()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].subject, EmbeddingSubject::Chunk(2));
        assert!(failed[0].failure.as_deref().unwrap().contains("poisoned"));
    }

    #[tokio::test]
    async fn test_reuses_vectors_by_hash() {
        let provider = Arc::new(MockProvider {
            calls: AtomicUsize::new(0),
        });
        let chunks = chunks(&["Alpha one.", "Beta two."]);
        let reusable: HashMap<String, Vec<f32>> = chunks
            .iter()
            .map(|c| (c.hash.clone(), vec![9.0, 9.0]))
            .collect();

        let records = coordinator(provider.clone())
            .embed_document(&chunks, None, &reusable)
            .await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(records.iter().all(|r| r.vector == Some(vec![9.0, 9.0])));
    }

    #[tokio::test]
    async fn test_identical_texts_embedded_once() {
        let provider = Arc::new(MockProvider {
            calls: AtomicUsize::new(0),
        });
        let chunks = chunks(&["Same text.", "Same text."]);
        let records = coordinator(provider.clone())
            .embed_document(&chunks, Some("Summary text."), &HashMap::new())
            .await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].subject, EmbeddingSubject::Summary);
        assert_eq!(records[0].vector, records[1].vector);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_provider_writes_nothing() {
        let coordinator = EmbeddingCoordinator::new(
            Arc::new(crate::embedding::DisabledProvider),
            Arc::new(DisabledSummarizer),
            RetryPolicy {
                ceiling: 1,
                base: Duration::ZERO,
                max: Duration::ZERO,
                timeout: Duration::from_secs(1),
            },
            8,
        );
        let chunks = chunks(&["Alpha one."]);
        assert!(coordinator
            .embed_document(&chunks, None, &HashMap::new())
            .await
            .is_empty());
        assert_eq!(coordinator.summarize("text").await.unwrap(), None);
    }
}
