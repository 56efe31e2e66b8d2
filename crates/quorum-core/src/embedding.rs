//! Semantic similarity index over function records.
//!
//! The embedding provider is an injectable trait so the index can be built
//! against any backend (or a deterministic mock in tests). The index itself
//! is read-only after construction and safe to share across worker threads.

use std::collections::BTreeMap;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::errors::QuorumResult;
use crate::models::FunctionRecord;
use crate::retry::with_backoff;

/// Boundary to the external embedding provider: text in, fixed-dimension
/// vector out. Failures are retryable; exhaustion means "no vector".
pub trait EmbeddingService: Send + Sync {
    fn embed(&self, text: &str) -> QuorumResult<Vec<f32>>;
}

/// Maps record ids to embedding vectors and answers k-nearest-neighbor
/// queries. Writes happen only during `build`, which completes before any
/// querying starts.
#[derive(Clone, Debug, Default)]
pub struct EmbeddingIndex {
    vectors: BTreeMap<String, Vec<f32>>,
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl EmbeddingIndex {
    /// Embed every record through the shared retry helper. A record whose
    /// embedding fails after retries is simply absent from the index; the
    /// build itself never fails on individual records.
    pub fn build<'a, I>(
        records: I,
        service: &dyn EmbeddingService,
        retry: &RetryPolicy,
    ) -> EmbeddingIndex
    where
        I: IntoIterator<Item = &'a FunctionRecord>,
    {
        let mut vectors = BTreeMap::new();
        for record in records {
            match with_backoff(retry, "embed", || service.embed(&record.text)) {
                Ok(vector) => {
                    vectors.insert(record.id.clone(), vector);
                }
                Err(err) => {
                    warn!(record = record.id.as_str(), "no vector available: {err}");
                }
            }
        }
        EmbeddingIndex { vectors }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vectors.contains_key(id)
    }

    /// Rank all indexed records against `query`, descending similarity,
    /// ties broken by ascending record id.
    fn rank(&self, query: &[f32], k: usize, exclude: Option<&str>) -> Vec<String> {
        let mut scored: Vec<(f32, &String)> = self
            .vectors
            .iter()
            .filter(|(id, _)| exclude != Some(id.as_str()))
            .map(|(id, vector)| (cosine(query, vector), id))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        scored.into_iter().take(k).map(|(_, id)| id.clone()).collect()
    }

    /// Top-k neighbors of an indexed record. A record with no vector has no
    /// neighbors.
    pub fn query_by_id(&self, id: &str, k: usize) -> Vec<String> {
        match self.vectors.get(id) {
            Some(vector) => self.rank(vector, k, Some(id)),
            None => Vec::new(),
        }
    }

    /// Top-k neighbors of ad hoc text. Embedding the query goes through the
    /// retry helper; exhaustion surfaces as a retryable error the caller
    /// treats as "zero semantic neighbors available".
    pub fn query_text(
        &self,
        text: &str,
        k: usize,
        service: &dyn EmbeddingService,
        retry: &RetryPolicy,
    ) -> QuorumResult<Vec<String>> {
        let vector = with_backoff(retry, "embed_query", || service.embed(text))?;
        Ok(self.rank(&vector, k, None))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::errors::QuorumError;
    use crate::models::{record_id, Language, Visibility};

    fn record(name: &str, text: &str) -> FunctionRecord {
        FunctionRecord {
            id: record_id("m", name),
            language: Language::Python,
            file_path: "m.py".into(),
            module_path: "m".into(),
            name: name.into(),
            qualified_name: format!("m.{name}"),
            start_line: 1,
            end_line: 2,
            text: text.into(),
            call_names: vec![],
            visibility: Visibility::Public,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(1),
        }
    }

    /// Deterministic embedding: [len, vowels, underscores].
    struct CountingEmbedder;

    impl EmbeddingService for CountingEmbedder {
        fn embed(&self, text: &str) -> QuorumResult<Vec<f32>> {
            let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count();
            let unders = text.chars().filter(|c| *c == '_').count();
            Ok(vec![text.len() as f32, vowels as f32, unders as f32])
        }
    }

    struct FailingEmbedder {
        calls: AtomicU32,
    }

    impl EmbeddingService for FailingEmbedder {
        fn embed(&self, _text: &str) -> QuorumResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(QuorumError::Retrieval("embedding service down".into()))
        }
    }

    #[test]
    fn build_indexes_all_records() {
        let records = vec![record("a", "alpha body"), record("b", "beta body")];
        let index = EmbeddingIndex::build(records.iter(), &CountingEmbedder, &fast_retry());
        assert_eq!(index.len(), 2);
        assert!(index.contains(&records[0].id));
    }

    #[test]
    fn query_ranks_by_similarity() {
        let a = record("a", "aaaa");
        let b = record("b", "aaab");
        let c = record("c", "zzzzzzzzzzzzzzzzzzzz____");
        let records = vec![a.clone(), b.clone(), c.clone()];
        let index = EmbeddingIndex::build(records.iter(), &CountingEmbedder, &fast_retry());

        let neighbors = index.query_by_id(&a.id, 2);
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0], b.id);
    }

    #[test]
    fn ties_break_by_record_id() {
        // Identical texts embed identically; ranking must fall back to ids.
        let a = record("a", "same body");
        let b = record("b", "same body");
        let c = record("c", "same body");
        let records = vec![a.clone(), b.clone(), c.clone()];
        let index = EmbeddingIndex::build(records.iter(), &CountingEmbedder, &fast_retry());

        let mut expected: Vec<String> = vec![b.id.clone(), c.id.clone()];
        expected.sort();
        assert_eq!(index.query_by_id(&a.id, 2), expected);
    }

    #[test]
    fn failed_records_absent_from_index() {
        let records = vec![record("a", "alpha")];
        let embedder = FailingEmbedder {
            calls: AtomicU32::new(0),
        };
        let index = EmbeddingIndex::build(records.iter(), &embedder, &fast_retry());
        assert!(index.is_empty());
        // Exhausted the retry budget before giving up.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert!(index.query_by_id(&records[0].id, 3).is_empty());
    }

    #[test]
    fn query_text_surfaces_retryable_error() {
        let records = vec![record("a", "alpha")];
        let index = EmbeddingIndex::build(records.iter(), &CountingEmbedder, &fast_retry());
        let failing = FailingEmbedder {
            calls: AtomicU32::new(0),
        };
        let result = index.query_text("probe", 3, &failing, &fast_retry());
        assert!(matches!(result, Err(ref e) if e.is_retryable()));
    }

    #[test]
    fn query_text_ranks_against_index() {
        let a = record("a", "short");
        let b = record("b", "a considerably longer body of text here");
        let records = vec![a.clone(), b];
        let index = EmbeddingIndex::build(records.iter(), &CountingEmbedder, &fast_retry());
        let ranked = index
            .query_text("short", 1, &CountingEmbedder, &fast_retry())
            .unwrap();
        assert_eq!(ranked, vec![a.id]);
    }
}
