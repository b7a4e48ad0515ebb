//! Query pipeline: embed, vector search, metadata join, optional rerank.
//!
//! Each stage has its own failure policy. Embedding and store failures abort
//! the query; a stale index (ids the store no longer knows) and a failing
//! reranker degrade it instead, and the [`SearchOutcome`] says so.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{IndexError, PipelineError};
use crate::traits::{
    ChunkReader, ChunkRecord, DocumentInfo, QueryEmbedder, Reranker, SearchResult, VectorSearcher,
};

/// Per-query options.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub top_k: usize,
    /// `None` reranks whenever a reranker is configured.
    pub rerank: Option<bool>,
    pub content_type: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            rerank: None,
            content_type: None,
        }
    }
}

impl SearchOptions {
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = Some(rerank);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Why a query returned less than a full answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Degradation {
    /// The index references embeddings the metadata store does not know.
    StaleIndex { detail: String },
    /// Reranking failed; results are in vector-search order.
    RerankFailed { reason: String },
}

/// Results of one query plus the degradation it went through, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub degraded: Option<Degradation>,
}

impl SearchOutcome {
    fn empty() -> Self {
        Self::default()
    }

    fn stale(detail: String) -> Self {
        Self {
            results: Vec::new(),
            degraded: Some(Degradation::StaleIndex { detail }),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Runs queries against injected capabilities. Holds no per-query state, so
/// one pipeline can serve concurrent queries.
#[derive(Default, Clone)]
pub struct SearchPipeline {
    embedder: Option<Arc<dyn QueryEmbedder>>,
    index: Option<Arc<dyn VectorSearcher>>,
    store: Option<Arc<dyn ChunkReader>>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl SearchPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn QueryEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn VectorSearcher>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ChunkReader>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    /// Runs `query` end to end. Without reranking, results are in ascending
    /// distance order; with reranking, in the reranker's order.
    pub fn execute(&self, query: &str, options: &SearchOptions) -> Result<SearchOutcome, PipelineError> {
        if query.trim().is_empty() {
            debug!("Empty query; returning no results");
            return Ok(SearchOutcome::empty());
        }

        let embedder = self
            .embedder
            .as_ref()
            .ok_or(PipelineError::MissingDependency("embedder"))?;
        let index = self
            .index
            .as_ref()
            .ok_or(PipelineError::MissingDependency("vector index"))?;
        let store = self
            .store
            .as_ref()
            .ok_or(PipelineError::MissingDependency("metadata store"))?;
        if options.top_k == 0 {
            return Err(PipelineError::InvalidOptions(
                "top_k must be at least 1".to_string(),
            ));
        }
        let reranker = match (options.rerank, &self.reranker) {
            (Some(true), None) => return Err(PipelineError::MissingDependency("reranker")),
            (Some(false), _) => None,
            (_, reranker) => reranker.as_ref(),
        };
        let content_type = options.content_type.as_deref();

        let embedding = embedder
            .embed(query, content_type)
            .map_err(PipelineError::Embedding)?;

        let hits = index.search(&embedding.vector, options.top_k)?;
        if hits.is_empty() {
            debug!("Vector search returned no hits for '{}'", query);
            return Ok(SearchOutcome::empty());
        }

        let embedding_ids = match index.resolve_ids(&hits.ids) {
            Ok(ids) => ids,
            Err(IndexError::UnknownVectorId(id)) => {
                warn!(
                    "Vector id {} has no embedding binding; the index is out of sync with the metadata store. Run a rebuild.",
                    id
                );
                return Ok(SearchOutcome::stale(format!(
                    "vector id {} has no embedding binding",
                    id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let records = store
            .get_by_ids(&embedding_ids)
            .map_err(PipelineError::Metadata)?;
        // Several dense ids may share one embedding id after re-ingestion.
        let by_id: HashMap<&str, &ChunkRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut results = Vec::with_capacity(embedding_ids.len());
        for (embedding_id, distance) in embedding_ids.iter().zip(hits.distances.iter()) {
            let Some(record) = by_id.get(embedding_id.as_str()) else {
                warn!(
                    "Embedding {} is indexed but missing from the metadata store. Run a rebuild.",
                    embedding_id
                );
                return Ok(SearchOutcome::stale(format!(
                    "embedding {} is missing from the metadata store",
                    embedding_id
                )));
            };
            results.push(to_result(record, *distance));
        }

        let mut outcome = SearchOutcome {
            results,
            degraded: None,
        };
        if let Some(reranker) = reranker.filter(|_| outcome.results.len() > 1) {
            match reranker.rerank(query, &outcome.results, content_type) {
                Ok(reranked) if reranked.len() == outcome.results.len() => {
                    outcome.results = reranked;
                }
                Ok(reranked) => {
                    let reason = format!(
                        "reranker returned {} of {} results",
                        reranked.len(),
                        outcome.results.len()
                    );
                    warn!("Ignoring rerank: {}", reason);
                    outcome.degraded = Some(Degradation::RerankFailed { reason });
                }
                Err(e) => {
                    warn!("Reranking failed, keeping vector order: {:#}", e);
                    outcome.degraded = Some(Degradation::RerankFailed {
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        info!(
            "Query '{}' returned {} results{}",
            query,
            outcome.results.len(),
            if outcome.is_degraded() { " (degraded)" } else { "" }
        );
        Ok(outcome)
    }
}

/// Similarity score for a cosine distance.
pub fn distance_to_score(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

fn to_result(record: &ChunkRecord, distance: f32) -> SearchResult {
    SearchResult {
        content: record.text.clone(),
        score: distance_to_score(distance),
        content_type: record.content_type.clone(),
        document: DocumentInfo {
            id: record.document_id,
            source: record.document_source.clone(),
            title: record.document_title.clone(),
            content_type: record.content_type.clone(),
        },
        metadata: record.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{QueryEmbedding, VectorHits};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FixedEmbedder {
        calls: AtomicUsize,
        fail: bool,
    }

    impl QueryEmbedder for FixedEmbedder {
        fn embed(&self, _text: &str, content_type: Option<&str>) -> anyhow::Result<QueryEmbedding> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("model not loaded");
            }
            if content_type.is_some_and(|c| c != "text") {
                anyhow::bail!("unsupported content type");
            }
            Ok(QueryEmbedding {
                id: "q".to_string(),
                vector: vec![1.0, 0.0],
            })
        }
    }

    /// Returns ids 0..n with distances 0.1, 0.3, ... and binds id i to "emb-i".
    struct FakeIndex {
        hits: usize,
        unbound: Option<u32>,
        /// Binds every id to "emb-0".
        shared_binding: bool,
        calls: AtomicUsize,
    }

    impl FakeIndex {
        fn with_hits(hits: usize) -> Self {
            Self {
                hits,
                unbound: None,
                shared_binding: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl VectorSearcher for FakeIndex {
        fn search(&self, _query: &[f32], k: usize) -> Result<VectorHits, IndexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = self.hits.min(k);
            Ok(VectorHits {
                ids: (0..n as u32).collect(),
                distances: (0..n).map(|i| 0.1 + 0.2 * i as f32).collect(),
            })
        }

        fn resolve_ids(&self, ids: &[u32]) -> Result<Vec<String>, IndexError> {
            ids.iter()
                .map(|id| match self.unbound {
                    Some(unbound) if unbound == *id => Err(IndexError::UnknownVectorId(*id)),
                    _ if self.shared_binding => Ok("emb-0".to_string()),
                    _ => Ok(format!("emb-{}", id)),
                })
                .collect()
        }
    }

    /// Knows "emb-0".."emb-(n-1)" and returns rows in reverse order.
    struct ReversedStore {
        known: usize,
        calls: AtomicUsize,
    }

    impl ReversedStore {
        fn knowing(known: usize) -> Self {
            Self {
                known,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ChunkReader for ReversedStore {
        fn get_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<ChunkRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut records: Vec<ChunkRecord> = ids
                .iter()
                .filter(|id| {
                    id.trim_start_matches("emb-")
                        .parse::<usize>()
                        .is_ok_and(|n| n < self.known)
                })
                .map(|id| ChunkRecord {
                    id: id.clone(),
                    text: format!("text of {}", id),
                    content_type: "text".to_string(),
                    document_id: 7,
                    document_source: "doc.md".to_string(),
                    document_title: "Doc".to_string(),
                    metadata: None,
                })
                .collect();
            records.reverse();
            Ok(records)
        }
    }

    struct ReverseReranker;

    impl Reranker for ReverseReranker {
        fn rerank(
            &self,
            _query: &str,
            results: &[SearchResult],
            _content_type: Option<&str>,
        ) -> anyhow::Result<Vec<SearchResult>> {
            Ok(results.iter().rev().cloned().collect())
        }
    }

    struct FailingReranker;

    impl Reranker for FailingReranker {
        fn rerank(
            &self,
            _query: &str,
            _results: &[SearchResult],
            _content_type: Option<&str>,
        ) -> anyhow::Result<Vec<SearchResult>> {
            anyhow::bail!("cross-encoder crashed")
        }
    }

    struct DroppingReranker;

    impl Reranker for DroppingReranker {
        fn rerank(
            &self,
            _query: &str,
            results: &[SearchResult],
            _content_type: Option<&str>,
        ) -> anyhow::Result<Vec<SearchResult>> {
            Ok(results.iter().take(1).cloned().collect())
        }
    }

    fn pipeline(index: FakeIndex, store: ReversedStore) -> SearchPipeline {
        SearchPipeline::new()
            .with_embedder(Arc::new(FixedEmbedder::default()))
            .with_index(Arc::new(index))
            .with_store(Arc::new(store))
    }

    fn contents(outcome: &SearchOutcome) -> Vec<String> {
        outcome.results.iter().map(|r| r.content.clone()).collect()
    }

    #[test]
    fn test_empty_query_invokes_nothing() {
        let embedder = Arc::new(FixedEmbedder::default());
        let index = Arc::new(FakeIndex::with_hits(3));
        let store = Arc::new(ReversedStore::knowing(3));
        let pipeline = SearchPipeline::new()
            .with_embedder(embedder.clone())
            .with_index(index.clone())
            .with_store(store.clone());

        for query in ["", "   \n\t"] {
            let outcome = pipeline.execute(query, &SearchOptions::default()).unwrap();
            assert!(outcome.results.is_empty());
            assert!(!outcome.is_degraded());
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(index.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);

        // No dependencies at all is still fine for an empty query
        assert!(SearchPipeline::new().execute("", &SearchOptions::default()).is_ok());
    }

    #[test]
    fn test_missing_dependency_is_named() {
        let options = SearchOptions::default();
        let err = SearchPipeline::new().execute("rust", &options).unwrap_err();
        assert!(matches!(err, PipelineError::MissingDependency("embedder")));

        let err = SearchPipeline::new()
            .with_embedder(Arc::new(FixedEmbedder::default()))
            .with_index(Arc::new(FakeIndex::with_hits(1)))
            .execute("rust", &options)
            .unwrap_err();
        assert_eq!(err.to_string(), "search pipeline is missing its metadata store dependency");

        let err = pipeline(FakeIndex::with_hits(1), ReversedStore::knowing(1))
            .execute("rust", &options.clone().with_rerank(true))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingDependency("reranker")));
    }

    #[test]
    fn test_zero_top_k_is_invalid() {
        let err = pipeline(FakeIndex::with_hits(1), ReversedStore::knowing(1))
            .execute("rust", &SearchOptions::default().with_top_k(0))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOptions(_)));
    }

    #[test]
    fn test_embedding_failure_aborts() {
        let pipeline = SearchPipeline::new()
            .with_embedder(Arc::new(FixedEmbedder {
                calls: AtomicUsize::new(0),
                fail: true,
            }))
            .with_index(Arc::new(FakeIndex::with_hits(2)))
            .with_store(Arc::new(ReversedStore::knowing(2)));
        let err = pipeline.execute("rust", &SearchOptions::default()).unwrap_err();
        assert!(err.to_string().starts_with("query embedding failed: "));
        assert!(err.to_string().contains("model not loaded"));

        let err = pipeline_with_text_embedder()
            .execute("rust", &SearchOptions::default().with_content_type("image"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Embedding(_)));
    }

    fn pipeline_with_text_embedder() -> SearchPipeline {
        pipeline(FakeIndex::with_hits(2), ReversedStore::knowing(2))
    }

    #[test]
    fn test_results_follow_vector_order_not_store_order() {
        let outcome = pipeline(FakeIndex::with_hits(3), ReversedStore::knowing(3))
            .execute("rust", &SearchOptions::default())
            .unwrap();
        assert_eq!(
            contents(&outcome),
            vec!["text of emb-0", "text of emb-1", "text of emb-2"]
        );
        let scores: Vec<f32> = outcome.results.iter().map(|r| r.score).collect();
        assert!((scores[0] - 0.9).abs() < 1e-6);
        assert!((scores[2] - 0.5).abs() < 1e-6);
        assert_eq!(outcome.results[0].document.source, "doc.md");
    }

    #[test]
    fn test_top_k_limits_results() {
        let outcome = pipeline(FakeIndex::with_hits(5), ReversedStore::knowing(5))
            .execute("rust", &SearchOptions::default().with_top_k(2))
            .unwrap();
        assert_eq!(outcome.results.len(), 2);
    }

    #[test]
    fn test_no_hits_skips_store() {
        let store = Arc::new(ReversedStore::knowing(0));
        let outcome = SearchPipeline::new()
            .with_embedder(Arc::new(FixedEmbedder::default()))
            .with_index(Arc::new(FakeIndex::with_hits(0)))
            .with_store(store.clone())
            .with_reranker(Arc::new(FailingReranker))
            .execute("rust", &SearchOptions::default())
            .unwrap();
        assert!(outcome.results.is_empty());
        assert!(!outcome.is_degraded());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unbound_vector_id_degrades_to_empty() {
        let mut index = FakeIndex::with_hits(3);
        index.unbound = Some(1);
        let outcome = pipeline(index, ReversedStore::knowing(3))
            .execute("rust", &SearchOptions::default())
            .unwrap();
        assert!(outcome.results.is_empty());
        assert!(matches!(outcome.degraded, Some(Degradation::StaleIndex { .. })));
    }

    #[test]
    fn test_embedding_missing_from_store_degrades_to_empty() {
        let outcome = pipeline(FakeIndex::with_hits(3), ReversedStore::knowing(2))
            .execute("rust", &SearchOptions::default())
            .unwrap();
        assert!(outcome.results.is_empty());
        match outcome.degraded {
            Some(Degradation::StaleIndex { detail }) => assert!(detail.contains("emb-2")),
            other => panic!("unexpected degradation: {other:?}"),
        }
    }

    #[test]
    fn test_hits_sharing_an_embedding_id_all_resolve() {
        let mut index = FakeIndex::with_hits(3);
        index.shared_binding = true;
        let outcome = pipeline(index, ReversedStore::knowing(1))
            .execute("rust", &SearchOptions::default())
            .unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(contents(&outcome), vec!["text of emb-0"; 3]);
        let scores: Vec<f32> = outcome.results.iter().map(|r| r.score).collect();
        assert!(scores.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_configured_reranker_reorders() {
        let pipeline = pipeline(FakeIndex::with_hits(3), ReversedStore::knowing(3))
            .with_reranker(Arc::new(ReverseReranker));
        let outcome = pipeline.execute("rust", &SearchOptions::default()).unwrap();
        assert_eq!(
            contents(&outcome),
            vec!["text of emb-2", "text of emb-1", "text of emb-0"]
        );
        assert!(!outcome.is_degraded());

        let plain = pipeline
            .execute("rust", &SearchOptions::default().with_rerank(false))
            .unwrap();
        assert_eq!(contents(&plain)[0], "text of emb-0");
    }

    #[test]
    fn test_single_result_is_not_reranked() {
        let outcome = pipeline(FakeIndex::with_hits(1), ReversedStore::knowing(1))
            .with_reranker(Arc::new(FailingReranker))
            .execute("rust", &SearchOptions::default())
            .unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert!(!outcome.is_degraded());
    }

    #[test]
    fn test_failing_reranker_falls_back_to_vector_order() {
        let baseline = pipeline(FakeIndex::with_hits(3), ReversedStore::knowing(3))
            .execute("rust", &SearchOptions::default().with_rerank(false))
            .unwrap();

        for reranker in [
            Arc::new(FailingReranker) as Arc<dyn Reranker>,
            Arc::new(DroppingReranker) as Arc<dyn Reranker>,
        ] {
            let outcome = pipeline(FakeIndex::with_hits(3), ReversedStore::knowing(3))
                .with_reranker(reranker)
                .execute("rust", &SearchOptions::default().with_rerank(true))
                .unwrap();
            assert_eq!(outcome.results, baseline.results);
            assert!(matches!(
                outcome.degraded,
                Some(Degradation::RerankFailed { .. })
            ));
        }
    }

    #[test]
    fn test_repeated_queries_are_identical() {
        let pipeline = pipeline(FakeIndex::with_hits(4), ReversedStore::knowing(4));
        let first = pipeline.execute("rust", &SearchOptions::default()).unwrap();
        let second = pipeline.execute("rust", &SearchOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_distance_to_score_bounds() {
        assert_eq!(distance_to_score(0.0), 1.0);
        assert_eq!(distance_to_score(1.5), 0.0);
        assert_eq!(distance_to_score(-1e-7), 1.0);
        assert!((distance_to_score(0.25) - 0.75).abs() < 1e-6);
    }
}
