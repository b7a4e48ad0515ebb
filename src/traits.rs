use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::IndexError;

/// Content type every text-only capability accepts.
pub const TEXT_CONTENT_TYPE: &str = "text";

/// Document a search result belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: i64,
    pub source: String,
    pub title: String,
    pub content_type: String,
}

/// One ranked hit returned by the search pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub content: String,
    /// `max(0, 1 - cosine distance)`, always within `[0, 1]`.
    pub score: f32,
    pub content_type: String,
    pub document: DocumentInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// Chunk row as returned by a [`ChunkReader`], keyed by embedding id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub id: String,
    pub text: String,
    pub content_type: String,
    pub document_id: i64,
    pub document_source: String,
    pub document_title: String,
    pub metadata: Option<HashMap<String, String>>,
}

/// Output of an embed call.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEmbedding {
    pub id: String,
    pub vector: Vec<f32>,
}

/// The embedding model a database is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelIdentity {
    pub model_name: String,
    pub dimensions: usize,
    /// Informational tag written by a rebuild; never compared.
    #[serde(default)]
    pub model_version: Option<String>,
}

impl ModelIdentity {
    pub fn new(model_name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model_name: model_name.into(),
            dimensions,
            model_version: None,
        }
    }
}

/// Nearest neighbours in ascending distance order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorHits {
    pub ids: Vec<u32>,
    pub distances: Vec<f32>,
}

impl VectorHits {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Request to store (or update) a document row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub source: String,
    pub title: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub metadata: Option<HashMap<String, String>>,
}

/// Request to store one chunk of a document under its embedding id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub embedding_id: String,
    pub document_id: i64,
    pub chunk_index: i64,
    pub text: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub metadata: Option<HashMap<String, String>>,
}

fn default_content_type() -> String {
    TEXT_CONTENT_TYPE.to_string()
}

/// Turns query input into a vector.
///
/// Implementations must fail on a content type they cannot handle instead of
/// returning a placeholder vector.
pub trait QueryEmbedder: Send + Sync {
    fn embed(&self, text: &str, content_type: Option<&str>) -> anyhow::Result<QueryEmbedding>;
}

/// Reorders an initial result set. Must return every input result.
pub trait Reranker: Send + Sync {
    fn rerank(
        &self,
        query: &str,
        results: &[SearchResult],
        content_type: Option<&str>,
    ) -> anyhow::Result<Vec<SearchResult>>;
}

/// Read side of the metadata store. Row order is not guaranteed.
pub trait ChunkReader: Send + Sync {
    fn get_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<ChunkRecord>>;
}

/// Bookkeeping the index manager keeps next to the metadata: the model
/// identity record and the dense-id to embedding-id bindings.
pub trait IndexCatalog: Send + Sync {
    fn model_identity(&self) -> anyhow::Result<Option<ModelIdentity>>;
    fn set_model_identity(&self, identity: &ModelIdentity) -> anyhow::Result<()>;
    fn vector_bindings(&self) -> anyhow::Result<Vec<(u32, String)>>;
    fn bind_vectors(&self, bindings: &[(u32, String)]) -> anyhow::Result<()>;
    fn clear_vector_bindings(&self) -> anyhow::Result<()>;
}

/// Nearest-neighbour lookup as seen by the search pipeline.
pub trait VectorSearcher: Send + Sync {
    fn search(&self, query: &[f32], k: usize) -> Result<VectorHits, IndexError>;

    /// Maps dense ids to embedding ids, failing with
    /// [`IndexError::UnknownVectorId`] on the first unbound id.
    fn resolve_ids(&self, ids: &[u32]) -> Result<Vec<String>, IndexError>;
}

impl<T: VectorSearcher> VectorSearcher for parking_lot::RwLock<T> {
    fn search(&self, query: &[f32], k: usize) -> Result<VectorHits, IndexError> {
        self.read().search(query, k)
    }

    fn resolve_ids(&self, ids: &[u32]) -> Result<Vec<String>, IndexError> {
        self.read().resolve_ids(ids)
    }
}
