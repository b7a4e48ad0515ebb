//! Error types for the index manager, the snapshot codec and the search pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::index::IndexState;

/// Failures while encoding or decoding an index snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The buffer ends before the data the header declares.
    #[error("snapshot truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The header or the overall length is inconsistent.
    #[error("snapshot corrupt: {0}")]
    Corrupt(String),

    /// A wide field would be read or written at an unaligned offset.
    #[error("misaligned snapshot access at byte offset {0}")]
    Misaligned(usize),

    /// A vector handed to the encoder does not match the header dimensions.
    #[error("vector {id} has {actual} dimensions, snapshot expects {expected}")]
    InvalidVector {
        id: u32,
        expected: usize,
        actual: usize,
    },

    /// A size does not fit the 32-bit fields of the format.
    #[error("snapshot field `{field}` is too large: {value}")]
    TooLarge { field: &'static str, value: usize },
}

/// Errors raised by [`crate::IndexManager`].
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid index configuration: {0}")]
    InvalidConfig(String),

    #[error("vector index is not ready (state: {0}); call initialize first")]
    NotReady(IndexState),

    #[error(
        "embedding dimension mismatch: the index was built with {stored} dimensions but model `{model}` produces {configured}. Run a rebuild to re-index with the configured model."
    )]
    DimensionMismatch {
        stored: usize,
        configured: usize,
        model: String,
    },

    #[error(
        "embedding model mismatch: the index was built with `{stored}` but the configured model is `{configured}`. Run a rebuild to re-index with the configured model."
    )]
    ModelMismatch { stored: String, configured: String },

    #[error("index file not found at {}. Run ingestion to create it.", path.display())]
    MissingSnapshot { path: PathBuf },

    #[error("index file {} is corrupt, rebuild required: {source}", path.display())]
    CorruptSnapshot {
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },

    #[error(
        "vector search failed (query dimensions: {query_dimensions}, index size: {index_size}): {reason}"
    )]
    Search {
        query_dimensions: usize,
        index_size: usize,
        reason: String,
    },

    #[error(
        "vector id {0} has no stored embedding binding; the index and metadata store are out of sync, rebuild recommended"
    )]
    UnknownVectorId(u32),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index catalog error: {0:#}")]
    Catalog(anyhow::Error),
}

/// Errors raised by [`crate::SearchPipeline::execute`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("search pipeline is missing its {0} dependency")]
    MissingDependency(&'static str),

    #[error("invalid search options: {0}")]
    InvalidOptions(String),

    #[error("query embedding failed: {0:#}")]
    Embedding(anyhow::Error),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("metadata retrieval failed: {0:#}")]
    Metadata(anyhow::Error),
}
