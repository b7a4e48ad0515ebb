//! # semsearch
//!
//! Local semantic search over chunked documents: an approximate nearest
//! neighbour index with a binary snapshot on disk, a SQLite metadata store,
//! and a query pipeline that ties them to an embedder and an optional
//! cross-encoder reranker.
//!
//! ## Features
//!
//! - Vector index lifecycle with model identity checks and explicit rebuilds
//! - Self-describing, validated index snapshots
//! - SQLite storage for documents, chunks and vector id bindings
//! - Degraded (not failed) queries on a stale index or a broken reranker
//! - FastEmbed models, or your own local ONNX model and tokenizer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parking_lot::RwLock;
//! use semsearch::{
//!     IndexManager, LocalEmbedder, SearchDirs, SearchOptions, SearchPipeline,
//!     SqliteMetadataStore,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let dirs = SearchDirs::new();
//! dirs.ensure_data_dir()?;
//!
//! let store = Arc::new(SqliteMetadataStore::new(&dirs.default_db_path().to_string_lossy())?);
//! store.create_tables()?;
//!
//! let embedder = Arc::new(LocalEmbedder::new_with_default_model()?);
//!
//! let config = embedder.index_config(dirs.default_index_path());
//! let mut manager = IndexManager::new(config, store.clone())?;
//! manager.initialize(false)?;
//! let index = Arc::new(RwLock::new(manager));
//!
//! let pipeline = SearchPipeline::new()
//!     .with_embedder(embedder)
//!     .with_index(index)
//!     .with_store(store);
//!
//! let outcome = pipeline.execute("example", &SearchOptions::default().with_top_k(5))?;
//! for result in outcome.results {
//!     println!("{:.3} {}", result.score, result.document.source);
//! }
//! # Ok(())
//! # }
//! ```

pub mod traits;
pub use traits::{
    ChunkReader, ChunkRecord, ChunkRequest, DocumentInfo, DocumentRequest, IndexCatalog,
    ModelIdentity, QueryEmbedder, QueryEmbedding, Reranker, SearchResult, VectorHits,
    VectorSearcher,
};

pub mod error;
pub use error::{IndexError, PipelineError, SnapshotError};

pub mod config;
pub use config::{IndexConfig, SearchDirs};

pub mod embed;
pub use embed::LocalEmbedder;

pub mod rerank;
pub use rerank::LocalReranker;

pub mod engines;
pub use engines::{SqliteMetadataStore, StoreStats};

pub mod index;
pub use index::{AddReport, IndexManager, IndexState, IndexStats, NewVector, RejectedVector};

pub mod search;
pub use search::{Degradation, SearchOptions, SearchOutcome, SearchPipeline};
