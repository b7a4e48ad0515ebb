//! Persisted vector index bound to one embedding model.
//!
//! The manager keeps the canonical copy of every vector in memory, keyed by a
//! dense `u32` id, and treats the ANN engine as a cache rebuilt from it. The
//! binary snapshot (see [`snapshot`]) is the only durable form of the index;
//! the model identity record and the dense-id bindings live in the
//! [`IndexCatalog`].
//!
//! # Concurrency
//!
//! Mutating operations take `&mut self` and searches take `&self`, so one
//! owner is always a single writer. To share a manager between threads wrap
//! it in a `parking_lot::RwLock`, which implements [`VectorSearcher`] by
//! taking a read lock per call. A search that runs between a write and the
//! next read on another handle sees whichever state the lock hands it; the
//! pair `search` + `resolve_ids` is not atomic across a concurrent
//! `add_vectors` or `rebuild_index`.

pub mod engine;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::IndexConfig;
use crate::error::{IndexError, SnapshotError};
use crate::traits::{IndexCatalog, ModelIdentity, VectorHits, VectorSearcher};
use engine::{AnnEngine, EngineFactory, default_engine_factory};
use snapshot::{IndexParams, Snapshot, StoredVector};

/// Lifecycle of an [`IndexManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Uninitialized,
    Initializing,
    Ready,
    Rebuilding,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Rebuilding => write!(f, "rebuilding"),
        }
    }
}

/// Snapshot of the manager's configuration and size.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub state: IndexState,
    pub model_name: String,
    pub dimensions: usize,
    pub max_elements: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub seed: u32,
    pub current_size: usize,
    pub index_path: PathBuf,
}

/// Vector to add under its application-level embedding id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVector {
    pub embedding_id: String,
    pub vector: Vec<f32>,
}

impl NewVector {
    pub fn new(embedding_id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            embedding_id: embedding_id.into(),
            vector,
        }
    }
}

/// A vector `add_vectors` skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedVector {
    pub embedding_id: String,
    pub reason: String,
}

/// Outcome of one `add_vectors` batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddReport {
    pub added: usize,
    pub rejected: Vec<RejectedVector>,
}

/// Engine plus the canonical vector store it was built from.
struct LoadedIndex {
    params: IndexParams,
    engine: Box<dyn AnnEngine>,
    vectors: BTreeMap<u32, Vec<f32>>,
    bindings: HashMap<u32, String>,
}

impl LoadedIndex {
    fn next_id(&self) -> Option<u32> {
        match self.vectors.keys().next_back() {
            Some(max) => max.checked_add(1),
            None => Some(0),
        }
    }
}

/// Owns one ANN engine and keeps it durable and consistent with the
/// configured embedding model.
pub struct IndexManager {
    config: IndexConfig,
    catalog: Arc<dyn IndexCatalog>,
    engine_factory: EngineFactory,
    state: IndexState,
    skip_identity_check: bool,
    loaded: Option<LoadedIndex>,
}

impl IndexManager {
    /// Creates an uninitialized manager using the default engine.
    pub fn new(config: IndexConfig, catalog: Arc<dyn IndexCatalog>) -> Result<Self, IndexError> {
        Self::with_engine_factory(config, catalog, default_engine_factory())
    }

    /// Creates an uninitialized manager building engines with `engine_factory`.
    pub fn with_engine_factory(
        config: IndexConfig,
        catalog: Arc<dyn IndexCatalog>,
        engine_factory: EngineFactory,
    ) -> Result<Self, IndexError> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            engine_factory,
            state: IndexState::Uninitialized,
            skip_identity_check: false,
            loaded: None,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn current_size(&self) -> usize {
        self.loaded.as_ref().map_or(0, |l| l.vectors.len())
    }

    /// Loads the snapshot (or creates an empty index) and checks the model
    /// identity record unless `skip_identity_check` is set.
    ///
    /// On failure the manager is left `Uninitialized` and can be retried.
    pub fn initialize(&mut self, skip_identity_check: bool) -> Result<IndexStats, IndexError> {
        info!(
            "Initializing vector index at {:?} for model {}",
            self.config.index_path, self.config.model_name
        );
        self.state = IndexState::Initializing;
        self.skip_identity_check = skip_identity_check;
        self.loaded = None;

        match self.open(skip_identity_check) {
            Ok(loaded) => {
                self.loaded = Some(loaded);
                self.state = IndexState::Ready;
                let stats = self.get_stats();
                info!(
                    "Vector index ready with {} vectors ({} dimensions)",
                    stats.current_size, stats.dimensions
                );
                Ok(stats)
            }
            Err(e) => {
                self.state = IndexState::Uninitialized;
                warn!("Vector index initialization failed: {}", e);
                Err(e)
            }
        }
    }

    fn open(&self, skip_identity_check: bool) -> Result<LoadedIndex, IndexError> {
        let adopt = if skip_identity_check {
            warn!("Skipping model identity check for {:?}", self.config.index_path);
            false
        } else {
            self.check_identity()?
        };

        let loaded = if self.config.index_path.exists() {
            self.read_snapshot()?
        } else {
            debug!("No snapshot at {:?}; starting empty", self.config.index_path);
            self.load_bindings(self.empty_index())?
        };
        if adopt {
            self.adopt_identity()?;
        }
        Ok(loaded)
    }

    /// Compares the stored identity record with the configuration. Returns
    /// `true` when no record exists yet and the configured model should be
    /// adopted once the index has loaded.
    fn check_identity(&self) -> Result<bool, IndexError> {
        let stored = self.catalog.model_identity().map_err(IndexError::Catalog)?;
        match stored {
            None => Ok(true),
            Some(identity) if identity.dimensions != self.config.dimensions => {
                Err(IndexError::DimensionMismatch {
                    stored: identity.dimensions,
                    configured: self.config.dimensions,
                    model: self.config.model_name.clone(),
                })
            }
            Some(identity) if identity.model_name != self.config.model_name => {
                Err(IndexError::ModelMismatch {
                    stored: identity.model_name,
                    configured: self.config.model_name.clone(),
                })
            }
            Some(_) => Ok(false),
        }
    }

    fn adopt_identity(&self) -> Result<(), IndexError> {
        info!(
            "No model identity recorded; adopting {} ({} dimensions)",
            self.config.model_name, self.config.dimensions
        );
        self.catalog
            .set_model_identity(&self.configured_identity(None))
            .map_err(IndexError::Catalog)
    }

    fn configured_identity(&self, model_version: Option<&str>) -> ModelIdentity {
        ModelIdentity {
            model_name: self.config.model_name.clone(),
            dimensions: self.config.dimensions,
            model_version: model_version.map(str::to_string),
        }
    }

    fn empty_index(&self) -> LoadedIndex {
        let params = IndexParams::from_config(&self.config);
        LoadedIndex {
            engine: (self.engine_factory)(&params),
            params,
            vectors: BTreeMap::new(),
            bindings: HashMap::new(),
        }
    }

    fn read_snapshot(&self) -> Result<LoadedIndex, IndexError> {
        let path = &self.config.index_path;
        let bytes = std::fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                IndexError::MissingSnapshot { path: path.clone() }
            } else {
                IndexError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        let snapshot = Snapshot::decode(&bytes).map_err(|source| IndexError::CorruptSnapshot {
            path: path.clone(),
            source,
        })?;
        debug!(
            "Decoded snapshot {:?}: {} vectors, {} bytes",
            path,
            snapshot.current_size(),
            bytes.len()
        );

        if snapshot.params.dimensions != self.config.dimensions {
            return Err(IndexError::DimensionMismatch {
                stored: snapshot.params.dimensions,
                configured: self.config.dimensions,
                model: self.config.model_name.clone(),
            });
        }

        let mut engine = (self.engine_factory)(&snapshot.params);
        let mut vectors = BTreeMap::new();
        for StoredVector { id, vector } in snapshot.vectors {
            engine
                .insert(id, &vector)
                .map_err(|e| IndexError::CorruptSnapshot {
                    path: path.clone(),
                    source: SnapshotError::Corrupt(format!(
                        "vector {} rejected by engine: {:#}",
                        id, e
                    )),
                })?;
            vectors.insert(id, vector);
        }

        self.load_bindings(LoadedIndex {
            params: snapshot.params,
            engine,
            vectors,
            bindings: HashMap::new(),
        })
    }

    fn load_bindings(&self, mut loaded: LoadedIndex) -> Result<LoadedIndex, IndexError> {
        let bindings = self.catalog.vector_bindings().map_err(IndexError::Catalog)?;
        let total = bindings.len();
        loaded.bindings = bindings
            .into_iter()
            .filter(|(id, _)| loaded.vectors.contains_key(id))
            .collect();
        if loaded.bindings.len() != total || loaded.bindings.len() != loaded.vectors.len() {
            debug!(
                "Loaded {} of {} vector bindings for {} vectors",
                loaded.bindings.len(),
                total,
                loaded.vectors.len()
            );
        }
        Ok(loaded)
    }

    fn ready(&self) -> Result<&LoadedIndex, IndexError> {
        match (&self.state, &self.loaded) {
            (IndexState::Ready, Some(loaded)) => Ok(loaded),
            _ => Err(IndexError::NotReady(self.state)),
        }
    }

    fn ready_mut(&mut self) -> Result<&mut LoadedIndex, IndexError> {
        match (&self.state, &mut self.loaded) {
            (IndexState::Ready, Some(loaded)) => Ok(loaded),
            (state, _) => Err(IndexError::NotReady(*state)),
        }
    }

    /// Adds a batch of vectors. A vector with the wrong length (or one that
    /// does not fit) is reported in [`AddReport::rejected`] and the rest of
    /// the batch still goes in.
    ///
    /// Bindings are persisted before any vector reaches the engine; a
    /// catalog failure leaves the index unchanged.
    pub fn add_vectors(&mut self, entries: &[NewVector]) -> Result<AddReport, IndexError> {
        let catalog = Arc::clone(&self.catalog);
        let loaded = self.ready_mut()?;
        let mut report = AddReport::default();
        let mut staged: Vec<(u32, &NewVector)> = Vec::with_capacity(entries.len());
        let mut next_id = loaded.next_id();

        for entry in entries {
            if entry.vector.len() != loaded.params.dimensions {
                warn!(
                    "Rejecting vector {}: {} dimensions, index expects {}",
                    entry.embedding_id,
                    entry.vector.len(),
                    loaded.params.dimensions
                );
                report.rejected.push(RejectedVector {
                    embedding_id: entry.embedding_id.clone(),
                    reason: format!(
                        "vector has {} dimensions, index expects {}",
                        entry.vector.len(),
                        loaded.params.dimensions
                    ),
                });
                continue;
            }
            if loaded.vectors.len() + staged.len() >= loaded.params.max_elements {
                report.rejected.push(RejectedVector {
                    embedding_id: entry.embedding_id.clone(),
                    reason: format!("index is full ({} elements)", loaded.params.max_elements),
                });
                continue;
            }
            let Some(id) = next_id else {
                report.rejected.push(RejectedVector {
                    embedding_id: entry.embedding_id.clone(),
                    reason: "dense id space exhausted".to_string(),
                });
                continue;
            };
            next_id = id.checked_add(1);
            staged.push((id, entry));
        }

        let new_bindings: Vec<(u32, String)> = staged
            .iter()
            .map(|(id, entry)| (*id, entry.embedding_id.clone()))
            .collect();
        catalog.bind_vectors(&new_bindings).map_err(IndexError::Catalog)?;

        for (id, entry) in staged {
            if let Err(e) = loaded.engine.insert(id, &entry.vector) {
                // The persisted binding is dropped on the next load and the
                // id is rebound by a later add.
                warn!("Engine rejected vector {}: {:#}", entry.embedding_id, e);
                report.rejected.push(RejectedVector {
                    embedding_id: entry.embedding_id.clone(),
                    reason: format!("{:#}", e),
                });
                continue;
            }
            loaded.vectors.insert(id, entry.vector.clone());
            loaded.bindings.insert(id, entry.embedding_id.clone());
            report.added += 1;
        }

        debug!(
            "Added {} vectors ({} rejected); index size {}",
            report.added,
            report.rejected.len(),
            loaded.vectors.len()
        );
        Ok(report)
    }

    /// Nearest neighbours of `query`. Returns every stored vector when `k`
    /// exceeds the index size.
    pub fn search(&self, query: &[f32], k: usize) -> Result<VectorHits, IndexError> {
        let loaded = self.ready()?;
        if loaded.vectors.is_empty() || k == 0 {
            return Ok(VectorHits::default());
        }
        let k = k.min(loaded.vectors.len());
        let hits = loaded
            .engine
            .search(query, k)
            .map_err(|e| IndexError::Search {
                query_dimensions: query.len(),
                index_size: loaded.vectors.len(),
                reason: format!("{:#}", e),
            })?;
        let (ids, distances) = hits.into_iter().unzip();
        Ok(VectorHits { ids, distances })
    }

    /// Embedding ids bound to `ids`, in the same order.
    pub fn resolve_ids(&self, ids: &[u32]) -> Result<Vec<String>, IndexError> {
        let loaded = self.ready()?;
        ids.iter()
            .map(|id| {
                loaded
                    .bindings
                    .get(id)
                    .cloned()
                    .ok_or(IndexError::UnknownVectorId(*id))
            })
            .collect()
    }

    /// Writes the snapshot to a temporary sibling file and renames it over
    /// the index path.
    pub fn save_index(&self) -> Result<(), IndexError> {
        let loaded = self.ready()?;
        write_snapshot(&self.config.index_path, loaded)?;
        info!(
            "Saved {} vectors to {:?}",
            loaded.vectors.len(),
            self.config.index_path
        );
        Ok(())
    }

    /// Reloads the index from its snapshot, replacing the in-memory state.
    /// Fails with [`IndexError::MissingSnapshot`] when there is no file.
    ///
    /// The model identity record is checked as in [`Self::initialize`],
    /// unless the last initialization skipped it.
    pub fn load_index(&mut self) -> Result<usize, IndexError> {
        if !self.config.index_path.exists() {
            return Err(IndexError::MissingSnapshot {
                path: self.config.index_path.clone(),
            });
        }
        match self.reload() {
            Ok(loaded) => {
                let size = loaded.vectors.len();
                self.loaded = Some(loaded);
                self.state = IndexState::Ready;
                info!("Loaded {} vectors from {:?}", size, self.config.index_path);
                Ok(size)
            }
            Err(e) => {
                self.loaded = None;
                self.state = IndexState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Drops every vector and binding, rebinds the database to the configured
    /// model and persists the empty index. Content is not re-embedded; the
    /// caller re-adds vectors afterwards.
    pub fn rebuild_index(&mut self, model_version: Option<&str>) -> Result<IndexStats, IndexError> {
        info!(
            "Rebuilding vector index at {:?} for model {}",
            self.config.index_path, self.config.model_name
        );
        self.state = IndexState::Rebuilding;
        self.loaded = None;

        match self.reset(model_version) {
            Ok(loaded) => {
                self.loaded = Some(loaded);
                self.skip_identity_check = false;
                self.state = IndexState::Ready;
                Ok(self.get_stats())
            }
            Err(e) => {
                self.state = IndexState::Uninitialized;
                warn!("Vector index rebuild failed: {}", e);
                Err(e)
            }
        }
    }

    fn reload(&self) -> Result<LoadedIndex, IndexError> {
        let adopt = if self.skip_identity_check {
            false
        } else {
            self.check_identity()?
        };
        let loaded = self.read_snapshot()?;
        if adopt {
            self.adopt_identity()?;
        }
        Ok(loaded)
    }

    fn reset(&self, model_version: Option<&str>) -> Result<LoadedIndex, IndexError> {
        let loaded = self.empty_index();
        self.catalog
            .clear_vector_bindings()
            .map_err(IndexError::Catalog)?;
        self.catalog
            .set_model_identity(&self.configured_identity(model_version))
            .map_err(IndexError::Catalog)?;
        write_snapshot(&self.config.index_path, &loaded)?;
        Ok(loaded)
    }

    pub fn get_stats(&self) -> IndexStats {
        let params = self
            .loaded
            .as_ref()
            .map(|l| l.params)
            .unwrap_or_else(|| IndexParams::from_config(&self.config));
        IndexStats {
            state: self.state,
            model_name: self.config.model_name.clone(),
            dimensions: params.dimensions,
            max_elements: params.max_elements,
            m: params.m,
            ef_construction: params.ef_construction,
            seed: params.seed,
            current_size: self.current_size(),
            index_path: self.config.index_path.clone(),
        }
    }
}

impl VectorSearcher for IndexManager {
    fn search(&self, query: &[f32], k: usize) -> Result<VectorHits, IndexError> {
        IndexManager::search(self, query, k)
    }

    fn resolve_ids(&self, ids: &[u32]) -> Result<Vec<String>, IndexError> {
        IndexManager::resolve_ids(self, ids)
    }
}

fn write_snapshot(path: &Path, loaded: &LoadedIndex) -> Result<(), IndexError> {
    let bytes = snapshot::encode(
        &loaded.params,
        loaded.vectors.iter().map(|(id, v)| (*id, v.as_slice())),
    )
    .map_err(|source| IndexError::CorruptSnapshot {
        path: path.to_path_buf(),
        source,
    })?;

    let io_err = |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, &bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    debug!("Wrote {} snapshot bytes to {:?}", bytes.len(), path);
    Ok(())
}
