use directories::ProjectDirs;
use fastembed::{EmbeddingModel, TextEmbedding};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::IndexError;

/// Embedding model used when nothing else is configured.
pub const DEFAULT_EMBEDDING_MODEL: EmbeddingModel = EmbeddingModel::AllMiniLML6V2;

/// Output dimensionality of a FastEmbed text model, looked up by the model
/// code [`crate::LocalEmbedder`] records as its name.
pub fn known_model_dimensions(model_name: &str) -> Option<usize> {
    TextEmbedding::list_supported_models()
        .into_iter()
        .find(|info| info.model_code.eq_ignore_ascii_case(model_name))
        .map(|info| info.dim)
}

/// Configuration of one vector index: the embedding model it is bound to,
/// the ANN parameters and where the snapshot lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    pub model_name: String,
    pub dimensions: usize,
    #[serde(default = "IndexConfig::default_max_elements")]
    pub max_elements: usize,
    /// Graph degree (`M`).
    #[serde(default = "IndexConfig::default_m")]
    pub m: usize,
    #[serde(default = "IndexConfig::default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "IndexConfig::default_seed")]
    pub seed: u32,
    pub index_path: PathBuf,
}

impl IndexConfig {
    pub fn new(model_name: impl Into<String>, dimensions: usize, index_path: impl Into<PathBuf>) -> Self {
        Self {
            model_name: model_name.into(),
            dimensions,
            max_elements: Self::default_max_elements(),
            m: Self::default_m(),
            ef_construction: Self::default_ef_construction(),
            seed: Self::default_seed(),
            index_path: index_path.into(),
        }
    }

    /// Configuration for a model from the known-model table.
    pub fn for_model(model_name: &str, index_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dimensions = known_model_dimensions(model_name).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown embedding model '{}'; use IndexConfig::new with explicit dimensions",
                model_name
            )
        })?;
        Ok(Self::new(model_name, dimensions, index_path))
    }

    /// Reads a JSON configuration file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read index config {:?}: {}", path, e))?;
        let config: IndexConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("Failed to parse index config {:?}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Checks the values the snapshot format and the ANN engines depend on.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.model_name.trim().is_empty() {
            return Err(IndexError::InvalidConfig("model name is empty".to_string()));
        }
        if self.dimensions == 0 {
            return Err(IndexError::InvalidConfig(
                "dimensions must be greater than zero".to_string(),
            ));
        }
        if self.max_elements == 0 {
            return Err(IndexError::InvalidConfig(
                "maxElements must be greater than zero".to_string(),
            ));
        }
        for (field, value) in [
            ("dimensions", self.dimensions),
            ("maxElements", self.max_elements),
            ("m", self.m),
            ("efConstruction", self.ef_construction),
        ] {
            if u32::try_from(value).is_err() {
                return Err(IndexError::InvalidConfig(format!(
                    "{} = {} does not fit the snapshot format",
                    field, value
                )));
            }
        }
        Ok(())
    }

    fn default_max_elements() -> usize {
        100_000
    }

    fn default_m() -> usize {
        16
    }

    fn default_ef_construction() -> usize {
        200
    }

    fn default_seed() -> u32 {
        100
    }
}

/// Configuration for semsearch project directories
pub struct SearchDirs {
    project_dirs: Option<ProjectDirs>,
}

impl SearchDirs {
    /// Create a new SearchDirs instance
    pub fn new() -> Self {
        let project_dirs = ProjectDirs::from("com", "semsearch", "semsearch");
        Self { project_dirs }
    }

    /// Get the default cache directory for embedding and reranking models
    pub fn default_cache_dir(&self) -> PathBuf {
        match &self.project_dirs {
            Some(dirs) => dirs.cache_dir().to_path_buf(),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".cache"),
        }
    }

    /// Get the default data directory holding the database and the index
    pub fn default_data_dir(&self) -> PathBuf {
        match &self.project_dirs {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Get the default database file path
    pub fn default_db_path(&self) -> PathBuf {
        self.default_data_dir().join("semsearch.db")
    }

    /// Get the default index snapshot path
    pub fn default_index_path(&self) -> PathBuf {
        self.default_data_dir().join("vectors.index")
    }

    /// Index configuration for the default model under the default data
    /// directory. The model name matches [`crate::LocalEmbedder::model_name`].
    pub fn default_index_config(&self) -> anyhow::Result<IndexConfig> {
        let info = TextEmbedding::get_model_info(&DEFAULT_EMBEDDING_MODEL)?;
        Ok(IndexConfig::new(
            info.model_code.clone(),
            info.dim,
            self.default_index_path(),
        ))
    }

    /// Ensure the cache directory exists
    pub fn ensure_cache_dir(&self) -> std::io::Result<PathBuf> {
        let cache_dir = self.default_cache_dir();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(cache_dir)
    }

    /// Ensure the data directory exists
    pub fn ensure_data_dir(&self) -> std::io::Result<PathBuf> {
        let data_dir = self.default_data_dir();
        std::fs::create_dir_all(&data_dir)?;
        Ok(data_dir)
    }
}

impl Default for SearchDirs {
    fn default() -> Self {
        Self::new()
    }
}
