use crate::config::{DEFAULT_EMBEDDING_MODEL, IndexConfig, SearchDirs};
use crate::traits::{QueryEmbedder, QueryEmbedding, TEXT_CONTENT_TYPE};
use anyhow::{Result, bail};
use fastembed::{
    EmbeddingModel, InitOptions, InitOptionsUserDefined, TextEmbedding, TokenizerFiles,
    UserDefinedEmbeddingModel,
};
use log::{debug, info};
use std::{fs, path::PathBuf};
use xxhash_rust::xxh64::xxh64;

/// Local text embedding service using FastEmbed models.
///
/// Supports both pre-built models from the FastEmbed library and local ONNX models
/// with custom tokenizers. Local models require an ONNX file and four tokenizer files:
/// tokenizer.json, config.json, special_tokens_map.json, and tokenizer_config.json.
pub struct LocalEmbedder {
    model: TextEmbedding,
    model_name: String,
    dimensions: usize,
}

impl LocalEmbedder {
    /// Creates a new embedder with the specified model or [`DEFAULT_EMBEDDING_MODEL`].
    /// If cache_dir is provided, uses that; otherwise uses SearchDirs default.
    pub fn new(model: Option<EmbeddingModel>, cache_dir: Option<PathBuf>) -> Result<Self> {
        let model = model.unwrap_or(DEFAULT_EMBEDDING_MODEL);

        let cache_dir = match cache_dir {
            Some(dir) => dir,
            None => SearchDirs::new().ensure_cache_dir()?,
        };

        let info = TextEmbedding::get_model_info(&model)?;
        let model_name = info.model_code.clone();
        let dimensions = info.dim;

        let init_options = InitOptions::new(model.clone()).with_cache_dir(cache_dir);
        let embedding = TextEmbedding::try_new(init_options)?;

        info!(
            "Initialized embedding model: {} ({} dimensions)",
            model_name, dimensions
        );

        Ok(LocalEmbedder {
            model: embedding,
            model_name,
            dimensions,
        })
    }

    /// Creates a new embedder with local model files.
    ///
    /// # Arguments
    /// * `model_name` - Name recorded in the model identity record
    /// * `onnx_model_path` - Path to the ONNX model file
    /// * `tokenizer_dir` - Path to directory containing tokenizer files:
    ///   - tokenizer.json
    ///   - config.json
    ///   - special_tokens_map.json
    ///   - tokenizer_config.json
    /// * `max_length` - Optional maximum sequence length (default: 512)
    pub fn new_with_local_model(
        model_name: &str,
        onnx_model_path: PathBuf,
        tokenizer_dir: PathBuf,
        max_length: Option<usize>,
    ) -> Result<Self> {
        let onnx_file = fs::read(&onnx_model_path).map_err(|e| {
            anyhow::anyhow!("Failed to read ONNX model from {:?}: {}", onnx_model_path, e)
        })?;

        let read = |name: &str| {
            fs::read(tokenizer_dir.join(name))
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", name, e))
        };
        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read("tokenizer.json")?,
            config_file: read("config.json")?,
            special_tokens_map_file: read("special_tokens_map.json")?,
            tokenizer_config_file: read("tokenizer_config.json")?,
        };

        let user_defined_model = UserDefinedEmbeddingModel::new(onnx_file, tokenizer_files);

        let mut init_options = InitOptionsUserDefined::new();
        if let Some(max_len) = max_length {
            init_options = init_options.with_max_length(max_len);
        }

        let model = TextEmbedding::try_new_from_user_defined(user_defined_model, init_options)?;

        // User-defined models carry no metadata; probe once for the output size
        let dimensions = model
            .embed(vec!["dimension probe"], None)?
            .into_iter()
            .next()
            .map(|e| e.len())
            .ok_or_else(|| anyhow::anyhow!("Local model produced no embedding"))?;

        info!(
            "Initialized local embedding model {} from {:?} with tokenizer from {:?} ({} dimensions)",
            model_name, onnx_model_path, tokenizer_dir, dimensions
        );

        Ok(LocalEmbedder {
            model,
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Creates a new embedder with the default model and default cache directory.
    pub fn new_with_default_model() -> Result<Self> {
        Self::new(None, None)
    }

    /// Creates a new embedder with the default model and custom cache directory.
    pub fn new_with_cache_dir(cache_dir: PathBuf) -> Result<Self> {
        Self::new(None, Some(cache_dir))
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Index configuration bound to this embedder's model name and output size.
    pub fn index_config(&self, index_path: impl Into<PathBuf>) -> IndexConfig {
        IndexConfig::new(self.model_name.clone(), self.dimensions, index_path)
    }

    /// Embeds a single text string and returns a normalized vector.
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.model.embed(vec![text], None)?;
        embeddings
            .into_iter()
            .next()
            .map(|x| Self::normalize_l2(&x))
            .ok_or_else(|| anyhow::anyhow!("Failed to get embedding"))
    }

    /// Embeds multiple text strings and returns normalized vectors.
    pub fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        let embeddings = self.model.embed(texts, None)?;
        Ok(embeddings.iter().map(|e| Self::normalize_l2(e)).collect())
    }

    /// Normalizes an embedding vector using L2 normalization.
    pub fn normalize_l2(embedding: &[f32]) -> Vec<f32> {
        let norm = (embedding.iter().map(|x| x * x).sum::<f32>()).sqrt();
        if norm < 1e-5 {
            debug!(
                "Embedding norm {} is less than 1e-5, returning original embedding",
                norm
            );
            embedding.to_vec()
        } else {
            embedding.iter().map(|x| x / norm).collect()
        }
    }
}

/// Id for a query text: xxh64 of its UTF-8 bytes with seed 0, so the same
/// text gets the same id in every process and build.
pub fn query_id(text: &str) -> String {
    format!("query-{:016x}", xxh64(text.as_bytes(), 0))
}

impl QueryEmbedder for LocalEmbedder {
    fn embed(&self, text: &str, content_type: Option<&str>) -> Result<QueryEmbedding> {
        let content_type = content_type.unwrap_or(TEXT_CONTENT_TYPE);
        if content_type != TEXT_CONTENT_TYPE {
            bail!(
                "content type '{}' is not supported by text embedding model {}",
                content_type,
                self.model_name
            );
        }
        Ok(QueryEmbedding {
            id: query_id(text),
            vector: self.embed_text(text)?,
        })
    }
}
