//! Configuration for the vector engine.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file, and the environment (a `.env` file in the working directory is
//! read into the environment first).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use vembed_embeddings::RetryPolicy;
use vembed_embeddings::model::{DEFAULT_LOCAL_MODEL, DEFAULT_REMOTE_MODEL};
use vembed_embeddings::provider::DEFAULT_OPENAI_BASE_URL;

use crate::error::{EngineError, Result};

/// Configuration for the vector engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Embedding cache configuration.
    pub cache: CacheConfig,

    /// Vector index configuration.
    pub index: IndexConfig,
}

impl EngineConfig {
    /// Load configuration from defaults, `path` (if given) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("Read environment from {}", env_file.display());
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Override fields from environment variables, looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.embedding.openai_api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.embedding.openai_base_url = url;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL_OPENAI") {
            self.embedding.remote_model = model;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL_LOCAL") {
            self.embedding.local_model = model;
        }
        if let Some(value) = lookup("MAX_BATCH_SIZE") {
            self.embedding.max_batch_size = parse_var("MAX_BATCH_SIZE", &value)?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.cache.redis_url = Some(url);
        }
        if let Some(value) = lookup("CACHE_TTL") {
            self.cache.ttl_secs = parse_var("CACHE_TTL", &value)?;
        }
        if let Some(value) = lookup("VECTOR_DIMENSION") {
            self.index.dimension = parse_var("VECTOR_DIMENSION", &value)?;
        }
        if let Some(path) = lookup("FAISS_INDEX_PATH").or_else(|| lookup("INDEX_PATH")) {
            self.index.path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.max_batch_size == 0 {
            return Err(EngineError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.index.dimension == 0 {
            return Err(EngineError::Config(
                "vector dimension must be at least 1".to_string(),
            ));
        }
        if self.embedding.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the index path.
    pub fn with_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.index.path = path.into();
        self
    }

    /// Set the index dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.index.dimension = dimension;
        self
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| EngineError::Config(format!("invalid {name} {value:?}: {e}")))
}

/// Configuration for the embedding providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// API key for the remote provider. Without one, requests go to the
    /// local model.
    pub openai_api_key: Option<String>,

    pub openai_base_url: String,

    /// Default remote model.
    pub remote_model: String,

    /// Local model, used by default without an API key and as fallback.
    pub local_model: String,

    /// Whether the local model may be loaded at all.
    pub local_enabled: bool,

    /// Directory for downloaded local model files.
    pub local_cache_dir: Option<PathBuf>,

    /// Largest accepted batch.
    pub max_batch_size: usize,

    /// Timeout of a single remote request.
    pub request_timeout_secs: u64,

    pub retry: RetryConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            remote_model: DEFAULT_REMOTE_MODEL.to_string(),
            local_model: DEFAULT_LOCAL_MODEL.to_string(),
            local_enabled: true,
            local_cache_dir: None,
            max_batch_size: vembed_embeddings::DEFAULT_MAX_BATCH_SIZE,
            request_timeout_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry settings for remote requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Configuration for the embedding cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether to cache embeddings.
    pub enabled: bool,

    /// Redis server. Without one, embeddings are cached in process memory.
    pub redis_url: Option<String>,

    /// Expiry of cached embeddings, in seconds.
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: Some("redis://localhost:6379/0".to_string()),
            ttl_secs: vembed_embeddings::DEFAULT_CACHE_TTL.as_secs(),
        }
    }
}

/// Configuration for the vector index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Where the index is saved and loaded from.
    pub path: PathBuf,

    /// Dimension of an empty index.
    pub dimension: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("faiss_index.bin"),
            dimension: vembed_embeddings::DEFAULT_DIMENSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.embedding.remote_model, "text-embedding-3-small");
        assert_eq!(config.embedding.local_model, "all-MiniLM-L6-v2");
        assert_eq!(config.embedding.max_batch_size, 100);
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.index.dimension, 1536);
        assert_eq!(config.index.path, PathBuf::from("faiss_index.bin"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("EMBEDDING_MODEL_LOCAL", "bge-small-en-v1.5"),
            ("MAX_BATCH_SIZE", "25"),
            ("CACHE_TTL", "60"),
            ("VECTOR_DIMENSION", "384"),
            ("INDEX_PATH", "/tmp/index.bin"),
            ("REDIS_URL", ""),
        ]);
        let mut config = EngineConfig::default();

        config.apply_env(|key| vars.get(key).cloned()).unwrap();

        assert_eq!(config.embedding.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.embedding.local_model, "bge-small-en-v1.5");
        assert_eq!(config.embedding.max_batch_size, 25);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert_eq!(config.index.dimension, 384);
        assert_eq!(config.index.path, PathBuf::from("/tmp/index.bin"));
        assert_eq!(config.cache.redis_url, CacheConfig::default().redis_url);
    }

    #[test]
    fn test_faiss_index_path_wins() {
        let vars = env(&[("FAISS_INDEX_PATH", "a.bin"), ("INDEX_PATH", "b.bin")]);
        let mut config = EngineConfig::default();

        config.apply_env(|key| vars.get(key).cloned()).unwrap();

        assert_eq!(config.index.path, PathBuf::from("a.bin"));
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let vars = env(&[("MAX_BATCH_SIZE", "lots")]);
        let mut config = EngineConfig::default();

        let result = config.apply_env(|key| vars.get(key).cloned());

        assert!(matches!(result, Err(EngineError::Config(msg)) if msg.contains("MAX_BATCH_SIZE")));
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [index]
            dimension = 384

            [cache]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.index.dimension, 384);
        assert!(!config.cache.enabled);
        assert_eq!(config.embedding, EmbeddingConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(EngineConfig::default().with_dimension(0).validate().is_err());

        let mut config = EngineConfig::default();
        config.embedding.max_batch_size = 0;
        assert!(config.validate().is_err());
    }
}
