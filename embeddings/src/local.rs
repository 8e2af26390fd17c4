//! In-process embedding models.
//!
//! The local provider loads its model on first use. Loading happens at most
//! once per provider: concurrent first callers wait on the same load, and a
//! failed load marks the provider unavailable for the rest of its life.
//! Model loading and inference are CPU-bound and run on the blocking pool.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::model::{DEFAULT_LOCAL_MODEL, known_dimension};
use crate::provider::EmbeddingProvider;

/// A loaded model that turns texts into vectors synchronously.
pub trait TextEncoder: Send + Sync {
    /// Encode every text, in input order.
    fn encode(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Length of the vectors this model produces.
    fn dimension(&self) -> usize;
}

/// Loads a [`TextEncoder`] by model name.
pub trait LocalModelLoader: Send + Sync {
    fn load(&self, model: &str) -> Result<Arc<dyn TextEncoder>>;
}

impl<F> LocalModelLoader for F
where
    F: Fn(&str) -> Result<Arc<dyn TextEncoder>> + Send + Sync,
{
    fn load(&self, model: &str) -> Result<Arc<dyn TextEncoder>> {
        self(model)
    }
}

/// Lazily loaded in-process embedding provider.
pub struct LocalProvider {
    model_name: String,

    loader: Arc<dyn LocalModelLoader>,

    /// `Some(None)` once a load has failed.
    encoder: OnceCell<Option<Arc<dyn TextEncoder>>>,
}

impl LocalProvider {
    /// Create a provider for `model_name`. Nothing is loaded yet.
    pub fn new(model_name: impl Into<String>, loader: impl LocalModelLoader + 'static) -> Self {
        Self {
            model_name: model_name.into(),
            loader: Arc::new(loader),
            encoder: OnceCell::new(),
        }
    }

    /// Provider backed by `fastembed`.
    #[cfg(feature = "fastembed")]
    pub fn fastembed(model_name: impl Into<String>) -> Self {
        Self::new(model_name, FastEmbedLoader::default())
    }

    /// Whether the model has been loaded successfully.
    pub fn is_loaded(&self) -> bool {
        matches!(self.encoder.get(), Some(Some(_)))
    }

    /// Load the model now rather than on first use.
    pub async fn preload(&self) -> Result<()> {
        self.encoder().await.map(|_| ())
    }

    async fn encoder(&self) -> Result<Arc<dyn TextEncoder>> {
        let encoder = self
            .encoder
            .get_or_init(|| async {
                let loader = Arc::clone(&self.loader);
                let model = self.model_name.clone();
                info!("Loading local embedding model {model}");
                let loaded = tokio::task::spawn_blocking(move || loader.load(&model))
                    .await
                    .map_err(|e| EmbeddingError::LocalModel(format!("model load panicked: {e}")))
                    .and_then(|result| result);
                match loaded {
                    Ok(encoder) => {
                        info!(
                            "Loaded local embedding model {} ({} dimensions)",
                            self.model_name,
                            encoder.dimension()
                        );
                        Some(encoder)
                    }
                    Err(e) => {
                        warn!(
                            "Local embedding model {} unavailable: {e}",
                            self.model_name
                        );
                        None
                    }
                }
            })
            .await;

        encoder.clone().ok_or_else(|| {
            EmbeddingError::ProviderNotConfigured(format!(
                "local model {} failed to load",
                self.model_name
            ))
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn default_model(&self) -> &str {
        &self.model_name
    }

    fn default_dimension(&self) -> usize {
        match self.encoder.get() {
            Some(Some(encoder)) => encoder.dimension(),
            _ => known_dimension(&self.model_name).unwrap_or(crate::DEFAULT_LOCAL_DIMENSION),
        }
    }

    /// Unavailable only once a load has been attempted and failed.
    fn is_available(&self) -> bool {
        !matches!(self.encoder.get(), Some(None))
    }

    async fn embed_batch(&self, texts: &[String], model: &str) -> Result<Vec<Embedding>> {
        if model != self.model_name {
            return Err(EmbeddingError::ProviderNotConfigured(format!(
                "local model {model} is not loaded (configured: {})",
                self.model_name
            )));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encoder = self.encoder().await?;
        let texts = texts.to_vec();
        let count = texts.len();

        let embeddings = tokio::task::spawn_blocking(move || encoder.encode(&texts))
            .await
            .map_err(|e| EmbeddingError::LocalModel(format!("encoding panicked: {e}")))??;

        if embeddings.len() != count {
            return Err(EmbeddingError::LocalModel(format!(
                "expected {count} embeddings, got {}",
                embeddings.len()
            )));
        }

        debug!("Encoded {count} texts locally with {model}");
        Ok(embeddings)
    }
}

impl Default for LocalProvider {
    #[cfg(feature = "fastembed")]
    fn default() -> Self {
        Self::fastembed(DEFAULT_LOCAL_MODEL)
    }

    #[cfg(not(feature = "fastembed"))]
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_MODEL, |model: &str| -> Result<Arc<dyn TextEncoder>> {
            Err(EmbeddingError::LocalModel(format!(
                "no local runtime compiled in for {model}"
            )))
        })
    }
}

#[cfg(feature = "fastembed")]
pub use fastembed_runtime::FastEmbedLoader;

#[cfg(feature = "fastembed")]
mod fastembed_runtime {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

    use super::{LocalModelLoader, TextEncoder};
    use crate::Embedding;
    use crate::error::{EmbeddingError, Result};

    /// Loads catalog models through `fastembed`, downloading them on first
    /// use.
    #[derive(Debug, Clone, Default)]
    pub struct FastEmbedLoader {
        cache_dir: Option<PathBuf>,
        show_download_progress: bool,
    }

    impl FastEmbedLoader {
        /// Store downloaded model files under `dir`.
        pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
            self.cache_dir = Some(dir.into());
            self
        }

        pub fn with_download_progress(mut self, show: bool) -> Self {
            self.show_download_progress = show;
            self
        }
    }

    fn parse_model(name: &str) -> Option<EmbeddingModel> {
        match name {
            "all-MiniLM-L6-v2" => Some(EmbeddingModel::AllMiniLML6V2),
            "all-MiniLM-L12-v2" => Some(EmbeddingModel::AllMiniLML12V2),
            "bge-small-en-v1.5" => Some(EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Some(EmbeddingModel::BGEBaseENV15),
            _ => None,
        }
    }

    impl LocalModelLoader for FastEmbedLoader {
        fn load(&self, model: &str) -> Result<Arc<dyn TextEncoder>> {
            let embedding_model = parse_model(model)
                .ok_or_else(|| EmbeddingError::LocalModel(format!("unknown local model {model}")))?;

            let mut options =
                InitOptions::new(embedding_model).with_show_download_progress(self.show_download_progress);
            if let Some(dir) = &self.cache_dir {
                options = options.with_cache_dir(dir.clone());
            }

            let mut text_model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::LocalModel(format!("failed to load {model}: {e}")))?;

            // Probe once so the dimension comes from the model itself.
            let dimension = text_model
                .embed(vec!["dimension probe"], None)
                .map_err(|e| EmbeddingError::LocalModel(e.to_string()))?
                .first()
                .map(Vec::len)
                .ok_or_else(|| EmbeddingError::LocalModel("model returned no embedding".to_string()))?;

            Ok(Arc::new(FastEmbedEncoder {
                model: Mutex::new(text_model),
                dimension,
            }))
        }
    }

    struct FastEmbedEncoder {
        /// `TextEmbedding::embed` needs exclusive access.
        model: Mutex<TextEmbedding>,
        dimension: usize,
    }

    impl TextEncoder for FastEmbedEncoder {
        fn encode(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            self.model
                .lock()
                .map_err(|_| EmbeddingError::LocalModel("embedding model lock poisoned".to_string()))?
                .embed(texts.to_vec(), None)
                .map_err(|e| EmbeddingError::LocalModel(format!("failed to generate embeddings: {e}")))
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_model_covers_local_catalog() {
            for info in crate::model::local_catalog(true) {
                assert!(parse_model(&info.name).is_some(), "{} not loadable", info.name);
            }
            assert!(parse_model("not-a-model").is_none());
        }
    }
}
