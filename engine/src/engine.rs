//! Vector engine implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vembed_embeddings::{
    CacheStore, ClusterAssignment, EmbeddingError, EmbeddingService, IndexStats, LocalProvider,
    Metadata, OpenAIProvider, VectorIndex,
};

use crate::config::{CacheConfig, EmbeddingConfig, EngineConfig};
use crate::error::{EngineError, Result};
use crate::output::{
    AddVectorsOutput, BatchEmbeddingOutput, EmbeddingOutput, HealthReport, ModelsOutput,
    SearchOutput, SimilarPairsOutput,
};

/// Default number of search results.
pub const DEFAULT_TOP_K: usize = 10;

/// Default number of clusters.
pub const DEFAULT_CLUSTERS: usize = 10;

/// Default similarity threshold for pair discovery.
pub const DEFAULT_PAIR_THRESHOLD: f32 = 0.8;

/// Long-lived engine owning the embedding service and the vector index.
///
/// Writers (`add_vectors`, `clear`, `load`) take the index write lock;
/// everything else reads. CPU-heavy reads run on the blocking pool.
pub struct VectorEngine {
    /// Configuration.
    config: EngineConfig,

    service: Arc<EmbeddingService>,

    index: Arc<RwLock<VectorIndex>>,
}

impl VectorEngine {
    /// Build the engine from configuration, loading the saved index if one
    /// exists at the configured path. A new index takes the dimension of the
    /// default model.
    pub async fn new(mut config: EngineConfig) -> Result<Self> {
        info!("Initializing vector engine");
        config.validate()?;

        let service = build_service(&config)?;
        if !config.index.path.exists() {
            let model_dimension = service.default_dimension();
            if model_dimension != config.index.dimension {
                info!(
                    "Sizing new index for {} ({model_dimension} dimensions, configured {})",
                    service.resolve_model(None).name,
                    config.index.dimension
                );
                config.index.dimension = model_dimension;
            }
        }

        if service.cache().check().await {
            debug!("Embedding cache reachable");
        } else if config.cache.enabled {
            warn!("Embedding cache not reachable, continuing without it");
        }

        let engine = Self::with_service(config, service);

        if engine.config.index.path.exists() {
            engine.load().await?;
        } else {
            info!(
                "No saved index at {}, starting empty ({} dimensions)",
                engine.config.index.path.display(),
                engine.config.index.dimension
            );
        }

        Ok(engine)
    }

    /// Build the engine around an existing service with an empty index.
    pub fn with_service(config: EngineConfig, service: EmbeddingService) -> Self {
        let index = VectorIndex::new(config.index.dimension);
        Self {
            config,
            service: Arc::new(service),
            index: Arc::new(RwLock::new(index)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn service(&self) -> &EmbeddingService {
        &self.service
    }

    /// Embed one text.
    pub async fn generate(&self, text: &str, model: Option<&str>) -> Result<EmbeddingOutput> {
        let (embedding, model) = self.service.get_embedding(text, model).await?;
        Ok(EmbeddingOutput {
            dimension: embedding.len(),
            embedding,
            model,
        })
    }

    /// Embed several texts.
    pub async fn generate_batch(
        &self,
        texts: &[String],
        model: Option<&str>,
    ) -> Result<BatchEmbeddingOutput> {
        let (embeddings, model) = self.service.get_batch_embeddings(texts, model).await?;
        Ok(BatchEmbeddingOutput {
            dimension: embeddings.first().map_or(0, Vec::len),
            count: embeddings.len(),
            embeddings,
            model,
        })
    }

    /// Embed `query` and return the closest indexed texts.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        threshold: Option<f32>,
        model: Option<&str>,
    ) -> Result<SearchOutput> {
        let (embedding, model) = self.service.get_embedding(query, model).await?;
        let results = self.index.read().await.search(&embedding, top_k, threshold)?;
        debug!("Search returned {} results", results.len());

        Ok(SearchOutput {
            total_results: results.len(),
            results,
            query: query.to_string(),
            model,
        })
    }

    /// Requestable models and the configured defaults.
    pub fn list_models(&self) -> ModelsOutput {
        ModelsOutput {
            models: self.service.available_models(),
            default_remote: self.service.remote_model().to_string(),
            default_local: self.service.local_model().to_string(),
        }
    }

    /// Embed `texts` and append them to the index.
    pub async fn add_vectors(
        &self,
        texts: Vec<String>,
        metadata: Option<Vec<Metadata>>,
        model: Option<&str>,
    ) -> Result<AddVectorsOutput> {
        if let Some(count) = metadata.as_ref().map(Vec::len).filter(|n| *n != texts.len()) {
            return Err(EmbeddingError::LengthMismatch {
                what: "metadata entries and texts",
                expected: texts.len(),
                actual: count,
            }
            .into());
        }

        let (embeddings, model_used) = self.service.get_batch_embeddings(&texts, model).await?;
        let added = texts.len();

        let mut index = self.index.write().await;
        index.add(embeddings, texts, metadata)?;
        let total_vectors = index.len();
        drop(index);

        info!("Added {added} vectors to index using {model_used} ({total_vectors} total)");
        Ok(AddVectorsOutput {
            added,
            model_used,
            total_vectors,
        })
    }

    /// Cluster every indexed vector.
    pub async fn cluster(&self, n_clusters: usize) -> Result<ClusterAssignment> {
        let index = Arc::clone(&self.index);
        Ok(tokio::task::spawn_blocking(move || index.blocking_read().cluster(n_clusters)).await?)
    }

    /// Every pair of indexed texts at least `threshold` similar.
    pub async fn similar_pairs(&self, threshold: f32) -> Result<SimilarPairsOutput> {
        if !threshold.is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "threshold must be a finite number, got {threshold}"
            )));
        }

        let index = Arc::clone(&self.index);
        let similar_pairs =
            tokio::task::spawn_blocking(move || index.blocking_read().similar_pairs(threshold))
                .await?;

        Ok(SimilarPairsOutput {
            count: similar_pairs.len(),
            similar_pairs,
            threshold,
        })
    }

    pub async fn stats(&self) -> IndexStats {
        self.index.read().await.stats()
    }

    /// Persist the index to the configured path.
    pub async fn save(&self) -> Result<()> {
        let index = Arc::clone(&self.index);
        let path = self.config.index.path.clone();
        tokio::task::spawn_blocking(move || index.blocking_read().save(&path)).await??;
        Ok(())
    }

    /// Drop every indexed vector. The saved index is untouched until the
    /// next [`save`](Self::save).
    pub async fn clear(&self) {
        self.index.write().await.clear();
    }

    /// Replace the in-memory index with the saved one. Returns the number of
    /// loaded vectors.
    pub async fn load(&self) -> Result<usize> {
        let path = self.config.index.path.clone();
        let dimension = self.config.index.dimension;
        let loaded =
            tokio::task::spawn_blocking(move || VectorIndex::load(&path, dimension)).await?;
        let count = loaded.len();

        *self.index.write().await = loaded;
        Ok(count)
    }

    /// Service status. Contacts the cache backend once.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".to_string(),
            remote_available: self.service.remote_available(),
            cache_available: self.service.cache().check().await,
            local_available: self.service.local_available(),
            vector_stats: self.stats().await,
        }
    }
}

fn build_service(config: &EngineConfig) -> Result<EmbeddingService> {
    let embedding = &config.embedding;
    let mut builder = EmbeddingService::builder()
        .with_remote_model(&embedding.remote_model)
        .with_local_model(&embedding.local_model)
        .with_max_batch_size(embedding.max_batch_size)
        .with_retry((&embedding.retry).into())
        .with_cache(Arc::new(build_cache(&config.cache)));

    match &embedding.openai_api_key {
        Some(key) => {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(embedding.request_timeout_secs))
                .build()
                .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;
            builder = builder.with_remote(Arc::new(
                OpenAIProvider::new()
                    .with_api_key(key)
                    .with_base_url(&embedding.openai_base_url)
                    .with_model(&embedding.remote_model)
                    .with_client(client),
            ));
        }
        None => info!("No OpenAI API key configured, using the local model"),
    }

    if embedding.local_enabled {
        builder = builder.with_local(Arc::new(local_provider(embedding)));
    }

    Ok(builder.build())
}

#[cfg(feature = "fastembed")]
fn local_provider(config: &EmbeddingConfig) -> LocalProvider {
    let mut loader = vembed_embeddings::FastEmbedLoader::default();
    if let Some(dir) = &config.local_cache_dir {
        loader = loader.with_cache_dir(dir);
    }
    LocalProvider::new(&config.local_model, loader)
}

#[cfg(not(feature = "fastembed"))]
fn local_provider(config: &EmbeddingConfig) -> LocalProvider {
    use vembed_embeddings::TextEncoder;

    LocalProvider::new(
        &config.local_model,
        |model: &str| -> vembed_embeddings::Result<Arc<dyn TextEncoder>> {
            Err(EmbeddingError::LocalModel(format!(
                "built without a local model runtime, cannot load {model}"
            )))
        },
    )
}

fn build_cache(config: &CacheConfig) -> CacheStore {
    if !config.enabled {
        info!("Embedding cache disabled");
        return CacheStore::disabled();
    }
    match &config.redis_url {
        Some(url) => CacheStore::redis(url, config.ttl()).unwrap_or_else(|e| {
            warn!("Embedding cache disabled: {e}");
            CacheStore::disabled()
        }),
        None => CacheStore::memory(config.ttl()),
    }
}
