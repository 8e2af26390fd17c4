//! Embedding acquisition: model resolution, caching, retry and fallback.
//!
//! Requests resolve to a [`ModelDescriptor`] once, up front. The cache is
//! consulted under the resolved name; misses go to the provider for that
//! model. Remote failures are retried, then the local model takes over and
//! its name becomes the effective model for the result and the cache entry.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::error::{EmbeddingError, Result};
use crate::model::{
    DEFAULT_LOCAL_MODEL, DEFAULT_REMOTE_MODEL, ModelDescriptor, ModelInfo, ModelKind,
    local_catalog, remote_catalog,
};
use crate::provider::{EmbeddingProvider, RetryPolicy};
use crate::{DEFAULT_MAX_BATCH_SIZE, Embedding};

/// Generates embeddings through the cache and the configured providers.
pub struct EmbeddingService {
    remote: Option<Arc<dyn EmbeddingProvider>>,
    local: Option<Arc<dyn EmbeddingProvider>>,
    cache: Arc<CacheStore>,
    retry: RetryPolicy,
    remote_model: String,
    local_model: String,
    max_batch_size: usize,
}

/// Builder for [`EmbeddingService`].
pub struct EmbeddingServiceBuilder {
    remote: Option<Arc<dyn EmbeddingProvider>>,
    local: Option<Arc<dyn EmbeddingProvider>>,
    cache: Option<Arc<CacheStore>>,
    retry: RetryPolicy,
    remote_model: Option<String>,
    local_model: Option<String>,
    max_batch_size: usize,
}

impl Default for EmbeddingServiceBuilder {
    fn default() -> Self {
        Self {
            remote: None,
            local: None,
            cache: None,
            retry: RetryPolicy::default(),
            remote_model: None,
            local_model: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl EmbeddingServiceBuilder {
    /// Set the remote provider.
    pub fn with_remote(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.remote = Some(provider);
        self
    }

    /// Set the local fallback provider.
    pub fn with_local(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.local = Some(provider);
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Remote model used when a request names none.
    pub fn with_remote_model(mut self, model: impl Into<String>) -> Self {
        self.remote_model = Some(model.into());
        self
    }

    /// Local model used when a request names none and for fallback.
    pub fn with_local_model(mut self, model: impl Into<String>) -> Self {
        self.local_model = Some(model.into());
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn build(self) -> EmbeddingService {
        let remote_model = self
            .remote_model
            .or_else(|| self.remote.as_ref().map(|p| p.default_model().to_string()))
            .unwrap_or_else(|| DEFAULT_REMOTE_MODEL.to_string());
        let local_model = self
            .local_model
            .or_else(|| self.local.as_ref().map(|p| p.default_model().to_string()))
            .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());

        EmbeddingService {
            remote: self.remote,
            local: self.local,
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(CacheStore::disabled())),
            retry: self.retry,
            remote_model,
            local_model,
            max_batch_size: self.max_batch_size,
        }
    }
}

impl EmbeddingService {
    pub fn builder() -> EmbeddingServiceBuilder {
        EmbeddingServiceBuilder::default()
    }

    /// The cache shared by every request.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn remote_model(&self) -> &str {
        &self.remote_model
    }

    pub fn local_model(&self) -> &str {
        &self.local_model
    }

    /// Whether a remote provider is configured with credentials.
    pub fn remote_available(&self) -> bool {
        self.remote.as_ref().is_some_and(|p| p.is_available())
    }

    /// Whether a local provider exists and has not failed to load.
    pub fn local_available(&self) -> bool {
        self.local.as_ref().is_some_and(|p| p.is_available())
    }

    /// Output dimension of the model used when a request names none.
    pub fn default_dimension(&self) -> usize {
        let provider = if self.remote_available() {
            self.remote.as_ref()
        } else {
            self.local.as_ref()
        };
        provider.map_or_else(|| self.resolve_model(None).dimension, |p| p.default_dimension())
    }

    /// Pick the model for a request.
    ///
    /// An explicit name is routed by its prefix. Without one, the remote
    /// default wins when a remote provider is configured.
    pub fn resolve_model(&self, model: Option<&str>) -> ModelDescriptor {
        match model {
            Some(name) => ModelDescriptor::from_name(name),
            None if self.remote_available() => ModelDescriptor::remote(&self.remote_model),
            None => ModelDescriptor::local(&self.local_model),
        }
    }

    /// Models that can be requested.
    pub fn available_models(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();
        if self.remote_available() {
            models.extend(remote_catalog(true));
        }
        models.extend(local_catalog(self.local_available()));
        models
    }

    /// Embed one text. Returns the vector and the model that produced it.
    pub async fn get_embedding(&self, text: &str, model: Option<&str>) -> Result<(Embedding, String)> {
        let descriptor = self.resolve_model(model);

        if let Some(embedding) = self.cache.get(text, &descriptor.name).await.into_hit() {
            return Ok((embedding, descriptor.name));
        }

        let texts = [text.to_string()];
        let (mut embeddings, effective_model) = self.compute(&texts, &descriptor).await?;
        let embedding = embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))?;

        self.cache.set(text, &effective_model, &embedding).await;
        Ok((embedding, effective_model))
    }

    /// Embed several texts with one provider call for the uncached ones.
    ///
    /// Results are in input order. The call succeeds or fails as a whole.
    pub async fn get_batch_embeddings(
        &self,
        texts: &[String],
        model: Option<&str>,
    ) -> Result<(Vec<Embedding>, String)> {
        if texts.len() > self.max_batch_size {
            return Err(EmbeddingError::BatchTooLarge {
                size: texts.len(),
                max: self.max_batch_size,
            });
        }

        let descriptor = self.resolve_model(model);
        if texts.is_empty() {
            return Ok((Vec::new(), descriptor.name));
        }

        let mut slots = self.cache.get_batch(texts, &descriptor.name).await;
        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i)
            .collect();

        if missing.is_empty() {
            debug!("All {} batch embeddings served from cache", texts.len());
            return collect_slots(slots).map(|embeddings| (embeddings, descriptor.name));
        }

        let miss_texts: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();

        let (computed, effective_model) = self.compute(&miss_texts, &descriptor).await?;
        check_count(miss_texts.len(), computed.len())?;

        self.cache
            .set_batch(&miss_texts, &effective_model, &computed)
            .await;

        for (position, embedding) in missing.into_iter().zip(computed) {
            slots[position] = Some(embedding);
        }
        collect_slots(slots).map(|embeddings| (embeddings, effective_model))
    }

    /// Embed `texts` with the provider for `descriptor`, falling back to the
    /// local model when the remote route fails.
    async fn compute(
        &self,
        texts: &[String],
        descriptor: &ModelDescriptor,
    ) -> Result<(Vec<Embedding>, String)> {
        match descriptor.kind {
            ModelKind::Local => Ok((
                self.embed_local(texts, &descriptor.name).await?,
                descriptor.name.clone(),
            )),
            ModelKind::Remote => match self.embed_remote(texts, &descriptor.name).await {
                Ok(embeddings) => Ok((embeddings, descriptor.name.clone())),
                Err(remote_error) => Ok((
                    self.fallback(texts, remote_error).await?,
                    self.local_model.clone(),
                )),
            },
        }
    }

    async fn embed_remote(&self, texts: &[String], model: &str) -> Result<Vec<Embedding>> {
        let Some(remote) = self.remote.as_ref().filter(|p| p.is_available()) else {
            return Err(EmbeddingError::ProviderNotConfigured(
                "remote embedding provider not configured".to_string(),
            ));
        };

        self.retry
            .run("remote embedding request", || remote.embed_batch(texts, model))
            .await
    }

    async fn embed_local(&self, texts: &[String], model: &str) -> Result<Vec<Embedding>> {
        let Some(local) = &self.local else {
            return Err(EmbeddingError::ProviderNotConfigured(
                "local embedding provider not configured".to_string(),
            ));
        };
        local.embed_batch(texts, model).await
    }

    /// Encode `texts` with the local model after the remote route failed.
    async fn fallback(&self, texts: &[String], remote_error: EmbeddingError) -> Result<Vec<Embedding>> {
        warn!(
            "Remote embedding failed, falling back to local model {}: {remote_error}",
            self.local_model
        );

        match self.embed_local(texts, &self.local_model).await {
            Ok(embeddings) => {
                info!(
                    "Embedded {} texts with fallback model {}",
                    texts.len(),
                    self.local_model
                );
                Ok(embeddings)
            }
            Err(local_error) => {
                let nothing_configured = matches!(remote_error, EmbeddingError::ProviderNotConfigured(_))
                    && matches!(local_error, EmbeddingError::ProviderNotConfigured(_));
                if nothing_configured {
                    Err(EmbeddingError::ProviderNotConfigured(
                        "no embedding provider is available".to_string(),
                    ))
                } else {
                    Err(EmbeddingError::AllMethodsFailed {
                        remote: remote_error.to_string(),
                        local: local_error.to_string(),
                    })
                }
            }
        }
    }
}

fn check_count(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {expected} embeddings, got {actual}"
        )));
    }
    Ok(())
}

fn collect_slots(slots: Vec<Option<Embedding>>) -> Result<Vec<Embedding>> {
    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding in batch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::FlakyBackend;
    use crate::cache::CacheLookup;
    use crate::DEFAULT_CACHE_TTL;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider producing `dimension`-long vectors derived from the text.
    struct MockProvider {
        name: &'static str,
        model: &'static str,
        dimension: usize,
        available: bool,
        fail: AtomicBool,
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl MockProvider {
        fn new(name: &'static str, model: &'static str, dimension: usize) -> Self {
            Self {
                name,
                model,
                dimension,
                available: true,
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn failing(self) -> Self {
            self.fail.store(true, Ordering::SeqCst);
            self
        }

        fn unconfigured(mut self) -> Self {
            self.available = false;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn vector_for(&self, text: &str) -> Embedding {
            let seed = text.bytes().map(f32::from).sum::<f32>();
            (0..self.dimension).map(|i| seed + i as f32).collect()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn default_model(&self) -> &str {
            self.model
        }

        fn default_dimension(&self) -> usize {
            self.dimension
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn embed_batch(&self, texts: &[String], _model: &str) -> Result<Vec<Embedding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(texts.to_vec());
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbeddingError::ApiRequest(format!("{} is down", self.name)));
            }
            Ok(texts.iter().map(|t| self.vector_for(t)).collect())
        }
    }

    const REMOTE: &str = "text-embedding-3-small";
    const LOCAL: &str = "all-MiniLM-L6-v2";

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    fn service(remote: &Arc<MockProvider>, local: &Arc<MockProvider>) -> EmbeddingService {
        EmbeddingService::builder()
            .with_remote(remote.clone())
            .with_local(local.clone())
            .with_cache(Arc::new(CacheStore::memory(DEFAULT_CACHE_TTL)))
            .with_retry(fast_retry())
            .build()
    }

    fn remote() -> Arc<MockProvider> {
        Arc::new(MockProvider::new("openai", REMOTE, 4))
    }

    fn local() -> Arc<MockProvider> {
        Arc::new(MockProvider::new("local", LOCAL, 2))
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_resolve_model() {
        let remote = remote();
        let local = local();
        let service = service(&remote, &local);

        assert_eq!(service.resolve_model(None), ModelDescriptor::remote(REMOTE));
        assert_eq!(
            service.resolve_model(Some("text-embedding-3-large")).kind,
            ModelKind::Remote
        );
        assert_eq!(
            service.resolve_model(Some("bge-small-en-v1.5")),
            ModelDescriptor::local("bge-small-en-v1.5")
        );

        let offline = EmbeddingService::builder()
            .with_remote(Arc::new(MockProvider::new("openai", REMOTE, 4).unconfigured()))
            .with_local(local)
            .build();
        assert_eq!(offline.resolve_model(None), ModelDescriptor::local(LOCAL));
    }

    #[test]
    fn test_default_dimension_follows_default_route() {
        let remote = remote();
        let local = local();
        assert_eq!(service(&remote, &local).default_dimension(), 4);

        let offline = EmbeddingService::builder()
            .with_remote(Arc::new(MockProvider::new("openai", REMOTE, 4).unconfigured()))
            .with_local(local)
            .build();
        assert_eq!(offline.default_dimension(), 2);

        assert_eq!(EmbeddingService::builder().build().default_dimension(), 384);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let remote = remote();
        let local = local();
        let service = service(&remote, &local);

        let first = service.get_embedding("hello", None).await.unwrap();
        let second = service.get_embedding("hello", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.1, REMOTE);
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let (remote_a, local_a) = (remote(), local());
        let (remote_b, local_b) = (remote(), local());
        let single = service(&remote_a, &local_a);
        let batch = service(&remote_b, &local_b);
        let inputs = texts(&["alpha", "beta", "gamma"]);

        let (batched, model) = batch.get_batch_embeddings(&inputs, None).await.unwrap();

        assert_eq!(model, REMOTE);
        for (text, embedding) in inputs.iter().zip(&batched) {
            let (one, _) = single.get_embedding(text, None).await.unwrap();
            assert_eq!(&one, embedding);
        }
        assert_eq!(remote_b.calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_only_sends_misses() {
        let remote = remote();
        let local = local();
        let service = service(&remote, &local);
        service.get_embedding("b", None).await.unwrap();

        let (embeddings, _) = service
            .get_batch_embeddings(&texts(&["a", "b", "c"]), None)
            .await
            .unwrap();

        assert_eq!(embeddings.len(), 3);
        assert_eq!(embeddings[1], remote.vector_for("b"));
        let batches = remote.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![texts(&["b"]), texts(&["a", "c"])]);
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected_without_side_effects() {
        let remote = remote();
        let backend = Arc::new(FlakyBackend::default());
        let service = EmbeddingService::builder()
            .with_remote(remote.clone())
            .with_cache(Arc::new(CacheStore::new(backend.clone(), DEFAULT_CACHE_TTL)))
            .build();
        let inputs: Vec<String> = (0..150).map(|i| format!("text {i}")).collect();

        let result = service.get_batch_embeddings(&inputs, None).await;

        assert!(matches!(
            result,
            Err(EmbeddingError::BatchTooLarge { size: 150, max: 100 })
        ));
        assert_eq!(remote.calls(), 0);
        assert_eq!(backend.writes.load(Ordering::SeqCst), 0);
        assert_eq!(service.cache().stats().misses, 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let remote = remote();
        let local = local();
        let service = service(&remote, &local);

        let (embeddings, model) = service.get_batch_embeddings(&[], None).await.unwrap();

        assert!(embeddings.is_empty());
        assert_eq!(model, REMOTE);
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_local() {
        let remote = Arc::new(MockProvider::new("openai", REMOTE, 4).failing());
        let local = local();
        let service = service(&remote, &local);

        let (embedding, model) = service.get_embedding("hello", None).await.unwrap();

        assert_eq!(remote.calls(), 3);
        assert_eq!(local.calls(), 1);
        assert_eq!(model, LOCAL);
        assert_eq!(embedding, local.vector_for("hello"));
        assert_eq!(
            service.cache().get("hello", LOCAL).await,
            CacheLookup::Hit(embedding.clone())
        );
        assert_eq!(service.cache().get("hello", REMOTE).await, CacheLookup::Miss);

        let (cached, cached_model) = service.get_embedding("hello", Some(LOCAL)).await.unwrap();
        assert_eq!(cached, embedding);
        assert_eq!(cached_model, LOCAL);
        assert_eq!(remote.calls(), 3);
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_fallback_encodes_only_misses() {
        let remote = remote();
        let local = local();
        let service = service(&remote, &local);
        service.get_embedding("cached", None).await.unwrap();
        remote.fail.store(true, Ordering::SeqCst);

        let (embeddings, model) = service
            .get_batch_embeddings(&texts(&["cached", "fresh"]), None)
            .await
            .unwrap();

        assert_eq!(model, LOCAL);
        assert_eq!(embeddings[0], remote.vector_for("cached"));
        assert_eq!(embeddings[1], local.vector_for("fresh"));
        assert_eq!(local.batches.lock().unwrap().clone(), vec![texts(&["fresh"])]);
        assert_eq!(service.cache().get("cached", LOCAL).await, CacheLookup::Miss);
        assert_eq!(
            service.cache().get("fresh", LOCAL).await,
            CacheLookup::Hit(local.vector_for("fresh"))
        );
    }

    #[tokio::test]
    async fn test_all_methods_failed_names_both_causes() {
        let remote = Arc::new(MockProvider::new("openai", REMOTE, 4).failing());
        let local = Arc::new(MockProvider::new("local", LOCAL, 2).failing());
        let service = service(&remote, &local);

        let error = service.get_embedding("hello", None).await.unwrap_err();

        let message = error.to_string();
        assert!(matches!(error, EmbeddingError::AllMethodsFailed { .. }));
        assert!(message.contains("openai is down"), "{message}");
        assert!(message.contains("local is down"), "{message}");
        assert_eq!(service.cache().get("hello", LOCAL).await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_batch_all_methods_failed_writes_nothing() {
        let remote = Arc::new(MockProvider::new("openai", REMOTE, 4).failing());
        let local = Arc::new(MockProvider::new("local", LOCAL, 2).failing());
        let backend = Arc::new(FlakyBackend::default());
        let service = EmbeddingService::builder()
            .with_remote(remote.clone())
            .with_local(local.clone())
            .with_cache(Arc::new(CacheStore::new(backend.clone(), DEFAULT_CACHE_TTL)))
            .with_retry(fast_retry())
            .build();

        let error = service
            .get_batch_embeddings(&texts(&["a", "b"]), None)
            .await
            .unwrap_err();

        let message = error.to_string();
        assert!(matches!(error, EmbeddingError::AllMethodsFailed { .. }));
        assert!(message.contains("openai is down"), "{message}");
        assert!(message.contains("local is down"), "{message}");
        assert_eq!(remote.calls(), 3);
        assert_eq!(local.calls(), 1);
        assert_eq!(backend.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_providers_is_not_configured() {
        let service = EmbeddingService::builder().build();

        let result = service.get_embedding("hello", Some(REMOTE)).await;

        assert!(matches!(result, Err(EmbeddingError::ProviderNotConfigured(_))));
    }

    #[tokio::test]
    async fn test_local_route_is_not_retried() {
        let remote = remote();
        let local = Arc::new(MockProvider::new("local", LOCAL, 2).failing());
        let service = service(&remote, &local);

        let result = service.get_embedding("hello", Some(LOCAL)).await;

        assert!(matches!(result, Err(EmbeddingError::ApiRequest(_))));
        assert_eq!(local.calls(), 1);
        assert_eq!(remote.calls(), 0);
    }

    #[test]
    fn test_available_models() {
        let remote = remote();
        let local = local();
        let models = service(&remote, &local).available_models();

        assert!(models.iter().any(|m| m.name == REMOTE && m.kind == ModelKind::Remote));
        assert!(models.iter().any(|m| m.name == LOCAL && m.available));

        let offline = EmbeddingService::builder().with_local(local).build();
        assert!(offline.available_models().iter().all(|m| m.kind == ModelKind::Local));
    }
}
