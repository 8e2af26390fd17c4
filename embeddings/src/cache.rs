//! Embedding cache for efficient retrieval.
//!
//! Entries are keyed by a fingerprint of the text and the model name, so the
//! same text embedded by two models is cached twice. The cache is fail-open:
//! a backend error reads as [`CacheLookup::Unavailable`] or a skipped write,
//! never as an error for the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{EmbeddingError, Result};
use crate::{DEFAULT_CACHE_TTL, Embedding};

/// Prefix shared by every cache key.
pub const CACHE_KEY_PREFIX: &str = "embedding:";

/// How long to wait for a Redis connection before giving up on the cache.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cache key for `text` embedded by `model`.
pub fn cache_key(text: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b":");
    hasher.update(model.as_bytes());
    format!("{CACHE_KEY_PREFIX}{:x}", hasher.finalize())
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(Embedding),
    Miss,
    /// The backend could not be reached. Callers treat this like a miss.
    Unavailable,
}

impl CacheLookup {
    /// The cached embedding, if any.
    pub fn into_hit(self) -> Option<Embedding> {
        match self {
            Self::Hit(embedding) => Some(embedding),
            Self::Miss | Self::Unavailable => None,
        }
    }
}

/// Key-value storage with expiry behind the cache store.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name for logs and stats.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Round-trip to the backend without touching any entry.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Fetch several keys, in order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Store several entries with the same expiry.
    async fn set_many(&self, entries: Vec<(String, String)>, ttl: Duration) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Backend name, `None` when caching is disabled.
    pub backend: Option<String>,

    /// Whether the last backend interaction succeeded.
    pub available: bool,

    pub hits: u64,
    pub misses: u64,

    /// Lookups or writes that failed at the backend.
    pub errors: u64,
}

/// Fail-open embedding cache.
pub struct CacheStore {
    backend: Option<Arc<dyn CacheBackend>>,

    /// Expiry applied by [`set`](Self::set) and [`set_batch`](Self::set_batch).
    ttl: Duration,

    available: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl CacheStore {
    /// Create a store over `backend`.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self::with_backend(Some(backend), ttl)
    }

    /// A store with no backend. Every lookup is [`CacheLookup::Unavailable`]
    /// and writes are dropped.
    pub fn disabled() -> Self {
        Self::with_backend(None, DEFAULT_CACHE_TTL)
    }

    /// In-process store.
    pub fn memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryBackend::new(usize::MAX)), ttl)
    }

    /// Redis-backed store. Only the URL is checked here; the connection is
    /// made on first use, and the store reports itself unavailable until a
    /// command or [`check`](Self::check) succeeds.
    pub fn redis(url: &str, ttl: Duration) -> Result<Self> {
        let store = Self::new(Arc::new(RedisBackend::new(url)?), ttl);
        store.available.store(false, Ordering::Relaxed);
        Ok(store)
    }

    fn with_backend(backend: Option<Arc<dyn CacheBackend>>, ttl: Duration) -> Self {
        Self {
            available: AtomicBool::new(backend.is_some()),
            backend,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Default expiry for new entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether a backend is configured and its last interaction succeeded.
    pub fn is_available(&self) -> bool {
        self.backend.is_some() && self.available.load(Ordering::Relaxed)
    }

    /// Contact the backend and record whether it answered.
    pub async fn check(&self) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        match backend.ping().await {
            Ok(()) => self.mark_available(),
            Err(e) => self.mark_unavailable(&e),
        }
        self.is_available()
    }

    /// Look up the embedding of `text` under `model`.
    pub async fn get(&self, text: &str, model: &str) -> CacheLookup {
        let Some(backend) = &self.backend else {
            return CacheLookup::Unavailable;
        };

        match backend.get(&cache_key(text, model)).await {
            Ok(value) => {
                self.mark_available();
                match value.and_then(|v| decode(&v)) {
                    Some(embedding) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        debug!("Cache hit for embedding (model: {model})");
                        CacheLookup::Hit(embedding)
                    }
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        debug!("Cache miss for embedding (model: {model})");
                        CacheLookup::Miss
                    }
                }
            }
            Err(e) => {
                self.mark_unavailable(&e);
                CacheLookup::Unavailable
            }
        }
    }

    /// Look up several texts under one model. The result has one slot per
    /// text, in order; an unavailable backend yields all `None`.
    pub async fn get_batch(&self, texts: &[String], model: &str) -> Vec<Option<Embedding>> {
        let Some(backend) = &self.backend else {
            return vec![None; texts.len()];
        };
        if texts.is_empty() {
            return Vec::new();
        }

        let keys: Vec<String> = texts.iter().map(|t| cache_key(t, model)).collect();
        match backend.get_many(&keys).await {
            Ok(values) if values.len() == texts.len() => {
                self.mark_available();
                let found: Vec<Option<Embedding>> = values
                    .into_iter()
                    .map(|v| v.and_then(|v| decode(&v)))
                    .collect();
                let hits = found.iter().filter(|v| v.is_some()).count() as u64;
                self.hits.fetch_add(hits, Ordering::Relaxed);
                self.misses
                    .fetch_add(texts.len() as u64 - hits, Ordering::Relaxed);
                debug!("Cache batch lookup: {hits}/{} hits (model: {model})", texts.len());
                found
            }
            Ok(values) => {
                self.mark_unavailable(&EmbeddingError::Cache(format!(
                    "backend returned {} values for {} keys",
                    values.len(),
                    texts.len()
                )));
                vec![None; texts.len()]
            }
            Err(e) => {
                self.mark_unavailable(&e);
                vec![None; texts.len()]
            }
        }
    }

    /// Store an embedding with the default expiry.
    pub async fn set(&self, text: &str, model: &str, embedding: &[f32]) {
        self.set_with_ttl(text, model, embedding, self.ttl).await;
    }

    /// Store an embedding with an explicit expiry.
    pub async fn set_with_ttl(&self, text: &str, model: &str, embedding: &[f32], ttl: Duration) {
        let Some(backend) = &self.backend else {
            return;
        };
        let Some(value) = encode(embedding) else {
            return;
        };

        match backend.set(&cache_key(text, model), value, ttl).await {
            Ok(()) => {
                self.mark_available();
                debug!("Cached embedding for text (model: {model})");
            }
            Err(e) => self.mark_unavailable(&e),
        }
    }

    /// Store several embeddings under one model in a single backend call.
    pub async fn set_batch(&self, texts: &[String], model: &str, embeddings: &[Embedding]) {
        let Some(backend) = &self.backend else {
            return;
        };
        if texts.is_empty() {
            return;
        }
        if texts.len() != embeddings.len() {
            warn!(
                "Skipping cache write: {} texts but {} embeddings",
                texts.len(),
                embeddings.len()
            );
            return;
        }

        let entries: Vec<(String, String)> = texts
            .iter()
            .zip(embeddings)
            .filter_map(|(text, embedding)| Some((cache_key(text, model), encode(embedding)?)))
            .collect();
        let count = entries.len();

        match backend.set_many(entries, self.ttl).await {
            Ok(()) => {
                self.mark_available();
                debug!("Cached {count} embeddings (model: {model})");
            }
            Err(e) => self.mark_unavailable(&e),
        }
    }

    /// Counters and availability.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            backend: self.backend.as_ref().map(|b| b.name().to_string()),
            available: self.is_available(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn mark_available(&self) {
        if !self.available.swap(true, Ordering::Relaxed) {
            info!("Embedding cache is reachable");
        }
    }

    /// Logs once per outage.
    fn mark_unavailable(&self, error: &EmbeddingError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if self.available.swap(false, Ordering::Relaxed) {
            warn!("Embedding cache unavailable, continuing without it: {error}");
        } else {
            debug!("Embedding cache still unavailable: {error}");
        }
    }
}

fn encode(embedding: &[f32]) -> Option<String> {
    serde_json::to_string(embedding)
        .inspect_err(|e| warn!("Failed to serialize embedding for cache: {e}"))
        .ok()
}

fn decode(value: &str) -> Option<Embedding> {
    serde_json::from_str(value)
        .inspect_err(|e| warn!("Ignoring unreadable cache entry: {e}"))
        .ok()
}

struct MemoryEntry {
    value: String,
    inserted_at: Instant,
    expires_at: Instant,
}

/// In-process backend with per-entry expiry.
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, MemoryEntry>>,

    /// Maximum cache size.
    max_entries: usize,
}

impl MemoryBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of stored entries, expired ones included until the next write.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        self.insert(&mut entries, key.to_string(), value, now, ttl);
        Ok(())
    }

    async fn set_many(&self, batch: Vec<(String, String)>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        for (key, value) in batch {
            self.insert(&mut entries, key, value, now, ttl);
        }
        Ok(())
    }
}

impl MemoryBackend {
    /// Insert one entry into already-pruned storage, evicting the oldest
    /// entry when full.
    fn insert(
        &self,
        entries: &mut HashMap<String, MemoryEntry>,
        key: String,
        value: String,
        now: Instant,
        ttl: Duration,
    ) {
        let full = entries.len() >= self.max_entries && !entries.contains_key(&key);
        let oldest_key = full
            .then(|| {
                entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(k, _)| k.clone())
            })
            .flatten();
        if let Some(oldest_key) = oldest_key {
            entries.remove(&oldest_key);
        }

        entries.insert(
            key,
            MemoryEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }
}

/// Redis backend over a shared multiplexed connection.
pub struct RedisBackend {
    client: redis::Client,

    /// Reconnected after any command error.
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Create a backend for `url` (e.g. `redis://localhost:6379/0`).
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EmbeddingError::Cache(format!("invalid redis url {url}: {e}")))?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        if let Some(connection) = self.connection.read().await.as_ref() {
            return Ok(connection.clone());
        }

        let mut slot = self.connection.write().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection = tokio::time::timeout(
            REDIS_CONNECT_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| EmbeddingError::Cache("timed out connecting to redis".to_string()))?
        .map_err(|e| EmbeddingError::Cache(format!("failed to connect to redis: {e}")))?;

        info!("Connected to redis embedding cache");
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn reset(&self, error: redis::RedisError) -> EmbeddingError {
        *self.connection.write().await = None;
        EmbeddingError::Cache(format!("redis command failed: {error}"))
    }
}

/// `SET .. EX 0` is rejected by the server.
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection().await?;
        match redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut connection)
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => Err(self.reset(e).await),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut connection = self.connection().await?;
        match redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expiry_secs(ttl))
            .query_async::<()>(&mut connection)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self.reset(e).await),
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut connection = self.connection().await?;
        match redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Err(self.reset(e).await),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut connection = self.connection().await?;
        let mut command = redis::cmd("MGET");
        for key in keys {
            command.arg(key);
        }
        match command
            .query_async::<Vec<Option<String>>>(&mut connection)
            .await
        {
            Ok(values) => Ok(values),
            Err(e) => Err(self.reset(e).await),
        }
    }

    async fn set_many(&self, entries: Vec<(String, String)>, ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection().await?;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(expiry_secs(ttl))
                .ignore();
        }
        match pipe.query_async::<()>(&mut connection).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.reset(e).await),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    /// Backend whose reachability can be toggled; counts writes.
    #[derive(Default)]
    pub(crate) struct FlakyBackend {
        pub(crate) inner: MemoryBackend,
        pub(crate) down: AtomicBool,
        pub(crate) writes: AtomicUsize,
    }

    impl FlakyBackend {
        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(EmbeddingError::Cache("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
            self.check()?;
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value, ttl).await
        }

        async fn ping(&self) -> Result<()> {
            self.check()
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_cache_key_format() {
        let key = cache_key("hello", "text-embedding-3-small");
        assert!(key.starts_with("embedding:"));
        assert_eq!(key.len(), "embedding:".len() + 64);
        assert_eq!(key, cache_key("hello", "text-embedding-3-small"));
        assert_ne!(key, cache_key("hello", "all-MiniLM-L6-v2"));
    }

    #[tokio::test]
    async fn test_cache_set_get() {
        let cache = CacheStore::memory(DEFAULT_CACHE_TTL);
        let embedding = vec![1.0, 2.0, 3.0];

        cache.set("hello", "model-1", &embedding).await;

        assert_eq!(cache.get("hello", "model-1").await, CacheLookup::Hit(embedding));
        assert_eq!(cache.get("hello", "model-2").await, CacheLookup::Miss);
        assert_eq!(cache.get("not cached", "model-1").await, CacheLookup::Miss);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.backend.as_deref(), Some("memory"));
    }

    #[tokio::test]
    async fn test_batch_preserves_positions() {
        let cache = CacheStore::memory(DEFAULT_CACHE_TTL);
        cache
            .set_batch(&texts(&["a", "c"]), "m", &[vec![1.0], vec![3.0]])
            .await;

        let found = cache.get_batch(&texts(&["a", "b", "c"]), "m").await;

        assert_eq!(found, vec![Some(vec![1.0]), None, Some(vec![3.0])]);
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let cache = CacheStore::memory(DEFAULT_CACHE_TTL);
        cache
            .set_with_ttl("short", "m", &[1.0], Duration::ZERO)
            .await;

        assert_eq!(cache.get("short", "m").await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_memory_eviction() {
        let backend = MemoryBackend::new(2);

        backend.set("a", "[1.0]".to_string(), DEFAULT_CACHE_TTL).await.unwrap();
        backend.set("b", "[2.0]".to_string(), DEFAULT_CACHE_TTL).await.unwrap();
        backend.set("c", "[3.0]".to_string(), DEFAULT_CACHE_TTL).await.unwrap();

        // One entry should have been evicted
        assert_eq!(backend.len().await, 2);
        assert!(backend.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_set_many_prunes_and_evicts() {
        let backend = MemoryBackend::new(2);
        backend.set("stale", "[0.0]".to_string(), Duration::ZERO).await.unwrap();

        backend
            .set_many(
                vec![
                    ("a".to_string(), "[1.0]".to_string()),
                    ("b".to_string(), "[2.0]".to_string()),
                    ("c".to_string(), "[3.0]".to_string()),
                ],
                DEFAULT_CACHE_TTL,
            )
            .await
            .unwrap();

        assert_eq!(backend.len().await, 2);
        assert!(backend.get("stale").await.unwrap().is_none());
        assert_eq!(backend.get("c").await.unwrap().as_deref(), Some("[3.0]"));
    }

    #[tokio::test]
    async fn test_check_contacts_backend() {
        let backend = Arc::new(FlakyBackend::default());
        let cache = CacheStore::new(backend.clone(), DEFAULT_CACHE_TTL);

        backend.down.store(true, Ordering::SeqCst);
        assert!(!cache.check().await);
        assert!(!cache.stats().available);

        backend.down.store(false, Ordering::SeqCst);
        assert!(cache.check().await);
        assert!(!CacheStore::disabled().check().await);
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_unavailable() {
        let cache = CacheStore::redis("redis://127.0.0.1:1/0", DEFAULT_CACHE_TTL).unwrap();

        assert!(!cache.is_available());
        assert!(!cache.check().await);
        assert_eq!(cache.get("hello", "m").await, CacheLookup::Unavailable);
    }

    #[tokio::test]
    async fn test_fail_open() {
        let backend = Arc::new(FlakyBackend::default());
        let cache = CacheStore::new(backend.clone(), DEFAULT_CACHE_TTL);
        cache.set("hello", "m", &[1.0]).await;
        assert!(cache.is_available());

        backend.down.store(true, Ordering::SeqCst);
        assert_eq!(cache.get("hello", "m").await, CacheLookup::Unavailable);
        assert_eq!(cache.get_batch(&texts(&["hello"]), "m").await, vec![None]);
        cache.set("other", "m", &[2.0]).await;
        assert!(!cache.is_available());
        assert_eq!(cache.stats().errors, 3);

        backend.down.store(false, Ordering::SeqCst);
        assert_eq!(cache.get("hello", "m").await, CacheLookup::Hit(vec![1.0]));
        assert!(cache.is_available());
    }

    #[tokio::test]
    async fn test_disabled_store() {
        let cache = CacheStore::disabled();
        cache.set("hello", "m", &[1.0]).await;

        assert_eq!(cache.get("hello", "m").await, CacheLookup::Unavailable);
        assert_eq!(cache.get_batch(&texts(&["a", "b"]), "m").await, vec![None, None]);
        assert!(!cache.is_available());
        assert_eq!(cache.stats().backend, None);
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_miss() {
        let backend = Arc::new(MemoryBackend::default());
        backend
            .set(&cache_key("hello", "m"), "not json".to_string(), DEFAULT_CACHE_TTL)
            .await
            .unwrap();
        let cache = CacheStore::new(backend, DEFAULT_CACHE_TTL);

        assert_eq!(cache.get("hello", "m").await, CacheLookup::Miss);
    }

    #[test]
    fn test_invalid_redis_url() {
        assert!(matches!(
            RedisBackend::new("not a url"),
            Err(EmbeddingError::Cache(_))
        ));
    }
}
