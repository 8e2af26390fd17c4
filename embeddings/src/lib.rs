//! # Embeddings
//!
//! Embedding generation, caching, and exact vector search.
//!
//! ## Features
//!
//! - **Providers**: a remote embedding API and an in-process model behind one trait
//! - **Retry and fallback**: remote calls are retried, then fall back to the local model
//! - **Caching**: content-addressed, fail-open embedding cache
//! - **Vector index**: flat inner-product index with clustering and persistence
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingService ──► CacheStore ──► Redis / Memory             │
//! │       │                                                         │
//! │       ├──► OpenAIProvider (retry) ──► LocalProvider (fallback)  │
//! │       ▼                                                         │
//! │  Embedding ──► VectorIndex ──► search / cluster / similar_pairs │
//! │                    │                                            │
//! │                    ▼                                            │
//! │              storage (vectors + metadata sidecar)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

pub mod cache;
pub mod clustering;
pub mod error;
pub mod index;
pub mod local;
pub mod model;
pub mod provider;
pub mod service;
pub mod similarity;
pub mod storage;

pub use cache::{CacheBackend, CacheLookup, CacheStats, CacheStore, MemoryBackend, RedisBackend};
pub use error::{EmbeddingError, Result};
pub use index::{
    Cluster, ClusterAssignment, ClusterMember, IndexStats, SearchResult, SimilarPair, VectorIndex,
    VectorRecord,
};
pub use local::{LocalModelLoader, LocalProvider, TextEncoder};
pub use model::{ModelDescriptor, ModelInfo, ModelKind};
pub use provider::{EmbeddingProvider, OpenAIProvider, RetryPolicy};
pub use service::{EmbeddingService, EmbeddingServiceBuilder};

#[cfg(feature = "fastembed")]
pub use local::FastEmbedLoader;

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Free-form metadata attached to an indexed text.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Dimension of embeddings (varies by model).
pub const DEFAULT_DIMENSION: usize = 1536; // OpenAI text-embedding-3-small

/// Dimension of the default local model.
pub const DEFAULT_LOCAL_DIMENSION: usize = 384; // all-MiniLM-L6-v2

/// Largest batch accepted by default.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// How long cached embeddings live by default.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
