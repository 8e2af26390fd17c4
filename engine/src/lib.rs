//! # Vector Engine
//!
//! Service facade over the embeddings crate. It owns the long-lived
//! [`EmbeddingService`](vembed_embeddings::EmbeddingService) and
//! [`VectorIndex`](vembed_embeddings::VectorIndex), builds them from
//! configuration, and exposes the operations callers use.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Vector Engine                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  EngineConfig (defaults ─► TOML ─► env)                         │
//! │         │                                                       │
//! │         ▼                                                       │
//! │  ┌──────────────┐        ┌──────────────────────┐               │
//! │  │  Embedding   │        │  RwLock<VectorIndex> │               │
//! │  │   Service    │        │  (saved to disk)     │               │
//! │  └──────────────┘        └──────────────────────┘               │
//! │         │                           │                           │
//! │         └─────────────┬─────────────┘                           │
//! │                       ▼                                         │
//! │  generate / search / add_vectors / cluster / similar_pairs      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vembed_engine::{EngineConfig, VectorEngine};
//!
//! let engine = VectorEngine::new(EngineConfig::load(None)?).await?;
//! engine.add_vectors(vec!["Cats are pets".into()], None, None).await?;
//! let hits = engine.search("kittens", 5, None, None).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod output;

pub use config::{CacheConfig, EmbeddingConfig, EngineConfig, IndexConfig, RetryConfig};
pub use engine::{DEFAULT_CLUSTERS, DEFAULT_PAIR_THRESHOLD, DEFAULT_TOP_K, VectorEngine};
pub use error::{EngineError, ErrorKind, Result};
pub use output::{
    AddVectorsOutput, BatchEmbeddingOutput, EmbeddingOutput, HealthReport, ModelsOutput,
    SearchOutput, SimilarPairsOutput,
};

// Re-export from dependencies for convenience
pub use vembed_embeddings::{ClusterAssignment, IndexStats, Metadata, SearchResult, SimilarPair};
