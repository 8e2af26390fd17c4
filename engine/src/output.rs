//! Result types returned by the engine operations.

use serde::{Deserialize, Serialize};

use vembed_embeddings::{Embedding, IndexStats, ModelInfo, SearchResult, SimilarPair};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub embedding: Embedding,

    /// Model that produced the embedding. Differs from the requested model
    /// after a fallback.
    pub model: String,

    pub dimension: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEmbeddingOutput {
    pub embeddings: Vec<Embedding>,
    pub model: String,
    pub dimension: usize,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutput {
    pub results: Vec<SearchResult>,
    pub query: String,
    pub model: String,
    pub total_results: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsOutput {
    pub models: Vec<ModelInfo>,
    pub default_remote: String,
    pub default_local: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddVectorsOutput {
    /// Number of texts added by this call.
    pub added: usize,
    pub model_used: String,
    pub total_vectors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPairsOutput {
    pub similar_pairs: Vec<SimilarPair>,
    pub count: usize,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub remote_available: bool,
    pub cache_available: bool,
    pub local_available: bool,
    pub vector_stats: IndexStats,
}
