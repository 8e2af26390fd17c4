//! Flat exact vector index.
//!
//! Rows are stored L2-normalized in one contiguous matrix, with the original
//! texts and metadata kept in parallel arrays. Similarity is the inner
//! product of unit vectors, i.e. cosine similarity. Every query is a full
//! linear scan, so results are exact.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clustering::kmeans;
use crate::error::{EmbeddingError, Result};
use crate::similarity::{dot, find_top_k, normalize, normalized};
use crate::storage::{self, IndexSidecar};
use crate::{Embedding, Metadata};

/// Label reported by [`VectorIndex::stats`].
pub const INDEX_KIND: &str = "IndexFlatIP";

/// A stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Position in the index, stable until the index is cleared.
    pub index: usize,

    /// The unit-length embedding.
    pub vector: Embedding,

    /// The text that was embedded.
    pub text: String,

    /// Caller-supplied metadata.
    pub metadata: Metadata,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub text: String,

    /// Cosine similarity to the query, in [-1, 1].
    pub score: f32,

    pub index: usize,

    pub metadata: Metadata,
}

/// Two records whose similarity reached the requested threshold.
/// `first` is always lower than `second`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarPair {
    pub first: usize,
    pub second: usize,
    pub score: f32,
}

/// A member of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub text: String,
    pub index: usize,
    pub metadata: Metadata,
}

/// One cluster and its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: usize,
    pub items: Vec<ClusterMember>,
}

/// Result of clustering the whole index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    /// Non-empty clusters in ascending id order.
    pub clusters: Vec<Cluster>,

    /// Centroid of every cluster id.
    pub centroids: Vec<Embedding>,

    /// Cluster id of each record, by record index.
    pub assignments: Vec<usize>,

    /// Number of non-empty clusters.
    pub n_clusters: usize,
}

/// Index statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_vectors: usize,
    pub dimension: usize,
    pub index_type: String,

    /// Estimated as `total_vectors * dimension * 4`.
    pub memory_usage_bytes: usize,
    pub memory_usage_mb: f64,
}

/// An in-memory, exact, inner-product vector index.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    /// Row-major matrix of unit vectors.
    vectors: Vec<f32>,

    texts: Vec<String>,

    metadata: Vec<Metadata>,

    /// Length of every stored vector.
    dimension: usize,
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: Vec::new(),
            texts: Vec::new(),
            metadata: Vec::new(),
            dimension,
        }
    }

    /// Vector length accepted by this index.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    /// Whether the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// The stored (normalized) vector at `index`.
    pub fn vector(&self, index: usize) -> Option<&[f32]> {
        (index < self.len()).then(|| self.row(index))
    }

    /// The full record at `index`.
    pub fn record(&self, index: usize) -> Option<VectorRecord> {
        self.vector(index).map(|vector| VectorRecord {
            index,
            vector: vector.to_vec(),
            text: self.texts[index].clone(),
            metadata: self.metadata[index].clone(),
        })
    }

    /// Append records and return the indices they were assigned.
    ///
    /// All inputs are validated and normalized before anything is stored, so
    /// a failed call leaves the index unchanged.
    pub fn add(
        &mut self,
        vectors: Vec<Embedding>,
        texts: Vec<String>,
        metadata: Option<Vec<Metadata>>,
    ) -> Result<Range<usize>> {
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::LengthMismatch {
                what: "texts and embeddings",
                expected: vectors.len(),
                actual: texts.len(),
            });
        }
        if let Some(count) = metadata.as_ref().map(Vec::len).filter(|n| *n != texts.len()) {
            return Err(EmbeddingError::LengthMismatch {
                what: "metadata entries and texts",
                expected: texts.len(),
                actual: count,
            });
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        let start = self.len();
        let count = texts.len();

        let mut rows = Vec::with_capacity(count * self.dimension);
        for mut vector in vectors {
            normalize(&mut vector);
            rows.extend_from_slice(&vector);
        }

        self.vectors.extend_from_slice(&rows);
        self.texts.extend(texts);
        match metadata {
            Some(metadata) => self.metadata.extend(metadata),
            None => self.metadata.resize_with(start + count, Metadata::new),
        }

        debug!("Added {count} vectors to index ({} total)", self.len());
        Ok(start..start + count)
    }

    /// Find the `top_k` records most similar to `query`.
    ///
    /// Results scoring below `threshold` are dropped. An empty index yields
    /// no results.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchResult>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        self.check_dimension(query)?;

        let query = normalized(query);
        let top_k = top_k.min(self.len());

        Ok(find_top_k(&query, self.rows(), top_k, threshold)
            .into_iter()
            .map(|hit| SearchResult {
                text: self.texts[hit.index].clone(),
                score: hit.score,
                index: hit.index,
                metadata: self.metadata[hit.index].clone(),
            })
            .collect())
    }

    /// Run [`search`](Self::search) for each query, preserving query order.
    pub fn batch_search(
        &self,
        queries: &[Embedding],
        top_k: usize,
    ) -> Result<Vec<Vec<SearchResult>>> {
        queries
            .iter()
            .map(|query| self.search(query, top_k, None))
            .collect()
    }

    /// Group every record with k-means.
    ///
    /// `n_clusters` is clamped to the number of records. Clustering is
    /// reproducible: the same index always yields the same assignment.
    pub fn cluster(&self, n_clusters: usize) -> ClusterAssignment {
        let Some(result) = kmeans(&self.vectors, self.dimension, n_clusters) else {
            return ClusterAssignment::default();
        };

        let mut grouped: BTreeMap<usize, Vec<ClusterMember>> = BTreeMap::new();
        for (index, &label) in result.labels.iter().enumerate() {
            grouped.entry(label).or_default().push(ClusterMember {
                text: self.texts[index].clone(),
                index,
                metadata: self.metadata[index].clone(),
            });
        }

        let clusters: Vec<Cluster> = grouped
            .into_iter()
            .map(|(id, items)| Cluster { id, items })
            .collect();

        info!(
            "Clustered {} vectors into {} clusters in {} iterations",
            self.len(),
            clusters.len(),
            result.iterations
        );

        ClusterAssignment {
            n_clusters: clusters.len(),
            clusters,
            centroids: result.centroids,
            assignments: result.labels,
        }
    }

    /// Every pair of records with similarity at least `threshold`.
    ///
    /// Each record is compared against the whole index and only partners with
    /// a higher index are reported, so a pair never appears twice. Pairs come
    /// out grouped by their lower index, strongest match first.
    pub fn similar_pairs(&self, threshold: f32) -> Vec<SimilarPair> {
        let n = self.len();
        let mut pairs = Vec::new();

        for first in 0..n {
            let row = self.row(first);
            let start = pairs.len();
            for second in (first + 1)..n {
                let score = dot(row, self.row(second));
                if score >= threshold {
                    pairs.push(SimilarPair {
                        first,
                        second,
                        score,
                    });
                }
            }
            pairs[start..].sort_by(|a, b| b.score.total_cmp(&a.score));
        }

        pairs
    }

    /// Size and layout summary.
    pub fn stats(&self) -> IndexStats {
        let memory_usage_bytes = self.len() * self.dimension * 4;
        IndexStats {
            total_vectors: self.len(),
            dimension: self.dimension,
            index_type: INDEX_KIND.to_string(),
            memory_usage_bytes,
            memory_usage_mb: memory_usage_bytes as f64 / (1024.0 * 1024.0),
        }
    }

    /// Remove every record. The dimension is kept.
    pub fn clear(&mut self) {
        self.vectors.clear();
        self.texts.clear();
        self.metadata.clear();
        info!("Cleared vector index");
    }

    /// Persist the index to `path` and its sidecar to `<path>.metadata`.
    pub fn save(&self, path: &Path) -> Result<()> {
        storage::write_vectors(path, self.dimension, &self.vectors)?;
        storage::write_sidecar(
            path,
            &IndexSidecar {
                texts: self.texts.clone(),
                metadata: self.metadata.clone(),
                dimension: Some(self.dimension),
            },
        )?;
        info!("Saved {} vectors to {}", self.len(), path.display());
        Ok(())
    }

    /// Load an index from `path`.
    ///
    /// Never fails: an unreadable vector artifact yields an empty index of
    /// `dimension`, and a missing or unreadable sidecar yields empty texts and
    /// metadata for the loaded rows.
    pub fn load(path: &Path, dimension: usize) -> Self {
        match Self::try_load(path) {
            Ok(index) => {
                if index.dimension != dimension {
                    warn!(
                        "Index at {} has dimension {}, configured dimension is {dimension}",
                        path.display(),
                        index.dimension
                    );
                }
                index
            }
            Err(e) => {
                warn!("Failed to load index from {}: {e}", path.display());
                Self::new(dimension)
            }
        }
    }

    /// Load an index from `path`, failing if the vector artifact is unusable.
    pub fn try_load(path: &Path) -> Result<Self> {
        let (dimension, vectors) = storage::read_vectors(path)?;
        let count = if dimension == 0 { 0 } else { vectors.len() / dimension };

        let sidecar = match storage::read_sidecar(path) {
            Ok(Some(sidecar)) => sidecar,
            Ok(None) => {
                warn!("No metadata sidecar for {}, texts will be empty", path.display());
                IndexSidecar::default()
            }
            Err(e) => {
                warn!("Unreadable metadata sidecar for {}: {e}", path.display());
                IndexSidecar::default()
            }
        };

        if sidecar.dimension.is_some_and(|d| d != dimension) {
            warn!(
                "Sidecar dimension {:?} disagrees with vector artifact dimension {dimension}",
                sidecar.dimension
            );
        }

        let mut texts = sidecar.texts;
        let mut metadata = sidecar.metadata;
        if texts.len() != count || metadata.len() != count {
            warn!(
                "Sidecar holds {} texts and {} metadata entries for {count} vectors",
                texts.len(),
                metadata.len()
            );
        }
        texts.resize_with(count, String::new);
        metadata.resize_with(count, Metadata::new);

        info!("Loaded {count} vectors from {}", path.display());
        Ok(Self {
            vectors,
            texts,
            metadata,
            dimension,
        })
    }

    fn row(&self, index: usize) -> &[f32] {
        &self.vectors[index * self.dimension..(index + 1) * self.dimension]
    }

    fn rows(&self) -> impl Iterator<Item = &[f32]> {
        (0..self.len()).map(|i| self.row(i))
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}
