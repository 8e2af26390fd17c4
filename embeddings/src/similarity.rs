//! Similarity computation for embeddings.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Inner product of two equal-length slices.
///
/// On unit vectors this is the cosine similarity. Callers guarantee equal
/// lengths; extra elements of the longer slice are ignored.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize an embedding to unit length in place. Zero vectors are left
/// untouched.
pub fn normalize(embedding: &mut [f32]) {
    let magnitude = magnitude(embedding);
    if magnitude > 0.0 {
        for x in embedding.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Unit-length copy of an embedding.
pub fn normalized(embedding: &[f32]) -> Vec<f32> {
    let mut copy = embedding.to_vec();
    normalize(&mut copy);
    copy
}

/// A row index paired with its score against some query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredIndex {
    pub index: usize,
    pub score: f32,
}

/// Heap key: score first, then the lower row index.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    score: f32,
    index: Reverse<usize>,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.index.cmp(&other.index))
    }
}

/// Select the `k` rows scoring highest against `query`, best first.
///
/// Rows are compared by inner product, so both sides must already be unit
/// length for the score to be a cosine similarity. Rows scoring below
/// `min_score` are skipped. Equal scores rank the lower row index first.
pub fn find_top_k<'a>(
    query: &[f32],
    rows: impl Iterator<Item = &'a [f32]>,
    k: usize,
    min_score: Option<f32>,
) -> Vec<ScoredIndex> {
    if k == 0 {
        return Vec::new();
    }

    // Min-heap of the best k so far; the root is the weakest kept candidate.
    let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);

    for (index, row) in rows.enumerate() {
        let score = dot(query, row);
        if min_score.is_some_and(|min| score < min) {
            continue;
        }

        let candidate = Ranked {
            score,
            index: Reverse(index),
        };
        if heap.len() < k {
            heap.push(Reverse(candidate));
        } else if heap.peek().is_some_and(|Reverse(weakest)| candidate > *weakest) {
            heap.pop();
            heap.push(Reverse(candidate));
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(ranked)| ScoredIndex {
            index: ranked.index.0,
            score: ranked.score,
        })
        .collect()
}
