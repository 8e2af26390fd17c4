//! K-means clustering over the rows of a dense matrix.
//!
//! Centroids are seeded with k-means++ from a fixed-seed generator, so the
//! same input always yields the same clustering. Several seedings are run
//! and the one with the lowest inertia (sum of squared distances to the
//! assigned centroid) wins.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Seed used for every clustering run.
pub const KMEANS_SEED: u64 = 42;

/// Number of independent seedings per clustering.
pub const KMEANS_RESTARTS: usize = 10;

/// Upper bound on Lloyd iterations per seeding.
pub const KMEANS_MAX_ITERATIONS: usize = 300;

/// Stop once the total squared centroid shift falls below this.
const CONVERGENCE_TOLERANCE: f32 = 1e-8;

/// Outcome of a k-means run.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// One centroid per cluster.
    pub centroids: Vec<Vec<f32>>,

    /// Cluster label for each input row.
    pub labels: Vec<usize>,

    /// Sum of squared distances from each row to its centroid.
    pub inertia: f32,

    /// Lloyd iterations used by the winning seeding.
    pub iterations: usize,
}

/// Cluster the `data.len() / dimension` rows of `data` into `k` groups.
///
/// `k` is clamped to the number of rows. Returns `None` when there is
/// nothing to cluster.
pub fn kmeans(data: &[f32], dimension: usize, k: usize) -> Option<KMeansResult> {
    if dimension == 0 || data.is_empty() {
        return None;
    }
    let n = data.len() / dimension;
    let k = k.min(n);
    if k == 0 {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(KMEANS_SEED);
    let mut best: Option<KMeansResult> = None;

    for _ in 0..KMEANS_RESTARTS {
        let centroids = seed_plus_plus(data, dimension, k, &mut rng);
        let run = lloyd(data, dimension, centroids);
        if best.as_ref().is_none_or(|b| run.inertia < b.inertia) {
            best = Some(run);
        }
    }

    best
}

fn row(data: &[f32], dimension: usize, i: usize) -> &[f32] {
    &data[i * dimension..(i + 1) * dimension]
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index and squared distance of the nearest centroid. Ties go to the lower
/// centroid index.
fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, centroid) in centroids.iter().enumerate() {
        let distance = squared_distance(point, centroid);
        if distance < best.1 {
            best = (i, distance);
        }
    }
    best
}

/// k-means++ seeding: each new centroid is drawn with probability
/// proportional to its squared distance from the closest chosen centroid.
fn seed_plus_plus(data: &[f32], dimension: usize, k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = data.len() / dimension;
    let mut centroids = Vec::with_capacity(k);
    centroids.push(row(data, dimension, rng.random_range(0..n)).to_vec());

    let mut closest: Vec<f32> = (0..n)
        .map(|i| squared_distance(row(data, dimension, i), &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f32 = closest.iter().sum();
        let chosen = if total > 0.0 {
            let target = rng.random::<f32>() * total;
            let mut cumulative = 0.0;
            closest
                .iter()
                .position(|d| {
                    cumulative += d;
                    *d > 0.0 && cumulative >= target
                })
                .unwrap_or(n - 1)
        } else {
            // Every row coincides with a chosen centroid.
            rng.random_range(0..n)
        };

        let centroid = row(data, dimension, chosen).to_vec();
        for (i, d) in closest.iter_mut().enumerate() {
            *d = d.min(squared_distance(row(data, dimension, i), &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

fn lloyd(data: &[f32], dimension: usize, mut centroids: Vec<Vec<f32>>) -> KMeansResult {
    let n = data.len() / dimension;
    let k = centroids.len();
    let mut labels = vec![usize::MAX; n];
    let mut iterations = 0;

    while iterations < KMEANS_MAX_ITERATIONS {
        iterations += 1;

        let mut changed = false;
        let mut distances = vec![0.0f32; n];
        for (i, label) in labels.iter_mut().enumerate() {
            let (nearest_index, distance) = nearest(row(data, dimension, i), &centroids);
            distances[i] = distance;
            if *label != nearest_index {
                *label = nearest_index;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f32; dimension]; k];
        let mut counts = vec![0usize; k];
        for (i, &label) in labels.iter().enumerate() {
            counts[label] += 1;
            for (sum, value) in sums[label].iter_mut().zip(row(data, dimension, i)) {
                *sum += value;
            }
        }

        let mut shift = 0.0f32;
        for (cluster, sum) in sums.into_iter().enumerate() {
            let updated = if counts[cluster] == 0 {
                // Empty cluster: move it onto the row farthest from its centroid.
                let farthest = distances
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(i, _)| i);
                distances[farthest] = 0.0;
                row(data, dimension, farthest).to_vec()
            } else {
                let count = counts[cluster] as f32;
                sum.into_iter().map(|s| s / count).collect()
            };
            shift += squared_distance(&centroids[cluster], &updated);
            centroids[cluster] = updated;
        }

        if shift < CONVERGENCE_TOLERANCE {
            break;
        }
    }

    let mut inertia = 0.0f32;
    for (i, label) in labels.iter_mut().enumerate() {
        let (nearest_index, distance) = nearest(row(data, dimension, i), &centroids);
        *label = nearest_index;
        inertia += distance;
    }

    KMeansResult {
        centroids,
        labels,
        inertia,
        iterations,
    }
}
