use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use thiserror::Error;

/// Lloyd iteration settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansConfig {
    /// Independent k-means++ restarts; the lowest inertia wins.
    pub n_init: usize,
    pub max_iterations: usize,
    /// Centroid shift tolerance, relative to the mean per-dimension variance.
    pub tolerance: f64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            n_init: 10,
            max_iterations: 300,
            tolerance: 1.0e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KMeansError {
    #[error("k must be between 1 and {rows}, got {k}")]
    InvalidK { k: usize, rows: usize },
    #[error("{k} clusters requested but only {distinct} distinct points exist")]
    TooFewDistinctPoints { k: usize, distinct: usize },
    #[error("ragged input: point {index} has {got} dimensions, expected {expected}")]
    Ragged {
        index: usize,
        got: usize,
        expected: usize,
    },
    #[error("no restart converged within {max_iterations} iterations")]
    NotConverged { max_iterations: usize },
}

/// Seeded K-Means clustering over dense feature vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeans {
    pub centroids: Vec<Vec<f64>>,
    pub assignments: Vec<usize>,
    pub inertia: f64,
    pub iterations: usize,
}

impl KMeans {
    /// Runs K-Means clustering.
    ///
    /// The same `data`, `k`, `seed` and `config` always produce the same assignment.
    ///
    /// # Arguments
    /// * `data` - List of data points (vectors).
    /// * `k` - Number of clusters.
    /// * `seed` - Seed for centroid initialisation.
    ///
    /// # Errors
    /// [`KMeansError`] when `k` is out of range, there are fewer distinct points
    /// than clusters, or no restart converges.
    pub fn fit(
        data: &[Vec<f64>],
        k: usize,
        seed: u64,
        config: &KMeansConfig,
    ) -> Result<Self, KMeansError> {
        if k == 0 || k > data.len() {
            return Err(KMeansError::InvalidK {
                k,
                rows: data.len(),
            });
        }
        let dim = data[0].len();
        if let Some((index, point)) = data.iter().enumerate().find(|(_, p)| p.len() != dim) {
            return Err(KMeansError::Ragged {
                index,
                got: point.len(),
                expected: dim,
            });
        }
        let distinct = count_distinct(data);
        if distinct < k {
            return Err(KMeansError::TooFewDistinctPoints { k, distinct });
        }

        let tolerance = config.tolerance * mean_variance(data, dim);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut best: Option<Self> = None;

        for _ in 0..config.n_init.max(1) {
            let centroids = init_plus_plus(data, k, &mut rng);
            let Some(run) = lloyd(data, centroids, config.max_iterations, tolerance) else {
                continue;
            };
            if best.as_ref().is_none_or(|b| run.inertia < b.inertia) {
                best = Some(run);
            }
        }

        best.ok_or(KMeansError::NotConverged {
            max_iterations: config.max_iterations,
        })
    }
}

fn lloyd(
    data: &[Vec<f64>],
    mut centroids: Vec<Vec<f64>>,
    max_iterations: usize,
    tolerance: f64,
) -> Option<KMeans> {
    let k = centroids.len();
    let dim = data[0].len();

    for iteration in 1..=max_iterations {
        // E-step: Assign points to nearest centroid
        let nearest = assign(data, &centroids);

        // M-step: Update centroids
        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, &(cluster, _)) in data.iter().zip(&nearest) {
            for (sum, value) in sums[cluster].iter_mut().zip(point) {
                *sum += value;
            }
            counts[cluster] += 1;
        }

        // Empty clusters take the points farthest from their current centroid.
        let mut donors: Vec<usize> = (0..data.len()).collect();
        donors.sort_by(|&a, &b| nearest[b].1.total_cmp(&nearest[a].1).then(a.cmp(&b)));
        let mut donors = donors.into_iter();

        let mut shift = 0.0;
        for cluster in 0..k {
            let updated: Vec<f64> = if counts[cluster] > 0 {
                #[allow(clippy::cast_precision_loss)]
                let n = counts[cluster] as f64;
                sums[cluster].iter().map(|s| s / n).collect()
            } else {
                let donor = donors.next()?;
                data[donor].clone()
            };
            shift += distance_sq(&updated, &centroids[cluster]);
            centroids[cluster] = updated;
        }

        if shift <= tolerance {
            let nearest = assign(data, &centroids);
            let inertia = nearest.iter().map(|(_, d)| d).sum();
            return Some(KMeans {
                centroids,
                assignments: nearest.into_iter().map(|(c, _)| c).collect(),
                inertia,
                iterations: iteration,
            });
        }
    }

    None
}

/// Nearest centroid per point; ties resolve to the lowest cluster index.
fn assign(data: &[Vec<f64>], centroids: &[Vec<f64>]) -> Vec<(usize, f64)> {
    data.par_iter()
        .map(|point| {
            let mut best_cluster = 0;
            let mut min_dist_sq = f64::INFINITY;
            for (j, centroid) in centroids.iter().enumerate() {
                let dist_sq = distance_sq(point, centroid);
                if dist_sq < min_dist_sq {
                    min_dist_sq = dist_sq;
                    best_cluster = j;
                }
            }
            (best_cluster, min_dist_sq)
        })
        .collect()
}

/// k-means++ seeding: each further centroid is drawn with probability proportional
/// to its squared distance from the nearest centroid chosen so far.
fn init_plus_plus(data: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(data[rng.random_range(0..data.len())].clone());
    let mut closest: Vec<f64> = data.iter().map(|p| distance_sq(p, &centroids[0])).collect();

    while centroids.len() < k {
        let total: f64 = closest.iter().sum();
        let target = rng.random::<f64>() * total;
        let mut cumulative = 0.0;
        let mut chosen = None;
        for (index, weight) in closest.iter().enumerate() {
            if *weight <= 0.0 {
                continue;
            }
            chosen = Some(index);
            cumulative += weight;
            if cumulative > target {
                break;
            }
        }
        // At least one positive weight exists while distinct points remain.
        let Some(index) = chosen else { break };
        let centroid = data[index].clone();
        for (dist, point) in closest.iter_mut().zip(data) {
            *dist = dist.min(distance_sq(point, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

fn count_distinct(data: &[Vec<f64>]) -> usize {
    data.iter()
        .map(|p| {
            p.iter()
                .map(|v| if *v == 0.0 { 0 } else { v.to_bits() })
                .collect::<Vec<u64>>()
        })
        .collect::<FxHashSet<_>>()
        .len()
}

#[allow(clippy::cast_precision_loss)]
fn mean_variance(data: &[Vec<f64>], dim: usize) -> f64 {
    if dim == 0 {
        return 0.0;
    }
    let n = data.len() as f64;
    let total: f64 = (0..dim)
        .map(|d| {
            let mean = data.iter().map(|p| p[d]).sum::<f64>() / n;
            data.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / n
        })
        .sum();
    total / dim as f64
}

fn distance_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> Vec<Vec<f64>> {
        let mut data = Vec::new();
        for i in 0..10_i32 {
            let jitter = f64::from(i) * 0.01;
            data.push(vec![0.0 + jitter, 0.0 - jitter]);
            data.push(vec![10.0 + jitter, 10.0 - jitter]);
            data.push(vec![-10.0 - jitter, 10.0 + jitter]);
        }
        data
    }

    #[test]
    fn separates_well_spread_blobs() {
        let data = blobs();
        let kmeans = KMeans::fit(&data, 3, 7, &KMeansConfig::default()).expect("converges");
        assert_eq!(kmeans.centroids.len(), 3);
        // Points generated around the same center share a cluster.
        for offset in 0..3 {
            let first = kmeans.assignments[offset];
            assert!(kmeans.assignments.iter().skip(offset).step_by(3).all(|&c| c == first));
        }
        let distinct: FxHashSet<_> = kmeans.assignments.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn same_seed_same_assignment() {
        let data = blobs();
        let config = KMeansConfig::default();
        let a = KMeans::fit(&data, 4, 42, &config).expect("converges");
        let b = KMeans::fit(&data, 4, 42, &config).expect("converges");
        assert_eq!(a.assignments, b.assignments);
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn every_cluster_is_populated() {
        let data = blobs();
        let kmeans = KMeans::fit(&data, 6, 3, &KMeansConfig::default()).expect("converges");
        let distinct: FxHashSet<_> = kmeans.assignments.iter().collect();
        assert_eq!(distinct.len(), 6);
    }

    #[test]
    fn rejects_k_out_of_range() {
        let data = vec![vec![1.0], vec![2.0]];
        assert_eq!(
            KMeans::fit(&data, 0, 0, &KMeansConfig::default()),
            Err(KMeansError::InvalidK { k: 0, rows: 2 })
        );
        assert_eq!(
            KMeans::fit(&data, 3, 0, &KMeansConfig::default()),
            Err(KMeansError::InvalidK { k: 3, rows: 2 })
        );
    }

    #[test]
    fn rejects_more_clusters_than_distinct_points() {
        let data = vec![vec![1.0, 1.0], vec![1.0, 1.0], vec![2.0, 2.0]];
        assert_eq!(
            KMeans::fit(&data, 3, 0, &KMeansConfig::default()),
            Err(KMeansError::TooFewDistinctPoints { k: 3, distinct: 2 })
        );
    }

    #[test]
    fn zero_iterations_never_converge() {
        let config = KMeansConfig {
            max_iterations: 0,
            ..KMeansConfig::default()
        };
        assert_eq!(
            KMeans::fit(&blobs(), 2, 0, &config),
            Err(KMeansError::NotConverged { max_iterations: 0 })
        );
    }
}
