//! Unsupervised partitioning of normalized region features.

use ndarray::ArrayView2;
use tracing::debug;

use crate::error::PipelineError;
use crate::util::kmeans::{KMeans, KMeansConfig};

use super::types::ClusterLabel;

/// Centroid-based partitioning: one label in `[1, k]` per row.
///
/// Implementations must be deterministic for a fixed `seed` and `k`.
pub trait ClusterAssigner: Send + Sync {
    /// # Errors
    /// `ClusteringFailed` when `k` is out of range or the algorithm cannot converge.
    fn assign(
        &self,
        features: ArrayView2<'_, f64>,
        k: usize,
        seed: u64,
    ) -> Result<Vec<ClusterLabel>, PipelineError>;
}

#[derive(Debug, Clone, Default)]
pub struct KMeansAssigner {
    config: KMeansConfig,
}

impl KMeansAssigner {
    #[must_use]
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &KMeansConfig {
        &self.config
    }
}

impl ClusterAssigner for KMeansAssigner {
    fn assign(
        &self,
        features: ArrayView2<'_, f64>,
        k: usize,
        seed: u64,
    ) -> Result<Vec<ClusterLabel>, PipelineError> {
        let points: Vec<Vec<f64>> = features.outer_iter().map(|row| row.to_vec()).collect();
        let kmeans = KMeans::fit(&points, k, seed, &self.config)
            .map_err(|e| PipelineError::clustering(e.to_string()))?;

        debug!(
            k,
            seed,
            iterations = kmeans.iterations,
            inertia = kmeans.inertia,
            "k-means converged"
        );

        labels_from_indices(kmeans.assignments)
    }
}

fn labels_from_indices(indices: Vec<usize>) -> Result<Vec<ClusterLabel>, PipelineError> {
    indices
        .into_iter()
        .map(|index| {
            ClusterLabel::from_index(index).ok_or_else(|| {
                PipelineError::clustering(format!("cluster index {index} exceeds the label range"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Stage};
    use ndarray::array;

    #[test]
    fn labels_are_one_based_and_cover_k() {
        let x = array![[0.0, 0.0], [0.1, 0.0], [5.0, 5.0], [5.1, 5.0], [9.0, -9.0]];
        let labels = KMeansAssigner::default()
            .assign(x.view(), 3, 11)
            .expect("clusters");
        assert_eq!(labels.len(), 5);
        assert!(labels.iter().all(|l| (1..=3).contains(&l.get())));
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
        assert_ne!(labels[0], labels[4]);
    }

    #[test]
    fn out_of_range_index_is_a_clustering_failure() {
        let error = labels_from_indices(vec![0, usize::MAX]).expect_err("index overflows u32");
        assert_eq!(error.kind(), ErrorKind::ClusteringFailed);
        assert_eq!(error.stage(), Stage::Cluster);

        let labels = labels_from_indices(vec![2, 0]).expect("in range");
        assert_eq!(labels.iter().map(|l| l.get()).collect::<Vec<_>>(), vec![3, 1]);
    }

    #[test]
    fn k_larger_than_rows_fails_in_cluster_stage() {
        let x = array![[0.0], [1.0]];
        let error = KMeansAssigner::default()
            .assign(x.view(), 5, 0)
            .expect_err("k > rows should fail");
        assert_eq!(error.kind(), ErrorKind::ClusteringFailed);
        assert_eq!(error.stage(), Stage::Cluster);
    }
}
