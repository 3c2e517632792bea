//! ベンチマーク・テスト用の決定的な合成データ。

use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::pipeline::types::ClusterLabel;
use crate::table::{FeatureTable, RegionId};

/// Rows cycle through region codes `1..=regions`; each region's features sit around
/// its own centre with uniform noise in `[-0.5, 0.5)`, so k-means with
/// `k = regions` separates them cleanly.
///
/// # Panics
/// When `rows`, `features` or `regions` is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn synthetic_table(rows: usize, features: usize, regions: usize, seed: u64) -> FeatureTable {
    assert!(rows > 0 && features > 0 && regions > 0, "synthetic table needs a non-zero shape");
    let mut rng = StdRng::seed_from_u64(seed);

    let region_of = |row: usize| row % regions;
    let region_ids = (0..rows)
        .map(|row| Some(RegionId::from(i64::try_from(region_of(row) + 1).unwrap_or(i64::MAX))))
        .collect();
    let values = Array2::from_shape_fn((rows, features), |(row, col)| {
        let centre = (region_of(row) * 10) as f64 + (col as f64) * 0.25;
        centre + rng.random_range(-0.5..0.5)
    });
    let names = (0..features).map(|i| format!("feature_{i}")).collect();

    FeatureTable::new(region_ids, values, names).expect("synthetic table is well formed")
}

/// `len` labels drawn uniformly from `1..=k`.
#[must_use]
pub fn synthetic_labels(len: usize, k: u32, seed: u64) -> Vec<ClusterLabel> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .filter_map(|_| ClusterLabel::new(rng.random_range(1..=k.max(1))))
        .collect()
}
