//! Threading, treadling and tie-up matrices.

use ndarray::Array2;
use rand::Rng;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::warn;

use crate::error::{PipelineError, Stage};

use super::types::{BinaryMatrix, ClusterLabel};

/// How the tie-up matrix is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TieUpSpec {
    /// Cluster `i` ties only to itself.
    #[default]
    Identity,
    /// Every cell drawn independently from {0, 1}.
    Random,
    /// Caller-supplied square 0/1 matrix.
    Custom(BinaryMatrix),
}

/// One row per thread, a single 1 at column `label - 1`.
#[must_use]
pub fn threading_matrix(threading: &[ClusterLabel]) -> BinaryMatrix {
    let width = loom_width(threading, "threading");
    let mut matrix = Array2::zeros((threading.len(), width));
    for (row, label) in threading.iter().enumerate() {
        matrix[[row, label.index()]] = 1;
    }
    matrix
}

/// One column per pick, a single 1 at row `label - 1`.
#[must_use]
pub fn treadling_matrix(treadling: &[ClusterLabel]) -> BinaryMatrix {
    let height = loom_width(treadling, "treadling");
    let mut matrix = Array2::zeros((height, treadling.len()));
    for (col, label) in treadling.iter().enumerate() {
        matrix[[label.index(), col]] = 1;
    }
    matrix
}

/// Builds the tie-up. `side` is the generated size and the minimum accepted for a
/// custom matrix.
///
/// # Errors
/// `InvalidParameter` when a custom tie-up is not square, is smaller than `side`,
/// or holds values other than 0 and 1.
pub fn tieup_matrix<R: Rng + ?Sized>(
    spec: &TieUpSpec,
    side: usize,
    rng: &mut R,
) -> Result<BinaryMatrix, PipelineError> {
    match spec {
        TieUpSpec::Identity => Ok(Array2::eye(side)),
        TieUpSpec::Random => Ok(Array2::from_shape_fn((side, side), |_| {
            u8::from(rng.random_bool(0.5))
        })),
        TieUpSpec::Custom(matrix) => {
            let (rows, cols) = matrix.dim();
            if rows != cols {
                return Err(PipelineError::invalid_parameter(
                    Stage::Matrix,
                    "tieup",
                    format!("must be square, got {rows}x{cols}"),
                ));
            }
            if rows < side {
                return Err(PipelineError::invalid_parameter(
                    Stage::Matrix,
                    "tieup",
                    format!("side {rows} does not cover {side} labels"),
                ));
            }
            if matrix.iter().any(|v| *v > 1) {
                return Err(PipelineError::invalid_parameter(
                    Stage::Matrix,
                    "tieup",
                    "values must be 0 or 1",
                ));
            }
            Ok(matrix.clone())
        }
    }
}

/// Distinct label count, widened to the largest label when some label in between
/// never occurs.
fn loom_width(labels: &[ClusterLabel], name: &'static str) -> usize {
    let distinct = labels.iter().collect::<FxHashSet<_>>().len();
    let max_label = labels.iter().map(|l| l.index() + 1).max().unwrap_or(0);
    if max_label > distinct {
        warn!(
            matrix = name,
            distinct, max_label, "label gaps present, widening matrix to the largest label"
        );
    }
    distinct.max(max_label)
}
