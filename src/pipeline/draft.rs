use ndarray::{Array2, Zip};

use crate::error::{PipelineError, Stage};

use super::types::{BinaryMatrix, ClusterLabel};

/// Composes the draft: cell `(i, j)` is 1 iff `tieup[threading[j] - 1][treadling[i] - 1]` is 1.
///
/// Rows follow the treadling, columns the threading. Sequence indices are taken
/// modulo their length so a shorter sequence repeats across a larger draft.
///
/// # Errors
/// `InvalidParameter` when a label falls outside the tie-up.
pub fn compose_draft(
    threading: &[ClusterLabel],
    treadling: &[ClusterLabel],
    tieup: &BinaryMatrix,
) -> Result<BinaryMatrix, PipelineError> {
    let (tie_rows, tie_cols) = tieup.dim();
    if let Some(label) = threading.iter().find(|l| l.index() >= tie_rows) {
        return Err(PipelineError::invalid_parameter(
            Stage::Draft,
            "tieup",
            format!("threading label {label} outside a tie-up with {tie_rows} rows"),
        ));
    }
    if let Some(label) = treadling.iter().find(|l| l.index() >= tie_cols) {
        return Err(PipelineError::invalid_parameter(
            Stage::Draft,
            "tieup",
            format!("treadling label {label} outside a tie-up with {tie_cols} columns"),
        ));
    }

    let treadling_len = treadling.len();
    let threading_len = threading.len();
    let mut draft = Array2::zeros((treadling_len, threading_len));

    Zip::indexed(&mut draft).par_for_each(|(i, j), cell| {
        let y = treadling[i % treadling_len];
        let x = threading[j % threading_len];
        *cell = u8::from(tieup[[x.index(), y.index()]] == 1);
    });

    Ok(draft)
}
