use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{PipelineError, Stage};

/// Default denominator offset; keeps constant columns finite.
pub const DEFAULT_EPSILON: f64 = 1.0e-3;

/// Column-wise standardisation (population standard deviation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    epsilon: Option<f64>,
}

impl Normalizer {
    #[must_use]
    pub fn new(epsilon: Option<f64>) -> Self {
        Self { epsilon }
    }

    #[must_use]
    pub fn strict() -> Self {
        Self { epsilon: None }
    }

    #[must_use]
    pub fn epsilon(&self) -> Option<f64> {
        self.epsilon
    }

    /// Centers every column on its mean and scales it by `std + epsilon`.
    ///
    /// # Errors
    /// `InvalidInput` for an empty matrix, `DegenerateColumn` when a column has
    /// zero variance and the epsilon is absent or zero.
    pub fn normalize(&self, features: ArrayView2<'_, f64>) -> Result<Array2<f64>, PipelineError> {
        let mean = features.mean_axis(Axis(0)).ok_or_else(|| {
            PipelineError::invalid_input(Stage::Normalize, "feature matrix has no rows")
        })?;
        let mut std = features.std_axis(Axis(0), 0.0);
        if let Some(epsilon) = self.epsilon {
            std.mapv_inplace(|s| s + epsilon);
        }
        // A zero epsilon leaves constant columns at 0/0.
        if let Some(column) = std.iter().position(|s| *s == 0.0) {
            return Err(PipelineError::DegenerateColumn {
                stage: Stage::Normalize,
                column,
            });
        }

        let mut normalized = &features - &mean;
        normalized /= &std;
        Ok(normalized)
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Some(DEFAULT_EPSILON))
    }
}
