//! Morphological smoothing of the draft.
//!
//! The binary draft is treated as an 8-bit image (0 or 255). Each cell takes the
//! truncated integer mean over the part of the structuring element that lies inside
//! the image, and any positive mean becomes 1 again. Isolated cells disappear under
//! footprints larger than 255 cells, clustered regions grow and merge.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Stage};

use super::types::BinaryMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingShape {
    /// All offsets with `dy^2 + dx^2 <= radius^2`.
    Disk,
    /// Square of side `radius`, centred at `radius / 2`.
    #[default]
    Square,
}

impl FromStr for SmoothingShape {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disk" => Ok(Self::Disk),
            "square" => Ok(Self::Square),
            other => Err(PipelineError::invalid_parameter(
                Stage::Smooth,
                "shape",
                format!("unknown structuring element {other:?}"),
            )),
        }
    }
}

impl fmt::Display for SmoothingShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => f.write_str("disk"),
            Self::Square => f.write_str("square"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SmoothingSpec {
    pub shape: SmoothingShape,
    pub radius: u32,
}

/// Horizontal run of the structuring element at vertical offset `dy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    dy: isize,
    lo: isize,
    hi: isize,
}

#[derive(Debug, Clone)]
pub struct Smoother {
    spec: SmoothingSpec,
    spans: Vec<Span>,
}

impl Smoother {
    /// # Errors
    /// `InvalidParameter` when the radius is zero.
    pub fn new(spec: SmoothingSpec) -> Result<Self, PipelineError> {
        if spec.radius == 0 {
            return Err(PipelineError::invalid_parameter(
                Stage::Smooth,
                "radius",
                "must be at least 1",
            ));
        }
        let spans = match spec.shape {
            SmoothingShape::Square => square_spans(spec.radius),
            SmoothingShape::Disk => disk_spans(spec.radius),
        };
        Ok(Self { spec, spans })
    }

    #[must_use]
    pub fn spec(&self) -> SmoothingSpec {
        self.spec
    }

    /// Number of cells in the structuring element.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn footprint_size(&self) -> usize {
        self.spans.iter().map(|s| (s.hi - s.lo + 1) as usize).sum()
    }

    /// Grayscale intermediate: truncated local mean of the draft scaled to 0..=255.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn mean_filter(&self, draft: &BinaryMatrix) -> Array2<u8> {
        let (rows, cols) = draft.dim();
        let mut prefix = Array2::<u32>::zeros((rows, cols + 1));
        for i in 0..rows {
            for j in 0..cols {
                prefix[[i, j + 1]] = prefix[[i, j]] + u32::from(draft[[i, j]] > 0);
            }
        }

        let rows_i = rows as isize;
        let cols_i = cols as isize;
        let mut gray = Array2::<u8>::zeros((rows, cols));
        Zip::indexed(&mut gray).par_for_each(|(i, j), cell| {
            let mut count = 0u64;
            let mut population = 0u64;
            for span in &self.spans {
                let y = i as isize + span.dy;
                if y < 0 || y >= rows_i {
                    continue;
                }
                let a = (j as isize + span.lo).max(0);
                let b = (j as isize + span.hi).min(cols_i - 1);
                if a > b {
                    continue;
                }
                let (y, a, b) = (y as usize, a as usize, b as usize);
                population += (b - a + 1) as u64;
                count += u64::from(prefix[[y, b + 1]] - prefix[[y, a]]);
            }
            *cell = if population == 0 {
                0
            } else {
                (255 * count / population) as u8
            };
        });
        gray
    }

    /// Smooths and re-binarises; dimensions are unchanged.
    #[must_use]
    pub fn smooth(&self, draft: &BinaryMatrix) -> BinaryMatrix {
        self.mean_filter(draft).mapv_into(|v| u8::from(v > 0))
    }
}

#[allow(clippy::cast_possible_wrap)]
fn square_spans(width: u32) -> Vec<Span> {
    let width = width as isize;
    let lo = -(width / 2);
    let hi = width - 1 + lo;
    (lo..=hi).map(|dy| Span { dy, lo, hi }).collect()
}

#[allow(clippy::cast_possible_wrap)]
fn disk_spans(radius: u32) -> Vec<Span> {
    let r = i64::from(radius);
    (-r..=r)
        .map(|dy| {
            let half = isqrt(r * r - dy * dy) as isize;
            Span {
                dy: dy as isize,
                lo: -half,
                hi: half,
            }
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn isqrt(n: i64) -> i64 {
    let mut x = (n as f64).sqrt() as i64;
    while x * x > n {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    x
}
