//! Value types shared by the draft stages.

use std::fmt;
use std::num::NonZeroU32;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// 0/1 matrix in loom notation.
pub type BinaryMatrix = Array2<u8>;

/// One-based cluster label. Label 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterLabel(NonZeroU32);

impl ClusterLabel {
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    /// Shifts a zero-based cluster index into label space, `None` past `u32::MAX`.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        index
            .checked_add(1)
            .and_then(|value| u32::try_from(value).ok())
            .and_then(Self::new)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based position (`label - 1`) used for matrix indexing.
    #[must_use]
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the threading sequence carries into the loom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingSource {
    /// Primary cluster labels.
    #[default]
    Labels,
    /// Integer region codes, taken in label-sorted order.
    Regions,
}
