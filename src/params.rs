//! Run requests with opt-in randomized values.
//!
//! [`DraftPipeline`](crate::pipeline::DraftPipeline) only accepts explicit
//! [`DraftParams`]. A [`RunRequest`] may leave some of them to chance; `resolve`
//! draws those from a caller-supplied RNG and clock and logs what it picked so
//! the run can be replayed.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::info;

use crate::pipeline::matrix::TieUpSpec;
use crate::pipeline::smooth::{SmoothingShape, SmoothingSpec};
use crate::pipeline::types::ThreadingSource;
use crate::pipeline::{DraftParams, TreadlingClusters};

/// Range of a randomly chosen treadling cluster count.
pub const RANDOM_TREADLING_CLUSTERS: Range<usize> = 5..16;
/// Range of a randomly chosen smoothing radius.
pub const RANDOM_SMOOTHING_RADIUS: Range<u32> = 100..150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreadlingChoice {
    #[default]
    Same,
    Count(NonZeroUsize),
    Random,
}

impl FromStr for TreadlingChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "same" | "reuse" => Ok(Self::Same),
            "random" => Ok(Self::Random),
            raw => {
                let n = raw.parse::<usize>()?;
                NonZeroUsize::new(n)
                    .map(Self::Count)
                    .ok_or_else(|| anyhow!("treadling cluster count must be greater than zero"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedChoice {
    Fixed(u64),
    /// Wall-clock seconds at resolution time.
    Clock,
}

impl Default for SeedChoice {
    fn default() -> Self {
        Self::Fixed(0)
    }
}

impl FromStr for SeedChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clock" => Ok(Self::Clock),
            raw => Ok(Self::Fixed(raw.parse()?)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadiusChoice {
    #[default]
    Off,
    Fixed(u32),
    Random,
}

impl FromStr for RadiusChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "random" => Ok(Self::Random),
            raw => match raw.parse::<u32>()? {
                0 => bail!("smoothing radius must be at least 1"),
                r => Ok(Self::Fixed(r)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunRequest {
    pub clusters: Option<NonZeroUsize>,
    pub treadling: TreadlingChoice,
    pub seed: SeedChoice,
    pub random_tieup: bool,
    pub smoothing_radius: RadiusChoice,
    pub smoothing_shape: SmoothingShape,
    pub include_draft: bool,
    pub threading_source: ThreadingSource,
}

impl RunRequest {
    /// Deterministic request: fixed seed 0, reused treadling, no smoothing, draft included.
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            include_draft: true,
            ..Self::default()
        }
    }

    /// Whether `resolve` will consult the RNG or the clock.
    #[must_use]
    pub fn is_randomized(&self) -> bool {
        self.treadling == TreadlingChoice::Random
            || self.seed == SeedChoice::Clock
            || self.smoothing_radius == RadiusChoice::Random
    }

    /// Fixes every randomized choice.
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R, now: DateTime<Utc>) -> DraftParams {
        let seed = match self.seed {
            SeedChoice::Fixed(seed) => seed,
            SeedChoice::Clock => {
                let seed = u64::try_from(now.timestamp()).unwrap_or_default();
                info!(seed, "seed taken from the clock");
                seed
            }
        };

        let treadling = match self.treadling {
            TreadlingChoice::Same => TreadlingClusters::Reuse,
            TreadlingChoice::Count(n) => TreadlingClusters::Count(n),
            TreadlingChoice::Random => {
                let n = rng.random_range(RANDOM_TREADLING_CLUSTERS);
                info!(treadling_clusters = n, "treadling cluster count drawn");
                NonZeroUsize::new(n).map_or(TreadlingClusters::Reuse, TreadlingClusters::Count)
            }
        };

        let radius = match self.smoothing_radius {
            RadiusChoice::Off => None,
            RadiusChoice::Fixed(r) => Some(r),
            RadiusChoice::Random => {
                let r = rng.random_range(RANDOM_SMOOTHING_RADIUS);
                info!(smoothing_radius = r, "smoothing radius drawn");
                Some(r)
            }
        };

        DraftParams {
            clusters: self.clusters,
            treadling,
            seed,
            tieup: if self.random_tieup {
                TieUpSpec::Random
            } else {
                TieUpSpec::Identity
            },
            smoothing: radius.map(|radius| SmoothingSpec {
                shape: self.smoothing_shape,
                radius,
            }),
            include_draft: self.include_draft,
            threading_source: self.threading_source,
        }
    }
}
