//! Draft generation pipeline.
//!
//! A run moves a [`FeatureTable`] through normalization, clustering, sequencing,
//! matrix construction and composition, with optional smoothing of the draft.
//! Stages are plain values wired by [`DraftPipelineBuilder`]; only the clustering
//! step sits behind a trait so that callers can swap the partitioning algorithm.

pub mod cluster;
pub mod draft;
pub mod matrix;
pub mod normalize;
pub mod persist;
pub mod sequence;
pub mod smooth;
pub mod types;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

use crate::error::{PipelineError, Stage};
use crate::observability::metrics::PipelineMetrics;
use crate::table::FeatureTable;

use self::cluster::{ClusterAssigner, KMeansAssigner};
use self::draft::compose_draft;
use self::matrix::{TieUpSpec, threading_matrix, tieup_matrix, treadling_matrix};
use self::normalize::Normalizer;
use self::sequence::{LabelSequence, LabelSequencer, SequencedLabels};
use self::smooth::{SmoothingSpec, Smoother};
use self::types::{BinaryMatrix, ClusterLabel, ThreadingSource};

/// Where the treadling labels come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TreadlingClusters {
    /// Treadling repeats the threading sequence.
    #[default]
    Reuse,
    /// Independent partitioning with this many clusters, aligned to the threading rows.
    Count(NonZeroUsize),
}

/// Fully resolved run parameters. Nothing here is random.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftParams {
    /// `None` uses the number of distinct non-null region ids.
    pub clusters: Option<NonZeroUsize>,
    pub treadling: TreadlingClusters,
    pub seed: u64,
    pub tieup: TieUpSpec,
    pub smoothing: Option<SmoothingSpec>,
    pub include_draft: bool,
    pub threading_source: ThreadingSource,
}

impl Default for DraftParams {
    fn default() -> Self {
        Self {
            clusters: None,
            treadling: TreadlingClusters::Reuse,
            seed: 0,
            tieup: TieUpSpec::Identity,
            smoothing: None,
            include_draft: true,
            threading_source: ThreadingSource::Labels,
        }
    }
}

/// The four loom matrices of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSet {
    pub threading: BinaryMatrix,
    pub treadling: BinaryMatrix,
    pub tieup: BinaryMatrix,
    pub draft: Option<BinaryMatrix>,
}

impl MatrixSet {
    /// File-stem names paired with the matrices that are present.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, &BinaryMatrix)> {
        [
            ("threading", Some(&self.threading)),
            ("tieup", Some(&self.tieup)),
            ("treadling", Some(&self.treadling)),
            ("draft", self.draft.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, matrix)| matrix.map(|m| (name, m)))
    }
}

#[derive(Debug, Clone)]
pub struct DraftOutput {
    pub run_id: Uuid,
    /// Primary cluster count actually used.
    pub clusters: usize,
    pub treadling_clusters: usize,
    pub sequenced: SequencedLabels,
    pub treadling: LabelSequence,
    pub matrices: MatrixSet,
}

impl DraftOutput {
    #[must_use]
    pub fn threading(&self) -> &LabelSequence {
        &self.sequenced.threading
    }

    /// Rows dropped for a null region id.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.sequenced.dropped
    }
}

#[derive(Clone)]
pub struct DraftPipeline {
    normalizer: Normalizer,
    assigner: Arc<dyn ClusterAssigner>,
    sequencer: LabelSequencer,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl std::fmt::Debug for DraftPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftPipeline")
            .field("normalizer", &self.normalizer)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for DraftPipeline {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DraftPipeline {
    #[must_use]
    pub fn builder() -> DraftPipelineBuilder {
        DraftPipelineBuilder::default()
    }

    #[must_use]
    pub fn metrics(&self) -> Option<&Arc<PipelineMetrics>> {
        self.metrics.as_ref()
    }

    /// Runs every stage on `table`.
    ///
    /// # Errors
    /// The first stage failure, tagged with its [`Stage`].
    pub fn run(&self, table: &FeatureTable, params: &DraftParams) -> Result<DraftOutput, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("draft_run", %run_id, rows = table.n_rows(), seed = params.seed);
        let _entered = span.enter();

        let result = self.run_stages(run_id, table, params);
        match &result {
            Ok(output) => {
                if let Some(metrics) = &self.metrics {
                    metrics.runs_completed.inc();
                }
                info!(
                    clusters = output.clusters,
                    treadling_clusters = output.treadling_clusters,
                    threads = output.threading().len(),
                    dropped = output.dropped(),
                    has_draft = output.matrices.draft.is_some(),
                    "draft run completed"
                );
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(e.stage());
                }
                error!(stage = %e.stage(), kind = ?e.kind(), error = %e, "draft run failed");
            }
        }
        result
    }

    fn run_stages(
        &self,
        run_id: Uuid,
        table: &FeatureTable,
        params: &DraftParams,
    ) -> Result<DraftOutput, PipelineError> {
        let clusters = match params.clusters {
            Some(k) => k.get(),
            None => table.distinct_regions(),
        };
        if clusters == 0 {
            return Err(PipelineError::invalid_input(
                Stage::Preprocess,
                "no non-null region id to derive a cluster count from",
            ));
        }

        let normalized = self.timed(Stage::Normalize, || {
            self.normalizer.normalize(table.features())
        })?;
        let labels = self.timed(Stage::Cluster, || {
            self.assigner.assign(normalized.view(), clusters, params.seed)
        })?;

        let sequenced = self.timed(Stage::Sequence, || {
            self.sequencer.sequence(table.region_ids(), &labels)
        })?;
        if sequenced.threading.is_empty() {
            return Err(PipelineError::invalid_input(
                Stage::Sequence,
                "every row has a null region id",
            ));
        }
        if let Some(metrics) = &self.metrics {
            metrics.rows_dropped.inc_by(sequenced.dropped as u64);
        }

        let (treadling, treadling_clusters, treadling_source) = match params.treadling {
            TreadlingClusters::Reuse => (
                sequenced.threading.clone(),
                clusters,
                params.threading_source,
            ),
            TreadlingClusters::Count(n) => {
                let secondary = self.timed(Stage::Cluster, || {
                    self.assigner.assign(normalized.view(), n.get(), params.seed)
                })?;
                let aligned = self.timed(Stage::Sequence, || {
                    self.sequencer.realign(&sequenced, &secondary)
                })?;
                (aligned, n.get(), ThreadingSource::Labels)
            }
        };

        let threading_values = sequenced.threading.loom_values(params.threading_source)?;
        let treadling_values = treadling.loom_values(treadling_source)?;
        let side = clusters.max(treadling_clusters);
        if params.threading_source == ThreadingSource::Regions {
            check_region_codes(&threading_values, side)?;
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let (threading, treadling_m, tieup) = self.timed(Stage::Matrix, || {
            Ok((
                threading_matrix(&threading_values),
                treadling_matrix(&treadling_values),
                tieup_matrix(&params.tieup, side, &mut rng)?,
            ))
        })?;

        let draft = if params.include_draft {
            let composed = self.timed(Stage::Draft, || {
                compose_draft(&threading_values, &treadling_values, &tieup)
            })?;
            let draft = match params.smoothing {
                Some(spec) => {
                    let smoother = Smoother::new(spec)?;
                    self.timed(Stage::Smooth, || Ok(smoother.smooth(&composed)))?
                }
                None => composed,
            };
            if let Some(metrics) = &self.metrics {
                #[allow(clippy::cast_precision_loss)]
                metrics.last_draft_cells.set(draft.len() as f64);
            }
            Some(draft)
        } else {
            None
        };

        Ok(DraftOutput {
            run_id,
            clusters,
            treadling_clusters,
            sequenced,
            treadling,
            matrices: MatrixSet {
                threading,
                treadling: treadling_m,
                tieup,
                draft,
            },
        })
    }

    fn timed<T>(
        &self,
        stage: Stage,
        f: impl FnOnce() -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_stage(stage, elapsed);
        }
        debug!(
            stage = %stage,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            ok = result.is_ok(),
            "stage finished"
        );
        result
    }
}

fn check_region_codes(values: &[ClusterLabel], side: usize) -> Result<(), PipelineError> {
    match values.iter().find(|v| v.index() >= side) {
        Some(code) => Err(PipelineError::invalid_input(
            Stage::Sequence,
            format!("region code {code} exceeds the tie-up side {side}"),
        )),
        None => Ok(()),
    }
}

#[derive(Default)]
pub struct DraftPipelineBuilder {
    normalizer: Option<Normalizer>,
    assigner: Option<Arc<dyn ClusterAssigner>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl DraftPipelineBuilder {
    #[must_use]
    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    #[must_use]
    pub fn assigner(mut self, assigner: Arc<dyn ClusterAssigner>) -> Self {
        self.assigner = Some(assigner);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn build(self) -> DraftPipeline {
        DraftPipeline {
            normalizer: self.normalizer.unwrap_or_default(),
            assigner: self
                .assigner
                .unwrap_or_else(|| Arc::new(KMeansAssigner::default())),
            sequencer: LabelSequencer::new(),
            metrics: self.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::RegionId;
    use ndarray::{Array2, ArrayView2, array};

    /// Labels rows by the sign of their first feature, ignoring k and seed.
    struct SignAssigner;

    impl ClusterAssigner for SignAssigner {
        fn assign(
            &self,
            features: ArrayView2<'_, f64>,
            _k: usize,
            _seed: u64,
        ) -> Result<Vec<ClusterLabel>, PipelineError> {
            Ok(features
                .outer_iter()
                .map(|row| {
                    ClusterLabel::from_index(usize::from(row[0] > 0.0)).expect("label 1 or 2")
                })
                .collect())
        }
    }

    fn table(regions: Vec<Option<RegionId>>, features: Array2<f64>) -> FeatureTable {
        let names = (0..features.ncols()).map(|i| format!("f{i}")).collect();
        FeatureTable::new(regions, features, names).expect("table")
    }

    fn sign_pipeline() -> DraftPipeline {
        DraftPipeline::builder()
            .assigner(Arc::new(SignAssigner))
            .build()
    }

    #[test]
    fn matrix_set_names_follow_file_order() {
        let set = MatrixSet {
            threading: array![[1]],
            treadling: array![[1]],
            tieup: array![[1]],
            draft: None,
        };
        let names: Vec<_> = set.named().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["threading", "tieup", "treadling"]);
    }

    #[test]
    fn identity_draft_from_injected_labels() {
        let t = table(
            vec![
                Some(RegionId::Code(1)),
                Some(RegionId::Code(2)),
                Some(RegionId::Code(3)),
            ],
            array![[1.0], [-1.0], [2.0]],
        );
        let output = sign_pipeline()
            .run(&t, &DraftParams::default())
            .expect("run");

        // Row 1 is label 1, rows 0 and 2 label 2.
        assert_eq!(output.sequenced.permutation.indices(), &[1, 0, 2]);
        assert_eq!(output.matrices.threading, array![[1, 0], [0, 1], [0, 1]]);
        assert_eq!(
            output.matrices.draft,
            Some(array![[1, 0, 0], [0, 1, 1], [0, 1, 1]])
        );
    }

    #[test]
    fn draft_can_be_skipped() {
        let t = table(
            vec![Some(RegionId::Code(1)), Some(RegionId::Code(2))],
            array![[1.0], [-1.0]],
        );
        let params = DraftParams {
            include_draft: false,
            smoothing: Some(SmoothingSpec {
                shape: smooth::SmoothingShape::Square,
                radius: 3,
            }),
            ..DraftParams::default()
        };
        let output = sign_pipeline().run(&t, &params).expect("run");
        assert!(output.matrices.draft.is_none());
        assert_eq!(output.matrices.named().count(), 3);
    }

    #[test]
    fn all_null_regions_fail() {
        let t = table(vec![None, None], array![[1.0], [-1.0]]);
        let params = DraftParams {
            clusters: NonZeroUsize::new(2),
            ..DraftParams::default()
        };
        let error = sign_pipeline().run(&t, &params).expect_err("no regions");
        assert_eq!(error.stage(), Stage::Sequence);
    }

    #[test]
    fn region_codes_beyond_tieup_fail() {
        let t = table(
            vec![Some(RegionId::Code(1)), Some(RegionId::Code(9))],
            array![[1.0], [-1.0]],
        );
        let params = DraftParams {
            threading_source: ThreadingSource::Regions,
            ..DraftParams::default()
        };
        let error = sign_pipeline().run(&t, &params).expect_err("code 9 > side 2");
        assert_eq!(error.stage(), Stage::Sequence);
    }

    #[test]
    fn metrics_track_runs_and_drops() {
        let registry = Arc::new(prometheus::Registry::new());
        let metrics = Arc::new(PipelineMetrics::new(&registry).expect("metrics"));
        let pipeline = DraftPipeline::builder()
            .assigner(Arc::new(SignAssigner))
            .metrics(Arc::clone(&metrics))
            .build();
        let t = table(
            vec![Some(RegionId::Code(1)), None, Some(RegionId::Code(2))],
            array![[1.0], [2.0], [-1.0]],
        );
        pipeline.run(&t, &DraftParams::default()).expect("run");
        assert_eq!(metrics.runs_completed.get(), 1);
        assert_eq!(metrics.rows_dropped.get(), 1);
        assert!((metrics.last_draft_cells.get() - 4.0).abs() < f64::EPSILON);
    }
}
