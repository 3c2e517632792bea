//! Label sequencing: orders regions by cluster label and keeps a second, independently
//! computed labelling aligned to the same rows.
//!
//! The sort order is captured once as a [`Permutation`]. The treadling labels are
//! never re-sorted; they are pulled through that permutation so that position `i`
//! of both sequences always refers to the same region.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PipelineError, Stage};
use crate::table::RegionId;

use super::types::{ClusterLabel, ThreadingSource};

/// Original row indices in sequence order. Rows with a null region id are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permutation {
    indices: Vec<usize>,
    source_len: usize,
}

impl Permutation {
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Row count of the table the permutation was computed on.
    #[must_use]
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Picks `values` row-for-row in permutation order.
    ///
    /// # Errors
    /// `InvalidInput` when `values` does not have one entry per source row.
    pub fn apply<T: Clone>(&self, values: &[T]) -> Result<Vec<T>, PipelineError> {
        if values.len() != self.source_len {
            return Err(PipelineError::invalid_input(
                Stage::Sequence,
                format!(
                    "permutation over {} rows applied to {} values",
                    self.source_len,
                    values.len()
                ),
            ));
        }
        Ok(self.indices.iter().map(|&i| values[i].clone()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceEntry {
    pub region: RegionId,
    pub label: ClusterLabel,
}

/// Ordered (region, label) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct LabelSequence {
    entries: Vec<SequenceEntry>,
}

impl LabelSequence {
    #[must_use]
    pub fn from_entries(entries: Vec<SequenceEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[SequenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn labels(&self) -> Vec<ClusterLabel> {
        self.entries.iter().map(|e| e.label).collect()
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionId> {
        self.entries.iter().map(|e| &e.region)
    }

    /// Values handed to the matrix builders.
    ///
    /// # Errors
    /// `InvalidInput` with [`ThreadingSource::Regions`] when a region id is not a
    /// positive integer code.
    pub fn loom_values(&self, source: ThreadingSource) -> Result<Vec<ClusterLabel>, PipelineError> {
        match source {
            ThreadingSource::Labels => Ok(self.labels()),
            ThreadingSource::Regions => self
                .entries
                .iter()
                .map(|e| {
                    e.region
                        .as_code()
                        .and_then(|code| u32::try_from(code).ok())
                        .and_then(ClusterLabel::new)
                        .ok_or_else(|| {
                            PipelineError::invalid_input(
                                Stage::Sequence,
                                format!("region id {} is not a positive integer code", e.region),
                            )
                        })
                })
                .collect(),
        }
    }
}

/// Threading sequence plus the row order used to build it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequencedLabels {
    pub threading: LabelSequence,
    pub permutation: Permutation,
    /// Rows removed because their region id was null.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LabelSequencer;

impl LabelSequencer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Stable-sorts rows by ascending label, drops null regions, and records the order.
    ///
    /// # Errors
    /// `InvalidInput` when the columns differ in length.
    pub fn sequence(
        &self,
        regions: &[Option<RegionId>],
        labels: &[ClusterLabel],
    ) -> Result<SequencedLabels, PipelineError> {
        if regions.len() != labels.len() {
            return Err(PipelineError::invalid_input(
                Stage::Sequence,
                format!("{} region ids for {} labels", regions.len(), labels.len()),
            ));
        }

        let mut order: Vec<usize> = (0..labels.len()).collect();
        order.sort_by_key(|&row| labels[row]);

        let (indices, entries): (Vec<usize>, Vec<SequenceEntry>) = order
            .into_iter()
            .filter_map(|row| {
                regions[row].as_ref().map(|region| {
                    (
                        row,
                        SequenceEntry {
                            region: region.clone(),
                            label: labels[row],
                        },
                    )
                })
            })
            .unzip();

        let dropped = labels.len() - indices.len();
        if dropped > 0 {
            warn!(dropped, "rows with a null region id dropped from the sequence");
        }
        debug!(rows = indices.len(), dropped, "threading sequence built");

        Ok(SequencedLabels {
            threading: LabelSequence::from_entries(entries),
            permutation: Permutation {
                indices,
                source_len: labels.len(),
            },
            dropped,
        })
    }

    /// Aligns a second labelling of the same rows to an existing sequence.
    ///
    /// # Errors
    /// `InvalidInput` when `labels` does not cover the permutation's source rows.
    pub fn realign(
        &self,
        sequenced: &SequencedLabels,
        labels: &[ClusterLabel],
    ) -> Result<LabelSequence, PipelineError> {
        let aligned = sequenced.permutation.apply(labels)?;
        let entries = sequenced
            .threading
            .regions()
            .zip(aligned)
            .map(|(region, label)| SequenceEntry {
                region: region.clone(),
                label,
            })
            .collect();
        Ok(LabelSequence::from_entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(values: &[u32]) -> Vec<ClusterLabel> {
        values
            .iter()
            .map(|v| ClusterLabel::new(*v).expect("non-zero"))
            .collect()
    }

    fn codes(values: &[i64]) -> Vec<Option<RegionId>> {
        values.iter().map(|v| Some(RegionId::Code(*v))).collect()
    }

    #[test]
    fn sort_is_stable_for_equal_labels() {
        let regions = codes(&[10, 11, 12, 13, 14]);
        let result = LabelSequencer::new()
            .sequence(&regions, &labels(&[2, 1, 2, 1, 3]))
            .expect("sequence");
        assert_eq!(result.permutation.indices(), &[1, 3, 0, 2, 4]);
        let ordered: Vec<_> = result.threading.regions().cloned().collect();
        assert_eq!(
            ordered,
            vec![
                RegionId::Code(11),
                RegionId::Code(13),
                RegionId::Code(10),
                RegionId::Code(12),
                RegionId::Code(14)
            ]
        );
        assert_eq!(result.dropped, 0);
    }

    #[test]
    fn null_regions_are_dropped_and_counted() {
        let regions = vec![Some(RegionId::Code(1)), None, Some(RegionId::Code(3))];
        let result = LabelSequencer::new()
            .sequence(&regions, &labels(&[1, 1, 2]))
            .expect("sequence");
        assert_eq!(result.dropped, 1);
        assert_eq!(result.permutation.indices(), &[0, 2]);
        assert_eq!(result.permutation.source_len(), 3);
        assert_eq!(result.threading.len(), 2);
    }

    #[test]
    fn realign_uses_primary_order_not_a_fresh_sort() {
        let regions = vec![
            Some(RegionId::Code(1)),
            Some(RegionId::Code(2)),
            None,
            Some(RegionId::Code(4)),
        ];
        let sequencer = LabelSequencer::new();
        let primary = sequencer
            .sequence(&regions, &labels(&[3, 1, 1, 2]))
            .expect("sequence");
        // Secondary labels indexed by original row.
        let treadling = sequencer
            .realign(&primary, &labels(&[7, 8, 9, 6]))
            .expect("realign");

        assert_eq!(primary.permutation.indices(), &[1, 3, 0]);
        assert_eq!(treadling.labels(), labels(&[8, 6, 7]));
        let primary_regions: Vec<_> = primary.threading.regions().collect();
        let treadling_regions: Vec<_> = treadling.regions().collect();
        assert_eq!(primary_regions, treadling_regions);
    }

    #[test]
    fn realign_rejects_wrong_length() {
        let sequencer = LabelSequencer::new();
        let primary = sequencer
            .sequence(&codes(&[1, 2]), &labels(&[1, 2]))
            .expect("sequence");
        let error = sequencer
            .realign(&primary, &labels(&[1]))
            .expect_err("length mismatch");
        assert_eq!(error.stage(), Stage::Sequence);
    }

    #[test]
    fn loom_values_from_regions_require_positive_codes() {
        let sequencer = LabelSequencer::new();
        let ok = sequencer
            .sequence(&codes(&[4, 2]), &labels(&[2, 1]))
            .expect("sequence");
        assert_eq!(
            ok.threading.loom_values(ThreadingSource::Regions).expect("codes"),
            labels(&[2, 4])
        );
        assert_eq!(
            ok.threading.loom_values(ThreadingSource::Labels).expect("labels"),
            labels(&[1, 2])
        );

        let named = sequencer
            .sequence(&[Some(RegionId::from("north"))], &labels(&[1]))
            .expect("sequence");
        assert!(named.threading.loom_values(ThreadingSource::Regions).is_err());
    }
}
