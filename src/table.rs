//! Feature table loading: the boundary between raw region data and the draft pipeline.
//!
//! A table is one row per region with a designated region identifier column and
//! one or more numeric feature columns. Coordinate and bookkeeping columns are
//! excluded before the features reach the normalizer.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use ndarray::{Array2, ArrayView2};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Stage};

/// Region identifier. Integer codes are kept numeric so they can double as loom values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegionId {
    Code(i64),
    Name(String),
}

impl RegionId {
    /// Parses a raw cell. Empty and NaN-like cells are null.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || matches!(trimmed.to_ascii_lowercase().as_str(), "nan" | "na" | "null") {
            return None;
        }
        if let Ok(code) = trimmed.parse::<i64>() {
            return Some(Self::Code(code));
        }
        // Integer columns with gaps come out of spreadsheets as "3.0".
        if let Ok(value) = trimmed.parse::<f64>() {
            if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
                #[allow(clippy::cast_possible_truncation)]
                return Some(Self::Code(value as i64));
            }
        }
        Some(Self::Name(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_code(&self) -> Option<i64> {
        match self {
            Self::Code(code) => Some(*code),
            Self::Name(_) => None,
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "{code}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for RegionId {
    fn from(code: i64) -> Self {
        Self::Code(code)
    }
}

impl From<&str> for RegionId {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// Column layout of an input table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub region_column: String,
    /// Header renames applied before any lookup, as `(from, to)`.
    pub renames: Vec<(String, String)>,
    /// Non-feature columns dropped before normalization.
    pub exclude_columns: Vec<String>,
    /// Keep only rows whose integer region id is at most this value.
    pub max_region_code: Option<i64>,
}

impl Default for TableSpec {
    fn default() -> Self {
        Self {
            region_column: "alcaldiaid".to_string(),
            renames: vec![
                ("4_colonias_id".to_string(), "coloniaid".to_string()),
                ("4_alcaldias_id".to_string(), "alcaldiaid".to_string()),
            ],
            exclude_columns: vec!["coloniaid".to_string()],
            max_region_code: None,
        }
    }
}

/// Numeric feature matrix plus the parallel region identifier column.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    region_ids: Vec<Option<RegionId>>,
    features: Array2<f64>,
    feature_names: Vec<String>,
}

impl FeatureTable {
    /// Builds a table from in-memory columns.
    ///
    /// # Errors
    /// `InvalidInput` when the table is empty, the region column length does not
    /// match the feature rows, or a feature value is not finite.
    pub fn new(
        region_ids: Vec<Option<RegionId>>,
        features: Array2<f64>,
        feature_names: Vec<String>,
    ) -> Result<Self, PipelineError> {
        let (rows, cols) = features.dim();
        if rows == 0 {
            return Err(PipelineError::invalid_input(Stage::Preprocess, "table has no rows"));
        }
        if cols == 0 {
            return Err(PipelineError::invalid_input(
                Stage::Preprocess,
                "table has no feature columns",
            ));
        }
        if region_ids.len() != rows {
            return Err(PipelineError::invalid_input(
                Stage::Preprocess,
                format!(
                    "region column has {} entries but feature matrix has {rows} rows",
                    region_ids.len()
                ),
            ));
        }
        if feature_names.len() != cols {
            return Err(PipelineError::invalid_input(
                Stage::Preprocess,
                format!("{} feature names for {cols} feature columns", feature_names.len()),
            ));
        }
        if let Some(((row, col), _)) = features.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(PipelineError::invalid_input(
                Stage::Preprocess,
                format!("non-finite feature value at row {row}, column {col}"),
            ));
        }
        Ok(Self {
            region_ids,
            features,
            feature_names,
        })
    }

    /// Loads a table from a CSV file.
    ///
    /// # Errors
    /// I/O failures and every condition of [`FeatureTable::from_csv_reader`].
    pub fn from_csv_path(path: impl AsRef<Path>, spec: &TableSpec) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|e| PipelineError::io(Stage::Preprocess, path.display(), e))?;
        info!(path = %path.display(), "loading feature table");
        Self::from_csv_reader(file, spec)
    }

    /// Parses a headed CSV table.
    ///
    /// # Errors
    /// `InvalidInput` for a missing region column, an empty table, or a missing
    /// or non-numeric feature cell.
    pub fn from_csv_reader<R: Read>(reader: R, spec: &TableSpec) -> Result<Self, PipelineError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|header| {
                spec.renames
                    .iter()
                    .find(|(from, _)| from == header)
                    .map_or_else(|| header.to_string(), |(_, to)| to.clone())
            })
            .collect();

        let region_idx = headers
            .iter()
            .position(|h| h == &spec.region_column)
            .ok_or_else(|| {
                PipelineError::invalid_input(
                    Stage::Preprocess,
                    format!("missing region column {:?}", spec.region_column),
                )
            })?;

        let feature_idx: Vec<usize> = headers
            .iter()
            .enumerate()
            .filter(|(idx, name)| *idx != region_idx && !spec.exclude_columns.contains(name))
            .map(|(idx, _)| idx)
            .collect();
        let feature_names: Vec<String> = feature_idx.iter().map(|&i| headers[i].clone()).collect();

        let mut region_ids = Vec::new();
        let mut values = Vec::new();
        let mut filtered = 0usize;

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let region = record.get(region_idx).and_then(RegionId::parse);

            if let Some(max_code) = spec.max_region_code {
                let keep = region
                    .as_ref()
                    .and_then(RegionId::as_code)
                    .is_some_and(|code| code <= max_code);
                if !keep {
                    filtered += 1;
                    continue;
                }
            }

            for &col in &feature_idx {
                let cell = record.get(col).unwrap_or_default();
                let value = cell.parse::<f64>().map_err(|_| {
                    PipelineError::invalid_input(
                        Stage::Preprocess,
                        format!(
                            "row {row}: column {:?} is not numeric ({cell:?})",
                            headers[col]
                        ),
                    )
                })?;
                values.push(value);
            }
            region_ids.push(region);
        }

        if filtered > 0 {
            debug!(filtered, "rows removed by region code filter");
        }

        let rows = region_ids.len();
        let features = Array2::from_shape_vec((rows, feature_idx.len()), values).map_err(|e| {
            PipelineError::invalid_input(Stage::Preprocess, format!("ragged feature table: {e}"))
        })?;

        let table = Self::new(region_ids, features, feature_names)?;
        info!(
            rows = table.n_rows(),
            features = table.n_features(),
            regions = table.distinct_regions(),
            "feature table loaded"
        );
        Ok(table)
    }

    #[must_use]
    pub fn region_ids(&self) -> &[Option<RegionId>] {
        &self.region_ids
    }

    #[must_use]
    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    #[must_use]
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.features.nrows()
    }

    #[must_use]
    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    /// Number of distinct non-null region identifiers.
    #[must_use]
    pub fn distinct_regions(&self) -> usize {
        self.region_ids
            .iter()
            .flatten()
            .collect::<FxHashSet<_>>()
            .len()
    }
}
