use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Stage};

use super::MatrixSet;
use super::types::BinaryMatrix;

/// 永続化結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistReceipt {
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Destination for a finished matrix set.
pub trait MatrixSink: Send + Sync {
    /// # Errors
    /// `Io` in the persist stage when the destination cannot be written.
    fn write(&self, matrices: &MatrixSet, clusters: usize) -> Result<PersistReceipt, PipelineError>;
}

/// Writes one CSV file per matrix under `<root>/n_clusters=<k>/`.
#[derive(Debug, Clone)]
pub struct CsvDirectorySink {
    root: PathBuf,
}

impl CsvDirectorySink {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn output_dir(&self, clusters: usize) -> PathBuf {
        self.root.join(format!("n_clusters={clusters}"))
    }
}

impl MatrixSink for CsvDirectorySink {
    fn write(&self, matrices: &MatrixSet, clusters: usize) -> Result<PersistReceipt, PipelineError> {
        let directory = self.output_dir(clusters);
        fs::create_dir_all(&directory)
            .map_err(|e| PipelineError::io(Stage::Persist, directory.display(), e))?;

        let mut files = Vec::with_capacity(4);
        for (name, matrix) in matrices.named() {
            let path = directory.join(format!("{name}.csv"));
            let file =
                File::create(&path).map_err(|e| PipelineError::io(Stage::Persist, path.display(), e))?;
            write_matrix_csv(file, matrix)
                .map_err(|e| PipelineError::io(Stage::Persist, path.display(), e))?;
            debug!(path = %path.display(), rows = matrix.nrows(), cols = matrix.ncols(), "matrix written");
            files.push(path);
        }

        info!(directory = %directory.display(), files = files.len(), "matrices persisted");
        Ok(PersistReceipt { directory, files })
    }
}

/// Comma-separated plain integers, one `\n`-terminated line per row.
///
/// # Errors
/// Propagates writer failures.
pub fn write_matrix_csv<W: Write>(writer: W, matrix: &BinaryMatrix) -> io::Result<()> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(writer);
    for row in matrix.outer_iter() {
        csv_writer.write_record(row.iter().map(ToString::to_string))?;
    }
    csv_writer.flush()
}

/// In-memory rendition of a matrix set as nested integer arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoomPayload {
    pub threading_matrix: Vec<Vec<u8>>,
    pub treadling_matrix: Vec<Vec<u8>>,
    pub tieup: Vec<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_matrix: Option<Vec<Vec<u8>>>,
}

impl From<&MatrixSet> for LoomPayload {
    fn from(matrices: &MatrixSet) -> Self {
        Self {
            threading_matrix: nested(&matrices.threading),
            treadling_matrix: nested(&matrices.treadling),
            tieup: nested(&matrices.tieup),
            draft_matrix: matrices.draft.as_ref().map(nested),
        }
    }
}

fn nested(matrix: &BinaryMatrix) -> Vec<Vec<u8>> {
    matrix.outer_iter().map(|row| row.to_vec()).collect()
}

/// Reads every `.csv` in `dir` into `file stem -> rows`. Cells are parsed as
/// floats and truncated, so both `1` and `1.0` load as 1.
///
/// # Errors
/// `Io` when the directory or a file cannot be read, `InvalidInput` for a
/// non-numeric cell.
pub fn load_payload_dir(dir: impl AsRef<Path>) -> Result<BTreeMap<String, Vec<Vec<i64>>>, PipelineError> {
    let dir = dir.as_ref();
    let entries =
        fs::read_dir(dir).map_err(|e| PipelineError::io(Stage::Persist, dir.display(), e))?;

    let mut payload = BTreeMap::new();
    for entry in entries {
        let path = entry
            .map_err(|e| PipelineError::io(Stage::Persist, dir.display(), e))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let file =
            File::open(&path).map_err(|e| PipelineError::io(Stage::Persist, path.display(), e))?;
        payload.insert(name, read_matrix_csv(file, &path)?);
    }
    Ok(payload)
}

#[allow(clippy::cast_possible_truncation)]
fn read_matrix_csv<R: io::Read>(reader: R, path: &Path) -> Result<Vec<Vec<i64>>, PipelineError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record =
            record.map_err(|e| PipelineError::io(Stage::Persist, path.display(), e.into()))?;
        let row = record
            .iter()
            .map(|cell| {
                cell.trim()
                    .parse::<f64>()
                    .map(|v| v.trunc() as i64)
                    .map_err(|_| {
                        PipelineError::invalid_input(
                            Stage::Persist,
                            format!("{}: cell {cell:?} is not numeric", path.display()),
                        )
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(row);
    }
    Ok(rows)
}
