//! パイプラインのエラー分類。
use std::fmt;

use thiserror::Error;

/// Pipeline stage that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Preprocess,
    Normalize,
    Cluster,
    Sequence,
    Matrix,
    Draft,
    Smooth,
    Persist,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::Normalize => "normalize",
            Self::Cluster => "cluster",
            Self::Sequence => "sequence",
            Self::Matrix => "matrix",
            Self::Draft => "draft",
            Self::Smooth => "smooth",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    DegenerateColumn,
    ClusteringFailed,
    InvalidParameter,
    Io,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[{stage}] invalid input: {reason}")]
    InvalidInput { stage: Stage, reason: String },
    #[error("[{stage}] feature column {column} has zero variance and no positive epsilon is configured")]
    DegenerateColumn { stage: Stage, column: usize },
    #[error("[{stage}] clustering failed: {reason}")]
    ClusteringFailed { stage: Stage, reason: String },
    #[error("[{stage}] invalid parameter {name}: {reason}")]
    InvalidParameter {
        stage: Stage,
        name: &'static str,
        reason: String,
    },
    #[error("[{stage}] i/o failure on {path}: {source}")]
    Io {
        stage: Stage,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn invalid_input(stage: Stage, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            stage,
            reason: reason.into(),
        }
    }

    pub(crate) fn clustering(reason: impl Into<String>) -> Self {
        Self::ClusteringFailed {
            stage: Stage::Cluster,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_parameter(
        stage: Stage,
        name: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            stage,
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(stage: Stage, path: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            stage,
            path: path.to_string(),
            source,
        }
    }

    /// エラーを発生させたステージ。
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidInput { stage, .. }
            | Self::DegenerateColumn { stage, .. }
            | Self::ClusteringFailed { stage, .. }
            | Self::InvalidParameter { stage, .. }
            | Self::Io { stage, .. } => *stage,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::DegenerateColumn { .. } => ErrorKind::DegenerateColumn,
            Self::ClusteringFailed { .. } => ErrorKind::ClusteringFailed,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Stage failures are local and deterministic for fixed inputs; nothing is retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }
}

impl From<csv::Error> for PipelineError {
    fn from(error: csv::Error) -> Self {
        let line = error
            .position()
            .map_or_else(String::new, |pos| format!(" (line {})", pos.line()));
        match error.into_kind() {
            csv::ErrorKind::Io(source) => Self::io(Stage::Preprocess, "csv input", source),
            other => Self::invalid_input(Stage::Preprocess, format!("malformed csv{line}: {other:?}")),
        }
    }
}
