use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Why a single data row was rejected by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowErrorKind {
    /// The row does not have as many fields as the header.
    FieldCount { expected: usize, found: usize },
    /// A selected field is not valid UTF-8.
    Encoding,
    /// The underlying reader could not tokenise the row.
    Parse,
    /// A blank line between or after data rows.
    EmptyLine,
}

impl RowErrorKind {
    /// Stable label used to bucket skipped rows in the run summary.
    pub fn label(&self) -> &'static str {
        match self {
            RowErrorKind::FieldCount { .. } => "field_count",
            RowErrorKind::Encoding => "encoding",
            RowErrorKind::Parse => "parse",
            RowErrorKind::EmptyLine => "empty_line",
        }
    }
}

impl fmt::Display for RowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowErrorKind::FieldCount { expected, found } => {
                write!(f, "expected {} fields, found {}", expected, found)
            }
            RowErrorKind::Encoding => write!(f, "invalid UTF-8"),
            RowErrorKind::Parse => write!(f, "unparseable row"),
            RowErrorKind::EmptyLine => write!(f, "empty line"),
        }
    }
}

/// A malformed row, annotated with its 1-based line number in the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub line: u64,
    pub kind: RowErrorKind,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.kind)
    }
}

/// Every failure the extraction pipeline can surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input ─────────────────────────────────────────────────────────────────
    #[error("cannot read {}: {source}", path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    // ── Configuration ─────────────────────────────────────────────────────────
    #[error("configuration error: {0}")]
    Configuration(String),

    // ── Rows ──────────────────────────────────────────────────────────────────
    #[error("malformed row at {0}")]
    Row(RowError),

    // ── Contract ──────────────────────────────────────────────────────────────
    #[error("lifecycle violation: {0}")]
    Lifecycle(&'static str),

    // ── Output ────────────────────────────────────────────────────────────────
    #[error("cannot write {}: {message}", path.display())]
    Output { path: PathBuf, message: String },
}

impl PipelineError {
    pub(crate) fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::FileAccess {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn output(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        PipelineError::Output {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_error_display_carries_line_number() {
        let err = PipelineError::Row(RowError {
            line: 42,
            kind: RowErrorKind::FieldCount {
                expected: 4,
                found: 3,
            },
        });
        assert_eq!(
            err.to_string(),
            "malformed row at line 42: expected 4 fields, found 3"
        );
    }

    #[test]
    fn kind_labels_are_distinct() {
        let labels = [
            RowErrorKind::FieldCount {
                expected: 1,
                found: 2,
            }
            .label(),
            RowErrorKind::Encoding.label(),
            RowErrorKind::Parse.label(),
        ];
        assert_eq!(labels, ["field_count", "encoding", "parse"]);
    }
}
