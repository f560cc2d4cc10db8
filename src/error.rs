use std::path::PathBuf;

/// Errors raised while loading, aggregating and rendering evaluation reports.
///
/// Lookup and join misses are not errors: a roster entry without data becomes
/// a [`crate::models::MissingEntry`], a course without open answers simply
/// gets no bundle.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("{}: required column '{column}' not found", file.display())]
    Schema { file: PathBuf, column: String },

    #[error("{}: row {row}: {reason}", file.display())]
    InvalidRecord {
        file: PathBuf,
        row: usize,
        reason: String,
    },

    #[error("{}: line {line}: {reason}", path.display())]
    Roster {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("template references unknown slot '{0}'")]
    Template(String),

    #[error("PDF rendering failed for {}: {reason}", path.display())]
    Render { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, ReportError>;
