use std::path::PathBuf;

/// Errors raised by the splice graph library.
///
/// Per-locus (`InputValidation`) and per-sample (`Resource`) errors are
/// isolated by the callers in [`crate::analysis`]; `Configuration` errors are
/// raised before any per-sample work starts. htslib failures are reported as
/// `Resource` so that they name the sample.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid input for locus {locus}: {reason}")]
    InputValidation { locus: String, reason: String },

    #[error("cannot read alignments for sample '{sample}': {reason}")]
    Resource { sample: String, reason: String },

    #[error("I/O error: {source} ({path})")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("parse error at line {line_no}: {problem} [{line}]")]
    Parse {
        line_no: usize,
        problem: String,
        line: String,
    },
}

impl Error {
    /// Convenience for wrapping an `io::Error` with a path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: path.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_locus(locus: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InputValidation {
            locus: locus.into(),
            reason: reason.into(),
        }
    }

    pub fn resource(sample: impl Into<String>, reason: impl ToString) -> Self {
        Self::Resource {
            sample: sample.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            source: err,
            path: PathBuf::from("<unknown>"),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
