use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the streaming pipeline. Nothing is retried; every variant
/// names the offending channel or path.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A mandatory setting or normalization table is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A source file is unreadable or lacks a required variable.
    #[error("file format error in {path}: {reason}")]
    FileFormat {
        /// File that failed.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// A normalization entry cannot be applied (zero or non-finite scale).
    #[error("normalization error for channel \"{channel}\": {reason}")]
    Normalization {
        /// Channel whose entry is degenerate.
        channel: String,
        /// Why the entry cannot be used.
        reason: String,
    },
    /// Too few samples were seen to estimate a standard deviation.
    #[error("channel \"{channel}\" has {count} sample(s); at least 2 are needed for a standard deviation")]
    StatsDegenerate {
        /// Channel with too few samples.
        channel: String,
        /// Number of samples seen.
        count: u64,
    },
    /// Array shapes that must agree do not.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Filesystem failure outside of source-file decoding.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn file_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn normalization(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Normalization {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the pipeline crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
