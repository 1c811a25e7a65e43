use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// Manifest text could not be turned into a usable manifest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("manifest lists no segments or variants")]
    Empty,

    #[error("manifest does not start with #EXTM3U")]
    MissingHeader,

    #[error("malformed manifest at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("unsupported manifest feature: {0}")]
    Unsupported(String),
}

impl ParseError {
    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no variant streams to select from")]
    Empty,
}

/// A single fetch attempt failed. Retried by the segment downloader.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: StatusCode },

    #[error("{url} returned {actual} bytes, range needs {expected}")]
    ShortBody {
        url: String,
        expected: u64,
        actual: u64,
    },
}

impl TransportError {
    pub fn from_reqwest(url: &url::Url, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                url: url.to_string(),
            };
        }
        match err.status() {
            Some(status) => Self::Status {
                url: url.to_string(),
                status,
            },
            None => Self::Request {
                url: url.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

/// Fatal errors of a whole download batch. Per-segment failures are
/// reported through [`crate::download::segment::DownloadResult`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("no segments to download")]
    EmptyInput,

    #[error("invalid downloader configuration: {0}")]
    InvalidConfig(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("cannot store downloaded segments: {0}")]
    Spool(String),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot merge, {n} segment(s) missing: {0:?}", n = .0.len())]
    IncompleteSegments(Vec<u64>),

    #[error("I/O error while merging: {0}")]
    Io(#[from] std::io::Error),

    #[error("external merge tool failed: {0}")]
    ExternalToolFailed(String),
}

/// Pipeline state reached when a run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Locating,
    Parsing,
    Selecting,
    Downloading,
    Merging,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Locating => "locating",
            Stage::Parsing => "parsing",
            Stage::Selecting => "selecting",
            Stage::Downloading => "downloading",
            Stage::Merging => "merging",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no manifest found on page {page}")]
    NoManifestFound { page: String },

    #[error("none of the {tried} manifest candidate(s) could be parsed")]
    AllManifestsUnparsable { tried: usize },

    #[error("{n} segment(s) failed after retries: {0:?}", n = .0.len())]
    SegmentsMissing(Vec<u64>),

    #[error("cancelled while {stage}")]
    Cancelled { stage: Stage },

    #[error("failed while {stage}: {cause}")]
    Failed {
        stage: Stage,
        #[source]
        cause: StageError,
    },
}

impl PipelineError {
    pub fn failed(stage: Stage, cause: impl Into<StageError>) -> Self {
        Self::Failed {
            stage,
            cause: cause.into(),
        }
    }

    /// Stage the pipeline had reached when it gave up.
    pub fn stage(&self) -> Stage {
        match self {
            Self::NoManifestFound { .. } => Stage::Locating,
            Self::AllManifestsUnparsable { .. } => Stage::Parsing,
            Self::SegmentsMissing(_) => Stage::Downloading,
            Self::Cancelled { stage } | Self::Failed { stage, .. } => *stage,
        }
    }
}
