//! Error type for encode manager operations

use crate::gate::GateError;
use crate::job::{RecordedId, VideoFileId};
use thiserror::Error;

/// Error type for encode manager operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoding is disabled by configuration
    #[error("encoding is disabled: the concurrent encode limit is zero")]
    ConcurrentEncodeNumIsZero,

    /// Execution gate acquisition failed
    #[error(transparent)]
    Gate(#[from] GateError),

    /// The source video file does not exist in the metadata store
    #[error("video file {0} is not found")]
    VideoFileIdIsNotFound(VideoFileId),

    /// The recording does not exist in the metadata store
    #[error("recorded {0} is not found")]
    RecordedIsNotFound(RecordedId),

    /// The source video file has no resolvable path
    #[error("video path for file {0} is not found")]
    VideoPathIsNotFound(VideoFileId),

    /// No encoder profile matches the requested mode
    #[error("encode command \"{0}\" is not found")]
    EncodeCommandIsNotFound(String),

    /// The requested storage root is not configured
    #[error("parent directory \"{0}\" is not found")]
    ParentDirIsNotFound(String),

    /// Filename collision resolution exhausted its retry budget
    #[error("could not find a free output file name")]
    GetFilePath,

    /// At least one job of a per-recording cancellation failed
    #[error("failed to stop one or more encode jobs")]
    StopEncode,

    /// Propagated filesystem or spawn error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
