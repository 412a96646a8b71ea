//! Job model: identifiers, encode requests, queue entries and event payloads.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Identifier of a queued or running encode job.
pub type JobId = u64;
/// Identifier of a recording in the metadata store.
pub type RecordedId = u64;
/// Identifier of a source video file in the metadata store.
pub type VideoFileId = u64;

/// Upper bound for job identifiers. The allocation counter wraps back to
/// zero here, so assigned ids stay within the exactly-representable integer
/// range of IEEE-754 doubles for the benefit of JSON consumers.
pub const MAX_JOB_ID: u64 = 1 << 53;

/// Allocate the next job id, wrapping the counter at [`MAX_JOB_ID`].
///
/// The counter is pre-incremented, so the first id handed out is 1 and id 0
/// is never visible to consumers.
pub(crate) fn next_job_id(counter: &mut u64) -> JobId {
    if *counter >= MAX_JOB_ID {
        *counter = 0;
    }
    *counter += 1;
    *counter
}

/// A client request to re-encode one source video file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeRequest {
    /// Recording the source file belongs to
    pub recorded_id: RecordedId,
    /// Source video file to re-encode
    pub source_video_file_id: VideoFileId,
    /// Name of the encoder profile to apply
    pub mode: String,
    /// Named storage root the output lands under
    pub parent_dir: String,
    /// Optional sub-directory below the storage root
    #[serde(default)]
    pub directory: Option<String>,
    /// Delete the source file once this job succeeds
    #[serde(default)]
    pub remove_original: bool,
}

/// A request that has been admitted to the wait queue.
#[derive(Debug, Clone)]
pub(crate) struct WaitEntry {
    pub id: JobId,
    pub request: EncodeRequest,
}

/// A job with a live encoder process.
pub(crate) struct RunningEntry {
    pub job: WaitEntry,
    /// Set by `cancel`; distinguishes operator-initiated termination from
    /// process failure in the exit handler.
    pub cancelled: bool,
    /// Trips the supervisor task, which kills the child process.
    pub kill: CancellationToken,
    /// Deadline task; aborted during finalization.
    pub deadline: JoinHandle<()>,
}

/// Payload of the finish event emitted when a job succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedEncode {
    pub recorded_id: RecordedId,
    pub video_file_id: VideoFileId,
    pub parent_dir_name: String,
    /// Output path relative to the storage root (`directory/basename`, or
    /// just the basename when no sub-directory was requested)
    pub file_path: Option<String>,
    pub full_output_path: Option<PathBuf>,
    pub mode: String,
    /// False when the duplicate-source interlock suppressed deletion
    pub remove_original: bool,
}

/// One row of the per-recording job index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeInfo {
    pub job_id: JobId,
    pub mode: String,
}
