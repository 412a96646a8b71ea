//! recode-daemon
//!
//! Video re-encoding job manager. Encode requests land in a wait queue, a
//! scheduler promotes them into a bounded running set, and a supervisor task
//! drives each external encoder process to completion, failure, deadline
//! expiry or cancellation. Every mutation of the two job collections is
//! serialized through a priority-ordered execution gate.

pub mod error;
pub mod events;
pub mod fsutil;
pub mod gate;
pub mod job;
pub mod manager;
pub mod process;
pub mod stores;
mod supervisor;

pub use recode_daemon_config as config;
pub use recode_daemon_config::Config;

pub use error::EncodeError;
pub use events::{EncodeEvent, EncodeEventBus, EncodeEventEmitter};
pub use fsutil::{FileSystem, TokioFileSystem};
pub use gate::{ExecutionGate, GateError, Ticket};
pub use job::{EncodeInfo, EncodeRequest, FinishedEncode, JobId, RecordedId, VideoFileId};
pub use manager::{Collaborators, EncodeManager};
pub use process::{
    EncodeProcess, FfmpegProcessManager, ProcessExit, ProcessManager, SpawnRequest,
};
pub use stores::{
    MemoryRecordedStore, MemoryVideoFileStore, Recorded, RecordedStore, StandardVideoUtil,
    VideoFile, VideoFileStore, VideoUtil,
};
