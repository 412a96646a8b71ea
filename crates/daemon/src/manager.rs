//! The encode manager: wait queue, running set and scheduler.
//!
//! All mutations of the two job collections are serialized through the
//! execution gate. Public operations acquire at their designated priority;
//! the scheduler and finalizer re-enter at theirs. OS child processes run
//! outside the gate and are reaped by per-job supervisor tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use recode_daemon_config::Config;

use crate::error::EncodeError;
use crate::events::EncodeEventEmitter;
use crate::fsutil::FileSystem;
use crate::gate::{
    ExecutionGate, ADD_ENCODE_PRIORITY, CANCEL_PRIORITY, CLEAR_QUEUE_PRIORITY,
    CREATE_PROCESS_PRIORITY,
};
use crate::job::{next_job_id, EncodeInfo, EncodeRequest, JobId, RecordedId, RunningEntry, WaitEntry};
use crate::process::ProcessManager;
use crate::stores::{RecordedStore, VideoFileStore, VideoUtil};

/// External collaborators the manager drives.
pub struct Collaborators {
    pub recorded: Arc<dyn RecordedStore>,
    pub videos: Arc<dyn VideoFileStore>,
    pub video_util: Arc<dyn VideoUtil>,
    pub fs: Arc<dyn FileSystem>,
    pub processes: Arc<dyn ProcessManager>,
    pub events: Arc<dyn EncodeEventEmitter>,
}

pub(crate) struct ManagerState {
    pub job_id_counter: u64,
    pub wait: VecDeque<WaitEntry>,
    pub running: Vec<RunningEntry>,
}

/// Accepts encode requests, bounds the number of live encoder processes and
/// supervises each of them to completion, failure or cancellation.
pub struct EncodeManager {
    pub(crate) config: Arc<Config>,
    pub(crate) gate: Arc<ExecutionGate>,
    pub(crate) state: RwLock<ManagerState>,
    pub(crate) deps: Collaborators,
}

impl EncodeManager {
    pub fn new(config: Arc<Config>, deps: Collaborators) -> Arc<Self> {
        Self::with_gate(config, deps, ExecutionGate::new())
    }

    /// Construct with a caller-provided gate (used to shorten the gate
    /// timeout in tests).
    pub fn with_gate(
        config: Arc<Config>,
        deps: Collaborators,
        gate: Arc<ExecutionGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            gate,
            state: RwLock::new(ManagerState {
                job_id_counter: 0,
                wait: VecDeque::new(),
                running: Vec::new(),
            }),
            deps,
        })
    }

    /// Admit a request to the wait queue and wake the scheduler.
    ///
    /// # Errors
    /// * [`EncodeError::ConcurrentEncodeNumIsZero`] when encoding is disabled
    /// * [`EncodeError::Gate`] when the execution gate times out
    pub async fn enqueue(self: &Arc<Self>, request: EncodeRequest) -> Result<JobId, EncodeError> {
        if self.config.encode.concurrent_encode_num == 0 {
            return Err(EncodeError::ConcurrentEncodeNumIsZero);
        }

        let ticket = self.gate.acquire(ADD_ENCODE_PRIORITY).await?;
        let job_id = {
            let mut state = self.state.write().await;
            let job_id = next_job_id(&mut state.job_id_counter);
            state.wait.push_back(WaitEntry {
                id: job_id,
                request,
            });
            job_id
        };
        self.wake_scheduler();
        drop(ticket);

        self.deps.events.emit_add_encode(job_id);
        info!(job_id, "queued encode job");
        Ok(job_id)
    }

    /// Cancel one job.
    ///
    /// A running job is marked cancelled and its process is killed; a waiting
    /// job is dropped from the queue. Either way the caller gets no event: a
    /// cancelled job is silent beyond logging. Unknown ids are a no-op.
    ///
    /// Note that a successful return does not mean the process has exited,
    /// only that the kill has been signalled.
    pub async fn cancel(self: &Arc<Self>, job_id: JobId) -> Result<(), EncodeError> {
        let ticket = self.gate.acquire(CANCEL_PRIORITY).await?;
        let mut state = self.state.write().await;
        if let Some(entry) = state.running.iter_mut().find(|e| e.job.id == job_id) {
            entry.cancelled = true;
            entry.kill.cancel();
            info!(job_id, "cancelling running encode job");
            drop(state);
            drop(ticket);
        } else {
            state.wait.retain(|e| e.id != job_id);
            drop(state);
            drop(ticket);
            self.wake_scheduler();
        }
        Ok(())
    }

    /// Cancel every job attached to one recording.
    ///
    /// All matching jobs are attempted even if some cancellations fail; a
    /// single [`EncodeError::StopEncode`] is raised afterwards in that case.
    pub async fn cancel_by_recorded_id(
        self: &Arc<Self>,
        recorded_id: RecordedId,
    ) -> Result<(), EncodeError> {
        let job_ids: Vec<JobId> = {
            let state = self.state.read().await;
            state
                .running
                .iter()
                .filter(|e| e.job.request.recorded_id == recorded_id)
                .map(|e| e.job.id)
                .chain(
                    state
                        .wait
                        .iter()
                        .filter(|e| e.request.recorded_id == recorded_id)
                        .map(|e| e.id),
                )
                .collect()
        };

        let mut failed = false;
        for job_id in job_ids {
            if let Err(e) = self.cancel(job_id).await {
                warn!(job_id, recorded_id, error = %e, "failed to cancel encode job");
                failed = true;
            }
        }
        if failed {
            Err(EncodeError::StopEncode)
        } else {
            Ok(())
        }
    }

    /// Snapshot of all live jobs grouped by recording, running jobs first.
    pub async fn recorded_index(
        self: &Arc<Self>,
    ) -> Result<HashMap<RecordedId, Vec<EncodeInfo>>, EncodeError> {
        let ticket = self.gate.acquire(ADD_ENCODE_PRIORITY).await?;
        let index = {
            let state = self.state.read().await;
            let mut index: HashMap<RecordedId, Vec<EncodeInfo>> = HashMap::new();
            for entry in state
                .running
                .iter()
                .map(|e| &e.job)
                .chain(state.wait.iter())
            {
                index
                    .entry(entry.request.recorded_id)
                    .or_default()
                    .push(EncodeInfo {
                        job_id: entry.id,
                        mode: entry.request.mode.clone(),
                    });
            }
            index
        };
        drop(ticket);
        Ok(index)
    }

    /// Current `(waiting, running)` queue lengths.
    pub async fn queue_lengths(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.wait.len(), state.running.len())
    }

    /// Dispatch a deferred scheduler pass.
    ///
    /// The pass runs as its own task so that bursts of completions cannot
    /// build re-entrant scheduler stacks.
    pub(crate) fn wake_scheduler(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.check_queue().await;
        });
    }

    /// Promote the oldest waiting job if there is capacity.
    ///
    /// Idempotent and safe to invoke spuriously: the capacity and queue
    /// checks are repeated under the gate, so concurrent passes cannot
    /// overshoot the running-set bound.
    async fn check_queue(self: Arc<Self>) {
        let cap = self.config.encode.concurrent_encode_num as usize;
        {
            let state = self.state.read().await;
            if state.running.len() >= cap || state.wait.is_empty() {
                return;
            }
        }

        let ticket = match self.gate.acquire(CREATE_PROCESS_PRIORITY).await {
            Ok(ticket) => ticket,
            Err(e) => {
                error!(error = %e, "scheduler could not acquire the execution gate");
                return;
            }
        };

        let entry = {
            let mut state = self.state.write().await;
            if state.running.len() >= cap {
                None
            } else {
                state.wait.pop_front()
            }
        };
        let Some(entry) = entry else {
            drop(ticket);
            return;
        };

        let job_id = entry.id;
        match self.promote(entry).await {
            Ok(()) => drop(ticket),
            Err(e) => {
                drop(ticket);
                error!(job_id, error = %e, "failed to start encoder process");
                // Events are emitted before finalization, same as in the
                // exit watcher.
                self.deps.events.emit_error_encode();
                self.finalize(job_id).await;
            }
        }
    }

    /// Remove a finished job from the running set and wake the scheduler.
    ///
    /// The deadline timer is disarmed before the entry is dropped.
    pub(crate) async fn finalize(self: &Arc<Self>, job_id: JobId) {
        match self.gate.acquire(CLEAR_QUEUE_PRIORITY).await {
            Ok(ticket) => {
                {
                    let mut state = self.state.write().await;
                    if let Some(pos) = state.running.iter().position(|e| e.job.id == job_id) {
                        state.running[pos].deadline.abort();
                        state.running.remove(pos);
                    }
                }
                drop(ticket);
            }
            Err(e) => error!(job_id, error = %e, "could not serialize job finalization"),
        }
        self.wake_scheduler();
    }
}
