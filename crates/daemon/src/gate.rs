//! Priority-ordered mutual exclusion for manager state
//!
//! Every mutation of the wait queue and the running set is serialized through
//! a single gate. Waiters are granted the gate in descending priority order,
//! FIFO among equal priorities, so finalization of completed jobs cannot be
//! starved by a burst of new encode requests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Gate priority used when finalizing a completed or failed job.
pub const CLEAR_QUEUE_PRIORITY: i32 = 3;
/// Gate priority used when enqueueing a new job.
pub const ADD_ENCODE_PRIORITY: i32 = 2;
/// Gate priority used when promoting a waiting job into the running set.
pub const CREATE_PROCESS_PRIORITY: i32 = 2;
/// Gate priority used for cancellation requests.
pub const CANCEL_PRIORITY: i32 = 1;

/// How long a waiter may sit in the gate queue before acquisition fails.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Error type for gate acquisition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// Acquisition did not complete within the gate timeout
    #[error("timed out waiting for the execution gate")]
    GetExecutionTimeout,
}

struct Waiter {
    id: u64,
    priority: i32,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct GateInner {
    next_id: u64,
    /// Currently granted ticket, if any
    holder: Option<u64>,
    /// Pending waiters, sorted by descending priority, FIFO within a priority
    waiters: Vec<Waiter>,
}

/// Single-holder mutual exclusion with priority-ordered hand-off.
///
/// `acquire` returns a [`Ticket`]; holding the ticket is the sole right to
/// mutate the structures the gate protects. Dropping the ticket releases the
/// gate and hands it to the highest-priority waiter, which guarantees release
/// on every exit path.
pub struct ExecutionGate {
    timeout: Duration,
    inner: Mutex<GateInner>,
}

impl ExecutionGate {
    /// Create a gate with the standard acquisition timeout.
    pub fn new() -> Arc<Self> {
        Self::with_timeout(ACQUIRE_TIMEOUT)
    }

    /// Create a gate with a custom acquisition timeout.
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            inner: Mutex::new(GateInner::default()),
        })
    }

    fn locked(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().expect("execution gate lock poisoned")
    }

    /// Wait for the gate, respecting priority ordering.
    ///
    /// The waiter is placed after all queued waiters of equal or higher
    /// priority and before the first waiter of strictly lower priority.
    ///
    /// # Errors
    /// Returns [`GateError::GetExecutionTimeout`] if the gate was not granted
    /// within the gate timeout; the waiter is deregistered on timeout.
    pub async fn acquire(self: &Arc<Self>, priority: i32) -> Result<Ticket, GateError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut inner = self.locked();
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            let pos = inner
                .waiters
                .iter()
                .position(|w| w.priority < priority)
                .unwrap_or(inner.waiters.len());
            inner.waiters.insert(pos, Waiter { id, priority, tx });
            Self::handoff(&mut inner);
            id
        };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(())) => Ok(Ticket {
                gate: Arc::clone(self),
                id,
            }),
            // The sender is only dropped once the waiter has been removed, so
            // a closed channel is handled the same way as a timeout.
            Ok(Err(_)) | Err(_) => {
                let mut inner = self.locked();
                if let Some(pos) = inner.waiters.iter().position(|w| w.id == id) {
                    inner.waiters.remove(pos);
                } else if inner.holder == Some(id) {
                    // Granted between the deadline firing and this cleanup;
                    // give the grant back so the next waiter can proceed.
                    inner.holder = None;
                    Self::handoff(&mut inner);
                }
                Err(GateError::GetExecutionTimeout)
            }
        }
    }

    /// Grant the gate to the head waiter if nobody holds it.
    fn handoff(inner: &mut GateInner) {
        if inner.holder.is_some() {
            return;
        }
        while !inner.waiters.is_empty() {
            let waiter = inner.waiters.remove(0);
            // A send failure means the waiter gave up; skip to the next one.
            if waiter.tx.send(()).is_ok() {
                inner.holder = Some(waiter.id);
                return;
            }
        }
    }

    fn release(&self, id: u64) {
        let mut inner = self.locked();
        if inner.holder == Some(id) {
            inner.holder = None;
            Self::handoff(&mut inner);
        }
    }

    /// Number of waiters currently queued (excluding the holder).
    pub fn queued(&self) -> usize {
        self.locked().waiters.len()
    }
}

/// Exclusive grant of the execution gate. Released on drop.
pub struct Ticket {
    gate: Arc<ExecutionGate>,
    id: u64,
}

impl Ticket {
    /// Identifier of this grant, unique within the gate's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.gate.release(self.id);
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex as StdMutex;
    use tokio::task::yield_now;

    #[tokio::test]
    async fn test_acquire_when_free() {
        let gate = ExecutionGate::new();
        let ticket = gate.acquire(ADD_ENCODE_PRIORITY).await.unwrap();
        assert_eq!(gate.queued(), 0);
        drop(ticket);
    }

    #[tokio::test]
    async fn test_drop_releases_for_next_acquire() {
        let gate = ExecutionGate::new();
        let first = gate.acquire(ADD_ENCODE_PRIORITY).await.unwrap();
        drop(first);
        // A released gate must be immediately grantable again
        let second = gate.acquire(CANCEL_PRIORITY).await.unwrap();
        drop(second);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_higher_priority_preempts_queued_waiters() {
        let gate = ExecutionGate::new();
        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        let held = gate.acquire(ADD_ENCODE_PRIORITY).await.unwrap();

        // Ten enqueue-priority waiters line up first
        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let ticket = gate.acquire(ADD_ENCODE_PRIORITY).await.unwrap();
                order.lock().unwrap().push("add");
                drop(ticket);
            }));
            yield_now().await;
        }

        // A finalization waiter arrives last but must be served first
        {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let ticket = gate.acquire(CLEAR_QUEUE_PRIORITY).await.unwrap();
                order.lock().unwrap().push("clear");
                drop(ticket);
            }));
            yield_now().await;
        }

        assert_eq!(gate.queued(), 11);
        drop(held);

        for handle in handles {
            handle.await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 11);
        assert_eq!(order[0], "clear");
        assert!(order[1..].iter().all(|o| *o == "add"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_fifo_within_equal_priority() {
        let gate = ExecutionGate::new();
        let order: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));

        let held = gate.acquire(CLEAR_QUEUE_PRIORITY).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let ticket = gate.acquire(ADD_ENCODE_PRIORITY).await.unwrap();
                order.lock().unwrap().push(i);
                drop(ticket);
            }));
            yield_now().await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_and_deregisters() {
        let gate = ExecutionGate::with_timeout(Duration::from_millis(50));
        let held = gate.acquire(ADD_ENCODE_PRIORITY).await.unwrap();

        let err = gate.acquire(CANCEL_PRIORITY).await.unwrap_err();
        assert_eq!(err, GateError::GetExecutionTimeout);
        // The timed-out waiter must not linger in the queue
        assert_eq!(gate.queued(), 0);

        drop(held);
        let ticket = gate.acquire(CANCEL_PRIORITY).await.unwrap();
        drop(ticket);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_after_a_timeout_are_still_served() {
        let gate = ExecutionGate::with_timeout(Duration::from_millis(50));
        let held = gate.acquire(ADD_ENCODE_PRIORITY).await.unwrap();

        let err = gate.acquire(ADD_ENCODE_PRIORITY).await.unwrap_err();
        assert_eq!(err, GateError::GetExecutionTimeout);

        let gate2 = Arc::clone(&gate);
        let waiter = tokio::spawn(async move {
            let ticket = gate2.acquire(ADD_ENCODE_PRIORITY).await.unwrap();
            drop(ticket);
        });
        yield_now().await;

        drop(held);
        waiter.await.unwrap();
    }

    proptest! {
        // For any arrival sequence of priorities registered while the gate is
        // held, grants are handed out in non-increasing priority order with
        // arrival order preserved within a priority level.
        #[test]
        fn prop_grant_order_is_stable_priority_sort(priorities in prop::collection::vec(0i32..4, 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            rt.block_on(async move {
                let gate = ExecutionGate::new();
                let order: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));

                let held = gate.acquire(CLEAR_QUEUE_PRIORITY).await.unwrap();

                let mut handles = Vec::new();
                for (idx, priority) in priorities.iter().copied().enumerate() {
                    let gate = Arc::clone(&gate);
                    let order = Arc::clone(&order);
                    handles.push(tokio::spawn(async move {
                        let ticket = gate.acquire(priority).await.unwrap();
                        order.lock().unwrap().push(idx);
                        drop(ticket);
                    }));
                    yield_now().await;
                }

                drop(held);
                for handle in handles {
                    handle.await.unwrap();
                }

                let mut expected: Vec<usize> = (0..priorities.len()).collect();
                expected.sort_by_key(|&idx| std::cmp::Reverse(priorities[idx]));
                assert_eq!(*order.lock().unwrap(), expected);
            });
        }
    }
}
