//! FIFO queue of remote writes deferred while offline.
//!
//! Entries run strictly in enqueue order. The entry being replayed stays at
//! the head until it settles, so a write arriving meanwhile always lands
//! behind it. A transient failure leaves the head in place and pauses the
//! drain; any other failure is reported to that entry's caller and aborts
//! everything queued behind it, since later writes may depend on the failed
//! one.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use tarotsync_common::{Error, Result};

/// Future produced by one attempt of a queued write.
pub type OperationFuture = BoxFuture<'static, Result<()>>;

/// Re-invocable write; called once per attempt.
pub type Operation = Box<dyn Fn() -> OperationFuture + Send + Sync>;

type SharedOperation = Arc<dyn Fn() -> OperationFuture + Send + Sync>;

/// A deferred write and the channel its caller awaits.
pub struct QueuedOperation {
    id: u64,
    label: String,
    invoke: SharedOperation,
    completion: oneshot::Sender<Result<()>>,
}

impl QueuedOperation {
    /// Wrap `invoke`; the receiver resolves when the write finally runs.
    pub fn new(label: impl Into<String>, invoke: Operation) -> (Self, oneshot::Receiver<Result<()>>) {
        let (completion, rx) = oneshot::channel();
        let operation = Self {
            id: 0,
            label: label.into(),
            invoke: Arc::from(invoke),
            completion,
        };
        (operation, rx)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn complete(self, result: Result<()>) {
        // the caller may have stopped waiting
        let _ = self.completion.send(result);
    }
}

/// How a drain pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain was already running; nothing was done.
    AlreadyDraining,
    /// The queue is empty.
    Completed,
    /// Stopped on a transient failure or lost connectivity; entries remain.
    Paused,
    /// A write was rejected and this many later entries were dropped.
    Aborted { aborted: usize },
}

/// Result of [`OfflineQueue::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries that ran successfully.
    pub executed: usize,
    pub outcome: DrainOutcome,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueuedOperation>,
    draining: bool,
    next_id: u64,
}

/// Releases the drainer slot if a drain is cancelled mid-write.
struct DrainSlot<'a> {
    queue: &'a OfflineQueue,
    held: bool,
}

impl DrainSlot<'_> {
    /// Give the slot back while the caller holds the state lock.
    fn release(&mut self, state: &mut QueueState) {
        state.draining = false;
        self.held = false;
    }
}

impl Drop for DrainSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.queue.lock().draining = false;
        }
    }
}

/// Ordered queue of deferred writes with a single drainer.
#[derive(Default)]
pub struct OfflineQueue {
    state: Mutex<QueueState>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, mut operation: QueuedOperation) {
        let mut state = self.lock();
        state.next_id += 1;
        operation.id = state.next_id;
        state.entries.push_back(operation);
    }

    /// Pending entries, including one currently being replayed.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    /// Labels of pending entries, head first.
    pub fn labels(&self) -> Vec<String> {
        self.lock().entries.iter().map(|op| op.label.clone()).collect()
    }

    /// Run queued writes in order while `is_online` holds.
    ///
    /// Only one drain runs at a time; a concurrent call returns
    /// [`DrainOutcome::AlreadyDraining`] immediately. The running drain also
    /// picks up entries pushed before it finishes: it only stops after
    /// seeing an empty queue under the same lock that `push` takes.
    pub async fn drain<F>(&self, is_online: F) -> DrainReport
    where
        F: Fn() -> bool,
    {
        let mut executed = 0;

        {
            let mut state = self.lock();
            if state.draining {
                return DrainReport {
                    executed,
                    outcome: DrainOutcome::AlreadyDraining,
                };
            }
            state.draining = true;
        }
        let mut slot = DrainSlot {
            queue: self,
            held: true,
        };

        loop {
            let (id, label, invoke) = {
                let mut state = self.lock();
                if !is_online() {
                    slot.release(&mut state);
                    return DrainReport {
                        executed,
                        outcome: DrainOutcome::Paused,
                    };
                }
                let Some(head) = state.entries.front() else {
                    slot.release(&mut state);
                    return DrainReport {
                        executed,
                        outcome: DrainOutcome::Completed,
                    };
                };
                (head.id, head.label.clone(), head.invoke.clone())
            };

            debug!("Replaying queued write: {}", label);
            let result = invoke().await;

            let mut state = self.lock();
            if state.entries.front().map(|head| head.id) != Some(id) {
                // aborted while it ran
                debug!("Queued write {} finished after being dropped", label);
                continue;
            }
            let settled = match &result {
                Err(e) if e.is_transient() => None,
                _ => state.entries.pop_front(),
            };

            let Some(operation) = settled else {
                if let Err(e) = &result {
                    warn!("Queued write {} deferred again: {}", label, e);
                }
                slot.release(&mut state);
                return DrainReport {
                    executed,
                    outcome: DrainOutcome::Paused,
                };
            };

            match result {
                Ok(()) => {
                    operation.complete(Ok(()));
                    executed += 1;
                }
                Err(e) => {
                    error!("Queued write {} failed: {}", label, e);
                    operation.complete(Err(e));

                    let pending: Vec<QueuedOperation> = state.entries.drain(..).collect();
                    slot.release(&mut state);
                    drop(state);

                    let aborted = pending.len();
                    for operation in pending {
                        let reason = format!("{} dropped after {} failed", operation.label, label);
                        operation.complete(Err(Error::QueueAborted(reason)));
                    }
                    if aborted > 0 {
                        warn!("Dropped {} queued write(s) behind {}", aborted, label);
                    }
                    return DrainReport {
                        executed,
                        outcome: DrainOutcome::Aborted { aborted },
                    };
                }
            }
        }
    }

    /// Fail every pending entry with the error built by `reason`.
    ///
    /// An entry already being replayed is dropped too; its late result is
    /// ignored. Returns the number of entries dropped.
    pub fn abort_all<F>(&self, reason: F) -> usize
    where
        F: Fn(&str) -> Error,
    {
        let pending: Vec<QueuedOperation> = self.lock().entries.drain(..).collect();
        let count = pending.len();

        for operation in pending {
            let error = reason(&operation.label);
            operation.complete(Err(error));
        }

        count
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
