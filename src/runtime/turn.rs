//! Turn-taking scheduler.
//!
//! One [`InstanceOperation`] at a time holds the instance's turn. Callers
//! enqueue, wait to be notified, perform their effect, and release the turn.
//! The release runs the dispatch loop, which hands the turn to the next
//! runnable operation.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace};

use super::deadline::Deadline;
use super::lifecycle::LifecycleState;
use super::operation::InstanceOperation;
use super::{InstanceCore, lock};
use crate::WorkflowError;

/// Proof of holding the instance's turn.
///
/// Call [`Turn::release`] when done. A turn dropped without release (for
/// example because the caller's future was cancelled) is released on a
/// spawned task so the instance never deadlocks.
pub(crate) struct Turn {
    core: Arc<InstanceCore>,
    op: Arc<InstanceOperation>,
    released: bool,
}

impl Turn {
    fn new(core: Arc<InstanceCore>, op: Arc<InstanceOperation>) -> Self {
        let previous = core.active_turns.fetch_add(1, Ordering::SeqCst);
        if previous != 0 {
            error!(instance = %core.id(), active = previous + 1, "more than one operation holds the turn");
        }
        Self {
            core,
            op,
            released: false,
        }
    }

    pub(crate) async fn release(mut self) {
        self.released = true;
        self.core.active_turns.fetch_sub(1, Ordering::SeqCst);
        self.core.notify_operation_complete(&self.op).await;
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.core.active_turns.fetch_sub(1, Ordering::SeqCst);
        release_in_background(self.core.clone(), self.op.clone());
    }
}

fn release_in_background(core: Arc<InstanceCore>, op: Arc<InstanceOperation>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                core.notify_operation_complete(&op).await;
            });
        }
        Err(_) => {
            error!(instance = %core.id(), "turn dropped outside a tokio runtime; instance cannot make progress");
        }
    }
}

/// Removes a still-queued operation if the waiting future is dropped.
struct PendingWait<'a> {
    core: &'a Arc<InstanceCore>,
    op: &'a Arc<InstanceOperation>,
    armed: bool,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.armed && !self.core.remove(self.op) && self.op.is_notified() {
            release_in_background(self.core.clone(), self.op.clone());
        }
    }
}

impl InstanceCore {
    /// Queue `op`, or grant it the turn right away when the instance is free.
    pub(crate) fn enqueue(&self, op: &Arc<InstanceOperation>, push_front: bool) {
        let mut st = lock(&self.state);
        op.stamp(st.action_counter);
        if st.is_busy {
            if push_front {
                st.pending_operations.push_front(op.clone());
            } else {
                st.pending_operations.push_back(op.clone());
            }
            if op.interrupts_scheduler {
                self.pause.request_pause();
            }
            trace!(instance = %st.instance_id, kind = ?op.kind, queued = st.pending_operations.len(), "operation queued behind busy instance");
            return;
        }

        let terminal = matches!(st.lifecycle, LifecycleState::Aborted | LifecycleState::Unloaded);
        if terminal || op.can_run(&st, &self.pause) {
            st.is_busy = true;
            st.action_counter += 1;
            op.signal();
            trace!(instance = %st.instance_id, kind = ?op.kind, action = st.action_counter, "operation admitted");
        } else if push_front {
            st.pending_operations.push_front(op.clone());
        } else {
            st.pending_operations.push_back(op.clone());
        }
    }

    /// Remove a queued operation. Fails once it has been notified.
    pub(crate) fn remove(&self, op: &Arc<InstanceOperation>) -> bool {
        let mut st = lock(&self.state);
        match st.pending_operations.iter().position(|o| Arc::ptr_eq(o, op)) {
            Some(index) => {
                st.pending_operations.remove(index);
                true
            }
            None => false,
        }
    }

    /// Wait until `op` holds the turn or the deadline passes.
    ///
    /// If the deadline passes but the operation was notified concurrently,
    /// the timeout is discarded and the turn is returned.
    pub(crate) async fn wait_for_turn(
        self: &Arc<Self>,
        op: &Arc<InstanceOperation>,
        deadline: &Deadline,
        operation: &str,
    ) -> Result<Turn, WorkflowError> {
        if op.is_notified() {
            return Ok(Turn::new(self.clone(), op.clone()));
        }

        let mut guard = PendingWait {
            core: self,
            op,
            armed: true,
        };
        let waited = deadline
            .run(operation, async {
                while !op.is_notified() {
                    op.notified().await;
                }
            })
            .await;
        guard.armed = false;

        match waited {
            Ok(()) => Ok(Turn::new(self.clone(), op.clone())),
            Err(timeout) => {
                if self.remove(op) {
                    debug!(instance = %self.id(), operation, "timed out waiting for turn");
                    Err(timeout)
                } else {
                    // Notified between the timeout and the removal.
                    Ok(Turn::new(self.clone(), op.clone()))
                }
            }
        }
    }

    /// Enqueue, wait, and initialize the interpreter if the operation needs it.
    pub(crate) async fn acquire_turn(
        self: &Arc<Self>,
        op: InstanceOperation,
        push_front: bool,
        deadline: &Deadline,
        operation: &str,
    ) -> Result<Turn, WorkflowError> {
        let op = Arc::new(op);
        self.enqueue(&op, push_front);
        let turn = self.wait_for_turn(&op, deadline, operation).await?;
        if op.requires_initialized
            && let Err(e) = self.ensure_initialized()
        {
            turn.release().await;
            return Err(e);
        }
        Ok(turn)
    }

    /// Release the turn held by `op` and run the dispatch loop.
    pub(crate) async fn notify_operation_complete(self: &Arc<Self>, op: &Arc<InstanceOperation>) {
        if op.clear_notified() {
            self.on_notify_paused().await;
        }
    }
}
