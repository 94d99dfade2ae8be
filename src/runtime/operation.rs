use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

use super::InstanceState;
use super::lifecycle::LifecycleState;
use crate::controller::{ControllerState, PauseSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    /// Runnable as soon as it reaches the front of the queue.
    Plain,
    /// Runnable while the interpreter is idle.
    RequiresIdle,
    /// Re-queued resume that got `NotReady`, enqueued after a backoff.
    /// Runnable while the interpreter is idle or complete.
    DeferredRequiresIdle,
    /// Runnable while the interpreter is not mid-run inside a no-persist zone.
    RequiresPersistence,
}

/// A queued host request.
///
/// Once `notified` is set the operation owns the instance's turn and must
/// release it through `notify_operation_complete`.
#[derive(Debug)]
pub(crate) struct InstanceOperation {
    pub(crate) kind: OperationKind,
    pub(crate) requires_initialized: bool,
    pub(crate) interrupts_scheduler: bool,
    notified: AtomicBool,
    action_id: AtomicU64,
    notify: Notify,
}

impl InstanceOperation {
    fn new(kind: OperationKind, requires_initialized: bool, interrupts_scheduler: bool) -> Self {
        Self {
            kind,
            requires_initialized,
            interrupts_scheduler,
            notified: AtomicBool::new(false),
            action_id: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub(crate) fn plain() -> Self {
        Self::new(OperationKind::Plain, true, true)
    }

    /// Plain operation that must not force interpreter initialization (load, abort).
    pub(crate) fn plain_uninitialized() -> Self {
        Self::new(OperationKind::Plain, false, true)
    }

    pub(crate) fn requires_idle() -> Self {
        Self::new(OperationKind::RequiresIdle, true, false)
    }

    pub(crate) fn deferred_requires_idle() -> Self {
        Self::new(OperationKind::DeferredRequiresIdle, true, false)
    }

    pub(crate) fn requires_persistence() -> Self {
        Self::new(OperationKind::RequiresPersistence, true, true)
    }

    pub(crate) fn action_id(&self) -> u64 {
        self.action_id.load(Ordering::SeqCst)
    }

    pub(crate) fn stamp(&self, action_id: u64) {
        self.action_id.store(action_id, Ordering::SeqCst);
    }

    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }

    /// Grant the turn and wake the waiter.
    pub(crate) fn signal(&self) {
        self.notified.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Take back the turn; returns whether it was held.
    pub(crate) fn clear_notified(&self) -> bool {
        self.notified.swap(false, Ordering::SeqCst)
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn can_run(&self, state: &InstanceState, pause: &PauseSignal) -> bool {
        let controller = state.controller_state;
        match self.kind {
            OperationKind::Plain => true,
            OperationKind::RequiresIdle | OperationKind::DeferredRequiresIdle => {
                matches!(controller, Some(ControllerState::Idle | ControllerState::Complete))
            }
            OperationKind::RequiresPersistence => {
                if state.is_persistable || controller == Some(ControllerState::Complete) {
                    true
                } else {
                    pause.request_pause_when_persistable();
                    false
                }
            }
        }
    }

    /// Operations are always admitted in a terminal lifecycle so callers get a definitive error.
    pub(crate) fn can_dispatch(&self, state: &InstanceState, pause: &PauseSignal) -> bool {
        matches!(state.lifecycle, LifecycleState::Aborted | LifecycleState::Unloaded) || self.can_run(state, pause)
    }
}
