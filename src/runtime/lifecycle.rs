use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use super::deadline::Deadline;
use super::events::AbortedEventArgs;
use super::operation::InstanceOperation;
use super::{InstanceCore, InstanceState, lock};
use crate::WorkflowError;
use crate::controller::ControllerState;
use crate::tracking::{InstanceTrackingState, TrackingRecord};

/// Host-side lifecycle of an instance.
///
/// `Paused` is the state of a created or loaded instance before its first
/// `run`. `Aborted` is reachable from anywhere and is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Paused,
    Runnable,
    Unloaded,
    Aborted,
}

impl InstanceState {
    fn aborted_error(&self) -> WorkflowError {
        WorkflowError::Aborted {
            instance: self.instance_id,
            reason: self.abort_reason.clone().unwrap_or_default(),
        }
    }

    pub(crate) fn throw_if_aborted(&self) -> Result<(), WorkflowError> {
        if self.lifecycle == LifecycleState::Aborted {
            return Err(self.aborted_error());
        }
        Ok(())
    }

    pub(crate) fn throw_if_unloaded(&self) -> Result<(), WorkflowError> {
        if self.lifecycle == LifecycleState::Unloaded {
            return Err(WorkflowError::Unloaded {
                instance: self.instance_id,
            });
        }
        Ok(())
    }

    pub(crate) fn throw_if_terminal(&self) -> Result<(), WorkflowError> {
        self.throw_if_aborted()?;
        self.throw_if_unloaded()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.controller_state == Some(ControllerState::Complete)
    }

    /// `Completed` or `Terminated`, depending on how the interpreter finished.
    pub(crate) fn throw_if_completed(&self) -> Result<(), WorkflowError> {
        if !self.is_complete() {
            return Ok(());
        }
        Err(match &self.termination_reason {
            Some(reason) => WorkflowError::Terminated {
                instance: self.instance_id,
                reason: reason.clone(),
            },
            None => WorkflowError::Completed {
                instance: self.instance_id,
            },
        })
    }

    /// `run`, `terminate`, `get_bookmarks`.
    pub(crate) fn validate_runnable(&self) -> Result<(), WorkflowError> {
        self.throw_if_terminal()?;
        self.throw_if_completed()
    }

    pub(crate) fn validate_persist(&self, has_store: bool) -> Result<(), WorkflowError> {
        self.throw_if_terminal()?;
        if !has_store {
            return Err(WorkflowError::StoreRequired);
        }
        self.throw_if_completed()
    }

    pub(crate) fn validate_unload(&self, has_store: bool) -> Result<(), WorkflowError> {
        self.throw_if_terminal()?;
        if !has_store {
            return Err(WorkflowError::StoreRequired);
        }
        Ok(())
    }

    pub(crate) fn validate_load(&self) -> Result<(), WorkflowError> {
        self.throw_if_terminal()?;
        if self.is_initialized || self.has_called_run || self.lifecycle != LifecycleState::Paused {
            return Err(WorkflowError::InvalidState(
                "the instance is already initialized; load must be the first operation".into(),
            ));
        }
        Ok(())
    }
}

impl InstanceCore {
    /// Mark the instance aborted and fence concurrent persistence.
    ///
    /// Returns false if abort was already called.
    pub(crate) fn begin_abort(&self, reason: &str) -> bool {
        {
            let mut st = lock(&self.state);
            if st.has_called_abort {
                return false;
            }
            st.has_called_abort = true;
            st.lifecycle = LifecycleState::Aborted;
            st.abort_reason = Some(reason.to_string());
        }
        self.aborted.store(true, Ordering::SeqCst);
        warn!(instance = %self.id(), reason, "aborting workflow instance");

        if let Some(context) = lock(&self.in_flight_context).clone() {
            context.abort();
        }
        if self.pipeline_in_use.load(Ordering::SeqCst) {
            for module in &self.modules {
                module.abort();
            }
        }
        if let Some(provider) = self.persistence_provider() {
            provider.abort();
        }
        self.pause.request_pause();
        true
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Abort while already holding the turn (dispatch loop or handler thread).
    pub(crate) fn abort_in_turn(self: &Arc<Self>, reason: &str) {
        if !self.begin_abort(reason) {
            return;
        }
        self.abort_controller(reason);
        self.schedule_aborted_notification(reason.to_string());
    }

    fn abort_controller(&self, reason: &str) {
        if lock(&self.state).is_initialized {
            let _ = self.with_controller(|c| c.abort(reason));
        }
    }

    /// Abort from a host thread: fence first, then take the turn ahead of the queue.
    pub(crate) async fn abort_core(self: &Arc<Self>, reason: &str) -> Result<(), WorkflowError> {
        if self.is_handler_thread() {
            self.abort_in_turn(reason);
            return Ok(());
        }
        if !self.begin_abort(reason) {
            return Ok(());
        }
        let turn = self
            .acquire_turn(InstanceOperation::plain_uninitialized(), true, &Deadline::infinite(), "abort")
            .await?;
        self.abort_controller(reason);
        turn.release().await;
        self.schedule_aborted_notification(reason.to_string());
        Ok(())
    }

    /// Track and raise `Aborted` off the calling thread; tracking is best effort.
    fn schedule_aborted_notification(self: &Arc<Self>, reason: String) {
        let core = self.clone();
        tokio::spawn(async move {
            let id = core.id();
            core.tracking.add(TrackingRecord::instance_with_reason(
                id,
                InstanceTrackingState::Aborted,
                reason.clone(),
            ));
            let deadline = Deadline::after(core.options.internal_persistence_timeout);
            if let Err(e) = core.tracking.flush(&deadline).await {
                debug!(instance = %id, error = %e, "dropping tracking records of aborted instance");
            }
            if let Some(provider) = core.persistence_provider() {
                provider.release_after_abort().await;
            }
            if let Some(handler) = &core.handlers.on_aborted {
                let args = AbortedEventArgs {
                    instance_id: id,
                    reason,
                };
                if let Err(panic) = core.invoke_handler(|| handler(args)) {
                    warn!(instance = %id, panic = %panic, "aborted handler panicked");
                }
            }
        });
    }
}
