//! Dispatch loop.
//!
//! Runs whenever a notified operation releases the turn. Each pass picks one
//! step, in priority order: raise completion, hand the turn to the next
//! runnable queued operation, raise idle, run the interpreter. When none of
//! these applies, the instance becomes free.

use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::deadline::Deadline;
use super::events::{
    CompletedEventArgs, IdleEventArgs, PersistableIdleAction, UnhandledExceptionAction, UnhandledExceptionEventArgs,
    UnloadedEventArgs,
};
use super::persist::PersistenceOperation;
use super::{InstanceCore, InstanceState, LifecycleState, lock};
use crate::controller::{ActivityInstanceState, ControllerState, WorkflowFault};
use crate::tracking::{InstanceTrackingState, TrackingRecord};

#[derive(Debug, PartialEq, Eq)]
enum DispatchStep {
    RaiseCompleted,
    /// A queued operation now holds the turn.
    Notify,
    RaiseIdle,
    Run,
    Done,
}

impl InstanceCore {
    fn next_dispatch_step(&self, st: &mut InstanceState) -> DispatchStep {
        self.pause.reset();

        if st.is_complete() && !st.has_raised_completed && st.lifecycle != LifecycleState::Aborted {
            st.has_raised_completed = true;
            return DispatchStep::RaiseCompleted;
        }

        let next = st
            .pending_operations
            .iter()
            .position(|op| op.can_dispatch(st, &self.pause));
        if let Some(op) = next.and_then(|index| st.pending_operations.remove(index)) {
            st.action_counter += 1;
            op.signal();
            trace!(
                instance = %st.instance_id,
                kind = ?op.kind,
                queued_at = op.action_id(),
                action = st.action_counter,
                "operation dispatched"
            );
            return DispatchStep::Notify;
        }

        let is_idle = st.controller_state == Some(ControllerState::Idle);
        if is_idle
            && st.has_execution_occurred_since_last_idle
            && st.pending_unenqueued == 0
            && !st.has_raised_completed
            && st.lifecycle == LifecycleState::Runnable
        {
            st.has_execution_occurred_since_last_idle = false;
            return DispatchStep::RaiseIdle;
        }

        let is_runnable = st.controller_state == Some(ControllerState::Runnable);
        if st.lifecycle == LifecycleState::Runnable && st.is_initialized && (is_runnable || (is_idle && st.run_requested)) {
            st.run_requested = false;
            st.has_execution_occurred_since_last_idle = true;
            st.action_counter += 1;
            return DispatchStep::Run;
        }

        st.is_busy = false;
        DispatchStep::Done
    }

    /// Drive the instance until an operation holds the turn or nothing is left to do.
    pub(crate) async fn on_notify_paused(self: &Arc<Self>) {
        loop {
            let step = {
                let mut st = lock(&self.state);
                self.next_dispatch_step(&mut st)
            };
            match step {
                DispatchStep::RaiseCompleted => self.raise_completed().await,
                DispatchStep::RaiseIdle => self.raise_idle().await,
                DispatchStep::Run => self.run_controller(),
                DispatchStep::Notify | DispatchStep::Done => return,
            }
        }
    }

    fn run_controller(self: &Arc<Self>) {
        let pause = self.pause.clone();
        let outcome = self.with_controller(|c| {
            c.run(&pause);
            (c.take_unhandled_fault(), c.take_tracking_records())
        });
        let (fault, records) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(instance = %self.id(), error = %e, "interpreter run failed");
                return;
            }
        };
        for record in records {
            self.tracking.add(record);
        }
        trace!(instance = %self.id(), state = ?lock(&self.state).controller_state, "interpreter paused");
        if let Some(fault) = fault {
            self.handle_unhandled_fault(fault);
        }
    }

    fn handle_unhandled_fault(self: &Arc<Self>, fault: WorkflowFault) {
        let id = self.id();
        warn!(instance = %id, fault = %fault, "unhandled workflow fault");
        self.tracking.add(TrackingRecord::instance_with_reason(
            id,
            InstanceTrackingState::UnhandledException,
            fault.message.clone(),
        ));

        let action = match &self.handlers.on_unhandled_exception {
            Some(handler) => {
                let args = UnhandledExceptionEventArgs {
                    instance_id: id,
                    fault: fault.clone(),
                };
                match self.invoke_handler(|| handler(args)) {
                    Ok(action) => action,
                    Err(panic) => {
                        self.abort_in_turn(&panic);
                        return;
                    }
                }
            }
            None => UnhandledExceptionAction::default(),
        };

        let applied = match action {
            UnhandledExceptionAction::Terminate => {
                lock(&self.state).termination_reason = Some(fault.message.clone());
                self.with_controller(|c| {
                    c.terminate(WorkflowFault {
                        is_termination: true,
                        ..fault.clone()
                    })
                })
            }
            UnhandledExceptionAction::Cancel => self.with_controller(|c| c.schedule_cancel()),
            UnhandledExceptionAction::Abort => {
                self.abort_in_turn(&fault.message);
                Ok(())
            }
        };
        if let Err(e) = applied {
            self.abort_in_turn(&e.to_string());
        }
    }

    fn internal_deadline(&self) -> Deadline {
        Deadline::after(self.options.internal_persistence_timeout)
    }

    async fn raise_completed(self: &Arc<Self>) {
        let id = self.id();
        let completion = match self.with_controller(|c| c.completion_state()) {
            Ok(Some(completion)) => completion,
            Ok(None) | Err(_) => {
                self.abort_in_turn("the interpreter completed without a completion state");
                return;
            }
        };
        if let Some(fault) = &completion.fault
            && fault.is_termination
        {
            lock(&self.state)
                .termination_reason
                .get_or_insert_with(|| fault.message.clone());
        }
        let tracked = match completion.state {
            ActivityInstanceState::Closed => InstanceTrackingState::Completed,
            ActivityInstanceState::Canceled => InstanceTrackingState::Canceled,
            ActivityInstanceState::Faulted => InstanceTrackingState::Terminated,
        };
        debug!(instance = %id, state = ?completion.state, "workflow instance completed");

        self.tracking.add(TrackingRecord::instance(id, tracked));
        let deadline = self.internal_deadline();
        if let Err(e) = self.tracking.flush(&deadline).await {
            self.abort_in_turn(&e.to_string());
            return;
        }

        if let Some(handler) = &self.handlers.on_completed {
            let args = CompletedEventArgs {
                instance_id: id,
                completion_state: completion.state,
                outputs: completion.outputs,
                termination_fault: completion.fault,
            };
            if let Err(panic) = self.invoke_handler(|| handler(args)) {
                self.abort_in_turn(&panic);
                return;
            }
        }

        if self.has_persistence_target() && !self.is_aborted() {
            match self.persist_core(PersistenceOperation::Complete, None, &deadline).await {
                Ok(()) => self.raise_unloaded(),
                Err(e) => {
                    warn!(instance = %id, error = %e, "failed to persist completed instance");
                    self.abort_in_turn(&e.to_string());
                }
            }
        }
    }

    async fn raise_idle(self: &Arc<Self>) {
        let id = self.id();
        let bookmarks = self.with_controller(|c| c.bookmarks()).unwrap_or_default();
        self.tracking.add(TrackingRecord::instance(id, InstanceTrackingState::Idle));
        let deadline = self.internal_deadline();
        if let Err(e) = self.tracking.flush(&deadline).await {
            self.abort_in_turn(&e.to_string());
            return;
        }

        let args = IdleEventArgs {
            instance_id: id,
            bookmarks,
        };
        if let Some(handler) = &self.handlers.on_idle {
            let args = args.clone();
            if let Err(panic) = self.invoke_handler(|| handler(args)) {
                self.abort_in_turn(&panic);
                return;
            }
        }

        let persistable = lock(&self.state).is_persistable;
        if !self.has_store() || !persistable || self.is_aborted() {
            return;
        }
        let action = match &self.handlers.on_persistable_idle {
            Some(handler) => match self.invoke_handler(|| handler(args)) {
                Ok(action) => action,
                Err(panic) => {
                    self.abort_in_turn(&panic);
                    return;
                }
            },
            None => PersistableIdleAction::None,
        };

        let operation = match action {
            PersistableIdleAction::None => return,
            PersistableIdleAction::Persist => PersistenceOperation::Save,
            PersistableIdleAction::Unload => PersistenceOperation::Unload,
        };
        match self.persist_core(operation, None, &deadline).await {
            Ok(()) if operation == PersistenceOperation::Unload => self.raise_unloaded(),
            Ok(()) => {}
            Err(e) => {
                warn!(instance = %id, error = %e, ?operation, "persistable idle action failed");
                self.abort_in_turn(&e.to_string());
            }
        }
    }

    pub(super) fn raise_unloaded(self: &Arc<Self>) {
        if let Some(handler) = &self.handlers.on_unloaded {
            let args = UnloadedEventArgs { instance_id: self.id() };
            if let Err(panic) = self.invoke_handler(|| handler(args)) {
                self.abort_in_turn(&panic);
            }
        }
    }
}
