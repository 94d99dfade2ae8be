use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::bookmark::BookmarkInfo;
use crate::controller::{ActivityInstanceState, WorkflowFault};

#[derive(Debug, Clone)]
pub struct IdleEventArgs {
    pub instance_id: Uuid,
    pub bookmarks: Vec<BookmarkInfo>,
}

#[derive(Debug, Clone)]
pub struct CompletedEventArgs {
    pub instance_id: Uuid,
    pub completion_state: ActivityInstanceState,
    pub outputs: BTreeMap<String, Value>,
    /// Set when the instance faulted or was terminated.
    pub termination_fault: Option<WorkflowFault>,
}

#[derive(Debug, Clone)]
pub struct UnloadedEventArgs {
    pub instance_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct AbortedEventArgs {
    pub instance_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct UnhandledExceptionEventArgs {
    pub instance_id: Uuid,
    pub fault: WorkflowFault,
}

/// What to do when an instance becomes idle at a persistable point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistableIdleAction {
    #[default]
    None,
    Persist,
    Unload,
}

/// What to do with a fault the workflow did not handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnhandledExceptionAction {
    #[default]
    Terminate,
    Cancel,
    Abort,
}

pub(crate) type Handler<A> = Box<dyn Fn(A) + Send + Sync>;
pub(crate) type DecidingHandler<A, R> = Box<dyn Fn(A) -> R + Send + Sync>;

/// Host callbacks, fixed when the application is built.
#[derive(Default)]
pub(crate) struct WorkflowHandlers {
    pub(crate) on_idle: Option<Handler<IdleEventArgs>>,
    pub(crate) on_persistable_idle: Option<DecidingHandler<IdleEventArgs, PersistableIdleAction>>,
    pub(crate) on_completed: Option<Handler<CompletedEventArgs>>,
    pub(crate) on_unloaded: Option<Handler<UnloadedEventArgs>>,
    pub(crate) on_aborted: Option<Handler<AbortedEventArgs>>,
    pub(crate) on_unhandled_exception: Option<DecidingHandler<UnhandledExceptionEventArgs, UnhandledExceptionAction>>,
}
