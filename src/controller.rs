//! Interfaces to the activity interpreter.
//!
//! The host never looks inside a running workflow. An [`ActivityGraph`]
//! creates or restores a [`Controller`]. The host then drives that controller
//! through `run`, bookmark resumption, cancellation, termination and abort.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult, BookmarkScope};
use crate::tracking::TrackingRecord;

/// Interpreter state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    /// Work is scheduled; `run` will make progress.
    Runnable,
    /// Parked on bookmarks.
    Idle,
    /// The root activity closed, canceled or faulted.
    Complete,
    /// The interpreter was aborted and must not be used.
    Aborted,
}

/// Final state of the root activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    Closed,
    Canceled,
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFault {
    pub message: String,
    /// Display name of the activity that raised the fault, if known.
    pub source: Option<String>,
    /// True when the fault was produced by `terminate`.
    pub is_termination: bool,
}

impl WorkflowFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            is_termination: false,
        }
    }

    pub fn termination(reason: impl Into<String>) -> Self {
        Self {
            message: reason.into(),
            source: None,
            is_termination: true,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl std::fmt::Display for WorkflowFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{} (in {source})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionState {
    pub state: ActivityInstanceState,
    pub outputs: BTreeMap<String, Value>,
    pub fault: Option<WorkflowFault>,
}

/// Name and version of a workflow definition.
///
/// Stored alongside persisted instances and compared on load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionIdentity {
    pub name: String,
    pub version: Option<semver::Version>,
}

impl DefinitionIdentity {
    pub fn new(name: impl Into<String>, version: Option<semver::Version>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for DefinitionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}; Version={v}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Default)]
struct PauseInner {
    pause: AtomicBool,
    when_persistable: AtomicBool,
}

/// Cooperative pause request observed by [`Controller::run`].
///
/// The scheduler sets it from any thread when an interrupting operation is
/// queued. The interpreter checks it between work items.
#[derive(Debug, Clone, Default)]
pub struct PauseSignal {
    inner: Arc<PauseInner>,
}

impl PauseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Pause at the next point where the interpreter is persistable.
    pub fn request_pause_when_persistable(&self) {
        self.inner.when_persistable.store(true, Ordering::SeqCst);
    }

    pub fn should_pause(&self, is_persistable: bool) -> bool {
        self.inner.pause.load(Ordering::SeqCst) || (is_persistable && self.inner.when_persistable.load(Ordering::SeqCst))
    }

    pub fn reset(&self) {
        self.inner.pause.store(false, Ordering::SeqCst);
        self.inner.when_persistable.store(false, Ordering::SeqCst);
    }
}

/// The activity interpreter for one instance.
///
/// Every method is called by the host while it holds the instance's turn, so
/// calls are never concurrent. `run` is synchronous. It executes work until
/// the instance idles, completes, or `pause` asks it to stop.
pub trait Controller: Send {
    fn state(&self) -> ControllerState;

    /// Whether the instance may be persisted right now (outside no-persist zones).
    fn is_persistable(&self) -> bool {
        true
    }

    fn run(&mut self, pause: &PauseSignal);

    fn schedule_bookmark_resumption(
        &mut self,
        bookmark: &Bookmark,
        scope: Option<&BookmarkScope>,
        value: Value,
    ) -> BookmarkResumptionResult;

    /// Request cancellation of the root activity; takes effect on the next `run`.
    fn schedule_cancel(&mut self);

    /// Schedule termination with `fault`; takes effect on the next `run`.
    fn terminate(&mut self, fault: WorkflowFault);

    fn abort(&mut self, reason: &str);

    fn bookmarks(&self) -> Vec<BookmarkInfo>;

    /// Fault raised during the last `run` and not handled inside the workflow.
    fn take_unhandled_fault(&mut self) -> Option<WorkflowFault>;

    /// Tracking records produced since the last call.
    fn take_tracking_records(&mut self) -> Vec<TrackingRecord> {
        Vec::new()
    }

    /// `Some` once the controller is `Complete`.
    fn completion_state(&self) -> Option<CompletionState>;

    /// Serialize the runtime state for persistence.
    fn save_state(&self) -> Result<Value, String>;
}

/// A prepared, validated workflow definition.
pub trait ActivityGraph: Send + Sync {
    fn identity(&self) -> Option<DefinitionIdentity> {
        None
    }

    /// Create a fresh interpreter with the given inputs.
    fn initialize(&self, inputs: BTreeMap<String, Value>) -> Result<Box<dyn Controller>, String>;

    /// Recreate an interpreter from a value produced by [`Controller::save_state`].
    fn restore(&self, state: Value) -> Result<Box<dyn Controller>, String>;
}
