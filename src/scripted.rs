//! A step-list interpreter.
//!
//! [`ScriptedWorkflow`] is a small, deterministic [`ActivityGraph`]: the
//! workflow is a list of [`ScriptStep`]s executed in order. It is enough to
//! exercise every host path (idling on bookmarks, no-persist zones, faults,
//! cancellation, persistence round trips) without a real activity model.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};

use crate::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult, BookmarkScope};
use crate::controller::{
    ActivityGraph, ActivityInstanceState, CompletionState, Controller, ControllerState, DefinitionIdentity,
    PauseSignal, WorkflowFault,
};
use crate::tracking::TrackingRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptStep {
    /// Do a unit of work; reported as a custom tracking record.
    Work(String),
    /// Idle until every named bookmark was resumed. The first `not_ready`
    /// resumptions are answered with `NotReady`.
    WaitBookmarks { names: Vec<String>, not_ready: u32 },
    /// Set an output value.
    Output { name: String, value: Value },
    /// Copy an input argument to the outputs under the same name.
    EchoInput(String),
    BeginNoPersist,
    EndNoPersist,
    /// Raise an unhandled fault.
    Fail(String),
}

impl ScriptStep {
    pub fn work(name: impl Into<String>) -> Self {
        ScriptStep::Work(name.into())
    }

    pub fn bookmark(name: impl Into<String>) -> Self {
        Self::bookmarks([name])
    }

    pub fn bookmarks<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptStep::WaitBookmarks {
            names: names.into_iter().map(Into::into).collect(),
            not_ready: 0,
        }
    }

    /// Answer the first `count` resumptions of this wait with `NotReady`.
    pub fn not_ready(self, count: u32) -> Self {
        match self {
            ScriptStep::WaitBookmarks { names, .. } => ScriptStep::WaitBookmarks { names, not_ready: count },
            other => other,
        }
    }

    pub fn output(name: impl Into<String>, value: Value) -> Self {
        ScriptStep::Output {
            name: name.into(),
            value,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        ScriptStep::Fail(message.into())
    }
}

/// Workflow definition made of [`ScriptStep`]s.
#[derive(Debug, Clone)]
pub struct ScriptedWorkflow {
    steps: Vec<ScriptStep>,
    identity: Option<DefinitionIdentity>,
}

impl ScriptedWorkflow {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps, identity: None }
    }

    pub fn with_identity(mut self, identity: DefinitionIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
}

impl ActivityGraph for ScriptedWorkflow {
    fn identity(&self) -> Option<DefinitionIdentity> {
        self.identity.clone()
    }

    fn initialize(&self, inputs: BTreeMap<String, Value>) -> Result<Box<dyn Controller>, String> {
        let state = ScriptState {
            inputs,
            ..ScriptState::default()
        };
        Ok(Box::new(ScriptedController::new(self.steps.clone(), state)))
    }

    fn restore(&self, state: Value) -> Result<Box<dyn Controller>, String> {
        let state: ScriptState = serde_json::from_value(state).map_err(|e| format!("invalid script state: {e}"))?;
        if state.position > self.steps.len() {
            return Err(format!(
                "stored position {} is past the end of a {}-step script",
                state.position,
                self.steps.len()
            ));
        }
        Ok(Box::new(ScriptedController::new(self.steps.clone(), state)))
    }
}

/// Persisted part of a running script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ScriptState {
    position: usize,
    inputs: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Value>,
    completed_work: Vec<String>,
    received: BTreeSet<String>,
    not_ready_served: u32,
    no_persist: bool,
    cancel_requested: bool,
    termination: Option<WorkflowFault>,
    completion: Option<CompletionState>,
}

struct ScriptedController {
    steps: Vec<ScriptStep>,
    state: ScriptState,
    aborted: bool,
    fault: Option<WorkflowFault>,
    records: Vec<TrackingRecord>,
}

impl ScriptedController {
    fn new(steps: Vec<ScriptStep>, state: ScriptState) -> Self {
        Self {
            steps,
            state,
            aborted: false,
            fault: None,
            records: Vec::new(),
        }
    }

    /// Names of the current wait that are still outstanding.
    fn waiting_on(&self) -> Vec<&str> {
        match self.steps.get(self.state.position) {
            Some(ScriptStep::WaitBookmarks { names, .. }) if self.state.completion.is_none() => names
                .iter()
                .filter(|n| !self.state.received.contains(*n))
                .map(String::as_str)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn complete(&mut self, state: ActivityInstanceState, fault: Option<WorkflowFault>) {
        self.state.completion = Some(CompletionState {
            state,
            outputs: self.state.outputs.clone(),
            fault,
        });
    }

    fn advance(&mut self) {
        self.state.position += 1;
        self.state.received.clear();
        self.state.not_ready_served = 0;
    }

    /// Execute one step. Returns false when the script cannot go further.
    fn step(&mut self) -> bool {
        if let Some(fault) = self.state.termination.take() {
            self.complete(ActivityInstanceState::Faulted, Some(fault));
            return false;
        }
        if self.state.cancel_requested {
            self.state.cancel_requested = false;
            self.complete(ActivityInstanceState::Canceled, None);
            return false;
        }
        let Some(step) = self.steps.get(self.state.position).cloned() else {
            self.complete(ActivityInstanceState::Closed, None);
            return false;
        };
        match step {
            ScriptStep::Work(name) => {
                self.records.push(TrackingRecord::Custom {
                    name: "work".into(),
                    data: json!({ "step": name, "position": self.state.position }),
                });
                self.state.completed_work.push(name);
            }
            ScriptStep::WaitBookmarks { names, .. } => {
                if names.iter().any(|n| !self.state.received.contains(n)) {
                    return false;
                }
            }
            ScriptStep::Output { name, value } => {
                self.state.outputs.insert(name, value);
            }
            ScriptStep::EchoInput(name) => {
                let value = self.state.inputs.get(&name).cloned().unwrap_or(Value::Null);
                self.state.outputs.insert(name, value);
            }
            ScriptStep::BeginNoPersist => self.state.no_persist = true,
            ScriptStep::EndNoPersist => self.state.no_persist = false,
            ScriptStep::Fail(message) => {
                self.fault = Some(WorkflowFault::new(message).with_source(format!("step {}", self.state.position)));
                self.advance();
                return false;
            }
        }
        self.advance();
        true
    }
}

impl Controller for ScriptedController {
    fn state(&self) -> ControllerState {
        if self.aborted {
            ControllerState::Aborted
        } else if self.state.completion.is_some() {
            ControllerState::Complete
        } else if self.state.termination.is_none() && !self.state.cancel_requested && !self.waiting_on().is_empty() {
            ControllerState::Idle
        } else {
            ControllerState::Runnable
        }
    }

    fn is_persistable(&self) -> bool {
        !self.state.no_persist
    }

    fn run(&mut self, pause: &PauseSignal) {
        if self.aborted {
            return;
        }
        while self.step() {
            if pause.should_pause(self.is_persistable()) {
                break;
            }
        }
    }

    fn schedule_bookmark_resumption(
        &mut self,
        bookmark: &Bookmark,
        scope: Option<&BookmarkScope>,
        value: Value,
    ) -> BookmarkResumptionResult {
        if scope.is_some_and(|s| !s.is_default()) {
            return BookmarkResumptionResult::NotFound;
        }
        let Some(name) = bookmark.name() else {
            return BookmarkResumptionResult::NotFound;
        };
        if !self.waiting_on().contains(&name) {
            return BookmarkResumptionResult::NotFound;
        }
        if let Some(ScriptStep::WaitBookmarks { not_ready, .. }) = self.steps.get(self.state.position)
            && self.state.not_ready_served < *not_ready
        {
            self.state.not_ready_served += 1;
            return BookmarkResumptionResult::NotReady;
        }
        let name = name.to_string();
        self.state.outputs.insert(name.clone(), value);
        self.state.received.insert(name);
        BookmarkResumptionResult::Success
    }

    fn schedule_cancel(&mut self) {
        if self.state.completion.is_none() {
            self.state.cancel_requested = true;
        }
    }

    fn terminate(&mut self, fault: WorkflowFault) {
        if self.state.completion.is_none() {
            self.state.termination = Some(fault);
        }
    }

    fn abort(&mut self, _reason: &str) {
        self.aborted = true;
    }

    fn bookmarks(&self) -> Vec<BookmarkInfo> {
        let owner = format!("step {}", self.state.position);
        self.waiting_on()
            .into_iter()
            .map(|name| BookmarkInfo {
                owner_display_name: Some(owner.clone()),
                ..BookmarkInfo::new(name)
            })
            .collect()
    }

    fn take_unhandled_fault(&mut self) -> Option<WorkflowFault> {
        self.fault.take()
    }

    fn take_tracking_records(&mut self) -> Vec<TrackingRecord> {
        std::mem::take(&mut self.records)
    }

    fn completion_state(&self) -> Option<CompletionState> {
        self.state.completion.clone()
    }

    fn save_state(&self) -> Result<Value, String> {
        serde_json::to_value(&self.state).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(steps: Vec<ScriptStep>) -> Box<dyn Controller> {
        ScriptedWorkflow::new(steps)
            .initialize(BTreeMap::new())
            .expect("initialize")
    }

    #[test]
    fn runs_to_bookmark_then_completes() {
        let mut c = start(vec![
            ScriptStep::work("a"),
            ScriptStep::bookmark("go"),
            ScriptStep::output("done", json!(1)),
        ]);
        assert_eq!(c.state(), ControllerState::Runnable);
        c.run(&PauseSignal::new());
        assert_eq!(c.state(), ControllerState::Idle);
        assert_eq!(c.bookmarks()[0].bookmark_name, "go");
        assert_eq!(c.take_tracking_records().len(), 1);

        let result = c.schedule_bookmark_resumption(&"go".into(), None, json!("v"));
        assert_eq!(result, BookmarkResumptionResult::Success);
        assert_eq!(c.state(), ControllerState::Runnable);
        c.run(&PauseSignal::new());

        let completion = c.completion_state().expect("complete");
        assert_eq!(completion.state, ActivityInstanceState::Closed);
        assert_eq!(completion.outputs["go"], json!("v"));
        assert_eq!(completion.outputs["done"], json!(1));
    }

    #[test]
    fn not_ready_then_success() {
        let mut c = start(vec![ScriptStep::bookmark("b").not_ready(2)]);
        c.run(&PauseSignal::new());
        let bm: Bookmark = "b".into();
        assert_eq!(c.schedule_bookmark_resumption(&bm, None, json!(0)), BookmarkResumptionResult::NotReady);
        assert_eq!(c.schedule_bookmark_resumption(&bm, None, json!(0)), BookmarkResumptionResult::NotReady);
        assert_eq!(c.schedule_bookmark_resumption(&bm, None, json!(0)), BookmarkResumptionResult::Success);
        assert_eq!(
            c.schedule_bookmark_resumption(&"other".into(), None, json!(0)),
            BookmarkResumptionResult::NotFound
        );
    }

    #[test]
    fn pause_stops_between_steps() {
        let mut c = start(vec![ScriptStep::work("a"), ScriptStep::work("b"), ScriptStep::work("c")]);
        let pause = PauseSignal::new();
        pause.request_pause();
        c.run(&pause);
        assert_eq!(c.state(), ControllerState::Runnable);
        assert_eq!(c.take_tracking_records().len(), 1);
    }

    #[test]
    fn fail_reports_fault_and_terminate_completes_faulted() {
        let mut c = start(vec![ScriptStep::fail("boom"), ScriptStep::work("never")]);
        c.run(&PauseSignal::new());
        let fault = c.take_unhandled_fault().expect("fault");
        assert_eq!(fault.message, "boom");
        assert_eq!(fault.source.as_deref(), Some("step 0"));

        c.terminate(WorkflowFault::termination("boom"));
        c.run(&PauseSignal::new());
        let completion = c.completion_state().expect("complete");
        assert_eq!(completion.state, ActivityInstanceState::Faulted);
        assert!(completion.fault.expect("fault").is_termination);
    }

    #[test]
    fn no_persist_zone_and_restore() {
        let graph = ScriptedWorkflow::new(vec![
            ScriptStep::BeginNoPersist,
            ScriptStep::bookmark("inside"),
            ScriptStep::EndNoPersist,
            ScriptStep::bookmark("outside"),
        ]);
        let mut c = graph.initialize(BTreeMap::new()).expect("initialize");
        c.run(&PauseSignal::new());
        assert!(!c.is_persistable());
        c.schedule_bookmark_resumption(&"inside".into(), None, json!(1));
        c.run(&PauseSignal::new());
        assert!(c.is_persistable());

        let restored = graph.restore(c.save_state().expect("save")).expect("restore");
        assert_eq!(restored.state(), ControllerState::Idle);
        assert_eq!(restored.bookmarks()[0].bookmark_name, "outside");
    }

    #[test]
    fn restore_rejects_foreign_state() {
        let graph = ScriptedWorkflow::new(vec![ScriptStep::work("a")]);
        assert!(graph.restore(json!({"position": 7})).is_err());
        assert!(graph.restore(json!("garbage")).is_err());
    }
}
