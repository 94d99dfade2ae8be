#![allow(dead_code)]

pub mod tracing_capture;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wfhost::providers::SqliteInstanceStore;
use wfhost::scripted::{ScriptStep, ScriptedWorkflow};
use wfhost::{
    InstanceStore, InstanceTrackingState, TrackingEvent, TrackingParticipant, TrackingRecord,
    WorkflowApplicationBuilder, WorkflowApplication,
};

/// Ordered log of host notifications ("idle", "completed:Closed", "unloaded", "aborted:reason").
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Register idle, completed, unloaded and aborted handlers that append here.
    pub fn attach(&self, builder: WorkflowApplicationBuilder) -> WorkflowApplicationBuilder {
        let (idle, completed, unloaded, aborted) = (self.clone(), self.clone(), self.clone(), self.clone());
        builder
            .on_idle(move |_| idle.push("idle"))
            .on_completed(move |args| completed.push(format!("completed:{:?}", args.completion_state)))
            .on_unloaded(move |_| unloaded.push("unloaded"))
            .on_aborted(move |args| aborted.push(format!("aborted:{}", args.reason)))
    }
}

/// Tracking participant that keeps every event, optionally slowly.
#[derive(Default)]
pub struct RecordingParticipant {
    events: Mutex<Vec<TrackingEvent>>,
    delay: Option<Duration>,
}

impl RecordingParticipant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn events(&self) -> Vec<TrackingEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn instance_states(&self) -> Vec<InstanceTrackingState> {
        self.events()
            .iter()
            .filter_map(|e| e.record.instance_state())
            .collect()
    }

    pub fn resumed_bookmarks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.record {
                TrackingRecord::BookmarkResumption { bookmark, .. } => Some(bookmark),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TrackingParticipant for RecordingParticipant {
    async fn track(&self, event: &TrackingEvent, _timeout: Duration) -> Result<(), String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Poll `predicate` until it holds or `timeout_ms` passes.
pub async fn wait_until<F>(predicate: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn approval_workflow() -> Arc<ScriptedWorkflow> {
    Arc::new(ScriptedWorkflow::new(vec![
        ScriptStep::work("validate"),
        ScriptStep::bookmark("approval"),
        ScriptStep::work("ship"),
    ]))
}

/// App over `graph` with the event log attached.
pub fn logged_app(graph: Arc<ScriptedWorkflow>, log: &EventLog) -> WorkflowApplication {
    log.attach(WorkflowApplication::builder(graph)).build()
}

pub async fn create_sqlite_store_disk() -> (Arc<dyn InstanceStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteInstanceStore::new(&db_url).await.unwrap()) as Arc<dyn InstanceStore>;
    (store, td)
}
