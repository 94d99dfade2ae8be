mod common;

use async_trait::async_trait;
use common::{EventLog, RecordingParticipant, approval_workflow, wait_until};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use wfhost::providers::{InMemoryInstanceStore, names};
use wfhost::scripted::{ScriptStep, ScriptedWorkflow};
use wfhost::{
    BookmarkResumptionResult, DefinitionIdentity, InstanceData, InstanceStore, InstanceTrackingState, InstanceValue,
    LifecycleState, PersistableIdleAction, PersistencePipelineModule, ProviderError, Transaction,
    TransactionOutcome, WorkflowApplication, WorkflowApplicationBuilder, WorkflowError,
};

fn store() -> InMemoryInstanceStore {
    InMemoryInstanceStore::new()
}

fn with_store(graph: Arc<ScriptedWorkflow>, store: &InMemoryInstanceStore) -> WorkflowApplicationBuilder {
    WorkflowApplication::builder(graph).instance_store(Arc::new(store.clone()))
}

async fn names_of(app: &WorkflowApplication) -> Vec<String> {
    app.get_bookmarks()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.bookmark_name)
        .collect()
}

#[tokio::test]
async fn persist_without_store_is_rejected() {
    let app = WorkflowApplication::new(approval_workflow());
    app.run().await.unwrap();

    assert!(matches!(app.persist().await, Err(WorkflowError::StoreRequired)));
    assert!(matches!(app.unload().await, Err(WorkflowError::StoreRequired)));
    assert_eq!(app.lifecycle_state(), LifecycleState::Runnable);
}

#[tokio::test]
async fn persist_unload_load_round_trip() {
    let store = store();
    let log = EventLog::new();
    let app = log.attach(with_store(approval_workflow(), &store)).build();
    app.run().await.unwrap();
    let before = names_of(&app).await;

    app.persist().await.unwrap();
    assert_eq!(store.instance_ids().await, vec![app.id()]);
    assert!(store.lock_owner(app.id()).await.is_some());

    app.unload().await.unwrap();
    assert_eq!(app.lifecycle_state(), LifecycleState::Unloaded);
    assert_eq!(log.entries(), vec!["idle", "unloaded"]);
    assert!(store.lock_owner(app.id()).await.is_none());
    assert_eq!(store.owner_count().await, 0);
    assert!(matches!(app.run().await, Err(WorkflowError::Unloaded { .. })));

    let participant = RecordingParticipant::new();
    let loaded = with_store(approval_workflow(), &store)
        .tracking_participant(participant.clone())
        .build();
    loaded.load(app.id()).await.unwrap();
    assert_eq!(loaded.id(), app.id());
    assert_eq!(names_of(&loaded).await, before);

    loaded.run().await.unwrap();
    assert_eq!(participant.instance_states()[0], InstanceTrackingState::Resumed);
}

#[tokio::test]
async fn completion_deletes_stored_instance() {
    let store = store();
    let log = EventLog::new();
    let app = log.attach(with_store(approval_workflow(), &store)).build();
    app.run().await.unwrap();
    app.persist().await.unwrap();
    assert_eq!(store.instance_ids().await.len(), 1);

    let result = app.resume_bookmark("approval", json!(true)).await.unwrap();

    assert_eq!(result, BookmarkResumptionResult::Success);
    assert_eq!(log.entries(), vec!["idle", "completed:Closed", "unloaded"]);
    assert_eq!(app.lifecycle_state(), LifecycleState::Unloaded);
    assert!(store.instance_ids().await.is_empty());
    assert_eq!(store.owner_count().await, 0);
}

#[tokio::test]
async fn persistable_idle_can_unload() {
    let store = store();
    let log = EventLog::new();
    let app = log
        .attach(with_store(approval_workflow(), &store))
        .on_persistable_idle(|args| {
            assert_eq!(args.bookmarks[0].bookmark_name, "approval");
            PersistableIdleAction::Unload
        })
        .build();

    app.run().await.unwrap();

    assert_eq!(log.entries(), vec!["idle", "unloaded"]);
    assert_eq!(app.lifecycle_state(), LifecycleState::Unloaded);
    let data = store.stored_data(app.id()).await.unwrap();
    assert_eq!(data[names::STATUS].value, json!("Idle"));
    assert!(data[names::BOOKMARKS].is_write_only());
}

#[tokio::test]
async fn persistable_idle_can_persist_and_keep_running() {
    let store = store();
    let app = with_store(approval_workflow(), &store)
        .on_persistable_idle(|_| PersistableIdleAction::Persist)
        .build();

    app.run().await.unwrap();

    assert_eq!(app.lifecycle_state(), LifecycleState::Runnable);
    assert_eq!(store.instance_ids().await, vec![app.id()]);
    assert!(store.lock_owner(app.id()).await.is_some());
}

#[tokio::test]
async fn locked_instance_cannot_be_loaded_elsewhere() {
    let store = store();
    let app = with_store(approval_workflow(), &store).build();
    app.run().await.unwrap();
    app.persist().await.unwrap();

    let other = with_store(approval_workflow(), &store).build();
    assert!(matches!(
        other.load(app.id()).await,
        Err(WorkflowError::InstanceLocked { instance }) if instance == app.id()
    ));
    // The failed load released the owner it registered.
    assert_eq!(store.owner_count().await, 1);
}

#[tokio::test]
async fn load_missing_instance() {
    let store = store();
    let app = with_store(approval_workflow(), &store).build();
    let missing = uuid::Uuid::new_v4();

    assert!(matches!(
        app.load(missing).await,
        Err(WorkflowError::InstanceNotFound { instance: Some(id) }) if id == missing
    ));
    assert_eq!(store.owner_count().await, 0);
}

#[tokio::test]
async fn definition_identity_must_match() {
    let store = store();
    let v1 = DefinitionIdentity::new("Approval", Some(semver::Version::new(1, 0, 0)));
    let v2 = DefinitionIdentity::new("Approval", Some(semver::Version::new(2, 0, 0)));
    let graph = |identity: &DefinitionIdentity| {
        Arc::new(
            ScriptedWorkflow::new(vec![ScriptStep::bookmark("approval")]).with_identity(identity.clone()),
        )
    };

    let app = with_store(graph(&v1), &store).build();
    app.run().await.unwrap();
    app.unload().await.unwrap();

    let wrong = with_store(graph(&v2), &store).build();
    match wrong.load(app.id()).await {
        Err(WorkflowError::VersionMismatch { expected, found, .. }) => {
            assert_eq!(expected, Some(v2.clone()));
            assert_eq!(found, Some(v1.clone()));
        }
        other => panic!("expected version mismatch, got {other:?}"),
    }

    let right = with_store(graph(&v1), &store).build();
    right.load(app.id()).await.unwrap();
    assert_eq!(names_of(&right).await, vec!["approval"]);
}

#[tokio::test]
async fn load_runnable_instance_picks_up_unloaded_work() {
    let store = store();
    let empty = with_store(approval_workflow(), &store).build();
    assert!(matches!(
        empty.load_runnable_instance().await,
        Err(WorkflowError::NoRunnableInstance)
    ));

    // Unloading a fresh instance stores it with work still to do.
    let fresh = with_store(approval_workflow(), &store).build();
    fresh.unload().await.unwrap();

    let worker = log_free_app(&store);
    worker.load_runnable_instance().await.unwrap();
    assert_eq!(worker.id(), fresh.id());
    worker.run().await.unwrap();
    assert_eq!(names_of(&worker).await, vec!["approval"]);
}

fn log_free_app(store: &InMemoryInstanceStore) -> WorkflowApplication {
    with_store(approval_workflow(), store).build()
}

#[tokio::test]
async fn snapshot_load_and_abandon() {
    let store = store();
    let app = with_store(approval_workflow(), &store).build();
    app.run().await.unwrap();
    app.unload().await.unwrap();
    let shared: Arc<dyn InstanceStore> = Arc::new(store.clone());

    let snapshot = WorkflowApplication::get_instance(shared.clone(), app.id(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(snapshot.instance_id(), app.id());
    assert_eq!(snapshot.definition_identity(), None);
    assert!(snapshot.values().contains_key(names::WORKFLOW));
    assert!(!snapshot.values().contains_key(names::BOOKMARKS));
    snapshot.abandon(Duration::from_secs(5)).await.unwrap();
    assert!(store.lock_owner(app.id()).await.is_none());

    let snapshot = WorkflowApplication::get_instance(shared, app.id(), Duration::from_secs(5))
        .await
        .unwrap();
    let loaded = with_store(approval_workflow(), &store).build();
    loaded.load_instance(snapshot).await.unwrap();
    assert_eq!(
        loaded.resume_bookmark("approval", json!(1)).await.unwrap(),
        BookmarkResumptionResult::Success
    );
}

#[tokio::test]
async fn no_persist_zone_blocks_persist() {
    let store = store();
    let app = with_store(
        Arc::new(ScriptedWorkflow::new(vec![
            ScriptStep::BeginNoPersist,
            ScriptStep::bookmark("inside"),
            ScriptStep::EndNoPersist,
            ScriptStep::bookmark("outside"),
        ])),
        &store,
    )
    .build();
    app.run().await.unwrap();

    let blocked = app.persist_with_timeout(Duration::from_millis(100)).await;
    assert!(matches!(blocked, Err(WorkflowError::Timeout { .. })));
    assert_eq!(app.pending_operation_count(), 0);

    app.resume_bookmark("inside", json!(1)).await.unwrap();
    app.persist().await.unwrap();
    assert_eq!(store.instance_ids().await, vec![app.id()]);
}

#[tokio::test]
async fn transactional_persist_is_visible_after_commit() {
    let store = store();
    let app = with_store(approval_workflow(), &store).build();
    app.run().await.unwrap();

    let tx = Transaction::new();
    app.persist_in_transaction(&tx, Duration::from_secs(5)).await.unwrap();
    assert!(store.instance_ids().await.is_empty());

    tx.commit().await.unwrap();
    assert_eq!(tx.outcome(), TransactionOutcome::Committed);
    assert_eq!(store.instance_ids().await, vec![app.id()]);
}

#[tokio::test]
async fn transactional_persist_rolled_back_writes_nothing() {
    let store = store();
    let app = with_store(approval_workflow(), &store).build();
    app.run().await.unwrap();

    let tx = Transaction::new();
    app.persist_in_transaction(&tx, Duration::from_secs(5)).await.unwrap();
    tx.rollback().await;

    assert!(store.instance_ids().await.is_empty());
    assert_eq!(app.lifecycle_state(), LifecycleState::Runnable);
    // A finished transaction cannot be joined again.
    assert!(matches!(
        app.persist_in_transaction(&tx, Duration::from_secs(5)).await,
        Err(WorkflowError::TransactionAborted(_))
    ));
}

#[tokio::test]
async fn transactional_unload_releases_owner_on_commit() {
    let store = store();
    let app = with_store(approval_workflow(), &store).build();
    app.run().await.unwrap();
    app.persist().await.unwrap();

    let tx = Transaction::new();
    app.unload_in_transaction(&tx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(store.owner_count().await, 1);

    tx.commit().await.unwrap();
    assert_eq!(app.lifecycle_state(), LifecycleState::Unloaded);
    assert!(store.lock_owner(app.id()).await.is_none());
    assert_eq!(store.owner_count().await, 0);
}

#[tokio::test]
async fn abort_wins_over_concurrent_unload() {
    let store = store();
    let log = EventLog::new();
    let app = log.attach(with_store(approval_workflow(), &store)).build();
    app.run().await.unwrap();
    app.persist().await.unwrap();

    let (aborted, unloaded) = tokio::join!(app.abort("x"), app.unload_with_timeout(Duration::from_secs(10)));

    aborted.unwrap();
    assert!(matches!(unloaded, Err(WorkflowError::Aborted { reason, .. }) if reason == "x"));
    assert_eq!(app.lifecycle_state(), LifecycleState::Aborted);
    assert_eq!(log.count("unloaded"), 0);
    assert!(wait_until(|| log.count("aborted:x") == 1, 2000).await);

    // The aborted instance gives up its owner, so another host can take over.
    let mut released = false;
    for _ in 0..400 {
        if store.lock_owner(app.id()).await.is_none() && store.owner_count().await == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(released);
    let next = with_store(approval_workflow(), &store).build();
    next.load(app.id()).await.unwrap();
}

#[derive(Default)]
struct RecordingModule {
    calls: Mutex<Vec<String>>,
    published: Mutex<Option<InstanceData>>,
}

impl RecordingModule {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistencePipelineModule for RecordingModule {
    fn collect(&self) -> InstanceData {
        self.calls.lock().unwrap().push("collect".into());
        InstanceData::from([("{urn:test}Audit".to_string(), InstanceValue::new(json!("audited")))])
    }

    fn map(&self, values: &InstanceData) -> InstanceData {
        self.calls.lock().unwrap().push("map".into());
        InstanceData::from([(
            "{urn:test}ValueCount".to_string(),
            InstanceValue::write_only(json!(values.len())),
        )])
    }

    fn is_io_participant(&self) -> bool {
        true
    }

    async fn save(&self, values: &InstanceData, _tx: &Transaction, _timeout: Duration) -> Result<(), ProviderError> {
        assert!(values.contains_key(names::WORKFLOW));
        self.calls.lock().unwrap().push("save".into());
        Ok(())
    }

    fn publish_values(&self, values: &InstanceData) {
        *self.published.lock().unwrap() = Some(values.clone());
    }

    async fn load(&self, _values: &InstanceData, _timeout: Duration) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push("load".into());
        Ok(())
    }

    fn dispose(&self) {
        self.calls.lock().unwrap().push("dispose".into());
    }
}

#[tokio::test]
async fn pipeline_modules_join_persist_and_load() {
    let store = store();
    let module = Arc::new(RecordingModule::default());
    let app = with_store(approval_workflow(), &store)
        .persistence_module(module.clone())
        .build();
    app.run().await.unwrap();

    app.unload().await.unwrap();
    assert_eq!(module.calls(), vec!["collect", "map", "save", "dispose"]);
    let stored = store.stored_data(app.id()).await.unwrap();
    assert_eq!(stored["{urn:test}Audit"].value, json!("audited"));
    assert!(stored["{urn:test}ValueCount"].is_write_only());

    let reader = Arc::new(RecordingModule::default());
    let loaded = with_store(approval_workflow(), &store)
        .persistence_module(reader.clone())
        .build();
    loaded.load(app.id()).await.unwrap();
    assert_eq!(reader.calls(), vec!["load"]);
    let published = reader.published.lock().unwrap().clone().unwrap();
    assert!(published.contains_key("{urn:test}Audit"));
    assert!(!published.contains_key("{urn:test}ValueCount"));
}

#[tokio::test]
async fn module_only_persistence_needs_no_store() {
    let module = Arc::new(RecordingModule::default());
    let app = WorkflowApplication::builder(approval_workflow())
        .persistence_module(module.clone())
        .build();
    app.run().await.unwrap();

    app.persist().await.unwrap();
    assert_eq!(module.calls(), vec!["collect", "map", "save"]);
}

/// I/O participant whose save blocks until the gate opens.
struct GatedSaveModule {
    entered: AtomicBool,
    gate: Semaphore,
}

#[async_trait]
impl PersistencePipelineModule for GatedSaveModule {
    fn is_io_participant(&self) -> bool {
        true
    }

    async fn save(&self, _values: &InstanceData, _tx: &Transaction, _timeout: Duration) -> Result<(), ProviderError> {
        self.entered.store(true, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| ProviderError::permanent("save", e.to_string()))?;
        Ok(())
    }
}

#[tokio::test]
async fn abort_during_in_flight_persist_never_commits() {
    let store = store();
    let module = Arc::new(GatedSaveModule {
        entered: AtomicBool::new(false),
        gate: Semaphore::new(0),
    });
    let app = with_store(approval_workflow(), &store)
        .persistence_module(module.clone())
        .build();
    app.run().await.unwrap();

    let persister = app.clone();
    let persist = tokio::spawn(async move { persister.persist().await });
    assert!(wait_until(|| module.entered.load(Ordering::SeqCst), 2000).await);

    let aborter = app.clone();
    let abort = tokio::spawn(async move { aborter.abort("x").await });
    assert!(wait_until(|| app.lifecycle_state() == LifecycleState::Aborted, 2000).await);
    module.gate.add_permits(1);

    let persisted = persist.await.unwrap();
    assert!(matches!(persisted, Err(WorkflowError::Aborted { reason, .. }) if reason == "x"));
    abort.await.unwrap().unwrap();
    assert_eq!(app.lifecycle_state(), LifecycleState::Aborted);
    assert!(store.instance_ids().await.is_empty());
}
