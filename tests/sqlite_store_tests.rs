mod common;

use common::{EventLog, approval_workflow, create_sqlite_store_disk};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wfhost::providers::{ProviderErrorKind, SaveCommand, SqliteInstanceStore, names};
use wfhost::{
    BookmarkResumptionResult, InstanceData, InstanceStore, InstanceValue, LifecycleState, Transaction,
    WorkflowApplication, WorkflowError,
};

const LEASE: Duration = Duration::from_secs(30);

fn save_command(runnable: bool) -> SaveCommand {
    SaveCommand {
        data: InstanceData::from([
            (names::WORKFLOW.to_string(), InstanceValue::new(json!({"position": 1}))),
            (names::LAST_UPDATE.to_string(), InstanceValue::write_only(json!(0))),
        ]),
        runnable,
        unlock: false,
        complete: false,
    }
}

#[tokio::test]
async fn unloaded_instance_survives_reopening_the_database() {
    let td = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", td.path().join("instances.db").display());

    let id = {
        let store = Arc::new(SqliteInstanceStore::new(&url).await.unwrap());
        let app = WorkflowApplication::builder(approval_workflow())
            .instance_store(store.clone())
            .build();
        app.run().await.unwrap();
        app.unload().await.unwrap();
        assert_eq!(store.instance_ids().await.unwrap(), vec![app.id()]);
        assert_eq!(store.lock_owner(app.id()).await.unwrap(), None);
        app.id()
    };

    let store = Arc::new(SqliteInstanceStore::new(&url).await.unwrap());
    let log = EventLog::new();
    let app = log
        .attach(WorkflowApplication::builder(approval_workflow()).instance_store(store.clone()))
        .build();
    app.load(id).await.unwrap();

    let result = app.resume_bookmark("approval", json!("approved")).await.unwrap();

    assert_eq!(result, BookmarkResumptionResult::Success);
    assert_eq!(log.entries(), vec!["completed:Closed", "unloaded"]);
    assert!(store.instance_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn two_hosts_contend_for_one_instance() {
    let (store, _td) = create_sqlite_store_disk().await;
    let first = WorkflowApplication::builder(approval_workflow())
        .instance_store(store.clone())
        .build();
    first.run().await.unwrap();
    first.persist().await.unwrap();

    let second = WorkflowApplication::builder(approval_workflow())
        .instance_store(store.clone())
        .build();
    assert!(matches!(
        second.load(first.id()).await,
        Err(WorkflowError::InstanceLocked { .. })
    ));

    first.unload().await.unwrap();
    let third = WorkflowApplication::builder(approval_workflow())
        .instance_store(store)
        .build();
    third.load(first.id()).await.unwrap();
    assert_eq!(third.lifecycle_state(), LifecycleState::Runnable);
}

#[tokio::test]
async fn runnable_instances_are_handed_out_once() {
    let (store, _td) = create_sqlite_store_disk().await;
    let fresh = WorkflowApplication::builder(approval_workflow())
        .instance_store(store.clone())
        .build();
    fresh.unload().await.unwrap();

    let worker = WorkflowApplication::builder(approval_workflow())
        .instance_store(store.clone())
        .build();
    worker.load_runnable_instance().await.unwrap();
    assert_eq!(worker.id(), fresh.id());

    let other = WorkflowApplication::builder(approval_workflow())
        .instance_store(store)
        .build();
    assert!(matches!(
        other.load_runnable_instance().await,
        Err(WorkflowError::NoRunnableInstance)
    ));
}

#[tokio::test]
async fn save_is_deferred_until_commit() {
    let store = SqliteInstanceStore::new_in_memory().await.unwrap();
    let owner = store.create_owner(LEASE).await.unwrap();
    let id = uuid::Uuid::new_v4();

    let tx = Transaction::new();
    store.save_instance(owner, id, save_command(true), &tx).await.unwrap();
    assert_eq!(store.lock_owner(id).await.unwrap(), Some(owner));
    assert!(store.instance_ids().await.unwrap().is_empty());

    tx.commit().await.unwrap();
    assert_eq!(store.instance_ids().await.unwrap(), vec![id]);

    let loaded = store.load_instance(owner, id).await.unwrap();
    assert!(loaded.contains_key(names::WORKFLOW));
    assert!(!loaded.contains_key(names::LAST_UPDATE));
}

#[tokio::test]
async fn deleted_owner_releases_its_locks() {
    let store = SqliteInstanceStore::new_in_memory().await.unwrap();
    let a = store.create_owner(LEASE).await.unwrap();
    let b = store.create_owner(LEASE).await.unwrap();
    let id = uuid::Uuid::new_v4();
    let tx = Transaction::new();
    store.save_instance(a, id, save_command(false), &tx).await.unwrap();
    tx.commit().await.unwrap();

    let err = store.lock_instance(b, id).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::InstanceLocked(id));
    assert!(err.is_retryable());

    store.delete_owner(a).await.unwrap();
    store.lock_instance(b, id).await.unwrap();
    assert_eq!(store.lock_owner(id).await.unwrap(), Some(b));

    let err = store.renew_owner(a, LEASE).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::OwnerNotFound);
}

#[tokio::test]
async fn load_of_unknown_instance_is_not_found() {
    let store = SqliteInstanceStore::new_in_memory().await.unwrap();
    let owner = store.create_owner(LEASE).await.unwrap();
    let id = uuid::Uuid::new_v4();

    let err = store.load_instance(owner, id).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::InstanceNotFound(id));
    assert!(!err.is_retryable());
    assert_eq!(store.lock_owner(id).await.unwrap(), None);
}
