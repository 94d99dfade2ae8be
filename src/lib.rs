//! # wfhost
//!
//! A durable workflow execution host. A [`WorkflowApplication`] owns one
//! workflow instance: it drives an interpreter ([`Controller`]) to completion or
//! to a bookmark, persists and restores it through an [`InstanceStore`], and
//! lets many concurrent hosts resume it by bookmark name.
//!
//! All host calls are serialized through a turn-taking scheduler. Exactly one
//! operation at a time holds the instance's turn; everything else waits in a
//! queue, while I/O (store writes, tracking flushes) overlaps freely.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wfhost::scripted::{ScriptStep, ScriptedWorkflow};
//! use wfhost::{BookmarkResumptionResult, WorkflowApplication};
//!
//! # async fn demo() -> Result<(), wfhost::WorkflowError> {
//! let graph = Arc::new(ScriptedWorkflow::new(vec![
//!     ScriptStep::work("validate"),
//!     ScriptStep::bookmark("approval"),
//!     ScriptStep::work("ship"),
//! ]));
//! let app = WorkflowApplication::builder(graph)
//!     .on_completed(|args| println!("done: {:?}", args.completion_state))
//!     .build();
//!
//! app.run().await?;
//! let result = app.resume_bookmark("approval", serde_json::json!(true)).await?;
//! assert_eq!(result, BookmarkResumptionResult::Success);
//! # Ok(())
//! # }
//! ```

pub mod bookmark;
pub mod controller;
mod error;
pub mod observability;
pub mod providers;
pub mod runtime;
pub mod scripted;
pub mod tracking;
pub mod transaction;

pub use bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult, BookmarkScope, BookmarkScopeInfo};
pub use controller::{
    ActivityGraph, ActivityInstanceState, CompletionState, Controller, ControllerState, DefinitionIdentity,
    PauseSignal, WorkflowFault,
};
pub use error::WorkflowError;
pub use providers::{InstanceData, InstanceStore, InstanceValue, InstanceValueOptions, ProviderError};
pub use runtime::{
    AbortedEventArgs, CompletedEventArgs, IdleEventArgs, LifecycleState, PersistableIdleAction,
    PersistencePipelineModule, UnhandledExceptionAction, UnhandledExceptionEventArgs, UnloadedEventArgs,
    WorkflowApplication, WorkflowApplicationBuilder, WorkflowApplicationInstance, WorkflowApplicationOptions,
};
pub use tracking::{InstanceTrackingState, TrackingEvent, TrackingParticipant, TrackingRecord};
pub use transaction::{DependentTransaction, Enlistment, Transaction, TransactionOutcome};
