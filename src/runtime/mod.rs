//! Instance control loop.
//!
//! [`WorkflowApplication`] is a cheap, cloneable handle on one instance. Every
//! public operation follows the same shape: build an operation, wait for the
//! turn, validate the lifecycle, perform the effect, flush tracking, release
//! the turn. Releasing the turn runs the dispatch loop, which decides what
//! happens next.

use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Duration;
use uuid::Uuid;

use crate::WorkflowError;
use crate::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult, BookmarkScope};
use crate::controller::{ActivityGraph, Controller, ControllerState, PauseSignal, WorkflowFault};
use crate::providers::{InstanceStore, OwnerId};
use crate::tracking::{InstanceTrackingState, TrackingParticipant, TrackingProvider, TrackingRecord};
use crate::transaction::Transaction;

pub(crate) mod deadline;
mod dispatch;
mod events;
mod lifecycle;
mod operation;
mod persist;
mod persistence;
mod pipeline;
mod resume;
mod snapshot;
mod turn;

use deadline::Deadline;
use events::WorkflowHandlers;
use operation::InstanceOperation;
use persist::{LoadSource, PersistenceOperation};
use persistence::{PersistenceContext, PersistenceProvider};

pub use events::{
    AbortedEventArgs, CompletedEventArgs, IdleEventArgs, PersistableIdleAction, UnhandledExceptionAction,
    UnhandledExceptionEventArgs, UnloadedEventArgs,
};
pub use lifecycle::LifecycleState;
pub use pipeline::PersistencePipelineModule;
pub use snapshot::WorkflowApplicationInstance;

/// Lock a std mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Configuration options for a [`WorkflowApplication`].
#[derive(Debug, Clone)]
pub struct WorkflowApplicationOptions {
    /// Budget for operations called without an explicit timeout.
    ///
    /// Default: 30 seconds
    pub default_timeout: Duration,

    /// Budget for `resume_bookmark` without an explicit timeout. `None` waits
    /// until the bookmark can be resumed.
    ///
    /// Default: None
    pub resume_bookmark_timeout: Option<Duration>,

    /// Budget for persistence the host starts on its own (completion,
    /// persistable idle) and for tracking flushes along the way.
    ///
    /// Default: 30 seconds
    pub internal_persistence_timeout: Duration,

    /// Lease granted to lock owners this application registers.
    ///
    /// Default: 30 seconds
    pub owner_lease: Duration,

    /// How long before lease expiry the owner is renewed (leases ≥ 15s).
    ///
    /// Default: 5 seconds
    pub lock_renewal_buffer: Duration,
}

impl Default for WorkflowApplicationOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            resume_bookmark_timeout: None,
            internal_persistence_timeout: Duration::from_secs(30),
            owner_lease: Duration::from_secs(30),
            lock_renewal_buffer: Duration::from_secs(5),
        }
    }
}

/// Mutable instance state, guarded by a single lock.
#[derive(Debug)]
pub(crate) struct InstanceState {
    pub(crate) instance_id: Uuid,
    pub(crate) lifecycle: LifecycleState,
    pub(crate) is_busy: bool,
    pub(crate) action_counter: u64,
    pub(crate) pending_unenqueued: usize,
    pub(crate) has_execution_occurred_since_last_idle: bool,
    pub(crate) has_raised_completed: bool,
    pub(crate) has_called_run: bool,
    pub(crate) has_called_abort: bool,
    pub(crate) run_requested: bool,
    pub(crate) is_initialized: bool,
    pub(crate) is_loaded: bool,
    pub(crate) is_persisted: bool,
    pub(crate) abort_reason: Option<String>,
    pub(crate) termination_reason: Option<String>,
    /// Last observed interpreter state; `None` until initialized.
    pub(crate) controller_state: Option<ControllerState>,
    pub(crate) is_persistable: bool,
    pub(crate) pending_operations: VecDeque<Arc<InstanceOperation>>,
}

impl InstanceState {
    pub(crate) fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            lifecycle: LifecycleState::Paused,
            is_busy: false,
            action_counter: 0,
            pending_unenqueued: 0,
            has_execution_occurred_since_last_idle: false,
            has_raised_completed: false,
            has_called_run: false,
            has_called_abort: false,
            run_requested: false,
            is_initialized: false,
            is_loaded: false,
            is_persisted: false,
            abort_reason: None,
            termination_reason: None,
            controller_state: None,
            is_persistable: true,
            pending_operations: VecDeque::new(),
        }
    }
}

pub(crate) struct InstanceCore {
    graph: Arc<dyn ActivityGraph>,
    inputs: Mutex<Option<BTreeMap<String, Value>>>,
    pub(crate) options: WorkflowApplicationOptions,
    pub(crate) handlers: WorkflowHandlers,
    pub(crate) state: Mutex<InstanceState>,
    controller: Mutex<Option<Box<dyn Controller>>>,
    pub(crate) pause: PauseSignal,
    /// Abort fence read by the persistence pipeline.
    aborted: AtomicBool,
    store: Option<Arc<dyn InstanceStore>>,
    instance_owner: Option<OwnerId>,
    persistence: Mutex<Option<Arc<PersistenceProvider>>>,
    pub(crate) modules: Vec<Arc<dyn PersistencePipelineModule>>,
    pub(crate) tracking: TrackingProvider,
    pub(crate) in_flight_context: Mutex<Option<Arc<PersistenceContext>>>,
    pub(crate) pipeline_in_use: AtomicBool,
    handler_threads: Mutex<Vec<ThreadId>>,
    /// Operations currently holding the turn. Never more than one.
    pub(crate) active_turns: AtomicUsize,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl InstanceCore {
    pub(crate) fn id(&self) -> Uuid {
        lock(&self.state).instance_id
    }

    pub(crate) fn has_persistence_target(&self) -> bool {
        self.store.is_some() || !self.modules.is_empty()
    }

    pub(crate) fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub(crate) fn persistence_provider(&self) -> Option<Arc<PersistenceProvider>> {
        lock(&self.persistence).clone()
    }

    /// The provider for this instance, created on first use when a store is attached.
    pub(crate) fn ensure_persistence_provider(&self) -> Option<Arc<PersistenceProvider>> {
        let id = self.id();
        let mut slot = lock(&self.persistence);
        if slot.is_none()
            && let Some(store) = &self.store
        {
            *slot = Some(Arc::new(PersistenceProvider::new(
                store.clone(),
                id,
                self.instance_owner,
                self.options.owner_lease,
                self.options.lock_renewal_buffer,
            )));
        }
        slot.clone()
    }

    pub(crate) fn set_persistence_provider(&self, provider: Arc<PersistenceProvider>) {
        *lock(&self.persistence) = Some(provider);
    }

    /// Call into the interpreter and refresh the cached state afterwards.
    ///
    /// The controller lock and the state lock are never held together.
    pub(crate) fn with_controller<R>(&self, f: impl FnOnce(&mut dyn Controller) -> R) -> Result<R, WorkflowError> {
        let (result, state, persistable) = {
            let mut guard = lock(&self.controller);
            let controller = guard
                .as_mut()
                .ok_or_else(|| WorkflowError::InvalidState("the workflow instance is not initialized".into()))?;
            let result = f(controller.as_mut());
            (result, controller.state(), controller.is_persistable())
        };
        let mut st = lock(&self.state);
        st.controller_state = Some(state);
        st.is_persistable = persistable;
        Ok(result)
    }

    pub(crate) fn install_controller(&self, controller: Box<dyn Controller>) {
        let state = controller.state();
        let persistable = controller.is_persistable();
        *lock(&self.controller) = Some(controller);
        let mut st = lock(&self.state);
        st.controller_state = Some(state);
        st.is_persistable = persistable;
        st.is_initialized = true;
    }

    /// Create the interpreter from the graph on first use.
    pub(crate) fn ensure_initialized(&self) -> Result<(), WorkflowError> {
        {
            let st = lock(&self.state);
            if st.is_initialized || matches!(st.lifecycle, LifecycleState::Aborted | LifecycleState::Unloaded) {
                return Ok(());
            }
        }
        let inputs = lock(&self.inputs).take().unwrap_or_default();
        let controller = self.graph.initialize(inputs).map_err(WorkflowError::Controller)?;
        self.install_controller(controller);
        tracing::debug!(instance = %self.id(), "workflow instance initialized");
        Ok(())
    }

    pub(crate) fn is_handler_thread(&self) -> bool {
        let current = std::thread::current().id();
        lock(&self.handler_threads).contains(&current)
    }

    fn check_not_handler_thread(&self) -> Result<(), WorkflowError> {
        if self.is_handler_thread() {
            return Err(WorkflowError::InvalidState(
                "host operations cannot be called from inside a workflow handler".into(),
            ));
        }
        Ok(())
    }

    /// Run a host handler with this thread marked as a handler thread.
    ///
    /// A panic is caught and returned so the caller can abort the instance.
    pub(crate) fn invoke_handler<R>(&self, f: impl FnOnce() -> R) -> Result<R, String> {
        let current = std::thread::current().id();
        lock(&self.handler_threads).push(current);
        let result = catch_unwind(AssertUnwindSafe(f));
        {
            let mut threads = lock(&self.handler_threads);
            if let Some(index) = threads.iter().position(|t| *t == current) {
                threads.swap_remove(index);
            }
        }
        result.map_err(panic_message)
    }

    /// Hold the turn for the duration of `effect`.
    async fn with_turn<T>(
        self: &Arc<Self>,
        op: InstanceOperation,
        deadline: &Deadline,
        operation: &str,
        effect: impl Future<Output = Result<T, WorkflowError>>,
    ) -> Result<T, WorkflowError> {
        self.check_not_handler_thread()?;
        let turn = self.acquire_turn(op, false, deadline, operation).await?;
        let result = effect.await;
        turn.release().await;
        result
    }

    async fn run_effect(&self, deadline: &Deadline) -> Result<(), WorkflowError> {
        let first_run = {
            let mut st = lock(&self.state);
            st.validate_runnable()?;
            let first = !st.has_called_run;
            st.has_called_run = true;
            st.lifecycle = LifecycleState::Runnable;
            // Only the first run may push an idle interpreter through one more pass.
            st.run_requested |= first;
            first.then_some(st.is_loaded)
        };
        if let Some(loaded) = first_run {
            let state = if loaded {
                InstanceTrackingState::Resumed
            } else {
                InstanceTrackingState::Started
            };
            self.tracking.add(TrackingRecord::instance(self.id(), state));
        }
        self.tracking.flush(deadline).await
    }

    async fn cancel_effect(&self, deadline: &Deadline) -> Result<(), WorkflowError> {
        {
            let st = lock(&self.state);
            st.throw_if_terminal()?;
            if st.is_complete() {
                return Ok(());
            }
        }
        self.with_controller(|c| c.schedule_cancel())?;
        {
            let mut st = lock(&self.state);
            st.has_called_run = true;
            st.lifecycle = LifecycleState::Runnable;
            st.run_requested = true;
        }
        self.tracking.flush(deadline).await
    }

    async fn terminate_effect(&self, reason: &str, deadline: &Deadline) -> Result<(), WorkflowError> {
        lock(&self.state).validate_runnable()?;
        self.with_controller(|c| c.terminate(WorkflowFault::termination(reason)))?;
        {
            let mut st = lock(&self.state);
            st.termination_reason = Some(reason.to_string());
            st.has_called_run = true;
            st.lifecycle = LifecycleState::Runnable;
            st.run_requested = true;
        }
        self.tracking.flush(deadline).await
    }

    async fn get_bookmarks_effect(&self) -> Result<Vec<BookmarkInfo>, WorkflowError> {
        lock(&self.state).validate_runnable()?;
        let mut bookmarks = self.with_controller(|c| c.bookmarks())?;
        bookmarks.sort();
        Ok(bookmarks)
    }
}

/// Builder for [`WorkflowApplication`].
pub struct WorkflowApplicationBuilder {
    graph: Arc<dyn ActivityGraph>,
    inputs: BTreeMap<String, Value>,
    options: WorkflowApplicationOptions,
    store: Option<Arc<dyn InstanceStore>>,
    instance_owner: Option<OwnerId>,
    modules: Vec<Arc<dyn PersistencePipelineModule>>,
    participants: Vec<Arc<dyn TrackingParticipant>>,
    handlers: WorkflowHandlers,
}

impl WorkflowApplicationBuilder {
    pub fn inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn options(mut self, options: WorkflowApplicationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a lock owner registered by the host instead of creating one per instance.
    pub fn instance_owner(mut self, owner: OwnerId) -> Self {
        self.instance_owner = Some(owner);
        self
    }

    pub fn persistence_module(mut self, module: Arc<dyn PersistencePipelineModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn tracking_participant(mut self, participant: Arc<dyn TrackingParticipant>) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn on_idle(mut self, handler: impl Fn(IdleEventArgs) + Send + Sync + 'static) -> Self {
        self.handlers.on_idle = Some(Box::new(handler));
        self
    }

    pub fn on_persistable_idle(
        mut self,
        handler: impl Fn(IdleEventArgs) -> PersistableIdleAction + Send + Sync + 'static,
    ) -> Self {
        self.handlers.on_persistable_idle = Some(Box::new(handler));
        self
    }

    pub fn on_completed(mut self, handler: impl Fn(CompletedEventArgs) + Send + Sync + 'static) -> Self {
        self.handlers.on_completed = Some(Box::new(handler));
        self
    }

    pub fn on_unloaded(mut self, handler: impl Fn(UnloadedEventArgs) + Send + Sync + 'static) -> Self {
        self.handlers.on_unloaded = Some(Box::new(handler));
        self
    }

    pub fn on_aborted(mut self, handler: impl Fn(AbortedEventArgs) + Send + Sync + 'static) -> Self {
        self.handlers.on_aborted = Some(Box::new(handler));
        self
    }

    pub fn on_unhandled_exception(
        mut self,
        handler: impl Fn(UnhandledExceptionEventArgs) -> UnhandledExceptionAction + Send + Sync + 'static,
    ) -> Self {
        self.handlers.on_unhandled_exception = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> WorkflowApplication {
        let id = Uuid::new_v4();
        let core = InstanceCore {
            graph: self.graph,
            inputs: Mutex::new(Some(self.inputs)),
            options: self.options,
            handlers: self.handlers,
            state: Mutex::new(InstanceState::new(id)),
            controller: Mutex::new(None),
            pause: PauseSignal::new(),
            aborted: AtomicBool::new(false),
            store: self.store,
            instance_owner: self.instance_owner,
            persistence: Mutex::new(None),
            modules: self.modules,
            tracking: TrackingProvider::new(self.participants),
            in_flight_context: Mutex::new(None),
            pipeline_in_use: AtomicBool::new(false),
            handler_threads: Mutex::new(Vec::new()),
            active_turns: AtomicUsize::new(0),
        };
        tracing::debug!(instance = %id, "workflow application created");
        WorkflowApplication { core: Arc::new(core) }
    }
}

/// Host for one workflow instance.
///
/// Cloning yields another handle to the same instance, so many tasks can
/// call into it concurrently. Their effects are serialized.
///
/// Host operations must not be awaited from inside handlers. `abort` is the
/// exception: from a handler it takes effect immediately.
#[derive(Clone)]
pub struct WorkflowApplication {
    core: Arc<InstanceCore>,
}

impl std::fmt::Debug for WorkflowApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowApplication")
            .field("id", &self.id())
            .field("lifecycle", &self.lifecycle_state())
            .finish()
    }
}

impl WorkflowApplication {
    pub fn builder(graph: Arc<dyn ActivityGraph>) -> WorkflowApplicationBuilder {
        WorkflowApplicationBuilder {
            graph,
            inputs: BTreeMap::new(),
            options: WorkflowApplicationOptions::default(),
            store: None,
            instance_owner: None,
            modules: Vec::new(),
            participants: Vec::new(),
            handlers: WorkflowHandlers::default(),
        }
    }

    pub fn new(graph: Arc<dyn ActivityGraph>) -> Self {
        Self::builder(graph).build()
    }

    /// Instance id. Stable, except that loading replaces it with the stored instance's id.
    pub fn id(&self) -> Uuid {
        self.core.id()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        lock(&self.core.state).lifecycle
    }

    pub fn controller_state(&self) -> Option<ControllerState> {
        lock(&self.core.state).controller_state
    }

    /// Number of operations notified plus interpreter runs so far.
    pub fn action_count(&self) -> u64 {
        lock(&self.core.state).action_counter
    }

    pub fn pending_operation_count(&self) -> usize {
        lock(&self.core.state).pending_operations.len()
    }

    fn default_deadline(&self) -> Deadline {
        Deadline::after(self.core.options.default_timeout)
    }

    pub async fn run(&self) -> Result<(), WorkflowError> {
        self.run_inner(self.default_deadline()).await
    }

    pub async fn run_with_timeout(&self, timeout: Duration) -> Result<(), WorkflowError> {
        self.run_inner(Deadline::after(timeout)).await
    }

    async fn run_inner(&self, deadline: Deadline) -> Result<(), WorkflowError> {
        let core = &self.core;
        core.with_turn(InstanceOperation::plain(), &deadline, "run", core.run_effect(&deadline))
            .await
    }

    pub async fn cancel(&self) -> Result<(), WorkflowError> {
        self.cancel_with_timeout(self.core.options.default_timeout).await
    }

    pub async fn cancel_with_timeout(&self, timeout: Duration) -> Result<(), WorkflowError> {
        let core = &self.core;
        let deadline = Deadline::after(timeout);
        core.with_turn(InstanceOperation::plain(), &deadline, "cancel", core.cancel_effect(&deadline))
            .await
    }

    pub async fn terminate(&self, reason: &str) -> Result<(), WorkflowError> {
        self.terminate_with_timeout(reason, self.core.options.default_timeout)
            .await
    }

    pub async fn terminate_with_timeout(&self, reason: &str, timeout: Duration) -> Result<(), WorkflowError> {
        let core = &self.core;
        let deadline = Deadline::after(timeout);
        core.with_turn(
            InstanceOperation::plain(),
            &deadline,
            "terminate",
            core.terminate_effect(reason, &deadline),
        )
        .await
    }

    pub async fn persist(&self) -> Result<(), WorkflowError> {
        self.persist_with_timeout(self.core.options.default_timeout).await
    }

    pub async fn persist_with_timeout(&self, timeout: Duration) -> Result<(), WorkflowError> {
        self.core
            .persist_operation(PersistenceOperation::Save, None, Deadline::after(timeout))
            .await
    }

    /// Persist inside `tx`; the write becomes durable when `tx` commits.
    pub async fn persist_in_transaction(&self, tx: &Transaction, timeout: Duration) -> Result<(), WorkflowError> {
        self.core
            .persist_operation(PersistenceOperation::Save, Some(tx), Deadline::after(timeout))
            .await
    }

    pub async fn unload(&self) -> Result<(), WorkflowError> {
        self.unload_with_timeout(self.core.options.default_timeout).await
    }

    pub async fn unload_with_timeout(&self, timeout: Duration) -> Result<(), WorkflowError> {
        self.core
            .persist_operation(PersistenceOperation::Unload, None, Deadline::after(timeout))
            .await
    }

    pub async fn unload_in_transaction(&self, tx: &Transaction, timeout: Duration) -> Result<(), WorkflowError> {
        self.core
            .persist_operation(PersistenceOperation::Unload, Some(tx), Deadline::after(timeout))
            .await
    }

    /// Load a persisted instance by id into this (fresh) application.
    pub async fn load(&self, instance_id: Uuid) -> Result<(), WorkflowError> {
        self.load_with_timeout(instance_id, self.core.options.default_timeout)
            .await
    }

    pub async fn load_with_timeout(&self, instance_id: Uuid, timeout: Duration) -> Result<(), WorkflowError> {
        self.core
            .load_operation(LoadSource::ById(instance_id), Deadline::after(timeout))
            .await
    }

    /// Load a snapshot obtained from [`get_instance`](Self::get_instance) or
    /// [`get_runnable_instance`](Self::get_runnable_instance).
    pub async fn load_instance(&self, instance: WorkflowApplicationInstance) -> Result<(), WorkflowError> {
        self.load_instance_with_timeout(instance, self.core.options.default_timeout)
            .await
    }

    pub async fn load_instance_with_timeout(
        &self,
        instance: WorkflowApplicationInstance,
        timeout: Duration,
    ) -> Result<(), WorkflowError> {
        self.core
            .load_operation(LoadSource::Snapshot(instance), Deadline::after(timeout))
            .await
    }

    /// Load any unlocked instance with runnable work.
    pub async fn load_runnable_instance(&self) -> Result<(), WorkflowError> {
        self.load_runnable_instance_with_timeout(self.core.options.default_timeout)
            .await
    }

    pub async fn load_runnable_instance_with_timeout(&self, timeout: Duration) -> Result<(), WorkflowError> {
        self.core
            .load_operation(LoadSource::Runnable, Deadline::after(timeout))
            .await
    }

    pub async fn resume_bookmark(
        &self,
        bookmark: impl Into<Bookmark>,
        value: Value,
    ) -> Result<BookmarkResumptionResult, WorkflowError> {
        let deadline = Deadline::from_option(self.core.options.resume_bookmark_timeout);
        self.core
            .resume_bookmark_core(bookmark.into(), None, value, deadline)
            .await
    }

    pub async fn resume_bookmark_with_timeout(
        &self,
        bookmark: impl Into<Bookmark>,
        value: Value,
        timeout: Duration,
    ) -> Result<BookmarkResumptionResult, WorkflowError> {
        self.core
            .resume_bookmark_core(bookmark.into(), None, value, Deadline::after(timeout))
            .await
    }

    pub async fn resume_scoped_bookmark(
        &self,
        bookmark: impl Into<Bookmark>,
        scope: BookmarkScope,
        value: Value,
        timeout: Duration,
    ) -> Result<BookmarkResumptionResult, WorkflowError> {
        self.core
            .resume_bookmark_core(bookmark.into(), Some(scope), value, Deadline::after(timeout))
            .await
    }

    pub async fn get_bookmarks(&self) -> Result<Vec<BookmarkInfo>, WorkflowError> {
        self.get_bookmarks_with_timeout(self.core.options.default_timeout)
            .await
    }

    pub async fn get_bookmarks_with_timeout(&self, timeout: Duration) -> Result<Vec<BookmarkInfo>, WorkflowError> {
        let core = &self.core;
        let deadline = Deadline::after(timeout);
        core.with_turn(
            InstanceOperation::plain(),
            &deadline,
            "get_bookmarks",
            core.get_bookmarks_effect(),
        )
        .await
    }

    /// Abort the instance. Takes precedence over queued work and in-flight persistence.
    pub async fn abort(&self, reason: &str) -> Result<(), WorkflowError> {
        self.core.abort_core(reason).await
    }

    /// Lock and read an instance without attaching it to an application.
    pub async fn get_instance(
        store: Arc<dyn InstanceStore>,
        instance_id: Uuid,
        timeout: Duration,
    ) -> Result<WorkflowApplicationInstance, WorkflowError> {
        WorkflowApplicationInstance::fetch(
            store,
            Some(instance_id),
            &WorkflowApplicationOptions::default(),
            timeout,
        )
        .await
    }

    /// Lock and read any runnable instance without attaching it to an application.
    pub async fn get_runnable_instance(
        store: Arc<dyn InstanceStore>,
        timeout: Duration,
    ) -> Result<WorkflowApplicationInstance, WorkflowError> {
        WorkflowApplicationInstance::fetch(store, None, &WorkflowApplicationOptions::default(), timeout).await
    }
}
