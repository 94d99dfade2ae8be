use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use super::deadline::Deadline;
use super::lock;
use crate::WorkflowError;
use crate::providers::{InstanceData, InstanceStore, OwnerId, ProviderError, SaveCommand};
use crate::transaction::{DependentTransaction, Enlistment, Transaction};

/// Calculate the renewal interval based on lease and buffer settings.
///
/// # Logic
/// - If lease ≥ 15s: renew at (lease - buffer)
/// - If lease < 15s: renew at 0.5 × lease (buffer ignored)
pub(crate) fn calculate_renewal_interval(lease: Duration, buffer: Duration) -> Duration {
    if lease >= Duration::from_secs(15) {
        let buffer = buffer.min(lease);
        let interval = lease.checked_sub(buffer).unwrap_or_else(|| Duration::from_secs(1));
        interval.max(Duration::from_secs(1))
    } else {
        let half = (lease.as_secs_f64() * 0.5).ceil().max(1.0);
        Duration::from_secs_f64(half)
    }
}

/// Spawn a background task that keeps the owner's lease alive.
fn spawn_owner_renewal_task(
    store: Arc<dyn InstanceStore>,
    owner: OwnerId,
    lease: Duration,
    buffer: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lease, buffer);

    debug!(
        target: "wfhost::runtime::persistence",
        owner = %owner,
        lease_secs = %lease.as_secs(),
        renewal_interval_secs = %renewal_interval.as_secs(),
        "Spawning owner lease renewal task"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // Skip first immediate tick

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match store.renew_owner(owner, lease).await {
                Ok(()) => {
                    trace!(target: "wfhost::runtime::persistence", owner = %owner, "Owner lease renewed");
                }
                Err(e) => {
                    debug!(
                        target: "wfhost::runtime::persistence",
                        owner = %owner,
                        error = %e,
                        "Failed to renew owner lease (owner deleted?)"
                    );
                    break;
                }
            }
        }

        debug!(target: "wfhost::runtime::persistence", owner = %owner, "Owner lease renewal task stopped");
    })
}

struct Renewal {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

/// Per-instance handle on the instance store.
///
/// Holds the lock owner (created on demand, or supplied by the host) and
/// whether this instance's lock is currently held.
pub(crate) struct PersistenceProvider {
    store: Arc<dyn InstanceStore>,
    instance_id: Mutex<Uuid>,
    owner: Mutex<Option<OwnerId>>,
    owns_owner: bool,
    is_locked: AtomicBool,
    aborted: AtomicBool,
    lease: Duration,
    renewal_buffer: Duration,
    renewal: Mutex<Option<Renewal>>,
}

impl PersistenceProvider {
    pub(crate) fn new(
        store: Arc<dyn InstanceStore>,
        instance_id: Uuid,
        shared_owner: Option<OwnerId>,
        lease: Duration,
        renewal_buffer: Duration,
    ) -> Self {
        Self {
            store,
            instance_id: Mutex::new(instance_id),
            owns_owner: shared_owner.is_none(),
            owner: Mutex::new(shared_owner),
            is_locked: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            lease,
            renewal_buffer,
            renewal: Mutex::new(None),
        }
    }

    pub(crate) fn instance_id(&self) -> Uuid {
        *lock(&self.instance_id)
    }

    pub(crate) fn owner(&self) -> Option<OwnerId> {
        *lock(&self.owner)
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.is_locked.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_locked(&self) {
        self.is_locked.store(true, Ordering::SeqCst);
    }

    fn throw_if_aborted(&self) -> Result<(), WorkflowError> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(WorkflowError::Aborted {
                instance: self.instance_id(),
                reason: "the persistence provider was aborted".into(),
            });
        }
        Ok(())
    }

    fn require_owner(&self) -> Result<OwnerId, WorkflowError> {
        self.owner()
            .ok_or_else(|| WorkflowError::InvalidState("the persistence provider is not initialized".into()))
    }

    /// Register a lock owner if none exists yet and start renewing its lease.
    pub(crate) async fn initialize(&self, deadline: &Deadline) -> Result<OwnerId, WorkflowError> {
        self.throw_if_aborted()?;
        if let Some(owner) = self.owner() {
            return Ok(owner);
        }
        let owner = deadline.run("create_owner", self.store.create_owner(self.lease)).await??;
        *lock(&self.owner) = Some(owner);

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_owner_renewal_task(
            self.store.clone(),
            owner,
            self.lease,
            self.renewal_buffer,
            shutdown.clone(),
        );
        *lock(&self.renewal) = Some(Renewal { handle, shutdown });
        Ok(owner)
    }

    /// Acquire the instance lock ahead of a transactional save.
    pub(crate) async fn ensure_readiness(&self, deadline: &Deadline) -> Result<(), WorkflowError> {
        self.throw_if_aborted()?;
        if self.is_locked() {
            return Ok(());
        }
        let owner = self.require_owner()?;
        deadline
            .run("lock_instance", self.store.lock_instance(owner, self.instance_id()))
            .await??;
        self.mark_locked();
        Ok(())
    }

    pub(crate) async fn save(
        &self,
        command: SaveCommand,
        tx: &Transaction,
        deadline: &Deadline,
    ) -> Result<(), WorkflowError> {
        self.throw_if_aborted()?;
        let owner = self.require_owner()?;
        let unlock = command.unlock || command.complete;
        deadline
            .run("save_instance", self.store.save_instance(owner, self.instance_id(), command, tx))
            .await??;
        self.is_locked.store(!unlock, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) async fn load(&self, deadline: &Deadline) -> Result<InstanceData, WorkflowError> {
        self.throw_if_aborted()?;
        let owner = self.require_owner()?;
        let data = deadline
            .run("load_instance", self.store.load_instance(owner, self.instance_id()))
            .await??;
        self.mark_locked();
        Ok(data)
    }

    /// Lock any runnable instance; re-targets this provider at it.
    pub(crate) async fn try_load_runnable(&self, deadline: &Deadline) -> Result<Option<InstanceData>, WorkflowError> {
        self.throw_if_aborted()?;
        let owner = self.require_owner()?;
        let found = deadline
            .run("try_load_runnable", self.store.try_load_runnable(owner))
            .await??;
        Ok(found.map(|(instance, data)| {
            *lock(&self.instance_id) = instance;
            self.mark_locked();
            data
        }))
    }

    pub(crate) async fn unlock(&self, deadline: &Deadline) -> Result<(), WorkflowError> {
        if !self.is_locked() {
            return Ok(());
        }
        let owner = self.require_owner()?;
        deadline
            .run("unlock_instance", self.store.unlock_instance(owner, self.instance_id()))
            .await??;
        self.is_locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Delete the owner this provider created; a shared owner is left alone.
    pub(crate) async fn delete_owner(&self, deadline: &Deadline) -> Result<(), WorkflowError> {
        self.stop_renewal();
        if !self.owns_owner {
            return Ok(());
        }
        if let Some(owner) = self.owner() {
            deadline.run("delete_owner", self.store.delete_owner(owner)).await??;
            self.is_locked.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Enlist owner deletion so it happens after the instance write commits.
    pub(crate) fn enlist_delete_owner(&self, tx: &Transaction) -> Result<(), WorkflowError> {
        self.stop_renewal();
        if let (true, Some(owner)) = (self.owns_owner, self.owner()) {
            tx.enlist(Box::new(DeleteOwner {
                store: self.store.clone(),
                owner,
            }))?;
        }
        Ok(())
    }

    pub(crate) fn stop_renewal(&self) {
        if let Some(renewal) = lock(&self.renewal).take() {
            renewal.shutdown.store(true, Ordering::Relaxed);
            renewal.handle.abort();
        }
    }

    /// Fail every later call; the lock itself is released by `release_after_abort`.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.stop_renewal();
    }

    /// Best effort: give up the lock (or the whole owner) of an aborted instance.
    pub(crate) async fn release_after_abort(&self) {
        let Some(owner) = self.owner() else {
            return;
        };
        let result = if self.owns_owner {
            self.store.delete_owner(owner).await
        } else if self.is_locked() {
            self.store.unlock_instance(owner, self.instance_id()).await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            debug!(instance = %self.instance_id(), error = %e, "failed to release lock of aborted instance");
        }
    }
}

impl Drop for PersistenceProvider {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

struct DeleteOwner {
    store: Arc<dyn InstanceStore>,
    owner: OwnerId,
}

#[async_trait::async_trait]
impl Enlistment for DeleteOwner {
    async fn commit(&mut self) -> Result<(), ProviderError> {
        self.store.delete_owner(self.owner).await
    }

    async fn rollback(&mut self) {}
}

enum ContextTransaction {
    Local(Transaction),
    Dependent(Transaction),
}

/// Transaction scope of one persist pass.
///
/// Without an ambient transaction the context owns a local one and commits it
/// in `complete`. With one, writes enlist in the ambient transaction and
/// `complete` only checks that the context was not aborted.
pub(crate) struct PersistenceContext {
    tx: ContextTransaction,
    aborted: AtomicBool,
}

impl PersistenceContext {
    pub(crate) fn new(dependent: Option<&DependentTransaction>) -> Self {
        let tx = match dependent {
            Some(d) => ContextTransaction::Dependent(d.transaction().clone()),
            None => ContextTransaction::Local(Transaction::new()),
        };
        Self {
            tx,
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn transaction(&self) -> &Transaction {
        match &self.tx {
            ContextTransaction::Local(tx) | ContextTransaction::Dependent(tx) => tx,
        }
    }

    pub(crate) fn is_local(&self) -> bool {
        matches!(self.tx, ContextTransaction::Local(_))
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Doom the context. Safe to call from any thread, any number of times.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.transaction().mark_rollback_only();
    }

    pub(crate) async fn complete(&self) -> Result<(), WorkflowError> {
        if self.is_aborted() {
            if self.is_local() {
                self.transaction().rollback().await;
            }
            return Err(WorkflowError::TransactionAborted(self.transaction().id()));
        }
        match &self.tx {
            ContextTransaction::Local(tx) => tx.commit().await,
            ContextTransaction::Dependent(_) => Ok(()),
        }
    }

    /// Roll back after a failed step.
    pub(crate) async fn rollback(&self) {
        self.abort();
        if self.is_local() {
            self.transaction().rollback().await;
        }
    }
}
