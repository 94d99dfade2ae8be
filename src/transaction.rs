//! Explicit ambient transactions.
//!
//! Hosts pass a [`Transaction`] into `persist_in_transaction`. The pipeline
//! takes a [`DependentTransaction`] up front. That dependent clone blocks
//! [`Transaction::commit`] until it completes. It completes exactly once, either
//! through a call or when dropped. Store writes enlist in the transaction and
//! become durable only when it commits.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

use crate::WorkflowError;
use crate::providers::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Active,
    Committed,
    Aborted,
}

/// Work that becomes durable when the transaction commits.
#[async_trait]
pub trait Enlistment: Send {
    async fn commit(&mut self) -> Result<(), ProviderError>;
    async fn rollback(&mut self);
}

struct TxState {
    outcome: TransactionOutcome,
    rollback_only: bool,
    enlistments: Vec<Box<dyn Enlistment>>,
}

struct TxInner {
    id: Uuid,
    state: Mutex<TxState>,
    dependents: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        let (dependents, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(TxInner {
                id: Uuid::new_v4(),
                state: Mutex::new(TxState {
                    outcome: TransactionOutcome::Active,
                    rollback_only: false,
                    enlistments: Vec::new(),
                }),
                dependents,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn outcome(&self) -> TransactionOutcome {
        crate::runtime::lock(&self.inner.state).outcome
    }

    /// Take a dependent clone that holds off commit until it completes.
    pub fn dependent_clone(&self) -> Result<DependentTransaction, WorkflowError> {
        let state = crate::runtime::lock(&self.inner.state);
        if state.outcome != TransactionOutcome::Active {
            return Err(WorkflowError::TransactionAborted(self.inner.id));
        }
        self.inner.dependents.send_modify(|n| *n += 1);
        drop(state);
        Ok(DependentTransaction {
            tx: self.clone(),
            completed: false,
        })
    }

    pub fn enlist(&self, enlistment: Box<dyn Enlistment>) -> Result<(), WorkflowError> {
        let mut state = crate::runtime::lock(&self.inner.state);
        if state.outcome != TransactionOutcome::Active {
            return Err(WorkflowError::TransactionAborted(self.inner.id));
        }
        state.enlistments.push(enlistment);
        Ok(())
    }

    /// Doom the transaction; `commit` will roll back instead.
    pub fn mark_rollback_only(&self) {
        crate::runtime::lock(&self.inner.state).rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        crate::runtime::lock(&self.inner.state).rollback_only
    }

    /// Wait for every dependent clone, then commit the enlistments in order.
    ///
    /// If one enlistment fails, the ones after it are rolled back and the
    /// transaction ends `Aborted`.
    pub async fn commit(&self) -> Result<(), WorkflowError> {
        let mut rx = self.inner.dependents.subscribe();
        rx.wait_for(|n| *n == 0)
            .await
            .map_err(|_| WorkflowError::TransactionAborted(self.inner.id))?;

        let (enlistments, rollback_only) = {
            let mut state = crate::runtime::lock(&self.inner.state);
            if state.outcome != TransactionOutcome::Active {
                return Err(WorkflowError::InvalidState(format!(
                    "transaction {} already completed",
                    self.inner.id
                )));
            }
            (std::mem::take(&mut state.enlistments), state.rollback_only)
        };

        if rollback_only {
            rollback_all(enlistments).await;
            self.set_outcome(TransactionOutcome::Aborted);
            return Err(WorkflowError::TransactionAborted(self.inner.id));
        }

        let mut remaining = enlistments.into_iter();
        while let Some(mut enlistment) = remaining.next() {
            if let Err(e) = enlistment.commit().await {
                tracing::warn!(transaction = %self.inner.id, error = %e, "enlistment commit failed, rolling back");
                rollback_all(remaining.collect()).await;
                self.set_outcome(TransactionOutcome::Aborted);
                return Err(e.into());
            }
        }
        self.set_outcome(TransactionOutcome::Committed);
        tracing::debug!(transaction = %self.inner.id, "transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) {
        let enlistments = {
            let mut state = crate::runtime::lock(&self.inner.state);
            if state.outcome != TransactionOutcome::Active {
                return;
            }
            state.outcome = TransactionOutcome::Aborted;
            std::mem::take(&mut state.enlistments)
        };
        rollback_all(enlistments).await;
        tracing::debug!(transaction = %self.inner.id, "transaction rolled back");
    }

    fn set_outcome(&self, outcome: TransactionOutcome) {
        crate::runtime::lock(&self.inner.state).outcome = outcome;
    }
}

async fn rollback_all(enlistments: Vec<Box<dyn Enlistment>>) {
    for mut enlistment in enlistments {
        enlistment.rollback().await;
    }
}

/// Handle that keeps the parent transaction from committing until completed.
pub struct DependentTransaction {
    tx: Transaction,
    completed: bool,
}

impl DependentTransaction {
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Doom the parent transaction; the clone must still be completed.
    pub fn abort(&self) {
        self.tx.mark_rollback_only();
    }

    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.completed {
            self.completed = true;
            self.tx.inner.dependents.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

impl Drop for DependentTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}
