//! Persist, unload and load pipelines.

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

use super::deadline::Deadline;
use super::operation::InstanceOperation;
use super::persistence::{PersistenceContext, PersistenceProvider};
use super::pipeline::PersistencePipeline;
use super::snapshot::{WorkflowApplicationInstance, stored_identity};
use super::{InstanceCore, LifecycleState, lock};
use crate::WorkflowError;
use crate::controller::ControllerState;
use crate::providers::{InstanceData, InstanceValue, SaveCommand, names};
use crate::tracking::{InstanceTrackingState, TrackingRecord};
use crate::transaction::{DependentTransaction, Transaction};

/// Which lifecycle transition a persist pass performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PersistenceOperation {
    Save,
    Unload,
    /// The instance completed; its stored record is deleted.
    Complete,
}

impl PersistenceOperation {
    fn tracking_state(self) -> InstanceTrackingState {
        match self {
            PersistenceOperation::Save => InstanceTrackingState::Persisted,
            PersistenceOperation::Unload => InstanceTrackingState::Unloaded,
            PersistenceOperation::Complete => InstanceTrackingState::Deleted,
        }
    }

    fn releases_instance(self) -> bool {
        self != PersistenceOperation::Save
    }
}

pub(crate) enum LoadSource {
    ById(Uuid),
    Runnable,
    Snapshot(WorkflowApplicationInstance),
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, WorkflowError> {
    serde_json::to_value(value).map_err(|e| WorkflowError::Controller(e.to_string()))
}

impl InstanceCore {
    /// Host-facing persist / unload: takes a persistence turn, then runs the pipeline.
    pub(crate) async fn persist_operation(
        self: &Arc<Self>,
        operation: PersistenceOperation,
        transaction: Option<&Transaction>,
        deadline: Deadline,
    ) -> Result<(), WorkflowError> {
        let name = match operation {
            PersistenceOperation::Save => "persist",
            _ => "unload",
        };
        let effect = async {
            {
                let st = lock(&self.state);
                match operation {
                    PersistenceOperation::Save => st.validate_persist(self.has_persistence_target())?,
                    _ => st.validate_unload(self.has_persistence_target())?,
                }
            }
            self.persist_core(operation, transaction, &deadline).await?;
            if operation == PersistenceOperation::Unload {
                self.raise_unloaded();
            }
            Ok(())
        };
        self.with_turn(InstanceOperation::requires_persistence(), &deadline, name, effect)
            .await
    }

    /// Run one persist pass. The ambient transaction, if any, gets a dependent
    /// clone that is completed exactly once whatever the outcome.
    pub(crate) async fn persist_core(
        self: &Arc<Self>,
        operation: PersistenceOperation,
        transaction: Option<&Transaction>,
        deadline: &Deadline,
    ) -> Result<(), WorkflowError> {
        let dependent = transaction.map(Transaction::dependent_clone).transpose()?;
        let result = self.persist_steps(operation, dependent.as_ref(), deadline).await;
        if let Some(dependent) = dependent {
            if result.is_err() {
                dependent.abort();
            }
            dependent.complete();
        }
        result
    }

    fn throw_if_fenced(&self) -> Result<(), WorkflowError> {
        if self.aborted.load(Ordering::SeqCst) {
            return lock(&self.state).throw_if_aborted();
        }
        Ok(())
    }

    async fn persist_steps(
        self: &Arc<Self>,
        operation: PersistenceOperation,
        dependent: Option<&DependentTransaction>,
        deadline: &Deadline,
    ) -> Result<(), WorkflowError> {
        lock(&self.state).throw_if_terminal()?;
        if !self.has_persistence_target() {
            return Err(WorkflowError::StoreRequired);
        }
        let id = self.id();

        let provider = self.ensure_persistence_provider();
        if let Some(provider) = &provider {
            provider.initialize(deadline).await?;
            if !provider.is_locked() && dependent.is_some() {
                provider.ensure_readiness(deadline).await?;
            }
        }

        self.tracking.add(TrackingRecord::instance(id, operation.tracking_state()));
        self.tracking.flush(deadline).await?;

        let mut pipeline = PersistencePipeline::new(&self.modules, self.generate_instance_data()?);
        if !self.modules.is_empty() {
            pipeline.collect()?;
            pipeline.map()?;
        }

        let context = Arc::new(PersistenceContext::new(dependent));
        *lock(&self.in_flight_context) = Some(context.clone());
        self.pipeline_in_use.store(!self.modules.is_empty(), Ordering::SeqCst);
        let saved = self
            .save_in_context(operation, provider.as_deref(), &pipeline, &context, deadline)
            .await;
        *lock(&self.in_flight_context) = None;
        self.pipeline_in_use.store(false, Ordering::SeqCst);
        if let Err(e) = saved {
            context.rollback().await;
            debug!(instance = %id, ?operation, error = %e, "persistence context aborted");
            return Err(e);
        }

        if operation.releases_instance()
            && context.is_local()
            && let Some(provider) = &provider
        {
            provider.delete_owner(deadline).await?;
        }

        {
            let mut st = lock(&self.state);
            st.throw_if_aborted()?;
            match operation {
                PersistenceOperation::Save => st.is_persisted = true,
                PersistenceOperation::Unload | PersistenceOperation::Complete => {
                    st.lifecycle = LifecycleState::Unloaded;
                }
            }
        }
        if operation.releases_instance() {
            for module in &self.modules {
                module.dispose();
            }
        }
        info!(instance = %id, ?operation, "workflow instance persisted");
        Ok(())
    }

    /// Steps that run inside the persistence context, fenced against abort.
    async fn save_in_context(
        &self,
        operation: PersistenceOperation,
        provider: Option<&PersistenceProvider>,
        pipeline: &PersistencePipeline<'_>,
        context: &PersistenceContext,
        deadline: &Deadline,
    ) -> Result<(), WorkflowError> {
        let runnable = lock(&self.state).controller_state == Some(ControllerState::Runnable);

        self.throw_if_fenced()?;
        if let Some(provider) = provider {
            let command = SaveCommand {
                data: pipeline.values().clone(),
                runnable,
                unlock: operation.releases_instance(),
                complete: operation == PersistenceOperation::Complete,
            };
            provider.save(command, context.transaction(), deadline).await?;
        }

        self.throw_if_fenced()?;
        if !self.modules.is_empty() {
            pipeline.save(context.transaction(), deadline).await?;
        }

        self.throw_if_fenced()?;
        if operation.releases_instance()
            && !context.is_local()
            && let Some(provider) = provider
        {
            provider.enlist_delete_owner(context.transaction())?;
        }
        context.complete().await
    }

    /// Values the host itself stores for every instance.
    fn generate_instance_data(&self) -> Result<InstanceData, WorkflowError> {
        let (state, bookmarks, completion) =
            self.with_controller(|c| (c.save_state(), c.bookmarks(), c.completion_state()))?;
        let state = state.map_err(WorkflowError::Controller)?;
        let controller_state = lock(&self.state).controller_state;

        let status = match (&completion, controller_state) {
            (Some(c), _) => format!("{:?}", c.state),
            (None, Some(ControllerState::Idle)) => "Idle".to_string(),
            _ => "Executing".to_string(),
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut data = InstanceData::new();
        data.insert(names::WORKFLOW.into(), InstanceValue::new(state));
        data.insert(names::STATUS.into(), InstanceValue::new(json!(status)));
        data.insert(names::BOOKMARKS.into(), InstanceValue::write_only(to_value(&bookmarks)?));
        data.insert(names::LAST_UPDATE.into(), InstanceValue::write_only(json!(now)));
        if let Some(fault) = completion.and_then(|c| c.fault) {
            data.insert(names::EXCEPTION.into(), InstanceValue::write_only(to_value(&fault)?));
        }
        if let Some(identity) = self.graph.identity() {
            data.insert(names::DEFINITION_IDENTITY.into(), InstanceValue::new(to_value(&identity)?));
        }
        Ok(data)
    }

    /// Host-facing load: a plain turn that does not initialize a fresh interpreter.
    pub(crate) async fn load_operation(
        self: &Arc<Self>,
        source: LoadSource,
        deadline: Deadline,
    ) -> Result<(), WorkflowError> {
        let effect = self.load_core(source, &deadline);
        self.with_turn(InstanceOperation::plain_uninitialized(), &deadline, "load", effect)
            .await
    }

    fn new_provider(&self, instance_id: Uuid) -> Result<Arc<PersistenceProvider>, WorkflowError> {
        let store = self.store.clone().ok_or(WorkflowError::StoreRequired)?;
        Ok(Arc::new(PersistenceProvider::new(
            store,
            instance_id,
            self.instance_owner,
            self.options.owner_lease,
            self.options.lock_renewal_buffer,
        )))
    }

    async fn load_core(self: &Arc<Self>, source: LoadSource, deadline: &Deadline) -> Result<(), WorkflowError> {
        lock(&self.state).validate_load()?;

        let (provider, loaded) = match source {
            LoadSource::Snapshot(snapshot) => (snapshot.provider, Ok(Some(snapshot.data))),
            LoadSource::ById(instance_id) => {
                let provider = self.new_provider(instance_id)?;
                let loaded = match provider.initialize(deadline).await {
                    Ok(_) => provider.load(deadline).await.map(Some),
                    Err(e) => Err(e),
                };
                (provider, loaded)
            }
            LoadSource::Runnable => {
                let provider = self.new_provider(Uuid::new_v4())?;
                let loaded = match provider.initialize(deadline).await {
                    Ok(_) => provider.try_load_runnable(deadline).await,
                    Err(e) => Err(e),
                };
                (provider, loaded)
            }
        };

        let restored = match loaded {
            Ok(Some(data)) => self.restore_from(&provider, data, deadline).await,
            Ok(None) => Err(WorkflowError::NoRunnableInstance),
            Err(e) => Err(e),
        };
        if let Err(e) = restored {
            let _ = provider.unlock(deadline).await;
            let _ = provider.delete_owner(deadline).await;
            provider.abort();
            debug!(error = %e, "load failed");
            return Err(e);
        }
        Ok(())
    }

    async fn restore_from(
        &self,
        provider: &Arc<PersistenceProvider>,
        data: InstanceData,
        deadline: &Deadline,
    ) -> Result<(), WorkflowError> {
        let instance_id = provider.instance_id();
        let workflow = data
            .get(names::WORKFLOW)
            .map(|v| v.value.clone())
            .ok_or(WorkflowError::InstanceNotFound {
                instance: Some(instance_id),
            })?;

        let found = stored_identity(&data)?;
        let expected = self.graph.identity();
        if found != expected {
            return Err(WorkflowError::VersionMismatch {
                instance: instance_id,
                expected,
                found,
            });
        }

        if !self.modules.is_empty() {
            let pipeline = PersistencePipeline::new(&self.modules, data);
            pipeline.publish();
            pipeline.load(deadline).await?;
        }

        let controller = self.graph.restore(workflow).map_err(WorkflowError::Controller)?;
        lock(&self.inputs).take();
        {
            let mut st = lock(&self.state);
            st.instance_id = instance_id;
            st.is_loaded = true;
        }
        self.set_persistence_provider(provider.clone());
        self.install_controller(controller);
        info!(instance = %instance_id, "workflow instance loaded");
        Ok(())
    }
}
