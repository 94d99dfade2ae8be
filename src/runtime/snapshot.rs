use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::WorkflowApplicationOptions;
use super::deadline::Deadline;
use super::persistence::PersistenceProvider;
use crate::WorkflowError;
use crate::controller::DefinitionIdentity;
use crate::providers::{InstanceData, InstanceStore, names};

/// An instance loaded from a store but not yet attached to an application.
///
/// Holds the instance lock. Pass it to [`WorkflowApplication::load_instance`]
/// to resume it, or [`abandon`](Self::abandon) it to release the lock.
///
/// [`WorkflowApplication::load_instance`]: crate::WorkflowApplication::load_instance
pub struct WorkflowApplicationInstance {
    pub(crate) provider: Arc<PersistenceProvider>,
    pub(crate) data: InstanceData,
    identity: Option<DefinitionIdentity>,
}

impl std::fmt::Debug for WorkflowApplicationInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowApplicationInstance")
            .field("instance_id", &self.instance_id())
            .field("identity", &self.identity)
            .field("values", &self.data.len())
            .finish()
    }
}

/// Read the definition identity stored with an instance.
pub(crate) fn stored_identity(data: &InstanceData) -> Result<Option<DefinitionIdentity>, WorkflowError> {
    match data.get(names::DEFINITION_IDENTITY) {
        None => Ok(None),
        Some(v) if v.value.is_null() => Ok(None),
        Some(v) => serde_json::from_value(v.value.clone())
            .map(Some)
            .map_err(|e| WorkflowError::Controller(format!("invalid stored definition identity: {e}"))),
    }
}

impl WorkflowApplicationInstance {
    pub(crate) async fn fetch(
        store: Arc<dyn InstanceStore>,
        instance: Option<Uuid>,
        options: &WorkflowApplicationOptions,
        timeout: Duration,
    ) -> Result<Self, WorkflowError> {
        let deadline = Deadline::after(timeout);
        let provider = Arc::new(PersistenceProvider::new(
            store,
            instance.unwrap_or_else(Uuid::new_v4),
            None,
            options.owner_lease,
            options.lock_renewal_buffer,
        ));
        provider.initialize(&deadline).await?;

        let loaded = match instance {
            Some(_) => provider.load(&deadline).await.map(Some),
            None => provider.try_load_runnable(&deadline).await,
        };
        let data = match loaded {
            Ok(Some(data)) => data,
            Ok(None) => {
                let _ = provider.delete_owner(&deadline).await;
                return Err(WorkflowError::NoRunnableInstance);
            }
            Err(e) => {
                let _ = provider.delete_owner(&deadline).await;
                return Err(e);
            }
        };
        let identity = stored_identity(&data)?;
        tracing::debug!(instance = %provider.instance_id(), "fetched detached instance");
        Ok(Self {
            provider,
            data,
            identity,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.provider.instance_id()
    }

    pub fn definition_identity(&self) -> Option<&DefinitionIdentity> {
        self.identity.as_ref()
    }

    /// Loaded values (write-only values are never returned by stores).
    pub fn values(&self) -> &InstanceData {
        &self.data
    }

    /// Release the lock and owner without loading the instance.
    pub async fn abandon(self, timeout: Duration) -> Result<(), WorkflowError> {
        let deadline = Deadline::after(timeout);
        self.provider.unlock(&deadline).await?;
        self.provider.delete_owner(&deadline).await
    }
}
