use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{InstanceData, InstanceStore, OwnerId, ProviderError, SaveCommand, names, readable};
use crate::transaction::{Enlistment, Transaction};

#[derive(Debug, Default)]
struct StoredInstance {
    data: InstanceData,
    owner: Option<OwnerId>,
    runnable: bool,
}

impl StoredInstance {
    fn has_state(&self) -> bool {
        self.data.contains_key(names::WORKFLOW)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    owners: HashMap<OwnerId, Instant>,
    instances: HashMap<Uuid, StoredInstance>,
}

impl StoreState {
    fn is_live(&self, owner: &OwnerId) -> bool {
        self.owners.get(owner).is_some_and(|expiry| *expiry > Instant::now())
    }

    fn require_live(&self, operation: &str, owner: OwnerId) -> Result<(), ProviderError> {
        if self.is_live(&owner) {
            Ok(())
        } else {
            Err(ProviderError::owner_not_found(operation, owner))
        }
    }

    /// The lock is free for `owner` if unheld, held by `owner`, or held by an expired owner.
    fn lock_available(&self, instance: &StoredInstance, owner: OwnerId) -> bool {
        match instance.owner {
            None => true,
            Some(holder) => holder == owner || !self.is_live(&holder),
        }
    }

    fn acquire(&mut self, operation: &str, owner: OwnerId, instance_id: Uuid) -> Result<(), ProviderError> {
        self.require_live(operation, owner)?;
        let available = match self.instances.get(&instance_id) {
            Some(instance) => self.lock_available(instance, owner),
            None => true,
        };
        if !available {
            return Err(ProviderError::instance_locked(operation, instance_id));
        }
        self.instances.entry(instance_id).or_default().owner = Some(owner);
        Ok(())
    }
}

fn expiry_after(lease: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(lease)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

/// Instance store kept entirely in process memory.
///
/// Clones share the same data, so two hosts in one test can contend for the
/// same instances.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInstanceStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of instances that have runtime state stored.
    pub async fn instance_ids(&self) -> Vec<Uuid> {
        let g = self.state.lock().await;
        let mut ids: Vec<Uuid> = g
            .instances
            .iter()
            .filter(|(_, i)| i.has_state())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub async fn lock_owner(&self, instance: Uuid) -> Option<OwnerId> {
        self.state.lock().await.instances.get(&instance).and_then(|i| i.owner)
    }

    /// Raw stored values, write-only entries included.
    pub async fn stored_data(&self, instance: Uuid) -> Option<InstanceData> {
        self.state.lock().await.instances.get(&instance).map(|i| i.data.clone())
    }

    pub async fn owner_count(&self) -> usize {
        self.state.lock().await.owners.len()
    }
}

struct InMemoryWrite {
    state: Arc<Mutex<StoreState>>,
    owner: OwnerId,
    instance: Uuid,
    command: Option<SaveCommand>,
}

#[async_trait]
impl Enlistment for InMemoryWrite {
    async fn commit(&mut self) -> Result<(), ProviderError> {
        let Some(command) = self.command.take() else {
            return Ok(());
        };
        let mut g = self.state.lock().await;
        let held = g
            .instances
            .get(&self.instance)
            .is_some_and(|i| i.owner == Some(self.owner));
        if !held || !g.is_live(&self.owner) {
            return Err(ProviderError::instance_locked("save_instance", self.instance));
        }
        if command.complete {
            g.instances.remove(&self.instance);
            return Ok(());
        }
        if let Some(instance) = g.instances.get_mut(&self.instance) {
            instance.data = command.data;
            instance.runnable = command.runnable;
            if command.unlock {
                instance.owner = None;
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) {
        self.command = None;
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create_owner(&self, lease: Duration) -> Result<OwnerId, ProviderError> {
        let owner = Uuid::new_v4();
        self.state.lock().await.owners.insert(owner, expiry_after(lease));
        tracing::debug!(owner = %owner, "created lock owner");
        Ok(owner)
    }

    async fn renew_owner(&self, owner: OwnerId, lease: Duration) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        match g.owners.get_mut(&owner) {
            Some(expiry) => {
                *expiry = expiry_after(lease);
                Ok(())
            }
            None => Err(ProviderError::owner_not_found("renew_owner", owner)),
        }
    }

    async fn delete_owner(&self, owner: OwnerId) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        g.owners.remove(&owner);
        for instance in g.instances.values_mut() {
            if instance.owner == Some(owner) {
                instance.owner = None;
            }
        }
        Ok(())
    }

    async fn lock_instance(&self, owner: OwnerId, instance: Uuid) -> Result<(), ProviderError> {
        self.state.lock().await.acquire("lock_instance", owner, instance)
    }

    async fn save_instance(
        &self,
        owner: OwnerId,
        instance: Uuid,
        command: SaveCommand,
        tx: &Transaction,
    ) -> Result<(), ProviderError> {
        self.state.lock().await.acquire("save_instance", owner, instance)?;
        tx.enlist(Box::new(InMemoryWrite {
            state: self.state.clone(),
            owner,
            instance,
            command: Some(command),
        }))
        .map_err(|e| ProviderError::permanent("save_instance", e.to_string()))
    }

    async fn load_instance(&self, owner: OwnerId, instance: Uuid) -> Result<InstanceData, ProviderError> {
        let mut g = self.state.lock().await;
        if !g.instances.get(&instance).is_some_and(StoredInstance::has_state) {
            return Err(ProviderError::instance_not_found("load_instance", instance));
        }
        g.acquire("load_instance", owner, instance)?;
        Ok(g.instances.get(&instance).map(|i| readable(&i.data)).unwrap_or_default())
    }

    async fn try_load_runnable(&self, owner: OwnerId) -> Result<Option<(Uuid, InstanceData)>, ProviderError> {
        let mut g = self.state.lock().await;
        g.require_live("try_load_runnable", owner)?;
        let mut candidates: Vec<Uuid> = g
            .instances
            .iter()
            .filter(|(_, i)| i.runnable && i.has_state() && g.lock_available(i, owner))
            .map(|(id, _)| *id)
            .collect();
        candidates.sort();
        let Some(id) = candidates.first().copied() else {
            return Ok(None);
        };
        g.acquire("try_load_runnable", owner, id)?;
        let data = g.instances.get(&id).map(|i| readable(&i.data)).unwrap_or_default();
        Ok(Some((id, data)))
    }

    async fn unlock_instance(&self, owner: OwnerId, instance: Uuid) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if let Some(stored) = g.instances.get_mut(&instance)
            && stored.owner == Some(owner)
        {
            stored.owner = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{InstanceValue, ProviderErrorKind};
    use serde_json::json;

    fn command(runnable: bool) -> SaveCommand {
        let mut data = InstanceData::new();
        data.insert(names::WORKFLOW.into(), InstanceValue::new(json!({"position": 1})));
        data.insert("secret".into(), InstanceValue::write_only(json!("x")));
        SaveCommand {
            data,
            runnable,
            unlock: false,
            complete: false,
        }
    }

    #[tokio::test]
    async fn save_is_invisible_until_commit() {
        let store = InMemoryInstanceStore::new();
        let owner = store.create_owner(Duration::from_secs(30)).await.unwrap();
        let id = Uuid::new_v4();
        let tx = Transaction::new();
        store.save_instance(owner, id, command(false), &tx).await.unwrap();

        let err = store.load_instance(owner, id).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InstanceNotFound(id));

        tx.commit().await.unwrap();
        let data = store.load_instance(owner, id).await.unwrap();
        assert!(data.contains_key(names::WORKFLOW));
        assert!(!data.contains_key("secret"));
    }

    #[tokio::test]
    async fn other_owner_is_locked_out_until_expiry() {
        let store = InMemoryInstanceStore::new();
        let first = store.create_owner(Duration::from_millis(50)).await.unwrap();
        let second = store.create_owner(Duration::from_secs(30)).await.unwrap();
        let id = Uuid::new_v4();
        let tx = Transaction::new();
        store.save_instance(first, id, command(true), &tx).await.unwrap();
        tx.commit().await.unwrap();

        let err = store.load_instance(second, id).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InstanceLocked(id));

        tokio::time::sleep(Duration::from_millis(80)).await;
        store.load_instance(second, id).await.unwrap();
        assert_eq!(store.lock_owner(id).await, Some(second));
    }

    #[tokio::test]
    async fn runnable_instances_are_picked_once() {
        let store = InMemoryInstanceStore::new();
        let owner = store.create_owner(Duration::from_secs(30)).await.unwrap();
        let id = Uuid::new_v4();
        let tx = Transaction::new();
        let mut cmd = command(true);
        cmd.unlock = true;
        store.save_instance(owner, id, cmd, &tx).await.unwrap();
        tx.commit().await.unwrap();

        let other = store.create_owner(Duration::from_secs(30)).await.unwrap();
        let (loaded, _) = store.try_load_runnable(other).await.unwrap().unwrap();
        assert_eq!(loaded, id);
        assert!(store.try_load_runnable(owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_owner_releases_locks() {
        let store = InMemoryInstanceStore::new();
        let owner = store.create_owner(Duration::from_secs(30)).await.unwrap();
        let id = Uuid::new_v4();
        store.lock_instance(owner, id).await.unwrap();
        store.delete_owner(owner).await.unwrap();
        assert_eq!(store.lock_owner(id).await, None);
        assert!(store.renew_owner(owner, Duration::from_secs(1)).await.is_err());
    }
}
