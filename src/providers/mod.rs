use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::transaction::Transaction;

pub mod error;
pub use error::{ProviderError, ProviderErrorKind};

/// Identity of a lock owner registered with an instance store.
pub type OwnerId = Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceValueOptions {
    /// The value may be missing without failing the load.
    pub optional: bool,
    /// Stored, but never handed back by `load_instance`.
    pub write_only: bool,
}

/// One entry of persisted instance data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceValue {
    pub value: Value,
    #[serde(default)]
    pub options: InstanceValueOptions,
}

impl InstanceValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            options: InstanceValueOptions::default(),
        }
    }

    pub fn write_only(value: Value) -> Self {
        Self {
            value,
            options: InstanceValueOptions {
                optional: false,
                write_only: true,
            },
        }
    }

    pub fn optional(value: Value) -> Self {
        Self {
            value,
            options: InstanceValueOptions {
                optional: true,
                write_only: false,
            },
        }
    }

    pub fn is_write_only(&self) -> bool {
        self.options.write_only
    }
}

/// Persisted instance data keyed by qualified name.
pub type InstanceData = BTreeMap<String, InstanceValue>;

/// Well-known instance data keys written by the host.
pub mod names {
    /// Serialized interpreter runtime state. Its absence means "instance not found".
    pub const WORKFLOW: &str = "{urn:wfhost:instance}Workflow";
    pub const STATUS: &str = "{urn:wfhost:instance}Status";
    pub const BOOKMARKS: &str = "{urn:wfhost:instance}Bookmarks";
    pub const LAST_UPDATE: &str = "{urn:wfhost:instance}LastUpdate";
    pub const EXCEPTION: &str = "{urn:wfhost:instance}Exception";
    pub const DEFINITION_IDENTITY: &str = "{urn:wfhost:instance}DefinitionIdentity";
}

/// Values a load may hand back: everything that is not write-only.
pub fn readable(data: &InstanceData) -> InstanceData {
    data.iter()
        .filter(|(_, v)| !v.is_write_only())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A single save request.
#[derive(Debug, Clone, Default)]
pub struct SaveCommand {
    pub data: InstanceData,
    /// The interpreter still had runnable work when saved.
    pub runnable: bool,
    /// Release the instance lock once the write commits.
    pub unlock: bool,
    /// The instance completed; remove it from the store.
    pub complete: bool,
}

/// Durable store for workflow instances.
///
/// Instances are locked to a lock owner. An owner holds a lease, and the
/// host renews it in the background. Once the lease lapses, other owners
/// may take over the owner's locks. Writes go through a [`Transaction`]: the
/// store checks the lock right away, and the data becomes durable only when
/// the transaction commits.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create_owner(&self, lease: Duration) -> Result<OwnerId, ProviderError>;

    async fn renew_owner(&self, owner: OwnerId, lease: Duration) -> Result<(), ProviderError>;

    /// Delete the owner and release every lock it holds.
    async fn delete_owner(&self, owner: OwnerId) -> Result<(), ProviderError>;

    /// Lock `instance` to `owner`. Fails with `InstanceLocked` if another live owner holds it.
    async fn lock_instance(&self, owner: OwnerId, instance: Uuid) -> Result<(), ProviderError>;

    /// Lock the instance now and enlist the write in `tx`.
    async fn save_instance(
        &self,
        owner: OwnerId,
        instance: Uuid,
        command: SaveCommand,
        tx: &Transaction,
    ) -> Result<(), ProviderError>;

    /// Lock and read an instance. Write-only values are omitted.
    async fn load_instance(&self, owner: OwnerId, instance: Uuid) -> Result<InstanceData, ProviderError>;

    /// Lock and read any unlocked instance that has runnable work.
    async fn try_load_runnable(&self, owner: OwnerId) -> Result<Option<(Uuid, InstanceData)>, ProviderError>;

    async fn unlock_instance(&self, owner: OwnerId, instance: Uuid) -> Result<(), ProviderError>;
}

/// In-memory store for tests and single-process hosts.
pub mod in_memory;
/// SQLite-backed store.
pub mod sqlite;

pub use in_memory::InMemoryInstanceStore;
pub use sqlite::SqliteInstanceStore;
