use std::time::Duration;
use uuid::Uuid;

use crate::controller::DefinitionIdentity;
use crate::providers::{ProviderError, ProviderErrorKind};

/// Error returned by every host-facing operation.
///
/// Terminal-state variants (`Aborted`, `Terminated`, `Completed`, `Unloaded`)
/// are raised when an operation is attempted after the instance left the
/// runnable family of states. `Timeout` and some `Persistence` errors are
/// retryable; see [`WorkflowError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// The turn was not granted, or I/O did not finish, within the budget.
    Timeout { operation: String, timeout: Duration },
    /// The operation is not allowed in the instance's current state.
    InvalidState(String),
    /// The instance was aborted.
    Aborted { instance: Uuid, reason: String },
    /// The instance was terminated.
    Terminated { instance: Uuid, reason: String },
    /// The instance already completed.
    Completed { instance: Uuid },
    /// The instance was unloaded from this host.
    Unloaded { instance: Uuid },
    /// Persist or unload requested without an instance store or pipeline module.
    StoreRequired,
    /// The store has no instance with this id.
    InstanceNotFound { instance: Option<Uuid> },
    /// The instance is locked by another owner.
    InstanceLocked { instance: Uuid },
    /// `load_runnable_instance` found nothing to load.
    NoRunnableInstance,
    /// The persisted definition identity does not match the graph being loaded.
    VersionMismatch {
        instance: Uuid,
        expected: Option<DefinitionIdentity>,
        found: Option<DefinitionIdentity>,
    },
    /// Any other store failure.
    Persistence(ProviderError),
    /// A tracking participant failed.
    Tracking(String),
    /// The interpreter could not be created, restored or serialized.
    Controller(String),
    /// The ambient transaction was rolled back.
    TransactionAborted(Uuid),
}

impl WorkflowError {
    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        WorkflowError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Timeout { .. } | WorkflowError::InstanceLocked { .. } => true,
            WorkflowError::Persistence(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error reports a terminal instance state.
    pub fn is_terminal_state(&self) -> bool {
        matches!(
            self,
            WorkflowError::Aborted { .. }
                | WorkflowError::Terminated { .. }
                | WorkflowError::Completed { .. }
                | WorkflowError::Unloaded { .. }
        )
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowError::Timeout { operation, timeout } => {
                write!(f, "{operation} did not complete within {timeout:?}")
            }
            WorkflowError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            WorkflowError::Aborted { instance, reason } => {
                write!(f, "workflow instance {instance} was aborted: {reason}")
            }
            WorkflowError::Terminated { instance, reason } => {
                write!(f, "workflow instance {instance} was terminated: {reason}")
            }
            WorkflowError::Completed { instance } => write!(f, "workflow instance {instance} has completed"),
            WorkflowError::Unloaded { instance } => write!(f, "workflow instance {instance} has been unloaded"),
            WorkflowError::StoreRequired => {
                write!(f, "an instance store is required to persist or unload this instance")
            }
            WorkflowError::InstanceNotFound { instance: Some(id) } => write!(f, "workflow instance {id} not found"),
            WorkflowError::InstanceNotFound { instance: None } => write!(f, "workflow instance not found"),
            WorkflowError::InstanceLocked { instance } => {
                write!(f, "workflow instance {instance} is locked by another owner")
            }
            WorkflowError::NoRunnableInstance => write!(f, "no runnable workflow instance is available"),
            WorkflowError::VersionMismatch {
                instance,
                expected,
                found,
            } => write!(
                f,
                "workflow instance {instance} was persisted with definition {} but is loaded with {}",
                describe_identity(found),
                describe_identity(expected)
            ),
            WorkflowError::Persistence(e) => write!(f, "persistence failed: {e}"),
            WorkflowError::Tracking(msg) => write!(f, "tracking failed: {msg}"),
            WorkflowError::Controller(msg) => write!(f, "interpreter error: {msg}"),
            WorkflowError::TransactionAborted(id) => write!(f, "transaction {id} was rolled back"),
        }
    }
}

fn describe_identity(identity: &Option<DefinitionIdentity>) -> String {
    match identity {
        Some(id) => id.to_string(),
        None => "<none>".to_string(),
    }
}

impl std::error::Error for WorkflowError {}

impl From<ProviderError> for WorkflowError {
    fn from(e: ProviderError) -> Self {
        match e.kind {
            ProviderErrorKind::InstanceNotFound(id) => WorkflowError::InstanceNotFound { instance: Some(id) },
            ProviderErrorKind::InstanceLocked(id) => WorkflowError::InstanceLocked { instance: id },
            _ => WorkflowError::Persistence(e),
        }
    }
}
