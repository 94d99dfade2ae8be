use uuid::Uuid;

/// What an instance store failure is about.
///
/// Instance-level kinds let the host surface `InstanceNotFound` and
/// `InstanceLocked` to callers instead of a generic persistence failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// No stored instance with this id (or no runtime state stored for it).
    InstanceNotFound(Uuid),
    /// Another live owner holds the instance lock.
    InstanceLocked(Uuid),
    /// The lock owner is unknown to the store (deleted or never created).
    OwnerNotFound,
    /// Backend failure: I/O, SQL, serialization.
    Storage,
}

/// Store error with retry classification.
///
/// **Retryable**: database busy, pool timeouts, locked instances.
///
/// **Non-retryable**: missing instances, corrupt payloads, unknown owners,
/// constraint violations.
///
/// ```rust
/// use wfhost::providers::ProviderError;
///
/// let busy = ProviderError::retryable("save_instance", "database is locked");
/// assert!(busy.is_retryable());
/// let bad = ProviderError::permanent("load_instance", "invalid json");
/// assert!(!bad.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Store operation that failed (e.g. "save_instance", "lock_instance")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    /// Whether this error should be retried
    pub retryable: bool,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
            kind: ProviderErrorKind::Storage,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
            kind: ProviderErrorKind::Storage,
        }
    }

    pub fn instance_not_found(operation: impl Into<String>, instance: Uuid) -> Self {
        Self {
            operation: operation.into(),
            message: format!("instance {instance} not found"),
            retryable: false,
            kind: ProviderErrorKind::InstanceNotFound(instance),
        }
    }

    pub fn instance_locked(operation: impl Into<String>, instance: Uuid) -> Self {
        Self {
            operation: operation.into(),
            message: format!("instance {instance} is locked by another owner"),
            retryable: true,
            kind: ProviderErrorKind::InstanceLocked(instance),
        }
    }

    pub fn owner_not_found(operation: impl Into<String>, owner: Uuid) -> Self {
        Self {
            operation: operation.into(),
            message: format!("lock owner {owner} not found"),
            retryable: false,
            kind: ProviderErrorKind::OwnerNotFound,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// String errors from store backends are treated as retryable storage failures.
impl From<String> for ProviderError {
    fn from(s: String) -> Self {
        Self {
            operation: "unknown".to_string(),
            message: s,
            retryable: true,
            kind: ProviderErrorKind::Storage,
        }
    }
}

impl From<&str> for ProviderError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::permanent("serialize", e.to_string())
    }
}
