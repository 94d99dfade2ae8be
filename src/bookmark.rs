//! Bookmarks and bookmark scopes.
//!
//! The host treats both as opaque correlation values that it passes to the
//! interpreter. A scope starts with a process-local temporary id. It can be
//! given a GUID exactly once, and that change is irreversible.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use crate::WorkflowError;

/// A named (or anonymous) suspension point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Bookmark {
    Named(String),
    Anonymous(u64),
}

impl Bookmark {
    pub fn named(name: impl Into<String>) -> Self {
        Bookmark::Named(name.into())
    }

    pub fn anonymous(id: u64) -> Self {
        Bookmark::Anonymous(id)
    }

    /// Name of a named bookmark; `None` for anonymous ones.
    pub fn name(&self) -> Option<&str> {
        match self {
            Bookmark::Named(n) => Some(n),
            Bookmark::Anonymous(_) => None,
        }
    }
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bookmark::Named(n) => write!(f, "{n}"),
            Bookmark::Anonymous(id) => write!(f, "#{id}"),
        }
    }
}

impl From<&str> for Bookmark {
    fn from(name: &str) -> Self {
        Bookmark::Named(name.to_string())
    }
}

impl From<String> for Bookmark {
    fn from(name: String) -> Self {
        Bookmark::Named(name)
    }
}

/// Outcome of asking the interpreter to resume a bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookmarkResumptionResult {
    Success,
    /// No such bookmark (or the instance already completed).
    NotFound,
    /// The interpreter has not reached a point where the bookmark can be resumed.
    NotReady,
}

static NEXT_TEMPORARY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ScopeInner {
    is_default: bool,
    temporary_id: u64,
    id: OnceLock<Uuid>,
}

/// Namespace partition for bookmark names.
///
/// Clones share identity: initializing one clone initializes all of them.
#[derive(Debug, Clone)]
pub struct BookmarkScope {
    inner: Arc<ScopeInner>,
}

impl BookmarkScope {
    /// A fresh, uninitialized scope with a new temporary id.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                is_default: false,
                temporary_id: NEXT_TEMPORARY_ID.fetch_add(1, Ordering::Relaxed),
                id: OnceLock::new(),
            }),
        }
    }

    /// A scope that is already initialized with `id`.
    pub fn with_id(id: Uuid) -> Self {
        let scope = Self::new();
        let _ = scope.inner.id.set(id);
        scope
    }

    /// The shared default scope.
    pub fn default_scope() -> Self {
        static DEFAULT: OnceLock<BookmarkScope> = OnceLock::new();
        DEFAULT
            .get_or_init(|| Self {
                inner: Arc::new(ScopeInner {
                    is_default: true,
                    temporary_id: 0,
                    id: OnceLock::new(),
                }),
            })
            .clone()
    }

    pub fn is_default(&self) -> bool {
        self.inner.is_default
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.id.get().is_some()
    }

    /// Assign the scope's GUID. Allowed once, and never on the default scope.
    pub fn initialize(&self, id: Uuid) -> Result<(), WorkflowError> {
        if self.inner.is_default {
            return Err(WorkflowError::InvalidState(
                "the default bookmark scope cannot be initialized".into(),
            ));
        }
        self.inner
            .id
            .set(id)
            .map_err(|_| WorkflowError::InvalidState("bookmark scope is already initialized".into()))
    }

    pub fn id(&self) -> Option<Uuid> {
        self.inner.id.get().copied()
    }

    pub fn temporary_id(&self) -> u64 {
        self.inner.temporary_id
    }

    pub fn info(&self) -> BookmarkScopeInfo {
        match self.id() {
            Some(id) => BookmarkScopeInfo::Id(id),
            None => BookmarkScopeInfo::Temporary(self.inner.temporary_id),
        }
    }
}

impl Default for BookmarkScope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for BookmarkScope {
    fn eq(&self, other: &Self) -> bool {
        match (self.inner.is_default, other.inner.is_default) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => match (self.id(), other.id()) {
                (Some(a), Some(b)) => a == b,
                (None, None) => self.inner.temporary_id == other.inner.temporary_id,
                _ => false,
            },
        }
    }
}

impl Eq for BookmarkScope {}

/// Serializable view of a scope, as reported by `get_bookmarks`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookmarkScopeInfo {
    Id(Uuid),
    Temporary(u64),
}

/// A pending bookmark as reported to hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookmarkInfo {
    pub bookmark_name: String,
    pub owner_display_name: Option<String>,
    pub scope: Option<BookmarkScopeInfo>,
}

impl BookmarkInfo {
    pub fn new(bookmark_name: impl Into<String>) -> Self {
        Self {
            bookmark_name: bookmark_name.into(),
            owner_display_name: None,
            scope: None,
        }
    }
}
