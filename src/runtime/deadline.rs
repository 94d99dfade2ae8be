use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::WorkflowError;

/// Shared time budget for one host operation.
///
/// Each step asks for the remaining budget instead of getting its own timeout.
/// So the whole operation honours the caller's timeout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    expires_at: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    /// `Duration::MAX` (or any overflowing budget) means no deadline.
    pub(crate) fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now().checked_add(budget),
            budget: Some(budget),
        }
    }

    pub(crate) fn infinite() -> Self {
        Self {
            expires_at: None,
            budget: None,
        }
    }

    pub(crate) fn from_option(budget: Option<Duration>) -> Self {
        budget.map_or_else(Self::infinite, Self::after)
    }

    /// Remaining budget; `None` when unbounded.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[cfg(test)]
    pub(crate) fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    pub(crate) fn budget(&self) -> Duration {
        self.budget.unwrap_or(Duration::MAX)
    }

    /// Run `fut` within the remaining budget.
    pub(crate) async fn run<F, T>(&self, operation: &str, fut: F) -> Result<T, WorkflowError>
    where
        F: Future<Output = T>,
    {
        match self.expires_at {
            None => Ok(fut.await),
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| WorkflowError::timeout(operation, self.budget())),
        }
    }
}
