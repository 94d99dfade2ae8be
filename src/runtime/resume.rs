//! Bookmark resumption with retry.
//!
//! A resume waits for an idle interpreter. When the interpreter answers
//! `NotReady`, the caller backs off for a capped, doubling delay and then
//! re-queues a deferred operation. The backoff is bounded by the caller's
//! deadline, so a bookmark that never becomes ready ends in a timeout.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::deadline::Deadline;
use super::operation::InstanceOperation;
use super::{InstanceCore, LifecycleState, lock};
use crate::WorkflowError;
use crate::bookmark::{Bookmark, BookmarkResumptionResult, BookmarkScope};
use crate::tracking::TrackingRecord;

const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(100);

enum Attempt {
    Done(BookmarkResumptionResult),
    Retry,
}

/// Counts a resume that has started but not yet queued its operation, which
/// keeps the idle notification from firing in between.
struct Unenqueued<'a> {
    core: &'a InstanceCore,
}

impl<'a> Unenqueued<'a> {
    fn new(core: &'a InstanceCore) -> Self {
        lock(&core.state).pending_unenqueued += 1;
        Self { core }
    }
}

impl Drop for Unenqueued<'_> {
    fn drop(&mut self) {
        let mut st = lock(&self.core.state);
        st.pending_unenqueued = st.pending_unenqueued.saturating_sub(1);
    }
}

impl InstanceCore {
    pub(crate) async fn resume_bookmark_core(
        self: &Arc<Self>,
        bookmark: Bookmark,
        scope: Option<BookmarkScope>,
        value: Value,
        deadline: Deadline,
    ) -> Result<BookmarkResumptionResult, WorkflowError> {
        self.check_not_handler_thread()?;
        let mut unenqueued = None;

        // Resuming an instance nobody ran yet runs it first. A terminal
        // instance skips this so the attempt below reports `NotReady`.
        let needs_run = {
            let st = lock(&self.state);
            !st.has_called_run && !matches!(st.lifecycle, LifecycleState::Unloaded | LifecycleState::Aborted)
        };
        if needs_run {
            unenqueued = Some(Unenqueued::new(self));
            self.with_turn(
                InstanceOperation::plain(),
                &deadline,
                "resume_bookmark",
                self.run_effect(&deadline),
            )
            .await?;
        }

        let mut backoff: Option<Duration> = None;
        loop {
            let op = Arc::new(if backoff.is_some() {
                InstanceOperation::deferred_requires_idle()
            } else {
                InstanceOperation::requires_idle()
            });
            self.enqueue(&op, false);
            unenqueued.take();

            let turn = self.wait_for_turn(&op, &deadline, "resume_bookmark").await?;
            let attempt = match self.ensure_initialized() {
                Ok(()) => {
                    self.try_resume(&bookmark, scope.as_ref(), value.clone(), &deadline)
                        .await
                }
                Err(e) => Err(e),
            };
            if matches!(attempt, Ok(Attempt::Retry)) {
                // Counted before the turn goes back, so no idle is raised while we wait.
                unenqueued = Some(Unenqueued::new(self));
            }
            turn.release().await;

            match attempt? {
                Attempt::Done(result) => {
                    debug!(instance = %self.id(), %bookmark, ?result, "bookmark resumption finished");
                    return Ok(result);
                }
                Attempt::Retry => {
                    let delay = backoff.map_or(RETRY_BACKOFF_INITIAL, |d| (d * 2).min(RETRY_BACKOFF_MAX));
                    trace!(instance = %self.id(), %bookmark, ?delay, "bookmark not ready, retrying");
                    deadline.run("resume_bookmark", tokio::time::sleep(delay)).await?;
                    backoff = Some(delay);
                }
            }
        }
    }

    async fn try_resume(
        &self,
        bookmark: &Bookmark,
        scope: Option<&BookmarkScope>,
        value: Value,
        deadline: &Deadline,
    ) -> Result<Attempt, WorkflowError> {
        {
            let st = lock(&self.state);
            if matches!(st.lifecycle, LifecycleState::Unloaded | LifecycleState::Aborted) {
                return Ok(Attempt::Done(BookmarkResumptionResult::NotReady));
            }
            if st.is_complete() {
                return Ok(Attempt::Done(BookmarkResumptionResult::NotFound));
            }
        }

        let payload = value.clone();
        let result = self.with_controller(|c| c.schedule_bookmark_resumption(bookmark, scope, value))?;
        match result {
            BookmarkResumptionResult::Success => {
                self.tracking.add(TrackingRecord::BookmarkResumption {
                    instance_id: self.id(),
                    bookmark: bookmark.to_string(),
                    payload,
                });
                self.tracking.flush(deadline).await?;
                Ok(Attempt::Done(BookmarkResumptionResult::Success))
            }
            BookmarkResumptionResult::NotReady => Ok(Attempt::Retry),
            BookmarkResumptionResult::NotFound => Ok(Attempt::Done(BookmarkResumptionResult::NotFound)),
        }
    }
}
