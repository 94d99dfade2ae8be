//! Tracking records and participants.
//!
//! The host buffers records and delivers them to every participant in order
//! when an operation flushes. Delivery is bounded by the operation's deadline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::WorkflowError;
use crate::runtime::deadline::Deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceTrackingState {
    Started,
    Resumed,
    Idle,
    Persisted,
    Unloaded,
    Deleted,
    Completed,
    Canceled,
    Terminated,
    Aborted,
    UnhandledException,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackingRecord {
    Instance {
        instance_id: Uuid,
        state: InstanceTrackingState,
        reason: Option<String>,
    },
    BookmarkResumption {
        instance_id: Uuid,
        bookmark: String,
        payload: Value,
    },
    /// Emitted by the interpreter.
    Custom { name: String, data: Value },
}

impl TrackingRecord {
    pub fn instance(instance_id: Uuid, state: InstanceTrackingState) -> Self {
        TrackingRecord::Instance {
            instance_id,
            state,
            reason: None,
        }
    }

    pub fn instance_with_reason(instance_id: Uuid, state: InstanceTrackingState, reason: impl Into<String>) -> Self {
        TrackingRecord::Instance {
            instance_id,
            state,
            reason: Some(reason.into()),
        }
    }

    pub fn instance_state(&self) -> Option<InstanceTrackingState> {
        match self {
            TrackingRecord::Instance { state, .. } => Some(*state),
            _ => None,
        }
    }
}

/// A record stamped with its per-instance sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub record_number: u64,
    pub timestamp: SystemTime,
    pub record: TrackingRecord,
}

/// Sink for tracking events.
#[async_trait]
pub trait TrackingParticipant: Send + Sync {
    async fn track(&self, event: &TrackingEvent, timeout: Duration) -> Result<(), String>;
}

pub(crate) struct TrackingProvider {
    participants: Vec<Arc<dyn TrackingParticipant>>,
    pending: Mutex<VecDeque<TrackingEvent>>,
    next_record: AtomicU64,
}

impl TrackingProvider {
    pub(crate) fn new(participants: Vec<Arc<dyn TrackingParticipant>>) -> Self {
        Self {
            participants,
            pending: Mutex::new(VecDeque::new()),
            next_record: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !self.participants.is_empty()
    }

    pub(crate) fn add(&self, record: TrackingRecord) {
        if !self.is_enabled() {
            return;
        }
        let event = TrackingEvent {
            record_number: self.next_record.fetch_add(1, Ordering::SeqCst),
            timestamp: SystemTime::now(),
            record,
        };
        crate::runtime::lock(&self.pending).push_back(event);
    }

    #[cfg(test)]
    pub(crate) fn has_pending(&self) -> bool {
        !crate::runtime::lock(&self.pending).is_empty()
    }

    /// Deliver pending records in order; stops at the first failure.
    ///
    /// A record that failed or timed out stays at the head of the queue.
    pub(crate) async fn flush(&self, deadline: &Deadline) -> Result<(), WorkflowError> {
        loop {
            let event = match crate::runtime::lock(&self.pending).front() {
                Some(event) => event.clone(),
                None => return Ok(()),
            };
            for participant in &self.participants {
                let timeout = deadline.remaining().unwrap_or(Duration::MAX);
                deadline
                    .run("flush_tracking", participant.track(&event, timeout))
                    .await?
                    .map_err(WorkflowError::Tracking)?;
            }
            crate::runtime::lock(&self.pending).pop_front();
            tracing::trace!(
                target: "wfhost::tracking",
                record_number = event.record_number,
                "tracking record delivered"
            );
        }
    }
}
