//! User-facing notifications about runner sets.
//!
//! Emission is fire-and-forget: a failure to record an event is logged and
//! never affects the reconciliation that produced it.

use chrono::Utc;
use octorun_state::{Event, EventType, ObjectMeta, ObjectReference, ObjectStore};
use tracing::{debug, warn};

pub const REASON_RUNNER_ADOPTED: &str = "RunnerAdopted";
pub const REASON_RUNNER_CREATED: &str = "RunnerCreated";
pub const REASON_RUNNER_DELETED: &str = "RunnerDeleted";
pub const REASON_REVISION_CREATED: &str = "RevisionCreated";

/// Sink for user-facing notifications.
pub trait EventRecorder: Send + Sync {
    fn emit(&self, subject: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Records events as `Event` objects in the state store.
pub struct StoreEventRecorder<S> {
    store: S,
    source: String,
}

impl<S: ObjectStore> StoreEventRecorder<S> {
    pub fn new(store: S, source: impl Into<String>) -> Self {
        Self {
            store,
            source: source.into(),
        }
    }
}

impl<S: ObjectStore> EventRecorder for StoreEventRecorder<S> {
    fn emit(&self, subject: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let now = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", subject.name)),
                namespace: subject.namespace.clone(),
                ..Default::default()
            },
            involved_object: Some(subject.clone()),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            source: self.source.clone(),
            first_timestamp: Some(now),
            last_timestamp: Some(now),
            count: 1,
        };

        match self.store.create(&event) {
            Ok(_) => debug!(
                subject = %format_args!("{}/{}", subject.namespace, subject.name),
                %event_type,
                reason,
                text = message,
                "event recorded"
            ),
            Err(e) => warn!(
                subject = %format_args!("{}/{}", subject.namespace, subject.name),
                reason,
                error = %e,
                "failed to record event"
            ),
        }
    }
}

/// Discards every event.
pub struct NoopEventRecorder;

impl EventRecorder for NoopEventRecorder {
    fn emit(&self, _: &ObjectReference, _: EventType, _: &str, _: &str) {}
}
