//! Event recording.
//!
//! Each controller owns its own [`Recorder`], constructed with the
//! controller's component name and an [`EventSink`]. There is no
//! process-wide registry or broadcaster.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Reason recorded when a resource was reconciled successfully.
pub const REASON_SYNCED: &str = "Synced";

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// Reference to the object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: u64,
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub involved_object: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    /// Component that recorded the event.
    pub source: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

/// Destination for recorded events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Records events about objects on behalf of one component.
pub trait EventRecorder: Send + Sync {
    fn event(&self, subject: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Recorder that logs each event and forwards it to a sink.
pub struct Recorder {
    component: String,
    sink: Arc<dyn EventSink>,
}

impl Recorder {
    pub fn new(component: &str, sink: Arc<dyn EventSink>) -> Self {
        Self {
            component: component.to_string(),
            sink,
        }
    }
}

impl EventRecorder for Recorder {
    fn event(&self, subject: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                component = %self.component,
                kind = %subject.kind,
                object = %format!("{}/{}", subject.namespace, subject.name),
                reason,
                detail = message,
                "event recorded"
            ),
            EventType::Warning => warn!(
                component = %self.component,
                kind = %subject.kind,
                object = %format!("{}/{}", subject.namespace, subject.name),
                reason,
                detail = message,
                "event recorded"
            ),
        }

        self.sink.record(Event {
            involved_object: subject.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            source: self.component.clone(),
            timestamp: epoch_secs(),
        });
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
