//! Persistence events.
//!
//! A session emits events around every save and delete so that callers can
//! audit writes or stamp entities before they are compiled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{NativeId, SessionId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An event emitted by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceEvent {
    pub id: EventId,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub subject: EventSubject,
}

impl PersistenceEvent {
    pub fn new(session_id: SessionId, kind: EventKind, subject: EventSubject) -> Self {
        Self {
            id: EventId::new(),
            session_id,
            timestamp: Utc::now(),
            kind,
            subject,
        }
    }
}

/// When the event fired relative to the write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "event_type")]
pub enum EventKind {
    PreSave,
    PostSave,
    PreDelete,
    PostDelete,
}

/// The entity an event is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSubject {
    /// Descriptor name (node label or relationship-entity name).
    pub type_name: String,
    /// Native id, absent for entities that have not been persisted yet.
    pub native_id: Option<NativeId>,
}

/// Receives persistence events. Implementations must not block.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &PersistenceEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_roundtrip() {
        let event = PersistenceEvent::new(
            SessionId::new(),
            EventKind::PostSave,
            EventSubject {
                type_name: "Movie".to_string(),
                native_id: Some(12),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: PersistenceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, deserialized.id);
        assert_eq!(deserialized.kind, EventKind::PostSave);
        assert_eq!(deserialized.subject.native_id, Some(12));
    }

    #[test]
    fn event_kind_tags() {
        let json = serde_json::to_string(&EventKind::PreDelete).unwrap();
        assert_eq!(json, "{\"event_type\":\"PreDelete\"}");
    }
}
