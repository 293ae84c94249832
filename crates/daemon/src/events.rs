//! Lifecycle events
//!
//! The engine reports what happened to peers as typed events through an
//! [`EventSink`]. The daemon logs them; a messaging transport would plug in
//! as another sink.

use serde::Serialize;
use tracing::{info, warn};
use wgwarden_common::{ExpiryDate, PeerId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PeerEvent {
    Created {
        id: PeerId,
        name: String,
        address: String,
        expires_at: ExpiryDate,
    },
    Archived {
        id: PeerId,
        name: String,
        expires_at: ExpiryDate,
    },
    Renewed {
        id: PeerId,
        expires_at: ExpiryDate,
    },
    Restored {
        id: PeerId,
        expires_at: ExpiryDate,
    },
    Purged {
        id: PeerId,
    },
    ExpiringSoon {
        id: PeerId,
        name: String,
        expires_at: ExpiryDate,
        created_at: Timestamp,
        days_left: i64,
    },
    ConvergenceFailed {
        id: Option<PeerId>,
        op: String,
        error: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PeerEvent);
}

/// Writes events as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: PeerEvent) {
        match &event {
            PeerEvent::Created { id, name, address, expires_at } => {
                info!(peer = %id, %name, %address, %expires_at, "Peer created")
            }
            PeerEvent::Archived { id, name, expires_at } => {
                info!(peer = %id, %name, %expires_at, "Peer archived")
            }
            PeerEvent::Renewed { id, expires_at } => info!(peer = %id, %expires_at, "Peer renewed"),
            PeerEvent::Restored { id, expires_at } => {
                info!(peer = %id, %expires_at, "Peer restored from archive")
            }
            PeerEvent::Purged { id } => info!(peer = %id, "Peer purged"),
            PeerEvent::ExpiringSoon { id, name, expires_at, days_left, .. } => {
                warn!(peer = %id, %name, %expires_at, days_left, "Peer expires soon")
            }
            PeerEvent::ConvergenceFailed { id, op, error } => {
                warn!(peer = id.as_deref().unwrap_or("-"), %op, %error, "Convergence failed")
            }
        }
    }
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps every event for inspection
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<PeerEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<PeerEvent> {
            self.events.lock().clone()
        }

        pub fn clear(&self) {
            self.events.lock().clear();
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: PeerEvent) {
            self.events.lock().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = PeerEvent::ExpiringSoon {
            id: "id3".to_string(),
            name: "ivan".to_string(),
            expires_at: ExpiryDate::from_ymd(2025, 7, 1).unwrap(),
            created_at: Timestamp::parse("01.06.2025 10:00:00").unwrap(),
            days_left: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "expiring_soon");
        assert_eq!(json["expires_at"], "01.07.2025");
        assert_eq!(json["days_left"], 2);

        TracingEventSink.emit(event);
    }
}
