//! Typed profile events and the sinks that carry them.

use crate::profile::types::ProfileSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Event type, serialized with its wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Update,
    Connected,
    Disconnected,
    Output,
    Inactive,
    AuthError,
    ConnectionError,
    ConfigurationError,
    TimeoutError,
    HandshakeTimeout,
}

/// Payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Profile(ProfileSnapshot),
    Output { id: String, output: String },
}

/// A single event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: EventData,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn profile(kind: EventKind, snapshot: ProfileSnapshot) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            data: EventData::Profile(snapshot),
            timestamp: Utc::now(),
        }
    }

    pub fn output(profile_id: &str, output: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: EventKind::Output,
            data: EventData::Output {
                id: profile_id.to_string(),
                output: output.to_string(),
            },
            timestamp: Utc::now(),
        }
    }

    /// Id of the profile the event concerns.
    pub fn profile_id(&self) -> &str {
        match &self.data {
            EventData::Profile(s) => &s.id,
            EventData::Output { id, .. } => id,
        }
    }

    /// Snapshot carried by the event, if any.
    pub fn snapshot(&self) -> Option<&ProfileSnapshot> {
        match &self.data {
            EventData::Profile(s) => Some(s),
            EventData::Output { .. } => None,
        }
    }
}

/// Destination for engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Forwards events into an unbounded tokio channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            log::debug!("Event receiver dropped");
        }
    }
}

/// Writes events to the log facade.
#[derive(Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        match &event.data {
            EventData::Profile(s) => {
                log::info!("[{}] event {:?} status={}", s.id, event.kind, s.status)
            }
            EventData::Output { id, output } => log::debug!("[{}] {}", id, output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names() {
        let json = serde_json::to_string(&EventKind::HandshakeTimeout).unwrap();
        assert_eq!(json, "\"handshake_timeout\"");
        let json = serde_json::to_string(&EventKind::AuthError).unwrap();
        assert_eq!(json, "\"auth_error\"");
    }

    #[test]
    fn output_event_shape() {
        let ev = Event::output("p1", "hello");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "output");
        assert_eq!(v["data"]["id"], "p1");
        assert_eq!(v["data"]["output"], "hello");
        assert_eq!(ev.profile_id(), "p1");
        assert!(ev.snapshot().is_none());
    }

    #[tokio::test]
    async fn channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        let snap = ProfileSnapshot {
            id: "abc".into(),
            ..Default::default()
        };
        sink.emit(Event::profile(EventKind::Update, snap));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Update);
        assert_eq!(ev.profile_id(), "abc");
    }

    #[test]
    fn channel_sink_tolerates_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(Event::output("x", "y"));
    }
}
