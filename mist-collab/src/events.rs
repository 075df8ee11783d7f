//! Typed pub/sub for real-time events.
//!
//! Event kinds are a closed set. Strings only appear at the edges, where
//! [`EventKind::from_str`] turns an unknown kind into a typed error.
//!
//! Handlers run synchronously in registration order. A handler that
//! returns `Err` or panics is logged and skipped; the remaining handlers
//! still run, and the event is still broadcast.

use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broadcast::PeerBroadcaster;
use crate::protocol::{EventEnvelope, Frame, ProtocolError};
use crate::session::{unix_millis, SessionId};

/// Category of a real-time update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Selection,
    Navigation,
    Edit,
    Presence,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Selection,
        EventKind::Navigation,
        EventKind::Edit,
        EventKind::Presence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Selection => "selection",
            EventKind::Navigation => "navigation",
            EventKind::Edit => "edit",
            EventKind::Presence => "presence",
        }
    }

    fn slot(&self) -> usize {
        match self {
            EventKind::Selection => 0,
            EventKind::Navigation => 1,
            EventKind::Edit => 2,
            EventKind::Presence => 3,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0:?}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "selection" => Ok(EventKind::Selection),
            "navigation" => Ok(EventKind::Navigation),
            "edit" => Ok(EventKind::Edit),
            "presence" => Ok(EventKind::Presence),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Subscriber callback: `(data, sender_id)`.
pub type EventHandler = Box<dyn Fn(&Value, &SessionId) -> HandlerResult + Send>;

/// Outcome of running the handlers for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that were called
    pub invoked: usize,
    /// Handlers that returned `Err` or panicked
    pub failed: usize,
}

/// Outcome of [`EventDispatcher::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub dispatch: DispatchReport,
    /// Peers the event frame reached
    pub peers: usize,
}

/// Ordered handler lists, one per event kind.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: [Vec<EventHandler>; 4],
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `kind`.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&Value, &SessionId) -> HandlerResult + Send + 'static,
    {
        self.handlers[kind.slot()].push(Box::new(handler));
    }

    /// Subscribe by kind name, rejecting unknown kinds.
    pub fn subscribe_named<F>(&mut self, kind: &str, handler: F) -> Result<EventKind, UnknownEventKind>
    where
        F: Fn(&Value, &SessionId) -> HandlerResult + Send + 'static,
    {
        let kind = kind.parse::<EventKind>()?;
        self.subscribe(kind, handler);
        Ok(kind)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers[kind.slot()].len()
    }

    /// Run the handlers for `kind` without broadcasting.
    pub fn dispatch(&self, kind: EventKind, data: &Value, sender_id: &SessionId) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (index, handler) in self.handlers[kind.slot()].iter().enumerate() {
            report.invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(data, sender_id))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    log::warn!("{kind} handler #{index} failed for {sender_id}: {e}");
                }
                Err(_) => {
                    report.failed += 1;
                    log::error!("{kind} handler #{index} panicked for {sender_id}");
                }
            }
        }

        report
    }

    /// Run the handlers for `kind`, then broadcast `{kind, data, sender_id}`.
    ///
    /// The broadcast happens regardless of handler failures.
    pub fn publish(
        &self,
        kind: EventKind,
        data: Value,
        sender_id: SessionId,
        broadcaster: &mut PeerBroadcaster,
    ) -> Result<PublishReport, ProtocolError> {
        let envelope = EventEnvelope::new(kind, data, sender_id);
        let frame = Frame::event(&envelope, unix_millis())?;
        let encoded = Arc::new(frame.encode()?);
        Ok(self.publish_encoded(&envelope, encoded, broadcaster))
    }

    /// [`publish`](Self::publish) for an envelope whose frame is already
    /// encoded, possibly signed.
    pub fn publish_encoded(
        &self,
        envelope: &EventEnvelope,
        encoded: Arc<Vec<u8>>,
        broadcaster: &mut PeerBroadcaster,
    ) -> PublishReport {
        let dispatch = self.dispatch(envelope.kind, &envelope.data, &envelope.sender_id);
        let peers = broadcaster.broadcast_raw(encoded);
        PublishReport { dispatch, peers }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in EventKind::ALL {
            map.entry(&kind.as_str(), &self.handler_count(kind));
        }
        map.finish()
    }
}
