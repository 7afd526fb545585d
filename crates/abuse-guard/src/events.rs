//! Observability events emitted by the detector.
//!
//! This module provides the [`EventSink`] trait and default implementations.

use std::fmt;

use serde::Serialize;

/// What a [`GuardEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardEventKind {
    /// Count crossed the request threshold; the request still proceeds.
    Suspicious,
    /// Count crossed the block threshold and a block was just placed.
    Blocked,
    /// A request arrived from a client that is already blocked.
    BlockedRepeat,
}

impl fmt::Display for GuardEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Suspicious => "suspicious",
            Self::Blocked => "blocked",
            Self::BlockedRepeat => "blocked_repeat",
        };
        f.write_str(s)
    }
}

/// A suspicious or blocked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardEvent {
    /// Event kind.
    pub kind: GuardEventKind,
    /// Client identifier the request was attributed to.
    pub identifier: String,
    /// Request path.
    pub path: String,
    /// Request method.
    pub method: String,
    /// Count in the current window.
    pub count: u64,
    /// Threshold that was crossed.
    pub threshold: u64,
}

/// Destination for detector events.
///
/// Implement this trait to forward events to a custom destination
/// (e.g., an audit log or a metrics pipeline).
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Record one event.
    fn record(&self, event: &GuardEvent);
}

/// Event sink that uses the `tracing` infrastructure.
///
/// - Suspicious → `tracing::warn!`
/// - Blocked and `BlockedRepeat` → `tracing::error!`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &GuardEvent) {
        match event.kind {
            GuardEventKind::Suspicious => tracing::warn!(
                target: "abuse_guard",
                identifier = %event.identifier,
                path = %event.path,
                method = %event.method,
                count = event.count,
                threshold = event.threshold,
                "Suspicious request rate detected"
            ),
            GuardEventKind::Blocked => tracing::error!(
                target: "abuse_guard",
                identifier = %event.identifier,
                path = %event.path,
                method = %event.method,
                count = event.count,
                threshold = event.threshold,
                "DDoS attack detected, client blocked"
            ),
            GuardEventKind::BlockedRepeat => tracing::error!(
                target: "abuse_guard",
                identifier = %event.identifier,
                path = %event.path,
                method = %event.method,
                count = event.count,
                threshold = event.threshold,
                "Rejected request from blocked client"
            ),
        }
    }
}

/// Event sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event: &GuardEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: GuardEventKind) -> GuardEvent {
        GuardEvent {
            kind,
            identifier: "10.0.0.5".into(),
            path: "/api/posts".into(),
            method: "GET".into(),
            count: 3,
            threshold: 3,
        }
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(GuardEventKind::Suspicious.to_string(), "suspicious");
        assert_eq!(GuardEventKind::BlockedRepeat.to_string(), "blocked_repeat");
    }

    #[test]
    fn test_event_serializes() {
        let json = serde_json::to_value(event(GuardEventKind::Blocked)).unwrap();
        assert_eq!(json["kind"], "blocked");
        assert_eq!(json["identifier"], "10.0.0.5");
        assert_eq!(json["count"], 3);
    }

    #[test]
    fn test_sinks_accept_all_kinds() {
        for kind in [
            GuardEventKind::Suspicious,
            GuardEventKind::Blocked,
            GuardEventKind::BlockedRepeat,
        ] {
            TracingEventSink.record(&event(kind));
            NoopEventSink.record(&event(kind));
        }
    }
}
