//! Event records and feeds.
//!
//! Everything observable about the engine flows through structured
//! [`AutonomicEvent`] records published to an [`EventSink`]: trigger state
//! transitions, definition lifecycle, evaluation errors, reaction runs, and
//! notify actions. The engine itself is driven by a single merged feed of
//! telemetry packets and control-plane events.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::packet::TelemetryPacket;
use crate::reaction::ReactionDefinition;
use crate::trigger::TriggerDefinition;

/// Which entity class an event record concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventClass {
    Trigger,
    Reaction,
    Group,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Enabled,
    Disabled,
    /// Trigger state committed true.
    True,
    /// Trigger state committed false.
    False,
    Error,
    /// Reaction action list executed.
    Run,
    Snoozed,
    Awakened,
    /// Notify action payload.
    Notify,
    /// Command/script skipped because automation is globally disabled.
    AutomationDisabled,
    /// Manager or worker thread failed; ingestion is impaired.
    Degraded,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::True => "true",
            Self::False => "false",
            Self::Error => "error",
            Self::Run => "run",
            Self::Snoozed => "snoozed",
            Self::Awakened => "awakened",
            Self::Notify => "notify",
            Self::AutomationDisabled => "automation_disabled",
            Self::Degraded => "degraded",
        };
        f.write_str(label)
    }
}

/// A structured event record for the shared event/log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomicEvent {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub class: EventClass,
    pub kind: EventKind,
    /// Name of the trigger/reaction/group concerned.
    pub name: String,
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AutonomicEvent {
    fn new(class: EventClass, kind: EventKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        let severity = match kind {
            EventKind::Error | EventKind::Degraded => "ERROR",
            EventKind::AutomationDisabled => "WARN",
            _ => "INFO",
        };
        Self {
            id: Uuid::new_v4(),
            time: Utc::now(),
            class,
            kind,
            name: name.into(),
            severity: severity.to_string(),
            message: message.into(),
            data: None,
        }
    }

    /// A trigger-class event.
    #[must_use]
    pub fn trigger(kind: EventKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventClass::Trigger, kind, name, message)
    }

    /// A reaction-class event.
    #[must_use]
    pub fn reaction(kind: EventKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventClass::Reaction, kind, name, message)
    }

    /// A group-class event.
    #[must_use]
    pub fn group(kind: EventKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventClass::Group, kind, name, message)
    }

    /// Overrides the default severity label.
    #[must_use]
    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = severity.into();
        self
    }

    /// Attaches a structured payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Destination for structured event records.
///
/// Publishing is best-effort and must never block the evaluation path.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: AutonomicEvent);
}

/// Channel-backed sink for embedding and tests.
///
/// Events are enqueued with `try_send`; when the subscriber falls behind the
/// event is dropped and counted rather than blocking a worker.
#[derive(Debug)]
pub struct ChannelEventSink {
    tx: Sender<AutonomicEvent>,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    /// Creates a sink and its receiving end with the given capacity.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Receiver<AutonomicEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Number of events dropped because the subscriber was slow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: AutonomicEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Control-plane events for triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TriggerControl {
    Create(TriggerDefinition),
    Update(TriggerDefinition),
    Delete { name: String },
    Enable { name: String },
    Disable { name: String },
}

/// Control-plane events for reactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReactionControl {
    Create(ReactionDefinition),
    Update(ReactionDefinition),
    Delete { name: String },
    Enable { name: String },
    Disable { name: String },
    /// Execute the action list once, bypassing snooze and trigger state.
    RunNow { name: String },
}

/// Control-plane events for groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupControl {
    Created { name: String },
    /// Tears down every reaction and trigger in the group.
    Deleted { name: String },
}

/// A create/update/delete event consumed from the always-subscribed control
/// feed and applied in the ingest path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlEvent {
    Trigger(TriggerControl),
    Reaction(ReactionControl),
    Group(GroupControl),
    /// Refreshes the global automation-enabled toggle.
    Automation { enabled: bool },
}

/// One entry on the merged telemetry + control feed a group runtime reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedEvent {
    Telemetry(TelemetryPacket),
    Control(ControlEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_severity_defaults() {
        let event = AutonomicEvent::trigger(EventKind::Error, "TRIG1", "bad regex");
        assert_eq!(event.severity, "ERROR");
        let event = AutonomicEvent::reaction(EventKind::Run, "REACT1", "fired");
        assert_eq!(event.severity, "INFO");
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, rx) = ChannelEventSink::pair(1);
        sink.publish(AutonomicEvent::group(EventKind::Created, "DEFAULT", "created"));
        sink.publish(AutonomicEvent::group(EventKind::Created, "DEFAULT", "created"));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_control_event_round_trip() {
        let event = ControlEvent::Trigger(TriggerControl::Delete {
            name: "TRIG1".to_string(),
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: ControlEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
