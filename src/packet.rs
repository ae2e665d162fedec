//! Decommutated telemetry packets and the per-topic history buffer.
//!
//! Packet ingestion and decommutation are external collaborators: the engine
//! consumes already-decommutated [`TelemetryPacket`]s from the feed. The
//! [`PacketBuffer`] keeps the last two packets per topic, which is exactly the
//! history depth change-detection operators need.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::TelemetryValue;

/// Identifies the telemetry stream for one target+packet pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    /// Derives the topic for a target+packet pair.
    #[must_use]
    pub fn from_parts(target: &str, packet: &str) -> Self {
        Self(format!("DECOM__{target}__{packet}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single decommutated item within a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketItem {
    pub raw: TelemetryValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted: Option<TelemetryValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Current limit-state label, e.g. `GREEN`, `YELLOW_LOW`, `RED_HIGH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_state: Option<String>,
}

impl PacketItem {
    /// Creates an item carrying only a raw value.
    #[must_use]
    pub const fn raw(value: TelemetryValue) -> Self {
        Self {
            raw: value,
            converted: None,
            formatted: None,
            units: None,
            limit_state: None,
        }
    }
}

/// A decommutated telemetry packet as received from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub target: String,
    pub packet: String,
    pub items: HashMap<String, PacketItem>,
    pub received_at: DateTime<Utc>,
}

impl TelemetryPacket {
    /// Creates an empty packet stamped now.
    #[must_use]
    pub fn new(target: impl Into<String>, packet: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            packet: packet.into(),
            items: HashMap::new(),
            received_at: Utc::now(),
        }
    }

    /// Adds an item, replacing any existing item of the same name.
    #[must_use]
    pub fn with_item(mut self, name: impl Into<String>, item: PacketItem) -> Self {
        self.items.insert(name.into(), item);
        self
    }

    /// The topic this packet belongs to.
    #[must_use]
    pub fn topic(&self) -> TopicId {
        TopicId::from_parts(&self.target, &self.packet)
    }

    /// Reads an item value in the requested form.
    ///
    /// `Converted` falls back to the raw value when no conversion was applied,
    /// and `Formatted` renders the converted (or raw) value when no explicit
    /// formatting exists.
    #[must_use]
    pub fn read(&self, item: &str, field: ValueField) -> Option<TelemetryValue> {
        let entry = self.items.get(item)?;
        match field {
            ValueField::Raw => Some(entry.raw.clone()),
            ValueField::Converted => Some(entry.converted.clone().unwrap_or_else(|| entry.raw.clone())),
            ValueField::Formatted => {
                let text = entry.formatted.clone().unwrap_or_else(|| {
                    entry
                        .converted
                        .as_ref()
                        .unwrap_or(&entry.raw)
                        .to_string()
                });
                Some(TelemetryValue::Text(text))
            }
            ValueField::Limit => entry.limit_state.clone().map(TelemetryValue::Text),
        }
    }

    /// Reads an item's limit-state label.
    #[must_use]
    pub fn limit_state(&self, item: &str) -> Option<&str> {
        self.items.get(item)?.limit_state.as_deref()
    }
}

/// Which form of a telemetry item an operand reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueField {
    Raw,
    Converted,
    Formatted,
    Limit,
}

/// Thread-safe per-topic packet history, depth 2.
///
/// Shared between the manager thread (which appends) and the evaluator
/// workers (which read). Change-detection operators compare the two most
/// recent packets; deeper history is deliberately not kept.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    packets: Mutex<HashMap<TopicId, Vec<TelemetryPacket>>>,
}

impl PacketBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a packet, evicting the oldest once two are held.
    pub fn add(&self, topic: TopicId, packet: TelemetryPacket) {
        let mut guard = self.packets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let history = guard.entry(topic).or_default();
        if history.len() == 2 {
            history.remove(0);
        }
        history.push(packet);
    }

    /// The most recent packet for a topic.
    #[must_use]
    pub fn latest(&self, topic: &TopicId) -> Option<TelemetryPacket> {
        let guard = self.packets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(topic).and_then(|h| h.last().cloned())
    }

    /// The packet before the most recent one, if two have been seen.
    #[must_use]
    pub fn previous(&self, topic: &TopicId) -> Option<TelemetryPacket> {
        let guard = self.packets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(topic).filter(|h| h.len() == 2).map(|h| h[0].clone())
    }

    /// Drops all history for a topic (no longer subscribed).
    pub fn remove(&self, topic: &TopicId) {
        let mut guard = self.packets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.remove(topic);
    }

    /// Keeps only the topics `keep` accepts, dropping the rest.
    pub fn retain(&self, keep: impl Fn(&TopicId) -> bool) {
        let mut guard = self.packets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.retain(|topic, _| keep(topic));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(value: i64) -> TelemetryPacket {
        TelemetryPacket::new("INST", "ADCS").with_item("POSX", PacketItem::raw(TelemetryValue::Int(value)))
    }

    #[test]
    fn test_topic_derivation() {
        let topic = TopicId::from_parts("INST", "ADCS");
        assert_eq!(topic.as_str(), "DECOM__INST__ADCS");
        assert_eq!(packet(1).topic(), topic);
    }

    #[test]
    fn test_read_converted_falls_back_to_raw() {
        let p = packet(5);
        assert_eq!(p.read("POSX", ValueField::Converted), Some(TelemetryValue::Int(5)));
        assert_eq!(
            p.read("POSX", ValueField::Formatted),
            Some(TelemetryValue::Text("5".to_string()))
        );
        assert_eq!(p.read("POSX", ValueField::Limit), None);
        assert_eq!(p.read("MISSING", ValueField::Raw), None);
    }

    #[test]
    fn test_buffer_keeps_last_two() {
        let buffer = PacketBuffer::new();
        let topic = TopicId::from_parts("INST", "ADCS");

        buffer.add(topic.clone(), packet(1));
        assert!(buffer.previous(&topic).is_none());

        buffer.add(topic.clone(), packet(2));
        buffer.add(topic.clone(), packet(3));

        let latest = buffer.latest(&topic).unwrap();
        let previous = buffer.previous(&topic).unwrap();
        assert_eq!(latest.read("POSX", ValueField::Raw), Some(TelemetryValue::Int(3)));
        assert_eq!(previous.read("POSX", ValueField::Raw), Some(TelemetryValue::Int(2)));
    }

    #[test]
    fn test_buffer_remove() {
        let buffer = PacketBuffer::new();
        let topic = TopicId::from_parts("INST", "ADCS");
        buffer.add(topic.clone(), packet(1));
        buffer.remove(&topic);
        assert!(buffer.latest(&topic).is_none());
    }
}
