//! Outbound events and inbound subscriber messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CommandKind, Component, SensorReading, SystemMode, SystemState, VoiceCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SensorReading,
    StateUpdate,
    Degraded,
}

/// `{"type": "sensor_reading"|"state_update"|"degraded", "value": ..., "timestamp": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastEvent {
    pub fn reading(reading: &SensorReading) -> Self {
        Self {
            kind: EventKind::SensorReading,
            value: serde_json::json!(reading.value()),
            timestamp: reading.timestamp(),
        }
    }

    pub fn state_update(state: &SystemState) -> Self {
        Self {
            kind: EventKind::StateUpdate,
            value: serde_json::to_value(state).unwrap_or(serde_json::Value::Null),
            timestamp: Utc::now(),
        }
    }

    /// A mode transition, naming the critical components that are failed.
    pub fn degraded(from: SystemMode, to: SystemMode, failed: &[Component]) -> Self {
        Self {
            kind: EventKind::Degraded,
            value: serde_json::json!({
                "from": from,
                "mode": to,
                "failed": failed,
            }),
            timestamp: Utc::now(),
        }
    }

    /// Wire text for a websocket frame.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("broadcast: failed to serialise {:?} event: {e}", self.kind);
            String::from("{}")
        })
    }
}

/// Messages a subscriber may send over its websocket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// `{"type":"command","kind":"add_item","payload":"dragon_blood"}`
    Command {
        kind: CommandKind,
        #[serde(default)]
        payload: Option<String>,
    },
    Ping,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn into_command(self) -> Option<VoiceCommand> {
        match self {
            InboundMessage::Command { kind, payload } => {
                Some(VoiceCommand::from_subscriber(kind, payload))
            }
            InboundMessage::Ping => None,
        }
    }
}
