//! Wire payloads and the [`DeliveryTask`] that carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{SensorReading, VoiceCommand};
use crate::task::TaskRecord;

use super::transport::DeliveryError;

// ---------------------------------------------------------------------------
// Endpoint / payload kinds
// ---------------------------------------------------------------------------

/// The two logical sinks of the automation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    SensorData,
    Command,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EndpointKind::SensorData => "sensor-data",
            EndpointKind::Command => "command",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    SensorReading,
    Command,
}

// ---------------------------------------------------------------------------
// DeliveryPayload
// ---------------------------------------------------------------------------

/// One outbound message:
/// `{"type": "sensor_reading"|"command", "value": ..., "timestamp": ISO8601}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryPayload {
    pub fn reading(reading: &SensorReading) -> Self {
        Self {
            kind: PayloadKind::SensorReading,
            value: serde_json::json!(reading.value()),
            timestamp: reading.timestamp(),
        }
    }

    /// A processed command.  `completed` carries the task summary when the
    /// command finished a task.
    pub fn command(command: &VoiceCommand, completed: Option<&TaskRecord>) -> Self {
        let mut value = serde_json::json!({
            "kind": command.kind(),
            "payload": command.payload(),
            "source": command.source(),
        });
        if let Some(task) = completed {
            value["task"] = task.summary();
        }
        Self {
            kind: PayloadKind::Command,
            value,
            timestamp: command.timestamp(),
        }
    }

    /// Sink this payload belongs to.
    pub fn endpoint(&self) -> EndpointKind {
        match self.kind {
            PayloadKind::SensorReading => EndpointKind::SensorData,
            PayloadKind::Command => EndpointKind::Command,
        }
    }

    /// Reject payloads the automation service would not accept.
    pub fn validate(&self) -> Result<(), DeliveryError> {
        match (&self.kind, &self.value) {
            (_, serde_json::Value::Null) => {
                Err(DeliveryError::InvalidPayload("missing value".into()))
            }
            (PayloadKind::SensorReading, v)
                if !v.as_f64().is_some_and(f64::is_finite) =>
            {
                Err(DeliveryError::InvalidPayload(format!(
                    "sensor reading value must be a finite number, got {v}"
                )))
            }
            (PayloadKind::Command, v) if v.get("kind").is_none() => {
                Err(DeliveryError::InvalidPayload("command without kind".into()))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// OutboundBody
// ---------------------------------------------------------------------------

/// What actually goes over the wire: one payload, or a JSON array of them
/// when a batch was coalesced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundBody {
    Single(DeliveryPayload),
    Batch(Vec<DeliveryPayload>),
}

impl OutboundBody {
    pub fn len(&self) -> usize {
        match self {
            OutboundBody::Single(_) => 1,
            OutboundBody::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// DeliveryTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

/// One unit of outbound work, owned by the connector until it is
/// `Delivered` or `Failed`.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    id: Uuid,
    body: OutboundBody,
    endpoint: EndpointKind,
    attempts: u32,
    status: DeliveryStatus,
    last_error: Option<DeliveryError>,
}

impl DeliveryTask {
    pub fn new(body: OutboundBody, endpoint: EndpointKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            endpoint,
            attempts: 0,
            status: DeliveryStatus::Pending,
            last_error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &OutboundBody {
        &self.body
    }

    pub fn endpoint(&self) -> EndpointKind {
        self.endpoint
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&DeliveryError> {
        self.last_error.as_ref()
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.status = DeliveryStatus::InFlight;
    }

    pub(crate) fn record_error(&mut self, error: DeliveryError) {
        self.last_error = Some(error);
    }

    pub(crate) fn delivered(&mut self) {
        self.status = DeliveryStatus::Delivered;
        self.last_error = None;
    }

    pub(crate) fn fail(&mut self, error: Option<DeliveryError>) {
        self.status = DeliveryStatus::Failed;
        if let Some(error) = error {
            self.last_error = Some(error);
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryReport
// ---------------------------------------------------------------------------

/// Terminal outcome of a [`DeliveryTask`], sent back to the integrator so it
/// can update connector health.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub task_id: Uuid,
    pub endpoint: EndpointKind,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub payloads: usize,
    pub error: Option<DeliveryError>,
}

impl From<&DeliveryTask> for DeliveryReport {
    fn from(task: &DeliveryTask) -> Self {
        Self {
            task_id: task.id,
            endpoint: task.endpoint,
            status: task.status,
            attempts: task.attempts,
            payloads: task.body.len(),
            error: task.last_error.clone(),
        }
    }
}
