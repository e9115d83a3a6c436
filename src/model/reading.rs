//! Immutable inputs produced by the adapters: sensor readings and
//! recognised commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SensorReading
// ---------------------------------------------------------------------------

/// How much the filtered value can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingQuality {
    /// The moving-average window is full.
    Good,
    /// Fewer samples than the window size have been averaged so far, e.g.
    /// right after startup or a recalibration.
    Warmup,
}

/// One filtered level reading.  Fields are read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    value: f64,
    timestamp: DateTime<Utc>,
    quality: ReadingQuality,
}

impl SensorReading {
    /// A reading taken now.
    pub fn new(value: f64, quality: ReadingQuality) -> Self {
        Self::at(value, Utc::now(), quality)
    }

    pub fn at(value: f64, timestamp: DateTime<Utc>, quality: ReadingQuality) -> Self {
        Self {
            value,
            timestamp,
            quality,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn quality(&self) -> ReadingQuality {
        self.quality
    }
}

// ---------------------------------------------------------------------------
// VoiceCommand
// ---------------------------------------------------------------------------

/// What a recognised command asks the task state machine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    StartTask,
    AddItem,
    CompleteTask,
    AbortTask,
    /// Speech was heard but matched no command phrase.
    Unknown,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::StartTask => "start_task",
            CommandKind::AddItem => "add_item",
            CommandKind::CompleteTask => "complete_task",
            CommandKind::AbortTask => "abort_task",
            CommandKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    /// Recognised locally by the voice adapter.
    Voice,
    /// Sent by a connected subscriber over the push channel.
    Subscriber,
}

/// A single recognised command token.  Read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceCommand {
    kind: CommandKind,
    payload: Option<String>,
    timestamp: DateTime<Utc>,
    source: CommandSource,
}

impl VoiceCommand {
    /// A command recognised by the voice adapter just now.
    pub fn new(kind: CommandKind, payload: Option<String>) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            source: CommandSource::Voice,
        }
    }

    /// A command forwarded from a subscriber connection.
    pub fn from_subscriber(kind: CommandKind, payload: Option<String>) -> Self {
        Self {
            source: CommandSource::Subscriber,
            ..Self::new(kind, payload)
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> CommandSource {
        self.source
    }
}
