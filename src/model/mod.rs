//! Shared data model: adapter outputs, component health and system state.

pub mod health;
pub mod reading;
pub mod state;

pub use health::{Component, ComponentHealth, HealthMap, HealthStatus};
pub use reading::{CommandKind, CommandSource, ReadingQuality, SensorReading, VoiceCommand};
pub use state::{Snapshot, SnapshotReceiver, SystemMode, SystemState};
