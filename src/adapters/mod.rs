//! Capability interfaces for the two pulled collaborators.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐      ┌────────────────────────────┐
//! │ SensorAdapter (trait)    │      │ VoiceAdapter (trait)       │
//! │                          │      │                            │
//! │  FilteredSensor<P>       │      │  TranscriptVoice           │
//! │   └─ DistanceProbe (P)   │      │   ├─ mpsc<String>          │
//! │      (blocking driver)   │      │   └─ CommandParser         │
//! └──────────────────────────┘      └────────────────────────────┘
//! ```
//!
//! The integrator holds both as boxed trait objects; tests substitute the
//! scripted doubles from `crate::testing`.

pub mod sensor;
pub mod voice;

pub use sensor::{DistanceProbe, FilteredSensor, SensorAdapter, SensorError, SimulatedProbe};
pub use voice::{CommandParser, TranscriptVoice, VoiceAdapter, VoiceError};
