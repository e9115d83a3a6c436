//! The "potion mixer": a single-task state machine driven by commands.
//!
//! * [`TaskRecord`] / [`TaskStatus`]: one task and its lifecycle.
//! * [`TaskStateMachine`]: applies [`VoiceCommand`](crate::model::VoiceCommand)s
//!   and enforces that at most one task is active.
//! * [`TaskStateError`]: a rejected transition, reported but never escalated.

pub mod machine;
pub mod record;

pub use machine::{TaskStateError, TaskStateMachine, TaskTransition};
pub use record::{TaskRecord, TaskStatus};
