//! Orchestration: the monitoring cycle, health escalation and mode machine.

pub mod health;
pub mod mode;
pub mod runner;

pub use mode::ModeMachine;
pub use runner::{CycleReport, FatalError, SystemIntegrator};
