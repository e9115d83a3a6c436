//! Operating mode and the system-wide state value.
//!
//! [`SystemState`] is owned by the integrator and replaced wholesale once per
//! cycle.  Everybody else sees it as a [`Snapshot`] (`Arc<SystemState>`)
//! delivered through a `tokio::sync::watch` channel, so readers never hold a
//! live mutable reference.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::task::{TaskRecord, TaskStatus};

use super::health::{Component, HealthMap, HealthStatus};
use super::reading::SensorReading;

// ---------------------------------------------------------------------------
// SystemMode
// ---------------------------------------------------------------------------

/// Operating mode of the whole system.
///
/// ```text
/// MONITORING ──one critical FAILED──▶ DEGRADED ──second FAILED──▶ FALLBACK
///      ▲                                │  ▲                           │
///      └──healthy for N cycles──────────┘  └────one recovers───────────┘
/// any ──shutdown──▶ SHUTDOWN
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    #[default]
    Monitoring,
    Degraded,
    Fallback,
    Shutdown,
}

impl SystemMode {
    /// Returns `true` when outbound automation delivery is suspended.
    ///
    /// ```
    /// use potion_monitor::model::SystemMode;
    ///
    /// assert!(!SystemMode::Monitoring.suspends_delivery());
    /// assert!(!SystemMode::Degraded.suspends_delivery());
    /// assert!(SystemMode::Fallback.suspends_delivery());
    /// assert!(SystemMode::Shutdown.suspends_delivery());
    /// ```
    pub fn suspends_delivery(&self) -> bool {
        matches!(self, SystemMode::Fallback | SystemMode::Shutdown)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SystemMode::Monitoring => "monitoring",
            SystemMode::Degraded => "degraded",
            SystemMode::Fallback => "fallback",
            SystemMode::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// SystemState
// ---------------------------------------------------------------------------

/// The single source of truth for process state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    /// Index of the cycle that produced this state; `0` before the first
    /// cycle has completed.
    pub cycle: u64,
    /// Most recent successful reading.  Kept across cycles whose sensor pull
    /// failed; the sensor's health entry tells how stale it is.
    pub latest_reading: Option<SensorReading>,
    /// The task currently in `ACTIVE` state, if any.
    pub active_task: Option<TaskRecord>,
    pub health: HealthMap,
    pub mode: SystemMode,
}

impl SystemState {
    /// Status of `component`, `None` if it has not been observed yet.
    pub fn health_of(&self, component: Component) -> Option<HealthStatus> {
        self.health.get(&component).map(|h| h.status())
    }

    /// Critical components currently marked `FAILED`.
    pub fn failed_critical(&self) -> Vec<Component> {
        Component::CRITICAL
            .into_iter()
            .filter(|c| self.health_of(*c) == Some(HealthStatus::Failed))
            .collect()
    }

    /// Check the structural invariants a published state must satisfy.
    ///
    /// Returns a description of the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(task) = &self.active_task {
            if task.status() != TaskStatus::Active {
                return Err(format!(
                    "active task {} has status {:?}",
                    task.id(),
                    task.status()
                ));
            }
        }
        for (key, health) in &self.health {
            if *key != health.component() {
                return Err(format!(
                    "health entry {key} describes {}",
                    health.component()
                ));
            }
        }
        Ok(())
    }
}

/// Immutable view of a published [`SystemState`].
pub type Snapshot = Arc<SystemState>;

/// Receiving side of the snapshot channel; `borrow()` yields the latest
/// published snapshot.
pub type SnapshotReceiver = watch::Receiver<Snapshot>;
