//! Per-component health bookkeeping.
//!
//! A [`ComponentHealth`] only changes through [`record_success`] and
//! [`record_failure`], which are crate-private: the integrator's escalation
//! logic is the only caller.
//!
//! [`record_success`]: ComponentHealth::record_success
//! [`record_failure`]: ComponentHealth::record_failure

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The monitored collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Sensor,
    Voice,
    Connector,
}

impl Component {
    /// Components whose failure drives mode transitions.
    pub const CRITICAL: [Component; 2] = [Component::Sensor, Component::Connector];

    pub fn is_critical(self) -> bool {
        Self::CRITICAL.contains(&self)
    }

    pub fn name(self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::Voice => "voice",
            Component::Connector => "connector",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

/// Health of one component across cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    component: Component,
    status: HealthStatus,
    last_success: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl ComponentHealth {
    pub fn new(component: Component) -> Self {
        Self {
            component,
            status: HealthStatus::Healthy,
            last_success: None,
            consecutive_failures: 0,
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub(crate) fn record_success(&mut self, at: DateTime<Utc>) {
        self.status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.last_success = Some(at);
    }

    /// Count one more failure.  The component is `FAILED` once the count
    /// reaches `threshold`, `DEGRADED` before that.
    pub(crate) fn record_failure(&mut self, threshold: u32) -> HealthStatus {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.status = if self.consecutive_failures >= threshold.max(1) {
            HealthStatus::Failed
        } else {
            HealthStatus::Degraded
        };
        self.status
    }
}

/// Health of every component observed so far.
pub type HealthMap = BTreeMap<Component, ComponentHealth>;
