//! The operating-mode state machine.
//!
//! ```text
//!               one critical FAILED              both critical FAILED
//! MONITORING ───────────────────────▶ DEGRADED ───────────────────────▶ FALLBACK
//!     ▲                                 │  ▲                               │
//!     └──── all critical HEALTHY ───────┘  └──── fewer than two FAILED ────┘
//!           for N consecutive cycles
//!
//! any ──shutdown──▶ SHUTDOWN
//! ```

use crate::model::{Component, HealthMap, HealthStatus, SystemMode};

#[derive(Debug, Clone)]
pub struct ModeMachine {
    confirmation_cycles: u32,
    healthy_streak: u32,
}

impl ModeMachine {
    pub fn new(confirmation_cycles: u32) -> Self {
        Self {
            confirmation_cycles: confirmation_cycles.max(1),
            healthy_streak: 0,
        }
    }

    /// Consecutive evaluations in which every critical component was healthy.
    pub fn healthy_streak(&self) -> u32 {
        self.healthy_streak
    }

    /// Next mode given the current one and this cycle's health.
    pub fn evaluate(&mut self, current: SystemMode, health: &HealthMap) -> SystemMode {
        let status = |c: Component| health.get(&c).map(|h| h.status());
        let failed = Component::CRITICAL
            .into_iter()
            .filter(|c| status(*c) == Some(HealthStatus::Failed))
            .count();
        // A component never observed has not failed.
        let all_healthy = Component::CRITICAL
            .into_iter()
            .all(|c| matches!(status(c), None | Some(HealthStatus::Healthy)));

        self.healthy_streak = if all_healthy {
            self.healthy_streak.saturating_add(1)
        } else {
            0
        };

        let all_failed = failed == Component::CRITICAL.len();
        match current {
            SystemMode::Shutdown => SystemMode::Shutdown,
            SystemMode::Monitoring if all_failed => SystemMode::Fallback,
            SystemMode::Monitoring if failed > 0 => SystemMode::Degraded,
            SystemMode::Monitoring => SystemMode::Monitoring,
            SystemMode::Degraded if all_failed => SystemMode::Fallback,
            SystemMode::Degraded if self.healthy_streak >= self.confirmation_cycles => {
                SystemMode::Monitoring
            }
            SystemMode::Degraded => SystemMode::Degraded,
            SystemMode::Fallback if all_failed => SystemMode::Fallback,
            SystemMode::Fallback => SystemMode::Degraded,
        }
    }
}
