//! Health bookkeeping with escalation logging.

use chrono::{DateTime, Utc};

use crate::model::{Component, ComponentHealth, HealthMap, HealthStatus};

/// Record a successful interaction.  Returns the previous status when the
/// component was not healthy before.
pub fn mark_success(
    health: &mut HealthMap,
    component: Component,
    at: DateTime<Utc>,
) -> Option<HealthStatus> {
    let entry = health
        .entry(component)
        .or_insert_with(|| ComponentHealth::new(component));
    let before = entry.status();
    entry.record_success(at);

    if before != HealthStatus::Healthy {
        log::info!("integrator: {component} recovered (was {before:?})");
        Some(before)
    } else {
        None
    }
}

/// Record a failed interaction and log the escalation.
pub fn mark_failure(
    health: &mut HealthMap,
    component: Component,
    threshold: u32,
    error_kind: &str,
) -> HealthStatus {
    let entry = health
        .entry(component)
        .or_insert_with(|| ComponentHealth::new(component));
    let status = entry.record_failure(threshold);
    let failures = entry.consecutive_failures();

    match status {
        HealthStatus::Failed => log::error!(
            "integrator: escalation component={component} error={error_kind} consecutive_failures={failures} status=FAILED"
        ),
        _ => log::warn!(
            "integrator: escalation component={component} error={error_kind} consecutive_failures={failures} status={status:?}"
        ),
    }
    status
}
