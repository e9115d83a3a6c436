//! [`TaskRecord`]: one brewing task and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a task.
///
/// ```text
/// New ──activate──▶ Active ──complete──▶ Complete
///  │                  │
///  └──────abort───────┴──────▶ Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Active,
    Complete,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Aborted)
    }
}

/// A task and the items added to it, in order.
///
/// Only the task state machine mutates a record; everyone else gets clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    id: Uuid,
    status: TaskStatus,
    items: Vec<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    /// Level measured when the task started.
    baseline_level: Option<f64>,
    /// Level measured at the most recent item addition (or at start).
    last_level: Option<f64>,
    /// Sum of level changes measured across item additions.
    total_volume: f64,
}

impl TaskRecord {
    pub(crate) fn new(level: Option<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::New,
            items: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            baseline_level: level,
            last_level: level,
            total_volume: 0.0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn baseline_level(&self) -> Option<f64> {
        self.baseline_level
    }

    pub fn total_volume(&self) -> f64 {
        self.total_volume
    }

    pub(crate) fn activate(&mut self) {
        debug_assert_eq!(self.status, TaskStatus::New);
        self.status = TaskStatus::Active;
    }

    /// Append `item`, crediting it with the level change since the last
    /// measurement when both measurements are known.
    pub(crate) fn push_item(&mut self, item: String, level: Option<f64>) {
        if let (Some(prev), Some(now)) = (self.last_level, level) {
            self.total_volume += now - prev;
        }
        if level.is_some() {
            self.last_level = level;
        }
        self.items.push(item);
    }

    pub(crate) fn finish(&mut self, status: TaskStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Summary sent to the command sink when the task completes.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status,
            "items": self.items,
            "total_volume": self.total_volume,
            "start_time": self.started_at,
            "completion_time": self.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_is_sum_of_level_changes() {
        let mut task = TaskRecord::new(Some(20.0));
        task.activate();
        task.push_item("dragon_blood".into(), Some(22.5));
        task.push_item("phoenix_tears".into(), None);
        task.push_item("unicorn_hair".into(), Some(23.0));

        assert_eq!(task.items().len(), 3);
        assert!((task.total_volume() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_baseline_skips_volume() {
        let mut task = TaskRecord::new(None);
        task.activate();
        task.push_item("X".into(), Some(10.0));
        assert_eq!(task.total_volume(), 0.0);
        task.push_item("Y".into(), Some(12.0));
        assert_eq!(task.total_volume(), 2.0);
    }

    #[test]
    fn summary_carries_items_and_times() {
        let mut task = TaskRecord::new(None);
        task.activate();
        task.push_item("X".into(), None);
        task.finish(TaskStatus::Complete);

        let summary = task.summary();
        assert_eq!(summary["items"], serde_json::json!(["X"]));
        assert_eq!(summary["status"], serde_json::json!("complete"));
        assert!(summary["completion_time"].is_string());
    }
}
