//! Task state machine driven by recognised command tokens.
//!
//! The machine holds at most one unfinished task.  `start_task` is rejected
//! while that task is `Active`, so no interleaving of commands can produce two
//! active tasks.  Every rejected transition is returned as a
//! [`TaskStateError`]; the caller reports it and moves on.

use thiserror::Error;
use uuid::Uuid;

use crate::model::{CommandKind, VoiceCommand};

use super::record::{TaskRecord, TaskStatus};

// ---------------------------------------------------------------------------
// TaskStateError
// ---------------------------------------------------------------------------

/// A command that the task state machine refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskStateError {
    #[error("task {active} is already active")]
    AlreadyActive { active: Uuid },

    #[error("{command} requires an active task")]
    NoActiveTask { command: CommandKind },

    #[error("task {id} has no items and cannot be completed")]
    EmptyTask { id: Uuid },

    #[error("add_item needs an item name")]
    MissingItem,

    #[error("unrecognised command: {0:?}")]
    Unrecognised(String),
}

// ---------------------------------------------------------------------------
// TaskTransition
// ---------------------------------------------------------------------------

/// The outcome of one accepted command.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub command: CommandKind,
    /// Status before the command; `None` when it created the task.
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    /// The task as it stands after the command.
    pub task: TaskRecord,
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TaskStateMachine {
    current: Option<TaskRecord>,
    last_finished: Option<TaskRecord>,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The task in `Active` status, if any.
    pub fn active(&self) -> Option<&TaskRecord> {
        self.current
            .as_ref()
            .filter(|t| t.status() == TaskStatus::Active)
    }

    /// The most recently completed or aborted task.
    pub fn last_finished(&self) -> Option<&TaskRecord> {
        self.last_finished.as_ref()
    }

    /// Dispatch `command` to the matching transition.  `level` is the latest
    /// sensor value, used for volume accounting.
    pub fn apply(
        &mut self,
        command: &VoiceCommand,
        level: Option<f64>,
    ) -> Result<TaskTransition, TaskStateError> {
        let kind = command.kind();
        let from = self.current.as_ref().map(|t| t.status());
        let task = match kind {
            CommandKind::StartTask => self.start_task(level)?.clone(),
            CommandKind::AddItem => {
                let item = command
                    .payload()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(TaskStateError::MissingItem)?;
                self.add_item(item, level)?.clone()
            }
            CommandKind::CompleteTask => self.complete_task()?,
            CommandKind::AbortTask => self.abort_task()?,
            CommandKind::Unknown => {
                return Err(TaskStateError::Unrecognised(
                    command.payload().unwrap_or_default().to_string(),
                ))
            }
        };
        Ok(TaskTransition {
            command: kind,
            from,
            to: task.status(),
            task,
        })
    }

    /// Create a task and make it active.
    pub fn start_task(&mut self, level: Option<f64>) -> Result<&TaskRecord, TaskStateError> {
        if let Some(active) = self.active() {
            return Err(TaskStateError::AlreadyActive {
                active: active.id(),
            });
        }
        let mut task = match self.current.take() {
            Some(pending) if pending.status() == TaskStatus::New => pending,
            _ => TaskRecord::new(level),
        };
        task.activate();
        log::info!("task: {} started", task.id());
        let task: &TaskRecord = self.current.insert(task);
        Ok(task)
    }

    pub fn add_item(
        &mut self,
        item: &str,
        level: Option<f64>,
    ) -> Result<&TaskRecord, TaskStateError> {
        match self.current.as_mut() {
            Some(task) if task.status() == TaskStatus::Active => {
                task.push_item(item.to_string(), level);
                log::debug!("task: {} += {item}", task.id());
                Ok(&*task)
            }
            _ => Err(TaskStateError::NoActiveTask {
                command: CommandKind::AddItem,
            }),
        }
    }

    /// Complete the active task and return it.
    pub fn complete_task(&mut self) -> Result<TaskRecord, TaskStateError> {
        match self.current.take() {
            Some(task) if task.status() == TaskStatus::Active && !task.items().is_empty() => {
                Ok(self.finish(task, TaskStatus::Complete))
            }
            Some(task) if task.status() == TaskStatus::Active => {
                let id = task.id();
                self.current = Some(task);
                Err(TaskStateError::EmptyTask { id })
            }
            other => {
                self.current = other;
                Err(TaskStateError::NoActiveTask {
                    command: CommandKind::CompleteTask,
                })
            }
        }
    }

    /// Abort the current task (`New` or `Active`) and return it.
    pub fn abort_task(&mut self) -> Result<TaskRecord, TaskStateError> {
        match self.current.take() {
            Some(task) if !task.status().is_terminal() => Ok(self.finish(task, TaskStatus::Aborted)),
            other => {
                self.current = other;
                Err(TaskStateError::NoActiveTask {
                    command: CommandKind::AbortTask,
                })
            }
        }
    }

    fn finish(&mut self, mut task: TaskRecord, status: TaskStatus) -> TaskRecord {
        task.finish(status);
        log::info!("task: {} {:?}", task.id(), status);
        self.last_finished = Some(task.clone());
        task
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
