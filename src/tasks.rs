//! Task-progress and error-reporting collaborators
//!
//! The storage core never talks to a UI directly. Long-running operations
//! (integrity check, backup, migration) report through a [`TaskManager`],
//! and user-visible non-fatal failures are pushed into an [`ErrorSink`].
//!
//! Embedders provide their own implementations; the ones here log or record.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Identifier handed out by [`TaskManager::start_task`]
pub type TaskId = u64;

/// Consumer of task progress
pub trait TaskManager: Send + Sync {
    /// Register a new task and return its id
    fn start_task(&self, label: &str) -> TaskId;

    /// Report progress of a running task
    fn set_task_progress(&self, id: TaskId, current: u64, total: u64);

    /// Mark a task finished, successful or not
    fn set_task_finished(&self, id: TaskId);
}

/// Process-wide sink for messages surfaced to the user
pub trait ErrorSink: Send + Sync {
    fn add_error(&self, message: &str);
}

/// Finishes its task when dropped, so every exit path reports completion
pub struct TaskGuard<'a> {
    tasks: &'a dyn TaskManager,
    id: TaskId,
}

impl<'a> TaskGuard<'a> {
    pub fn start(tasks: &'a dyn TaskManager, label: &str) -> Self {
        let id = tasks.start_task(label);
        Self { tasks, id }
    }

    pub fn progress(&self, current: u64, total: u64) {
        self.tasks.set_task_progress(self.id, current, total);
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.tasks.set_task_finished(self.id);
    }
}

// =============================================================================
// Task events
// =============================================================================

/// A single task notification, as recorded by [`RecordingTaskManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    Started {
        id: TaskId,
        label: String,
    },
    Progress {
        id: TaskId,
        current: u64,
        total: u64,
    },
    Finished {
        id: TaskId,
    },
}

// =============================================================================
// Implementations
// =============================================================================

/// Logs task lifecycle through `tracing`
#[derive(Debug, Default)]
pub struct LogTaskManager {
    next_id: AtomicU64,
    labels: Mutex<HashMap<TaskId, String>>,
}

impl LogTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn label(&self, id: TaskId) -> String {
        self.labels
            .lock()
            .ok()
            .and_then(|labels| labels.get(&id).cloned())
            .unwrap_or_else(|| format!("task {}", id))
    }
}

impl TaskManager for LogTaskManager {
    fn start_task(&self, label: &str) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut labels) = self.labels.lock() {
            labels.insert(id, label.to_string());
        }
        info!("{} started", label);
        id
    }

    fn set_task_progress(&self, id: TaskId, current: u64, total: u64) {
        info!("{}: {}/{}", self.label(id), current, total);
    }

    fn set_task_finished(&self, id: TaskId) {
        let label = self
            .labels
            .lock()
            .ok()
            .and_then(|mut labels| labels.remove(&id));
        info!("{} finished", label.unwrap_or_else(|| format!("task {}", id)));
    }
}

/// Records every notification in order
#[derive(Debug, Default)]
pub struct RecordingTaskManager {
    next_id: AtomicU64,
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingTaskManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all events recorded so far
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Progress events as `(current, total)` pairs for the task with the given label
    pub fn progress_of(&self, label: &str) -> Vec<(u64, u64)> {
        let events = self.events();
        let ids: Vec<TaskId> = events
            .iter()
            .filter_map(|e| match e {
                TaskEvent::Started { id, label: l } if l == label => Some(*id),
                _ => None,
            })
            .collect();

        events
            .iter()
            .filter_map(|e| match e {
                TaskEvent::Progress { id, current, total } if ids.contains(id) => {
                    Some((*current, *total))
                }
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: TaskEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl TaskManager for RecordingTaskManager {
    fn start_task(&self, label: &str) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.push(TaskEvent::Started {
            id,
            label: label.to_string(),
        });
        id
    }

    fn set_task_progress(&self, id: TaskId, current: u64, total: u64) {
        self.push(TaskEvent::Progress { id, current, total });
    }

    fn set_task_finished(&self, id: TaskId) {
        self.push(TaskEvent::Finished { id });
    }
}

/// Logs every message at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn add_error(&self, message: &str) {
        error!("{}", message);
    }
}

/// Keeps every message for later inspection, also logging it
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    messages: Mutex<Vec<String>>,
}

impl CollectingErrorSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().map(|m| m.is_empty()).unwrap_or(true)
    }
}

impl ErrorSink for CollectingErrorSink {
    fn add_error(&self, message: &str) {
        error!("{}", message);
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_finishes_on_drop() {
        let tasks = RecordingTaskManager::new();
        {
            let guard = TaskGuard::start(tasks.as_ref(), "Backing up database");
            guard.progress(1, 4);
        }

        assert_eq!(
            tasks.events(),
            vec![
                TaskEvent::Started {
                    id: 1,
                    label: "Backing up database".to_string()
                },
                TaskEvent::Progress {
                    id: 1,
                    current: 1,
                    total: 4
                },
                TaskEvent::Finished { id: 1 },
            ]
        );
        assert_eq!(tasks.progress_of("Backing up database"), vec![(1, 4)]);
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingErrorSink::new();
        assert!(sink.is_empty());
        sink.add_error("Database: something broke");
        assert_eq!(sink.messages(), vec!["Database: something broke"]);
    }

    #[test]
    fn test_task_event_serializes() {
        let event = TaskEvent::Progress {
            id: 7,
            current: 16,
            total: 32,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"Progress":{"id":7,"current":16,"total":32}}"#);
    }
}
