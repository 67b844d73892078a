//! In-memory table of tasks that currently have a live worker.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct RegistryEntry {
    /// Set once, never cleared.
    cancel_requested: bool,
    token: CancellationToken,
    filename: String,
    started_at: DateTime<Utc>,
}

/// One in-flight task, as reported by [`TaskRegistry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct InFlightTask {
    pub task_id: i64,
    pub filename: String,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
}

/// Mutex-guarded map from task id to its cancellation state.
///
/// Entries are created by `register` when a worker starts and removed by
/// `evict` once the task's terminal state is durable. Every token is a child
/// of the registry's shutdown token.
pub struct TaskRegistry {
    entries: Mutex<HashMap<i64, RegistryEntry>>,
    shutdown: CancellationToken,
}

impl TaskRegistry {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, RegistryEntry>> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every critical section is a single insert/remove/flag write.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a task and return the token its worker must watch.
    pub fn register(&self, task_id: i64, filename: &str) -> Result<CancellationToken, AppError> {
        let mut entries = self.lock();
        if entries.contains_key(&task_id) {
            return Err(AppError::AlreadyRegistered(task_id));
        }
        let token = self.shutdown.child_token();
        entries.insert(
            task_id,
            RegistryEntry {
                cancel_requested: false,
                token: token.clone(),
                filename: filename.to_string(),
                started_at: Utc::now(),
            },
        );
        Ok(token)
    }

    /// Flag the task and trip its token. No-op when the task is absent.
    /// Returns whether an entry was found.
    pub fn mark_cancelled(&self, task_id: i64) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&task_id) {
            Some(entry) => {
                if !entry.cancel_requested {
                    entry.cancel_requested = true;
                    entry.token.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// `None` when the task has no live entry.
    pub fn is_cancelled(&self, task_id: i64) -> Option<bool> {
        self.lock().get(&task_id).map(|e| e.cancel_requested)
    }

    pub fn evict(&self, task_id: i64) {
        self.lock().remove(&task_id);
    }

    pub fn snapshot(&self) -> Vec<InFlightTask> {
        let mut tasks: Vec<InFlightTask> = self
            .lock()
            .iter()
            .map(|(id, e)| InFlightTask {
                task_id: *id,
                filename: e.filename.clone(),
                cancel_requested: e.cancel_requested,
                started_at: e.started_at,
            })
            .collect();
        tasks.sort_by_key(|t| t.task_id);
        tasks
    }
}
