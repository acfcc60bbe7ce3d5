//! Long-running operation tracking.
//!
//! Every failover, failback and switchover runs as a task with an
//! append-only leveled log. Task bodies execute on a bounded pool.

use crate::meta::ClusterId;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type TaskId = u64;

pub const DEFAULT_TASK_WORKERS: usize = 10;
/// Finished tasks kept per cluster before the oldest are dropped
pub const DEFAULT_TASK_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Failover,
    Failback,
    Switch,
    Create,
    Build,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Failover => "failover",
            TaskKind::Failback => "failback",
            TaskKind::Switch => "switch",
            TaskKind::Create => "create",
            TaskKind::Build => "build",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Success,
    Failed,
}

impl TaskState {
    pub fn code(self) -> i32 {
        match self {
            TaskState::Running => 0,
            TaskState::Success => 1,
            TaskState::Failed => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn code(self) -> i32 {
        match self {
            LogLevel::Debug => 1,
            LogLevel::Info => 0,
            LogLevel::Warn => -1,
            LogLevel::Error => -2,
            LogLevel::Fatal => -3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub seq: u64,
    pub level: LogLevel,
    pub message: String,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub name: String,
    pub cluster_id: Option<ClusterId>,
    pub state: TaskState,
    pub last_message: String,
    pub created_at: String,
    pub log: Vec<TaskLogEntry>,
}

fn now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Registry of tasks and the pool their bodies run on
pub struct TaskManager {
    next_id: AtomicU64,
    tasks: RwLock<BTreeMap<TaskId, Task>>,
    pool: Arc<Semaphore>,
    history: usize,
}

impl TaskManager {
    pub fn new(workers: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tasks: RwLock::new(BTreeMap::new()),
            pool: Arc::new(Semaphore::new(workers.max(1))),
            history: DEFAULT_TASK_HISTORY,
        }
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    pub fn create(
        &self,
        kind: TaskKind,
        name: impl Into<String>,
        cluster_id: Option<ClusterId>,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = Task {
            id,
            kind,
            name: name.into(),
            cluster_id,
            state: TaskState::Running,
            last_message: String::new(),
            created_at: now(),
            log: Vec::new(),
        };
        info!(task_id = id, "task created: {}", task.name);
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.insert(id, task);
        }
        id
    }

    /// Append a log line and mirror it into the process log
    pub fn log(&self, id: TaskId, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(task_id = id, "{}", message),
            LogLevel::Info => info!(task_id = id, "{}", message),
            LogLevel::Warn => warn!(task_id = id, "{}", message),
            LogLevel::Error | LogLevel::Fatal => error!(task_id = id, "{}", message),
        }
        let mut tasks = match self.tasks.write() {
            Ok(t) => t,
            Err(_) => return,
        };
        if let Some(task) = tasks.get_mut(&id) {
            let seq = task.log.len() as u64 + 1;
            task.last_message = message.clone();
            task.log.push(TaskLogEntry {
                seq,
                level,
                message,
                time: now(),
            });
        }
    }

    pub fn debug(&self, id: TaskId, message: impl Into<String>) {
        self.log(id, LogLevel::Debug, message)
    }

    pub fn info(&self, id: TaskId, message: impl Into<String>) {
        self.log(id, LogLevel::Info, message)
    }

    pub fn warn(&self, id: TaskId, message: impl Into<String>) {
        self.log(id, LogLevel::Warn, message)
    }

    pub fn error(&self, id: TaskId, message: impl Into<String>) {
        self.log(id, LogLevel::Error, message)
    }

    pub fn fatal(&self, id: TaskId, message: impl Into<String>) {
        self.log(id, LogLevel::Fatal, message)
    }

    /// Finish a task. Returns false if it was already completed or unknown.
    pub fn complete(&self, id: TaskId, state: TaskState, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut tasks = match self.tasks.write() {
            Ok(t) => t,
            Err(_) => return false,
        };
        let task = match tasks.get_mut(&id) {
            Some(t) => t,
            None => return false,
        };
        if task.state != TaskState::Running {
            warn!(
                task_id = id,
                "task already completed as {}, ignoring {}", task.state.as_str(), state.as_str()
            );
            return false;
        }
        let final_state = if state == TaskState::Running {
            TaskState::Failed
        } else {
            state
        };
        task.state = final_state;
        let seq = task.log.len() as u64 + 1;
        let level = if final_state == TaskState::Success {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        task.log.push(TaskLogEntry {
            seq,
            level,
            message: message.clone(),
            time: now(),
        });
        task.last_message = message;
        let cluster_id = task.cluster_id;
        info!(task_id = id, "task finished: {}", final_state.as_str());
        self.prune(&mut tasks, cluster_id);
        true
    }

    /// Drop the oldest finished tasks of `cluster_id` beyond the history size
    fn prune(&self, tasks: &mut BTreeMap<TaskId, Task>, cluster_id: Option<ClusterId>) {
        let finished: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.cluster_id == cluster_id && t.state != TaskState::Running)
            .map(|t| t.id)
            .collect();
        let excess = finished.len().saturating_sub(self.history);
        for id in &finished[..excess] {
            tasks.remove(id);
            debug!(task_id = *id, "task dropped from history");
        }
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().ok().and_then(|t| t.get(&id).cloned())
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.read().ok().and_then(|t| t.get(&id).map(|t| t.state))
    }

    /// Log entries with `seq > after`
    pub fn log_since(&self, id: TaskId, after: u64) -> Option<(TaskState, Vec<TaskLogEntry>)> {
        let tasks = self.tasks.read().ok()?;
        let task = tasks.get(&id)?;
        let entries = task.log.iter().filter(|e| e.seq > after).cloned().collect();
        Some((task.state, entries))
    }

    pub fn running(&self) -> Vec<Task> {
        self.tasks
            .read()
            .map(|t| {
                t.values()
                    .filter(|task| task.state == TaskState::Running)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tasks_of(&self, cluster_id: ClusterId) -> Vec<Task> {
        self.tasks
            .read()
            .map(|t| {
                t.values()
                    .filter(|task| task.cluster_id == Some(cluster_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run a task body on the pool. A body that panics or returns without
    /// completing its task leaves it failed.
    pub fn spawn<F>(self: &Arc<Self>, id: TaskId, body: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let manager = Arc::clone(self);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let _permit = match pool.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    manager.complete(id, TaskState::Failed, "task pool closed");
                    return;
                }
            };
            if AssertUnwindSafe(body).catch_unwind().await.is_err() {
                manager.complete(id, TaskState::Failed, "task panicked");
                return;
            }
            if manager.state(id) == Some(TaskState::Running) {
                manager.complete(id, TaskState::Failed, "task ended without a result");
            }
        })
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_WORKERS)
    }
}
