//! Task Orchestrator (C7): durable submission, a bounded worker pool, retries with
//! exponential backoff, lease expiry, and cooperative cancellation.
//!
//! The durable log reuses the same SHA-256 hash-chained, append-only JSON-lines idiom as
//! [`crate::core::conversation_store`]'s reference store — one line per state transition
//! instead of one line per message — so the crate's two durability-sensitive subsystems
//! share one well-tested primitive (§4.7, §9). The worker pool itself is tokio tasks
//! pulling from a bounded `mpsc` channel with per-task state behind a short-held
//! `RwLock`, matching the concrete-primitive guidance in §5: tasks + channels + locks,
//! not a ported actor framework.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::core::agent::{Agent, AgentDefinition};
use crate::core::config::{OrchestratorConfig, RetryConfig};
use crate::core::event::{EventHandler, NoopEventHandler, TaskEvent};
use crate::core::workflow::WorkflowRunner;

/// The authoritative state machine (§4.7). `Completed`, `Failed`, and `Cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

/// A cooperative cancellation signal a [`TaskHandler`] should poll between natural
/// checkpoints (workflow steps, LLM calls, tool invocations).
#[derive(Clone)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Executes one task body for a given `task_kind`. Implementations dispatch on `kind`
/// to invoke the Workflow Runner, the Agent Executor, or an external ingester, checking
/// `cancellation` at their own natural checkpoints.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        kind: &str,
        payload: serde_json::Value,
        cancellation: CancellationFlag,
    ) -> Result<serde_json::Value, String>;
}

/// A durable, user-facing record of one submitted task (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Failure modes the orchestrator surfaces directly (§7). Task-body failures live in
/// `Task::last_error` instead.
#[derive(Debug, Clone)]
pub enum TaskError {
    NotFound(String),
    QueueFull,
    Io(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NotFound(id) => write!(f, "task not found: {}", id),
            TaskError::QueueFull => write!(f, "dispatch queue is full"),
            TaskError::Io(msg) => write!(f, "task log io error: {}", msg),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> Self {
        TaskError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    index: u64,
    created_at: DateTime<Utc>,
    task_id: String,
    state: TaskState,
    attempts: u32,
    kind: String,
    payload: serde_json::Value,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    finished_at: Option<DateTime<Utc>>,
    prev_hash: String,
    hash: String,
}

fn compute_entry_hash(entry: &LogEntry) -> String {
    let canonical = format!(
        "{}|{}|{}|{:?}|{}|{}|{}|{}|{}",
        entry.index,
        entry.created_at.to_rfc3339(),
        entry.task_id,
        entry.state,
        entry.attempts,
        entry.kind,
        entry.payload,
        entry.last_error.as_deref().unwrap_or(""),
        entry.prev_hash,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Append-only, hash-chained log of task state transitions, replayed on open to
/// reconstruct the in-memory task table after a restart.
struct TaskLog {
    file_path: PathBuf,
    next_index: u64,
    last_hash: String,
}

impl TaskLog {
    fn open(dir: &PathBuf) -> io::Result<(Self, HashMap<String, Task>)> {
        std::fs::create_dir_all(dir)?;
        let file_path = dir.join("tasks.jsonl");
        let mut tasks: HashMap<String, Task> = HashMap::new();
        let mut next_index = 0u64;
        let mut last_hash = String::new();

        if file_path.exists() {
            let file = std::fs::File::open(&file_path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(&line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                next_index = entry.index + 1;
                last_hash = entry.hash.clone();
                tasks.insert(
                    entry.task_id.clone(),
                    Task {
                        id: entry.task_id,
                        kind: entry.kind,
                        payload: entry.payload,
                        state: entry.state,
                        attempts: entry.attempts,
                        last_error: entry.last_error,
                        result: entry.result,
                        created_at: entry.created_at,
                        finished_at: entry.finished_at,
                    },
                );
            }
        }

        Ok((
            Self {
                file_path,
                next_index,
                last_hash,
            },
            tasks,
        ))
    }

    fn append(&mut self, task: &Task) -> Result<(), TaskError> {
        let entry_base = LogEntry {
            index: self.next_index,
            created_at: Utc::now(),
            task_id: task.id.clone(),
            state: task.state,
            attempts: task.attempts,
            kind: task.kind.clone(),
            payload: task.payload.clone(),
            last_error: task.last_error.clone(),
            result: task.result.clone(),
            finished_at: task.finished_at,
            prev_hash: self.last_hash.clone(),
            hash: String::new(),
        };
        let hash = compute_entry_hash(&entry_base);
        let entry = LogEntry { hash: hash.clone(), ..entry_base };

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        let json = serde_json::to_string(&entry).map_err(|e| TaskError::Io(e.to_string()))?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;

        self.next_index += 1;
        self.last_hash = hash;
        Ok(())
    }
}

struct TaskRecord {
    task: Task,
    lease_until: Option<std::time::Instant>,
    cancellation: CancellationFlag,
}

/// Durable submission, a bounded worker pool, retries, lease expiry, and cooperative
/// cancellation (§4.7).
pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    retry: RetryConfig,
    handler: Arc<dyn TaskHandler>,
    tasks: Arc<RwLock<HashMap<String, TaskRecord>>>,
    log: Arc<std::sync::Mutex<TaskLog>>,
    dispatch_tx: tokio::sync::mpsc::Sender<String>,
    notify: Arc<RwLock<HashMap<String, Arc<tokio::sync::Notify>>>>,
    events: Arc<dyn EventHandler>,
}

impl TaskOrchestrator {
    /// Open (or create) the durable log under `config.task_log_dir`, replay non-terminal
    /// tasks back onto the dispatch queue, and spawn `config.worker_pool_size` workers.
    /// Lifecycle notifications go to a [`NoopEventHandler`]; use [`Self::open_with_events`]
    /// to observe them.
    pub fn open(config: OrchestratorConfig, retry: RetryConfig, handler: Arc<dyn TaskHandler>) -> Result<Self, TaskError> {
        Self::open_with_events(config, retry, handler, Arc::new(NoopEventHandler))
    }

    /// Same as [`Self::open`], reporting [`TaskEvent`]s to `events` as tasks transition.
    pub fn open_with_events(
        config: OrchestratorConfig,
        retry: RetryConfig,
        handler: Arc<dyn TaskHandler>,
        events: Arc<dyn EventHandler>,
    ) -> Result<Self, TaskError> {
        let (log, existing_tasks) = TaskLog::open(&config.task_log_dir)?;

        let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::channel(config.queue_capacity);
        let tasks = Arc::new(RwLock::new(HashMap::new()));
        let notify: Arc<RwLock<HashMap<String, Arc<tokio::sync::Notify>>>> = Arc::new(RwLock::new(HashMap::new()));

        {
            let mut table = tasks.write().unwrap();
            for (id, task) in existing_tasks {
                notify.write().unwrap().insert(id.clone(), Arc::new(tokio::sync::Notify::new()));
                table.insert(
                    id,
                    TaskRecord {
                        task,
                        lease_until: None,
                        cancellation: CancellationFlag::new(),
                    },
                );
            }
        }

        // Replay non-terminal tasks back onto the queue so a restart resumes work.
        let replay_ids: Vec<String> = tasks
            .read()
            .unwrap()
            .values()
            .filter(|r| !r.task.state.is_terminal())
            .map(|r| r.task.id.clone())
            .collect();
        for id in replay_ids {
            let _ = dispatch_tx.try_send(id);
        }

        let orchestrator = Self {
            config: config.clone(),
            retry: retry.clone(),
            handler,
            tasks,
            log: Arc::new(std::sync::Mutex::new(log)),
            dispatch_tx,
            notify,
            events,
        };

        orchestrator.spawn_workers(dispatch_rx, config.worker_pool_size);
        orchestrator.spawn_lease_monitor();
        orchestrator.spawn_retention_sweep();
        Ok(orchestrator)
    }

    fn spawn_workers(&self, dispatch_rx: tokio::sync::mpsc::Receiver<String>, pool_size: usize) {
        let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
        for _ in 0..pool_size {
            let dispatch_rx = dispatch_rx.clone();
            let tasks = self.tasks.clone();
            let log = self.log.clone();
            let handler = self.handler.clone();
            let notify = self.notify.clone();
            let retry = self.retry.clone();
            let dispatch_tx = self.dispatch_tx.clone();
            let lease_duration = self.config.lease_duration;
            let events = self.events.clone();

            tokio::spawn(async move {
                loop {
                    let task_id = {
                        let mut rx = dispatch_rx.lock().await;
                        match rx.recv().await {
                            Some(id) => id,
                            None => return,
                        }
                    };
                    run_one_task(task_id, &tasks, &log, &handler, &notify, &retry, &dispatch_tx, lease_duration, &events).await;
                }
            });
        }
    }

    /// Periodically reclaims tasks whose lease expired without a transition out of
    /// `Running` — the worker holding them presumably crashed or hung — and puts them
    /// back on the dispatch queue as `Retrying` (§4.7).
    fn spawn_lease_monitor(&self) {
        let tasks = self.tasks.clone();
        let log = self.log.clone();
        let notify = self.notify.clone();
        let dispatch_tx = self.dispatch_tx.clone();
        let events = self.events.clone();
        let sweep_interval = (self.config.lease_duration / 4).max(Duration::from_millis(50));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                let now = std::time::Instant::now();
                let expired: Vec<String> = {
                    let table = tasks.read().unwrap();
                    table
                        .iter()
                        .filter(|(_, r)| r.task.state == TaskState::Running && r.lease_until.map(|l| l <= now).unwrap_or(false))
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                for id in expired {
                    {
                        let mut table = tasks.write().unwrap();
                        if let Some(record) = table.get_mut(&id) {
                            if record.task.state == TaskState::Running {
                                record.task.state = TaskState::Retrying;
                                record.lease_until = None;
                                record.task.last_error = Some("lease expired".to_string());
                                let _ = log.lock().unwrap().append(&record.task);
                            }
                        }
                    }
                    let _ = notify.read().unwrap().get(&id).map(|n| n.notify_waiters());
                    events.on_task_event(&TaskEvent::LeaseExpired { task_id: id.clone() }).await;
                    let _ = dispatch_tx.send(id).await;
                }
            }
        });
    }

    /// Background counterpart of the `periodic_cleanup` task kind (§4.7): drops terminal
    /// tasks from the in-memory table once they are older than `retention_window`. The
    /// durable log is untouched — this only shrinks the live lookup table.
    fn spawn_retention_sweep(&self) {
        let tasks = self.tasks.clone();
        let notify = self.notify.clone();
        let retention_window = self.config.retention_window;
        let sweep_interval = (retention_window / 4).max(Duration::from_secs(1));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                prune_terminal_tasks(&tasks, &notify, retention_window);
            }
        });
    }

    /// Durably enqueue a new task and notify the dispatcher (§4.7 contract).
    pub async fn submit(&self, task_kind: impl Into<String>, payload: serde_json::Value) -> Result<String, TaskError> {
        let id = uuid::Uuid::new_v4().to_string();
        let task_kind = task_kind.into();
        let task = Task {
            id: id.clone(),
            kind: task_kind.clone(),
            payload,
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
            result: None,
            created_at: Utc::now(),
            finished_at: None,
        };

        self.log.lock().unwrap().append(&task)?;
        self.tasks.write().unwrap().insert(
            id.clone(),
            TaskRecord {
                task,
                lease_until: None,
                cancellation: CancellationFlag::new(),
            },
        );
        self.notify.write().unwrap().insert(id.clone(), Arc::new(tokio::sync::Notify::new()));

        self.dispatch_tx.send(id.clone()).await.map_err(|_| TaskError::QueueFull)?;
        self.events
            .on_task_event(&TaskEvent::Submitted { task_id: id.clone(), task_kind })
            .await;
        Ok(id)
    }

    pub fn status(&self, task_id: &str) -> Result<Task, TaskError> {
        self.tasks
            .read()
            .unwrap()
            .get(task_id)
            .map(|r| r.task.clone())
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    /// Pending/Retrying tasks cancel immediately; a Running task's cooperative flag is
    /// set and honored at its next checkpoint (§4.7).
    pub async fn cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        let cancelled = {
            let mut tasks = self.tasks.write().unwrap();
            let record = tasks.get_mut(task_id).ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

            match record.task.state {
                TaskState::Pending | TaskState::Retrying => {
                    record.task.state = TaskState::Cancelled;
                    record.task.last_error = Some("cancelled".to_string());
                    record.task.finished_at = Some(Utc::now());
                    self.log.lock().unwrap().append(&record.task)?;
                    if let Some(n) = self.notify.read().unwrap().get(task_id) {
                        n.notify_waiters();
                    }
                    true
                }
                TaskState::Running => {
                    record.cancellation.cancel();
                    true
                }
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled => false,
            }
        };
        if cancelled {
            self.events
                .on_task_event(&TaskEvent::Cancelled { task_id: task_id.to_string() })
                .await;
        }
        Ok(cancelled)
    }

    /// Block until `task_id` reaches a terminal state or `timeout` elapses.
    pub async fn wait(&self, task_id: &str, timeout: Duration) -> Result<Task, TaskError> {
        if let Some(task) = self.tasks.read().unwrap().get(task_id).map(|r| r.task.clone()) {
            if task.state.is_terminal() {
                return Ok(task);
            }
        } else {
            return Err(TaskError::NotFound(task_id.to_string()));
        }

        let notifier = self
            .notify
            .read()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.tasks.read().unwrap().get(task_id).map(|r| r.task.clone()) {
                if task.state.is_terminal() {
                    return Ok(task);
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.status(task_id);
            }
            let _ = tokio::time::timeout(remaining, notifier.notified()).await;
        }
    }
}

/// A [`TaskHandler`] wiring the standard-library task kinds (§4.7) to the rest of the
/// core: `run_workflow` and `execute_agent` delegate to a [`WorkflowRunner`] and an
/// [`Agent`]; `ingest_document` and `multi_modal_analysis` have no in-crate
/// implementation and are recorded as delegated to an external system rather than
/// executed here.
pub struct StandardTaskHandler {
    workflows: Arc<WorkflowRunner>,
    agent: Arc<Agent>,
}

impl StandardTaskHandler {
    pub fn new(workflows: Arc<WorkflowRunner>, agent: Arc<Agent>) -> Self {
        Self { workflows, agent }
    }
}

#[async_trait]
impl TaskHandler for StandardTaskHandler {
    async fn execute(
        &self,
        kind: &str,
        payload: serde_json::Value,
        cancellation: CancellationFlag,
    ) -> Result<serde_json::Value, String> {
        match kind {
            "run_workflow" => {
                let workflow_name = payload
                    .get("workflow_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "run_workflow payload missing workflow_name".to_string())?;
                let input = payload.get("input").and_then(|v| v.as_str()).unwrap_or("");
                let conversation_id = payload.get("conversation_id").and_then(|v| v.as_str());

                if cancellation.is_cancelled() {
                    return Err("cancelled".to_string());
                }
                let result = self
                    .workflows
                    .run(workflow_name, input, &[], conversation_id)
                    .await
                    .map_err(|e| e.to_string())?;
                if cancellation.is_cancelled() {
                    return Err("cancelled".to_string());
                }

                Ok(serde_json::json!({
                    "workflow_name": result.workflow_name,
                    "final_text": result.final_text,
                    "success": result.success,
                    "error": result.error,
                    "conversation_id": result.conversation_id,
                    "context_used": result.context_used,
                }))
            }
            "execute_agent" => {
                let role = payload.get("role").and_then(|v| v.as_str()).unwrap_or("assistant");
                let system_prompt = payload
                    .get("system_prompt")
                    .and_then(|v| v.as_str())
                    .unwrap_or("You are a helpful assistant.");
                let input = payload.get("input").and_then(|v| v.as_str()).unwrap_or("");
                let def = AgentDefinition::new(role, system_prompt);

                if cancellation.is_cancelled() {
                    return Err("cancelled".to_string());
                }
                let result = self.agent.execute(&def, input, &[]).await.map_err(|e| e.to_string())?;

                Ok(serde_json::json!({
                    "answer": result.answer,
                    "success": result.success,
                    "truncated": result.truncated,
                    "fallback": result.fallback,
                }))
            }
            "ingest_document" | "multi_modal_analysis" => Ok(serde_json::json!({
                "delegated": true,
                "kind": kind,
                "payload": payload,
            })),
            other => Err(format!("unknown task kind: {}", other)),
        }
    }
}

fn backoff_with_jitter(base: Duration, attempt: u32, cap: Duration, jitter: f64) -> Duration {
    let scaled = base.as_millis().saturating_mul(2u128.saturating_pow(attempt.min(32)));
    let capped = scaled.min(cap.as_millis());
    // Deterministic jitter derived from the attempt count rather than a random source,
    // since workflow scripts in this crate cannot call RNGs; still spreads retries.
    let spread = 1.0 - jitter + 2.0 * jitter * ((attempt % 5) as f64 / 5.0);
    Duration::from_millis((capped as f64 * spread) as u64)
}

async fn run_one_task(
    task_id: String,
    tasks: &Arc<RwLock<HashMap<String, TaskRecord>>>,
    log: &Arc<std::sync::Mutex<TaskLog>>,
    handler: &Arc<dyn TaskHandler>,
    notify: &Arc<RwLock<HashMap<String, Arc<tokio::sync::Notify>>>>,
    retry: &RetryConfig,
    dispatch_tx: &tokio::sync::mpsc::Sender<String>,
    lease_duration: Duration,
    events: &Arc<dyn EventHandler>,
) {
    let (kind, payload, cancellation, already_cancelled, attempt) = {
        let mut table = tasks.write().unwrap();
        let record = match table.get_mut(&task_id) {
            Some(r) => r,
            None => return,
        };
        if record.task.state.is_terminal() {
            return;
        }
        record.task.state = TaskState::Running;
        record.task.attempts += 1;
        record.lease_until = Some(std::time::Instant::now() + lease_duration);
        log::info!("task {} claimed (attempt {})", task_id, record.task.attempts);
        let _ = log.lock().unwrap().append(&record.task);
        (
            record.task.kind.clone(),
            record.task.payload.clone(),
            record.cancellation.clone(),
            record.cancellation.is_cancelled(),
            record.task.attempts,
        )
    };
    events.on_task_event(&TaskEvent::Claimed { task_id: task_id.clone(), attempt }).await;

    if already_cancelled {
        finish(&task_id, tasks, log, notify, events, TaskState::Cancelled, None, Some("cancelled".to_string())).await;
        return;
    }

    let outcome = handler.execute(&kind, payload, cancellation.clone()).await;

    if cancellation.is_cancelled() {
        finish(&task_id, tasks, log, notify, events, TaskState::Cancelled, None, Some("cancelled".to_string())).await;
        return;
    }

    match outcome {
        Ok(result) => {
            finish(&task_id, tasks, log, notify, events, TaskState::Completed, Some(result), None).await;
        }
        Err(error) => {
            let attempts = tasks.read().unwrap().get(&task_id).map(|r| r.task.attempts).unwrap_or(0);
            if attempts < retry.max_attempts {
                finish(&task_id, tasks, log, notify, events, TaskState::Retrying, None, Some(error)).await;
                let delay = backoff_with_jitter(retry.base_backoff, attempts, retry.cap_backoff, retry.jitter);
                let dispatch_tx = dispatch_tx.clone();
                let task_id_retry = task_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = dispatch_tx.send(task_id_retry).await;
                });
            } else {
                finish(&task_id, tasks, log, notify, events, TaskState::Failed, None, Some(error)).await;
            }
        }
    }
}

fn prune_terminal_tasks(
    tasks: &Arc<RwLock<HashMap<String, TaskRecord>>>,
    notify: &Arc<RwLock<HashMap<String, Arc<tokio::sync::Notify>>>>,
    retention_window: Duration,
) -> usize {
    let cutoff = Utc::now() - chrono::Duration::from_std(retention_window).unwrap_or(chrono::Duration::zero());
    let expired: Vec<String> = tasks
        .read()
        .unwrap()
        .iter()
        .filter(|(_, r)| r.task.state.is_terminal() && r.task.finished_at.map(|t| t < cutoff).unwrap_or(false))
        .map(|(id, _)| id.clone())
        .collect();

    let mut table = tasks.write().unwrap();
    let mut notify_table = notify.write().unwrap();
    for id in &expired {
        table.remove(id);
        notify_table.remove(id);
    }
    expired.len()
}

async fn finish(
    task_id: &str,
    tasks: &Arc<RwLock<HashMap<String, TaskRecord>>>,
    log: &Arc<std::sync::Mutex<TaskLog>>,
    notify: &Arc<RwLock<HashMap<String, Arc<tokio::sync::Notify>>>>,
    events: &Arc<dyn EventHandler>,
    state: TaskState,
    result: Option<serde_json::Value>,
    error: Option<String>,
) {
    {
        let mut table = tasks.write().unwrap();
        if let Some(record) = table.get_mut(task_id) {
            record.task.state = state;
            record.task.result = result;
            record.task.last_error = error;
            record.lease_until = None;
            if state.is_terminal() {
                record.task.finished_at = Some(Utc::now());
            }
            let _ = log.lock().unwrap().append(&record.task);
        }
    }
    if state.is_terminal() {
        if let Some(n) = notify.read().unwrap().get(task_id) {
            n.notify_waiters();
        }
        events
            .on_task_event(&TaskEvent::Terminal {
                task_id: task_id.to_string(),
                state: format!("{:?}", state),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tool_registry::ToolRegistry;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn execute(&self, _kind: &str, payload: serde_json::Value, _cancellation: CancellationFlag) -> Result<serde_json::Value, String> {
            Ok(payload)
        }
    }

    struct AlwaysFailsHandler;

    #[async_trait]
    impl TaskHandler for AlwaysFailsHandler {
        async fn execute(&self, _kind: &str, _payload: serde_json::Value, _cancellation: CancellationFlag) -> Result<serde_json::Value, String> {
            Err("boom".to_string())
        }
    }

    struct SlowHandler {
        started: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn execute(&self, _kind: &str, _payload: serde_json::Value, cancellation: CancellationFlag) -> Result<serde_json::Value, String> {
            self.started.notify_waiters();
            for _ in 0..200 {
                if cancellation.is_cancelled() {
                    return Err("cancelled at checkpoint".to_string());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(serde_json::json!("done"))
        }
    }

    fn test_config(dir: &std::path::Path) -> OrchestratorConfig {
        OrchestratorConfig {
            worker_pool_size: 2,
            queue_capacity: 16,
            lease_duration: Duration::from_secs(30),
            retention_window: Duration::from_secs(3600),
            task_log_dir: dir.to_path_buf(),
        }
    }

    fn test_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            cap_backoff: Duration::from_millis(50),
            jitter: 0.2,
        }
    }

    #[tokio::test]
    async fn submit_and_wait_completes_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = TaskOrchestrator::open(test_config(dir.path()), test_retry(), Arc::new(EchoHandler)).unwrap();
        let id = orchestrator.submit("execute_agent", serde_json::json!({"x": 1})).await.unwrap();
        let task = orchestrator.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result, Some(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn failing_task_retries_then_fails_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            TaskOrchestrator::open(test_config(dir.path()), test_retry(), Arc::new(AlwaysFailsHandler)).unwrap();
        let id = orchestrator.submit("execute_agent", serde_json::json!({})).await.unwrap();
        let task = orchestrator.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.last_error, Some("boom".to_string()));
    }

    #[tokio::test]
    async fn cancel_before_claim_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            worker_pool_size: 0,
            ..test_config(dir.path())
        };
        let orchestrator = TaskOrchestrator::open(config, test_retry(), Arc::new(EchoHandler)).unwrap();
        let id = orchestrator.submit("execute_agent", serde_json::json!({})).await.unwrap();
        let cancelled = orchestrator.cancel(&id).await.unwrap();
        assert!(cancelled);
        assert_eq!(orchestrator.status(&id).unwrap().state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_while_running_is_honored_at_next_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let started = Arc::new(tokio::sync::Notify::new());
        let orchestrator = TaskOrchestrator::open(
            test_config(dir.path()),
            test_retry(),
            Arc::new(SlowHandler { started: started.clone() }),
        )
        .unwrap();
        let id = orchestrator.submit("run_workflow", serde_json::json!({})).await.unwrap();
        started.notified().await;
        orchestrator.cancel(&id).await.unwrap();
        let task = orchestrator.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn status_of_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = TaskOrchestrator::open(test_config(dir.path()), test_retry(), Arc::new(EchoHandler)).unwrap();
        assert!(matches!(orchestrator.status("missing"), Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn replay_reconstructs_table_from_log_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let orchestrator = TaskOrchestrator::open(config.clone(), test_retry(), Arc::new(EchoHandler)).unwrap();
        let id = orchestrator.submit("execute_agent", serde_json::json!({"v": 1})).await.unwrap();
        let _ = orchestrator.wait(&id, Duration::from_secs(5)).await.unwrap();
        drop(orchestrator);

        let reopened = TaskOrchestrator::open(config, test_retry(), Arc::new(EchoHandler)).unwrap();
        let task = reopened.status(&id).unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn backoff_grows_exponentially_and_respects_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);
        let small = backoff_with_jitter(base, 0, cap, 0.2);
        let large = backoff_with_jitter(base, 10, cap, 0.2);
        assert!(small <= Duration::from_millis(140));
        assert!(large <= cap + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn standard_handler_run_workflow_delegates_to_runner_in_fallback_mode() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(WorkflowRunner::new(Agent::new(None, Arc::new(ToolRegistry::new()))));
        let agent = Arc::new(Agent::new(None, Arc::new(ToolRegistry::new())));
        let orchestrator = TaskOrchestrator::open(
            test_config(dir.path()),
            test_retry(),
            Arc::new(StandardTaskHandler::new(runner, agent)),
        )
        .unwrap();

        let id = orchestrator
            .submit(
                "run_workflow",
                serde_json::json!({"workflow_name": "simple_research", "input": "lichens"}),
            )
            .await
            .unwrap();
        let task = orchestrator.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result.unwrap()["workflow_name"], "simple_research");
    }

    #[tokio::test]
    async fn standard_handler_unknown_workflow_name_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(WorkflowRunner::new(Agent::new(None, Arc::new(ToolRegistry::new()))));
        let agent = Arc::new(Agent::new(None, Arc::new(ToolRegistry::new())));
        let orchestrator = TaskOrchestrator::open(
            test_config(dir.path()),
            test_retry(),
            Arc::new(StandardTaskHandler::new(runner, agent)),
        )
        .unwrap();

        let id = orchestrator
            .submit("run_workflow", serde_json::json!({"workflow_name": "does_not_exist"}))
            .await
            .unwrap();
        let task = orchestrator.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn standard_handler_ingest_document_is_recorded_as_delegated() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(WorkflowRunner::new(Agent::new(None, Arc::new(ToolRegistry::new()))));
        let agent = Arc::new(Agent::new(None, Arc::new(ToolRegistry::new())));
        let orchestrator = TaskOrchestrator::open(
            test_config(dir.path()),
            test_retry(),
            Arc::new(StandardTaskHandler::new(runner, agent)),
        )
        .unwrap();

        let id = orchestrator
            .submit("ingest_document", serde_json::json!({"source_ref": "s3://bucket/doc.pdf"}))
            .await
            .unwrap();
        let task = orchestrator.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result.unwrap()["delegated"], true);
    }

    struct CountingEventHandler {
        submitted: std::sync::atomic::AtomicUsize,
        claimed: std::sync::atomic::AtomicUsize,
        terminal: std::sync::Mutex<Vec<String>>,
    }

    impl CountingEventHandler {
        fn new() -> Self {
            Self {
                submitted: std::sync::atomic::AtomicUsize::new(0),
                claimed: std::sync::atomic::AtomicUsize::new(0),
                terminal: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventHandler for CountingEventHandler {
        async fn on_task_event(&self, event: &TaskEvent) {
            match event {
                TaskEvent::Submitted { .. } => {
                    self.submitted.fetch_add(1, Ordering::SeqCst);
                }
                TaskEvent::Claimed { .. } => {
                    self.claimed.fetch_add(1, Ordering::SeqCst);
                }
                TaskEvent::Terminal { state, .. } => {
                    self.terminal.lock().unwrap().push(state.clone());
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn open_with_events_reports_submitted_claimed_and_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(CountingEventHandler::new());
        let orchestrator = TaskOrchestrator::open_with_events(
            test_config(dir.path()),
            test_retry(),
            Arc::new(EchoHandler),
            events.clone(),
        )
        .unwrap();

        let id = orchestrator.submit("execute_agent", serde_json::json!({"x": 1})).await.unwrap();
        let task = orchestrator.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);

        assert_eq!(events.submitted.load(Ordering::SeqCst), 1);
        assert_eq!(events.claimed.load(Ordering::SeqCst), 1);
        assert_eq!(events.terminal.lock().unwrap().as_slice(), &["Completed".to_string()]);
    }

    #[test]
    fn prune_terminal_tasks_drops_entries_past_the_retention_window() {
        let tasks: Arc<RwLock<HashMap<String, TaskRecord>>> = Arc::new(RwLock::new(HashMap::new()));
        let notify: Arc<RwLock<HashMap<String, Arc<tokio::sync::Notify>>>> = Arc::new(RwLock::new(HashMap::new()));
        let old_task = Task {
            id: "old".to_string(),
            kind: "execute_agent".to_string(),
            payload: serde_json::json!({}),
            state: TaskState::Completed,
            attempts: 1,
            last_error: None,
            result: None,
            created_at: Utc::now(),
            finished_at: Some(Utc::now() - chrono::Duration::hours(2)),
        };
        tasks.write().unwrap().insert(
            "old".to_string(),
            TaskRecord {
                task: old_task,
                lease_until: None,
                cancellation: CancellationFlag::new(),
            },
        );
        notify.write().unwrap().insert("old".to_string(), Arc::new(tokio::sync::Notify::new()));

        let removed = prune_terminal_tasks(&tasks, &notify, Duration::from_secs(3600));
        assert_eq!(removed, 1);
        assert!(tasks.read().unwrap().is_empty());
    }
}
