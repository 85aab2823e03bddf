//! Lifecycle event system for the Agent Executor, Workflow Runner, and Task Orchestrator.
//!
//! Provides a callback-based observability layer distinct from the `log`-facade calls
//! scattered through the crate: `log::*!` macros are for an operator tailing output,
//! while [`EventHandler`] is for a caller that wants structured, programmatically
//! consumable lifecycle notifications (a progress UI, a streaming client, a test probe)
//! without the core depending on any one presentation.
//!
//! Both [`EventHandler`] methods default to a no-op, so a caller only overrides what it
//! cares about. The handler is wrapped in `Arc<dyn EventHandler>` and shared across every
//! [`Agent`](crate::Agent), [`WorkflowRunner`](crate::WorkflowRunner), and
//! [`TaskOrchestrator`](crate::TaskOrchestrator) that is constructed with one.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::core::event::{AgentEvent, EventHandler, TaskEvent};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_agent_event(&self, event: &AgentEvent) {
//!         if let AgentEvent::ToolCallDetected { tool_name, .. } = event {
//!             println!("invoking tool {tool_name}");
//!         }
//!     }
//!     async fn on_task_event(&self, event: &TaskEvent) {
//!         println!("{event:?}");
//!     }
//! }
//! ```

use async_trait::async_trait;

/// Events emitted by an [`Agent`](crate::Agent) during [`Agent::execute`](crate::Agent::execute).
///
/// Every variant carries enough identity for a handler to correlate events without
/// external state.
///
/// ```text
/// SendStarted
///   └─ ProviderCallStarted { iteration: 1 }
///   └─ ProviderCallCompleted { iteration: 1 }
///   └─ (if a tool call was parsed out of the completion)
///       ├─ ToolCallDetected { iteration: 1 }
///       ├─ ToolCallCompleted { iteration: 1 }
///       └─ ProviderCallStarted { iteration: 2 }
///   └─ (loop continues until a final answer or max_steps)
/// SendCompleted
/// ```
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Fired once at the start of [`Agent::execute`](crate::Agent::execute).
    SendStarted { agent_role: String, input_len: usize },
    /// Fired before each call into the Provider Dispatcher.
    ProviderCallStarted { agent_role: String, iteration: u32 },
    /// Fired after a provider call returns, successful or not.
    ProviderCallCompleted {
        agent_role: String,
        iteration: u32,
        response_len: usize,
    },
    /// Fired when the completion parses as a tool call.
    ToolCallDetected {
        agent_role: String,
        iteration: u32,
        tool_name: String,
    },
    /// Fired once the tool invocation (success or failure) has been absorbed into the trace.
    ToolCallCompleted {
        agent_role: String,
        iteration: u32,
        tool_name: String,
        succeeded: bool,
    },
    /// Fired when `max_steps` is exhausted without a final answer.
    MaxStepsReached { agent_role: String, max_steps: u32 },
    /// Fired once at the end of [`Agent::execute`](crate::Agent::execute).
    SendCompleted {
        agent_role: String,
        success: bool,
        fallback: bool,
    },
}

/// Events emitted by a [`WorkflowRunner`](crate::WorkflowRunner) during
/// [`WorkflowRunner::run`](crate::WorkflowRunner::run).
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Fired once at the start of a workflow run.
    RunStarted { workflow_name: String },
    /// Fired before invoking the Agent Executor for one step.
    StepStarted {
        workflow_name: String,
        step_index: usize,
        agent_role: String,
    },
    /// Fired after a step's `AgentResult` is available.
    StepCompleted {
        workflow_name: String,
        step_index: usize,
        agent_role: String,
        success: bool,
    },
    /// Fired once at the end of a workflow run.
    RunCompleted { workflow_name: String, success: bool },
}

/// Events emitted by a [`TaskOrchestrator`](crate::TaskOrchestrator) as tasks transition.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was durably enqueued.
    Submitted { task_id: String, task_kind: String },
    /// A worker claimed a task (`PENDING`/`RETRYING` → `RUNNING`).
    Claimed { task_id: String, attempt: u32 },
    /// A task reached a terminal state.
    Terminal { task_id: String, state: String },
    /// A worker's lease on a task expired without a status update.
    LeaseExpired { task_id: String },
    /// A cancellation request was observed at a cooperative checkpoint.
    Cancelled { task_id: String },
}

/// Best-effort observer of [`AgentEvent`], [`WorkflowEvent`], and [`TaskEvent`] notifications.
///
/// All methods default to a no-op. A handler's own failure (a panic is not caught; an
/// `async` body that errors internally) must never be allowed to abort the caller's loop —
/// implementations should swallow their own errors.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_agent_event(&self, _event: &AgentEvent) {}
    async fn on_workflow_event(&self, _event: &WorkflowEvent) {}
    async fn on_task_event(&self, _event: &TaskEvent) {}
}

/// The default handler used when a caller does not register one: observes nothing.
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        agent_events: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn on_agent_event(&self, _event: &AgentEvent) {
            self.agent_events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn handler_counts_only_agent_events() {
        let handler = Arc::new(CountingHandler {
            agent_events: AtomicUsize::new(0),
        });
        handler
            .on_agent_event(&AgentEvent::SendStarted {
                agent_role: "researcher".into(),
                input_len: 10,
            })
            .await;
        handler
            .on_workflow_event(&WorkflowEvent::RunStarted {
                workflow_name: "simple_research".into(),
            })
            .await;
        assert_eq!(handler.agent_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn noop_handler_accepts_all_events_without_panicking() {
        let handler = NoopEventHandler;
        handler
            .on_task_event(&TaskEvent::Submitted {
                task_id: "t1".into(),
                task_kind: "run_workflow".into(),
            })
            .await;
    }
}
