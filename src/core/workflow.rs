//! Workflow Runner (C5): composes several Agent Executor invocations into a named,
//! linear multi-agent pipeline.
//!
//! Narrows a richer hub-routed, multi-mode orchestration structure down to a linear-chain
//! contract: a small standard library of named workflows, each a straight sequence of
//! agent roles passing output forward. Per §4.5, this is the only component permitted to
//! instruct the Conversation Store Interface to append Turns, and it does so exactly once
//! per successful run.

use crate::core::agent::{Agent, AgentDefinition, AgentError, AgentResult};
use crate::core::conversation_store::{ConversationStore, Message, Role, StoreError};
use crate::core::event::{EventHandler, NoopEventHandler, WorkflowEvent};
use crate::core::retriever::RetrievedChunk;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One stage of a linear workflow: an agent definition plus how its input is derived
/// from the step before it.
pub struct WorkflowStep {
    pub def: AgentDefinition,
}

impl WorkflowStep {
    pub fn new(def: AgentDefinition) -> Self {
        Self { def }
    }
}

/// A named, ordered sequence of steps.
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

/// Outcome of running a workflow end to end (§4.5).
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_name: String,
    pub final_text: String,
    pub step_results: Vec<AgentResult>,
    pub agent_roles: Vec<String>,
    pub elapsed: Duration,
    pub success: bool,
    pub error: Option<String>,
    /// Echoes the `conversation_id` the caller supplied, if any.
    pub conversation_id: Option<String>,
    /// Whether prior turns from `conversation_id` were found and woven into the first
    /// step's prompt (§8 scenario 3).
    pub context_used: bool,
}

/// The only failures that abort a workflow run outright (§4.5); step-level failures are
/// captured in the result instead.
#[derive(Debug, Clone)]
pub enum WorkflowError {
    UnknownWorkflow(String),
    ConversationStore(String),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::UnknownWorkflow(name) => write!(f, "unknown workflow: {}", name),
            WorkflowError::ConversationStore(msg) => write!(f, "conversation store error: {}", msg),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        WorkflowError::ConversationStore(err.to_string())
    }
}

/// Wraps an `&str` of the previous step's output in a structured block so the next
/// agent's input makes clear what came before it (§4.5 step 2).
fn augment_with_prior_output(input: &str, prior_output: &str) -> String {
    format!("{}\n\n[Prior step output]\n{}", input, prior_output)
}

/// Renders prior turns as a structured block a prompt can be prefixed with (§8 scenario 3:
/// "the second turn's agent prompt contains the first turn's user and assistant messages").
fn render_history(messages: &[Message]) -> String {
    let mut block = String::from("[Conversation history]\n");
    for message in messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        block.push_str(&format!("{}: {}\n", role, message.content));
    }
    block
}

/// Runs named [`WorkflowDefinition`]s by delegating each step to an [`Agent`].
pub struct WorkflowRunner {
    agent: Agent,
    workflows: Vec<WorkflowDefinition>,
    event_handler: Arc<dyn EventHandler>,
    store: Option<Arc<dyn ConversationStore>>,
}

impl WorkflowRunner {
    /// Construct a runner with the standard-library workflows registered: a one-agent
    /// `simple_research`, a three-agent `research_analyze_write`, and a zero-agent
    /// `fallback` used when no provider is configured at all.
    pub fn new(agent: Agent) -> Self {
        let workflows = vec![
            WorkflowDefinition {
                name: "simple_research".to_string(),
                steps: vec![WorkflowStep::new(AgentDefinition::new(
                    "researcher",
                    "You research the given topic and summarize findings.",
                ))],
            },
            WorkflowDefinition {
                name: "research_analyze_write".to_string(),
                steps: vec![
                    WorkflowStep::new(AgentDefinition::new(
                        "researcher",
                        "You research the given topic and gather relevant facts.",
                    )),
                    WorkflowStep::new(AgentDefinition::new(
                        "analyst",
                        "You analyze the research findings and draw conclusions.",
                    )),
                    WorkflowStep::new(AgentDefinition::new(
                        "writer",
                        "You write a clear final summary from the analysis.",
                    )),
                ],
            },
            WorkflowDefinition {
                name: "fallback".to_string(),
                steps: vec![WorkflowStep::new(AgentDefinition::new(
                    "fallback",
                    "Deterministic stub path used when no provider is configured.",
                ))],
            },
        ];
        Self {
            agent,
            workflows,
            event_handler: Arc::new(NoopEventHandler),
            store: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Registers the Conversation Store Interface this runner persists Turns to. Without
    /// one, `conversation_id` is accepted but ignored: no history is loaded and nothing
    /// is appended.
    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register(&mut self, workflow: WorkflowDefinition) {
        self.workflows.retain(|w| w.name != workflow.name);
        self.workflows.push(workflow);
    }

    fn find(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.iter().find(|w| w.name == name)
    }

    /// Run `workflow_name` on `initial_input`. Only an unknown name or a conversation
    /// store failure aborts outright; a step's own failure is recorded and aborts the
    /// remaining steps without partial persistence.
    ///
    /// When `conversation_id` names an existing conversation and a store is registered,
    /// its prior turns are woven into the first step's prompt (`context_used` reports
    /// whether any were found) and, on a successful run, exactly one user turn and one
    /// assistant turn are appended to it (§4.5, §8 properties 3-4).
    pub async fn run(
        &self,
        workflow_name: &str,
        initial_input: &str,
        context_chunks: &[RetrievedChunk],
        conversation_id: Option<&str>,
    ) -> Result<WorkflowResult, WorkflowError> {
        let workflow = self
            .find(workflow_name)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_name.to_string()))?;

        self.event_handler
            .on_workflow_event(&WorkflowEvent::RunStarted {
                workflow_name: workflow_name.to_string(),
            })
            .await;

        let started = Instant::now();
        let mut step_results = Vec::new();
        let mut agent_roles = Vec::new();
        let mut current_input = initial_input.to_string();
        let mut final_text = String::new();
        let mut success = true;
        let mut error = None;

        let mut context_used = false;
        let history_block = match (conversation_id, &self.store) {
            (Some(id), Some(store)) => {
                let messages = store.load_conversation(id, None).await?;
                if messages.is_empty() {
                    None
                } else {
                    context_used = true;
                    Some(render_history(&messages))
                }
            }
            _ => None,
        };

        for (i, step) in workflow.steps.iter().enumerate() {
            agent_roles.push(step.def.role.clone());

            self.event_handler
                .on_workflow_event(&WorkflowEvent::StepStarted {
                    workflow_name: workflow_name.to_string(),
                    step_index: i,
                    agent_role: step.def.role.clone(),
                })
                .await;

            let mut step_input = if i == 0 {
                current_input.clone()
            } else {
                augment_with_prior_output(initial_input, &current_input)
            };
            if i == 0 {
                if let Some(block) = &history_block {
                    step_input = format!("{}\n\n{}", block, step_input);
                }
            }

            match self.agent.execute(&step.def, &step_input, context_chunks).await {
                Ok(result) => {
                    current_input = result.answer.clone();
                    final_text = result.answer.clone();
                    self.event_handler
                        .on_workflow_event(&WorkflowEvent::StepCompleted {
                            workflow_name: workflow_name.to_string(),
                            step_index: i,
                            agent_role: step.def.role.clone(),
                            success: result.success,
                        })
                        .await;
                    step_results.push(result);
                }
                Err(AgentError::DispatcherFailed(err)) => {
                    success = false;
                    error = Some(format!("step {} ({}) failed: {}", i, step.def.role, err));
                    self.event_handler
                        .on_workflow_event(&WorkflowEvent::StepCompleted {
                            workflow_name: workflow_name.to_string(),
                            step_index: i,
                            agent_role: step.def.role.clone(),
                            success: false,
                        })
                        .await;
                    break;
                }
            }
        }

        if success {
            if let (Some(id), Some(store)) = (conversation_id, &self.store) {
                store.append_message(id, Role::User, initial_input.to_string(), HashMap::new()).await?;
                store.append_message(id, Role::Assistant, final_text.clone(), HashMap::new()).await?;
            }
        }

        self.event_handler
            .on_workflow_event(&WorkflowEvent::RunCompleted {
                workflow_name: workflow_name.to_string(),
                success,
            })
            .await;

        Ok(WorkflowResult {
            workflow_name: workflow_name.to_string(),
            final_text,
            step_results,
            agent_roles,
            elapsed: started.elapsed(),
            success,
            error,
            conversation_id: conversation_id.map(|s| s.to_string()),
            context_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation_store::InMemoryLogStore;
    use crate::core::tool_registry::ToolRegistry;
    use std::sync::Arc;

    fn runner_without_provider() -> WorkflowRunner {
        WorkflowRunner::new(Agent::new(None, Arc::new(ToolRegistry::new())))
    }

    #[tokio::test]
    async fn unknown_workflow_name_fails() {
        let runner = runner_without_provider();
        let err = runner.run("does_not_exist", "input", &[], None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownWorkflow(name) if name == "does_not_exist"));
    }

    #[tokio::test]
    async fn simple_research_runs_one_step_in_fallback_mode() {
        let runner = runner_without_provider();
        let result = runner.run("simple_research", "quantum computing", &[], None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.agent_roles, vec!["researcher".to_string()]);
        assert_eq!(result.step_results.len(), 1);
        assert!(!result.context_used);
    }

    #[tokio::test]
    async fn research_analyze_write_chains_three_agents() {
        let runner = runner_without_provider();
        let result = runner.run("research_analyze_write", "renewable energy", &[], None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.agent_roles, vec!["researcher", "analyst", "writer"]);
        assert_eq!(result.step_results.len(), 3);
    }

    #[tokio::test]
    async fn registering_a_custom_workflow_replaces_same_named_one() {
        let mut runner = runner_without_provider();
        runner.register(WorkflowDefinition {
            name: "simple_research".to_string(),
            steps: vec![
                WorkflowStep::new(AgentDefinition::new("a", "sys")),
                WorkflowStep::new(AgentDefinition::new("b", "sys")),
            ],
        });
        let result = runner.run("simple_research", "x", &[], None).await.unwrap();
        assert_eq!(result.agent_roles, vec!["a", "b"]);
    }

    struct CountingWorkflowEventHandler {
        started: std::sync::atomic::AtomicUsize,
        steps: std::sync::atomic::AtomicUsize,
        completed: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingWorkflowEventHandler {
        async fn on_workflow_event(&self, event: &WorkflowEvent) {
            match event {
                WorkflowEvent::RunStarted { .. } => {
                    self.started.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                WorkflowEvent::StepStarted { .. } => {
                    self.steps.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                WorkflowEvent::RunCompleted { .. } => {
                    self.completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn with_event_handler_reports_run_and_step_lifecycle() {
        let events = Arc::new(CountingWorkflowEventHandler {
            started: std::sync::atomic::AtomicUsize::new(0),
            steps: std::sync::atomic::AtomicUsize::new(0),
            completed: std::sync::atomic::AtomicUsize::new(0),
        });
        let runner = runner_without_provider().with_event_handler(events.clone());

        let result = runner.run("research_analyze_write", "renewable energy", &[], None).await.unwrap();

        assert!(result.success);
        assert_eq!(events.started.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(events.steps.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(events.completed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    fn store() -> Arc<InMemoryLogStore> {
        Arc::new(InMemoryLogStore::new(tempfile::tempdir().unwrap().keep()).unwrap())
    }

    #[tokio::test]
    async fn successful_run_appends_exactly_one_user_and_one_assistant_turn() {
        let store = store();
        let conversation_id = store.create_conversation(None, None).await.unwrap();
        let runner = runner_without_provider().with_conversation_store(store.clone());

        let result = runner
            .run("simple_research", "what were the key findings", &[], Some(&conversation_id))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.conversation_id.as_deref(), Some(conversation_id.as_str()));
        let messages = store.load_conversation(&conversation_id, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].role, Role::User));
        assert!(matches!(messages[1].role, Role::Assistant));
    }

    #[tokio::test]
    async fn prior_turns_are_woven_into_the_next_run_and_reported_as_context_used() {
        let store = store();
        let conversation_id = store.create_conversation(None, None).await.unwrap();
        let runner = runner_without_provider().with_conversation_store(store.clone());

        runner
            .run(
                "simple_research",
                "What were the key findings of the latest IPCC report?",
                &[],
                Some(&conversation_id),
            )
            .await
            .unwrap();

        let second = runner
            .run(
                "simple_research",
                "How would these recommendations apply to Miami?",
                &[],
                Some(&conversation_id),
            )
            .await
            .unwrap();

        assert!(second.context_used);
        assert_eq!(second.conversation_id.as_deref(), Some(conversation_id.as_str()));
        let messages = store.load_conversation(&conversation_id, None).await.unwrap();
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn unknown_conversation_id_surfaces_as_a_conversation_store_error() {
        let store = store();
        let runner = runner_without_provider().with_conversation_store(store);
        let err = runner
            .run("simple_research", "x", &[], Some("missing-conversation"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ConversationStore(_)));
    }
}
