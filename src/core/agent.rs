//! Agent Executor (C4): runs one agent definition on one input through a budgeted
//! reason/act/observe (ReAct) loop, consulting the Provider Dispatcher, Tool Registry,
//! and whatever retrieved context the caller supplies.
//!
//! Built around the same "parse a tool call out of the completion, invoke it, feed the
//! result back in, repeat" shape as a classic send-loop LLM agent, generalized from a
//! single always-on session to the narrower [`crate::core::provider::Provider`] trait,
//! with step tracing and a deterministic no-provider fallback.

use crate::core::event::{AgentEvent, EventHandler, NoopEventHandler};
use crate::core::provider::{GenerationParams, ProviderDispatcher, ProviderError};
use crate::core::retriever::RetrievedChunk;
use crate::core::tool_registry::{ToolError, ToolRegistry};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A static description of an agent: its role label and system prompt. Distinct from the
/// runtime [`Agent`] executor, which is shared across many invocations of many
/// definitions.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub role: String,
    pub system_prompt: String,
    pub max_steps: u32,
    pub tool_timeout: Duration,
}

impl AgentDefinition {
    pub fn new(role: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            system_prompt: system_prompt.into(),
            max_steps: 6,
            tool_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// One entry in an [`AgentResult`]'s trace: a thought, an action taken, or an observation
/// received back.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ReasoningStep {
    Thought(String),
    Action { tool: String, args: serde_json::Value },
    Observation(String),
}

/// Outcome of running one [`AgentDefinition`] on one input (§4.4).
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub answer: String,
    pub steps: Vec<ReasoningStep>,
    pub tools_invoked: Vec<String>,
    pub provider_used: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub success: bool,
    pub truncated: bool,
    pub fallback: bool,
}

/// Only catastrophic, non-tool failures reach the caller as an `Err` (§4.4) — tool
/// failures are absorbed into the trace instead.
#[derive(Debug, Clone)]
pub enum AgentError {
    DispatcherFailed(ProviderError),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::DispatcherFailed(err) => write!(f, "dispatcher failed: {}", err),
        }
    }
}

impl std::error::Error for AgentError {}

/// A simplified completion the agent loop can act on: either a final answer or a
/// requested tool call.
enum ParsedCompletion {
    FinalAnswer(String),
    ToolCall { tool: String, args: serde_json::Value },
    Unparseable(String),
}

/// Scans a completion for `{"tool_call": {"name": "...", "args": {...}}}`, using
/// brace-counting so surrounding prose does not confuse the parse. Anything else is
/// treated as a final answer.
fn parse_completion(text: &str) -> ParsedCompletion {
    if let Some(start_idx) = text.find("{\"tool_call\"") {
        let chars: Vec<char> = text.chars().collect();
        let mut brace_count = 0;
        let mut end_idx = start_idx;
        for (i, ch) in chars.iter().enumerate().skip(start_idx) {
            match ch {
                '{' => brace_count += 1,
                '}' => {
                    brace_count -= 1;
                    if brace_count == 0 {
                        end_idx = i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        if end_idx > start_idx {
            let json_str: String = chars[start_idx..end_idx].iter().collect();
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&json_str) {
                if let Some(call) = parsed.get("tool_call") {
                    if let (Some(name), Some(args)) = (call.get("name").and_then(|v| v.as_str()), call.get("args")) {
                        return ParsedCompletion::ToolCall {
                            tool: name.to_string(),
                            args: args.clone(),
                        };
                    }
                }
            }
        }
        return ParsedCompletion::Unparseable(text.to_string());
    }
    ParsedCompletion::FinalAnswer(text.to_string())
}

/// Runs [`AgentDefinition`]s through a ReAct loop against a shared dispatcher and tool
/// registry. One `Agent` instance is typically shared across every invocation within a
/// process; it holds no per-run state.
pub struct Agent {
    dispatcher: Option<Arc<ProviderDispatcher>>,
    tools: Arc<ToolRegistry>,
    event_handler: Arc<dyn EventHandler>,
}

impl Agent {
    pub fn new(dispatcher: Option<Arc<ProviderDispatcher>>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            dispatcher,
            tools,
            event_handler: Arc::new(NoopEventHandler),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    async fn emit(&self, event: AgentEvent) {
        self.event_handler.on_agent_event(&event).await;
    }

    /// Build the prompt for one iteration: system prompt, serialized trace so far,
    /// retrieved context, and the user input.
    fn build_prompt(
        &self,
        def: &AgentDefinition,
        input: &str,
        context_chunks: &[RetrievedChunk],
        steps: &[ReasoningStep],
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str(&def.system_prompt);
        prompt.push('\n');

        if !context_chunks.is_empty() {
            prompt.push_str("\nRetrieved context:\n");
            for chunk in context_chunks {
                prompt.push_str(&format!("- {}\n", chunk.text));
            }
        }

        if !steps.is_empty() {
            prompt.push_str("\nPrior steps:\n");
            for step in steps {
                match step {
                    ReasoningStep::Thought(t) => prompt.push_str(&format!("Thought: {}\n", t)),
                    ReasoningStep::Action { tool, args } => {
                        prompt.push_str(&format!("Action: {} {}\n", tool, args))
                    }
                    ReasoningStep::Observation(o) => prompt.push_str(&format!("Observation: {}\n", o)),
                }
            }
        }

        if !self.tools.list().is_empty() {
            prompt.push_str("\nYou have access to the following tools:\n");
            for name in self.tools.list() {
                prompt.push_str(&format!("- {}\n", name));
            }
            prompt.push_str(
                "\nTo call a tool, respond with {\"tool_call\": {\"name\": \"...\", \"args\": {...}}}\n",
            );
        }

        prompt.push_str(&format!("\nInput: {}\n", input));
        prompt
    }

    fn fallback_result(&self, def: &AgentDefinition, input: &str) -> AgentResult {
        AgentResult {
            answer: format!(
                "[no provider configured] role={} received input: {}",
                def.role, input
            ),
            steps: Vec::new(),
            tools_invoked: Vec::new(),
            provider_used: None,
            input_tokens: 0,
            output_tokens: 0,
            success: true,
            truncated: false,
            fallback: true,
        }
    }

    /// Run `def` on `input`, consulting `context_chunks` for grounding. Returns `Err`
    /// only on catastrophic dispatcher failure; tool failures become observation steps.
    pub async fn execute(
        &self,
        def: &AgentDefinition,
        input: &str,
        context_chunks: &[RetrievedChunk],
    ) -> Result<AgentResult, AgentError> {
        let dispatcher = match &self.dispatcher {
            Some(d) => d.clone(),
            None => return Ok(self.fallback_result(def, input)),
        };

        self.emit(AgentEvent::SendStarted {
            agent_role: def.role.clone(),
            input_len: input.len(),
        })
        .await;

        let mut steps = Vec::new();
        let mut tools_invoked = Vec::new();
        let mut total_input_tokens = 0u32;
        let mut total_output_tokens = 0u32;
        let mut provider_used = None;
        let mut truncated = false;
        let mut fallback = false;
        let mut answer = String::new();

        if def.max_steps == 0 {
            let prompt = self.build_prompt(def, input, context_chunks, &steps);

            self.emit(AgentEvent::ProviderCallStarted {
                agent_role: def.role.clone(),
                iteration: 1,
            })
            .await;

            let outcome = match dispatcher.generate(&prompt, &GenerationParams::default()).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.emit(AgentEvent::SendCompleted {
                        agent_role: def.role.clone(),
                        success: false,
                        fallback: false,
                    })
                    .await;
                    return Err(AgentError::DispatcherFailed(err));
                }
            };

            self.emit(AgentEvent::ProviderCallCompleted {
                agent_role: def.role.clone(),
                iteration: 1,
                response_len: outcome.text.len(),
            })
            .await;

            let is_final_answer = matches!(parse_completion(&outcome.text), ParsedCompletion::FinalAnswer(_));

            self.emit(AgentEvent::SendCompleted {
                agent_role: def.role.clone(),
                success: true,
                fallback: false,
            })
            .await;

            return Ok(AgentResult {
                answer: outcome.text,
                steps,
                tools_invoked,
                provider_used: Some(outcome.provider_used),
                input_tokens: outcome.input_tokens,
                output_tokens: outcome.output_tokens,
                success: true,
                truncated: !is_final_answer,
                fallback: false,
            });
        }

        for iteration in 1..=def.max_steps {
            let prompt = self.build_prompt(def, input, context_chunks, &steps);

            self.emit(AgentEvent::ProviderCallStarted {
                agent_role: def.role.clone(),
                iteration,
            })
            .await;

            let outcome = match dispatcher.generate(&prompt, &GenerationParams::default()).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.emit(AgentEvent::SendCompleted {
                        agent_role: def.role.clone(),
                        success: false,
                        fallback: false,
                    })
                    .await;
                    return Err(AgentError::DispatcherFailed(err));
                }
            };

            total_input_tokens += outcome.input_tokens;
            total_output_tokens += outcome.output_tokens;
            provider_used = Some(outcome.provider_used.clone());

            self.emit(AgentEvent::ProviderCallCompleted {
                agent_role: def.role.clone(),
                iteration,
                response_len: outcome.text.len(),
            })
            .await;

            match parse_completion(&outcome.text) {
                ParsedCompletion::FinalAnswer(text) => {
                    answer = text;
                    break;
                }
                ParsedCompletion::Unparseable(text) => {
                    answer = text;
                    fallback = true;
                    break;
                }
                ParsedCompletion::ToolCall { tool, args } => {
                    steps.push(ReasoningStep::Action {
                        tool: tool.clone(),
                        args: args.clone(),
                    });

                    self.emit(AgentEvent::ToolCallDetected {
                        agent_role: def.role.clone(),
                        iteration,
                        tool_name: tool.clone(),
                    })
                    .await;

                    let observation = match tokio::time::timeout(def.tool_timeout, self.tools.invoke(&tool, args)).await
                    {
                        Ok(Ok(result)) => {
                            tools_invoked.push(tool.clone());
                            format!("tool '{}' succeeded: {}", tool, result.output)
                        }
                        Ok(Err(ToolError::ToolInputInvalid(msg))) => {
                            format!("tool '{}' rejected its arguments: {}", tool, msg)
                        }
                        Ok(Err(err)) => format!("tool '{}' failed: {}", tool, err),
                        Err(_) => format!("tool '{}' timed out", tool),
                    };

                    self.emit(AgentEvent::ToolCallCompleted {
                        agent_role: def.role.clone(),
                        iteration,
                        tool_name: tool,
                        succeeded: !observation.contains("failed") && !observation.contains("timed out"),
                    })
                    .await;

                    steps.push(ReasoningStep::Observation(observation));
                }
            }

            if iteration == def.max_steps {
                self.emit(AgentEvent::MaxStepsReached {
                    agent_role: def.role.clone(),
                    max_steps: def.max_steps,
                })
                .await;
                truncated = true;
                answer = steps
                    .iter()
                    .rev()
                    .find_map(|s| match s {
                        ReasoningStep::Observation(o) => Some(o.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| "no observation recorded before step budget exhausted".to_string());
            }
        }

        self.emit(AgentEvent::SendCompleted {
            agent_role: def.role.clone(),
            success: true,
            fallback,
        })
        .await;

        Ok(AgentResult {
            answer,
            steps,
            tools_invoked,
            provider_used,
            input_tokens: total_input_tokens,
            output_tokens: total_output_tokens,
            success: true,
            truncated,
            fallback,
        })
    }
}
