// src/lib.rs

//! A multi-agent AI orchestration backend.
//!
//! The crate is organised around seven cooperating components, wired together under
//! [`core`]: a provider fallback dispatcher, a tool registry, a retrieval-augmented
//! generation pipeline, a ReAct-style agent executor, a multi-agent workflow runner, a
//! conversation store contract, and a durable task orchestrator. See each module's
//! documentation for its contract.

pub mod core;

pub use core::agent::{Agent, AgentError, AgentResult};
pub use core::config::Config;
pub use core::conversation_store::{ConversationStore, InMemoryLogStore, StoreError};
pub use core::provider::{Provider, ProviderDispatcher, ProviderError};
pub use core::retriever::{ChunkFilters, ChunkSource, RagRetriever, RetrievalError, RetrievedChunk};
pub use core::task_orchestrator::{Task, TaskError, TaskOrchestrator, TaskState};
pub use core::tool_registry::{Tool, ToolError, ToolRegistry};
pub use core::workflow::{WorkflowError, WorkflowResult, WorkflowRunner};
