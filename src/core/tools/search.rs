//! A web-search tool stub.
//!
//! Written fresh in the same `Tool` shape as the rest of this module's tools, since a
//! search index has no equivalent among the caller-supplied-URL HTTP tools those model.
//! Real search-index wiring is out of scope; [`Search::new`] takes a backend closure so
//! tests (and a future real implementation) can supply results, or force the
//! `ToolExecutionFailed` path, without any actual network access.

use crate::core::tool_registry::{Tool, ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolResult};
use async_trait::async_trait;

type Backend = dyn Fn(&str) -> Result<Vec<String>, String> + Send + Sync;

/// A `"search"` tool backed by a pluggable lookup function.
pub struct Search {
    backend: Box<Backend>,
}

impl Search {
    pub fn new(backend: impl Fn(&str) -> Result<Vec<String>, String> + Send + Sync + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// A backend that always fails, for exercising the tool-failure-absorption path in
    /// an agent's ReAct loop.
    pub fn always_failing(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(move |_| Err(reason.clone()))
    }
}

#[async_trait]
impl Tool for Search {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new("search", "Searches for information relevant to a query and returns matching snippets")
            .with_parameter(
                ToolParameter::new("query", ToolParameterType::String)
                    .with_description("the search query")
                    .required(),
            )
    }

    async fn invoke(&self, args: serde_json::Value) -> Result<ToolResult, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::ToolInputInvalid("query must be a string".to_string()))?;

        match (self.backend)(query) {
            Ok(results) => Ok(ToolResult::success(serde_json::json!(results))),
            Err(reason) => Err(ToolError::ToolExecutionFailed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invoke_returns_backend_results() {
        let tool = Search::new(|query| Ok(vec![format!("result for {}", query)]));
        let result = tool.invoke(serde_json::json!({"query": "rust async"})).await.unwrap();
        assert_eq!(result.output, serde_json::json!(["result for rust async"]));
    }

    #[tokio::test]
    async fn always_failing_backend_raises_execution_failed() {
        let tool = Search::always_failing("search index unreachable");
        let err = tool.invoke(serde_json::json!({"query": "x"})).await.unwrap_err();
        assert!(matches!(err, ToolError::ToolExecutionFailed(msg) if msg == "search index unreachable"));
    }

    #[tokio::test]
    async fn invoke_without_query_is_input_invalid() {
        let tool = Search::new(|_| Ok(vec![]));
        let err = tool.invoke(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::ToolInputInvalid(_)));
    }
}
