//! Fan-out dispatcher for concurrent tool calls.
//!
//! Given a list of requests and a [`ToolClient`] executor, runs them on
//! independent tasks with All (settle-all), Any (first success), or Race
//! (first finish) aggregation. Branch failures and panics stay inside
//! their own result slot; they never abort sibling branches.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use conductor_core::error::{ConductorError, Result};

pub mod fanout;

pub use fanout::{call_all, call_any, call_race};

/// One tool invocation against an addressable endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Endpoint (server) id the operation is addressed to.
    pub endpoint: String,

    /// Operation / tool name.
    pub operation: String,

    /// Opaque arguments, passed through to the executor.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub arguments: serde_json::Value,
}

impl ToolRequest {
    pub fn new(
        endpoint: impl Into<String>,
        operation: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            operation: operation.into(),
            arguments,
        }
    }

    /// Parse a JSON array of `{endpoint, operation, arguments?}` objects,
    /// the shape callers hand over a scripting or HTTP boundary.
    pub fn parse_list(value: serde_json::Value) -> Result<Vec<ToolRequest>> {
        let items = value
            .as_array()
            .ok_or_else(|| ConductorError::Dispatch("requests must be an array".into()))?;

        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            let request: ToolRequest = serde_json::from_value(item.clone())?;
            if request.endpoint.is_empty() {
                return Err(ConductorError::Dispatch(
                    "request.endpoint is required".into(),
                ));
            }
            if request.operation.is_empty() {
                return Err(ConductorError::Dispatch(
                    "request.operation is required".into(),
                ));
            }
            requests.push(request);
        }
        Ok(requests)
    }
}

/// Outcome of one fan-out branch. Exactly one of `result` / `error` is
/// populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub endpoint: String,
    pub operation: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(request: &ToolRequest, value: serde_json::Value) -> Self {
        Self {
            endpoint: request.endpoint.clone(),
            operation: request.operation.clone(),
            result: Some(value),
            error: None,
        }
    }

    pub fn err(request: &ToolRequest, error: impl Into<String>) -> Self {
        Self {
            endpoint: request.endpoint.clone(),
            operation: request.operation.clone(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Executor behind fan-out requests and direct single-operation calls.
///
/// Implementations talk to the actual tool/resource protocol; the
/// dispatcher only needs this contract. The cancellation token is the
/// caller's force-interrupt scope; implementations should stop promptly
/// when it is cancelled.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn invoke(
        &self,
        cancel: CancellationToken,
        endpoint: &str,
        operation: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let requests = ToolRequest::parse_list(serde_json::json!([
            {"endpoint": "search", "operation": "query", "arguments": {"q": "rust"}},
            {"endpoint": "kb", "operation": "lookup"},
        ]))
        .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].endpoint, "search");
        assert!(requests[1].arguments.is_null());
    }

    #[test]
    fn test_parse_list_rejects_missing_fields() {
        let err = ToolRequest::parse_list(serde_json::json!([{"endpoint": "", "operation": "x"}]))
            .unwrap_err();
        assert!(err.to_string().contains("endpoint"));

        assert!(ToolRequest::parse_list(serde_json::json!({"not": "an array"})).is_err());
    }

    #[test]
    fn test_result_exclusive_fields() {
        let request = ToolRequest::new("search", "query", serde_json::Value::Null);

        let ok = ToolResult::ok(&request, serde_json::json!(42));
        assert!(ok.is_success());
        assert!(ok.error.is_none());

        let err = ToolResult::err(&request, "unreachable");
        assert!(!err.is_success());
        assert!(err.result.is_none());
    }
}
