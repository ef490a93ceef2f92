//! Trace sink seam.
//!
//! The core records one node per externally visible operation (tool call,
//! resource read, fan-out branch) and completes or fails it. Persistence
//! is the embedding application's concern; when no sink is installed the
//! core degrades to a no-op.

use serde::{Deserialize, Serialize};

/// Options attached to a trace node at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceNodeOptions {
    /// Node kind, e.g. "tool", "resource", "prompt".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Human-readable label shown in trace UIs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Call-tree node this operation belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_id: Option<String>,
}

/// A live trace node. Exactly one of `complete` or `fail` is called,
/// after which the node is consumed.
pub trait TraceNode: Send + Sync {
    fn complete(self: Box<Self>, output: serde_json::Value);
    fn fail(self: Box<Self>, error: &str);
}

/// Destination for trace nodes.
pub trait TraceSink: Send + Sync {
    fn add_node(
        &self,
        input: serde_json::Value,
        options: TraceNodeOptions,
    ) -> Box<dyn TraceNode>;
}

/// Sink that discards everything. Used when tracing is skipped or no
/// sink was installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceSink;

struct NoopNode;

impl TraceNode for NoopNode {
    fn complete(self: Box<Self>, _output: serde_json::Value) {}
    fn fail(self: Box<Self>, _error: &str) {}
}

impl TraceSink for NoopTraceSink {
    fn add_node(
        &self,
        _input: serde_json::Value,
        _options: TraceNodeOptions,
    ) -> Box<dyn TraceNode> {
        Box::new(NoopNode)
    }
}
