//! Call-tree nodes.
//!
//! A [`Stack`] records one unit of work: the root request, a delegated
//! sub-call, or a forked parallel branch. Lineage fields (trace id,
//! parent id, depth, path) are fixed at creation; only the status block
//! changes afterward, and only through the terminal transitions.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use conductor_core::types::{CallOptions, Referer, StackStatus};

/// Detached lineage snapshot handed to a forked branch.
///
/// A fork must know where it hangs in the call tree without holding the
/// live parent `Stack`, which the parent branch keeps mutating
/// concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkParent {
    pub stack_id: String,
    pub trace_id: String,
    pub depth: usize,
    pub path: Vec<String>,
}

#[derive(Debug)]
struct StackState {
    status: StackStatus,
    completed_at: Option<i64>,
    duration_ms: Option<i64>,
    error: Option<String>,
}

/// One node in the call tree. Identity and lineage are immutable; the
/// status block is guarded so the single terminal transition cannot be
/// applied twice from racing paths.
#[derive(Debug)]
pub struct Stack {
    pub id: String,
    pub trace_id: String,
    pub target_id: String,
    pub referer: Referer,
    pub depth: usize,
    /// Empty for the root node.
    pub parent_id: String,
    /// Ordered ids from root to self, self included.
    pub path: Vec<String>,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
    pub options: CallOptions,

    state: Mutex<StackState>,
}

/// Serializable view of a stack for trace reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSnapshot {
    pub id: String,
    pub trace_id: String,
    pub target_id: String,
    pub referer: Referer,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    pub path: Vec<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    pub status: StackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl Stack {
    /// Create a root node (depth 0, path = [self]). Generates a trace id
    /// when the caller does not supply one.
    pub fn new_root(
        trace_id: &str,
        target_id: &str,
        referer: Referer,
        options: CallOptions,
    ) -> Arc<Self> {
        let id = new_stack_id();
        let trace_id = if trace_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            trace_id.to_string()
        };
        Arc::new(Self {
            path: vec![id.clone()],
            id,
            trace_id,
            target_id: target_id.to_string(),
            referer,
            depth: 0,
            parent_id: String::new(),
            created_at: now_millis(),
            options,
            state: Mutex::new(StackState::running()),
        })
    }

    /// Create a child of a live parent node.
    pub fn new_child(
        parent: &Stack,
        target_id: &str,
        referer: Referer,
        options: CallOptions,
    ) -> Arc<Self> {
        let id = new_stack_id();
        let mut path = parent.path.clone();
        path.push(id.clone());
        Arc::new(Self {
            id,
            trace_id: parent.trace_id.clone(),
            target_id: target_id.to_string(),
            referer,
            depth: parent.depth + 1,
            parent_id: parent.id.clone(),
            path,
            created_at: now_millis(),
            options,
            state: Mutex::new(StackState::running()),
        })
    }

    /// Create a child from detached fork metadata. Same shape as
    /// [`Stack::new_child`], but the lineage comes from the snapshot
    /// taken at fork time, never from the live parent.
    pub fn from_fork(
        fork: &ForkParent,
        target_id: &str,
        referer: Referer,
        options: CallOptions,
    ) -> Arc<Self> {
        let id = new_stack_id();
        let mut path = fork.path.clone();
        path.push(id.clone());
        Arc::new(Self {
            id,
            trace_id: fork.trace_id.clone(),
            target_id: target_id.to_string(),
            referer,
            depth: fork.depth + 1,
            parent_id: fork.stack_id.clone(),
            path,
            created_at: now_millis(),
            options,
            state: Mutex::new(StackState::running()),
        })
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0 && self.parent_id.is_empty()
    }

    pub fn status(&self) -> StackStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == StackStatus::Running
    }

    /// True once any terminal state is reached, including failure.
    pub fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn completed_at(&self) -> Option<i64> {
        self.state.lock().unwrap().completed_at
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.state.lock().unwrap().duration_ms
    }

    pub fn complete(&self) {
        self.finish(StackStatus::Completed, None);
    }

    pub fn fail(&self, error: Option<String>) {
        self.finish(StackStatus::Failed, error);
    }

    pub fn timeout(&self) {
        self.finish(StackStatus::Timeout, None);
    }

    fn finish(&self, status: StackStatus, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            warn!(
                stack_id = %self.id,
                current = ?state.status,
                requested = ?status,
                "terminal status already set, ignoring transition"
            );
            return;
        }
        let completed_at = now_millis();
        state.status = status;
        state.completed_at = Some(completed_at);
        state.duration_ms = Some(completed_at - self.created_at);
        state.error = error;
    }

    /// Snapshot of the detachable lineage fields, for starting a fork.
    pub fn fork_parent(&self) -> ForkParent {
        ForkParent {
            stack_id: self.id.clone(),
            trace_id: self.trace_id.clone(),
            depth: self.depth,
            path: self.path.clone(),
        }
    }

    pub fn snapshot(&self) -> StackSnapshot {
        let state = self.state.lock().unwrap();
        StackSnapshot {
            id: self.id.clone(),
            trace_id: self.trace_id.clone(),
            target_id: self.target_id.clone(),
            referer: self.referer,
            depth: self.depth,
            parent_id: self.parent_id.clone(),
            path: self.path.clone(),
            created_at: self.created_at,
            completed_at: state.completed_at,
            status: state.status,
            error: state.error.clone(),
            duration_ms: state.duration_ms,
        }
    }
}

impl StackState {
    fn running() -> Self {
        Self {
            status: StackStatus::Running,
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }
}

fn new_stack_id() -> String {
    format!("stack-{}", Uuid::new_v4())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_root() {
        let stack = Stack::new_root("trace-1", "agent-a", Referer::Api, CallOptions::default());

        assert_eq!(stack.trace_id, "trace-1");
        assert_eq!(stack.target_id, "agent-a");
        assert_eq!(stack.depth, 0);
        assert!(stack.parent_id.is_empty());
        assert_eq!(stack.path, vec![stack.id.clone()]);
        assert!(stack.is_root());
        assert!(stack.is_running());
    }

    #[test]
    fn test_new_root_generates_trace_id() {
        let stack = Stack::new_root("", "agent-a", Referer::Api, CallOptions::default());
        assert!(stack.trace_id.len() >= 8);
    }

    #[test]
    fn test_new_child_inherits_lineage() {
        let parent = Stack::new_root("trace-1", "parent", Referer::Api, CallOptions::default());
        let child = Stack::new_child(&parent, "child", Referer::Agent, CallOptions::default());

        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_id, parent.id);
        assert_eq!(child.depth, parent.depth + 1);
        assert_eq!(child.path, vec![parent.id.clone(), child.id.clone()]);
        assert!(!child.is_root());
    }

    #[test]
    fn test_from_fork_uses_snapshot_not_parent() {
        let parent = Stack::new_root("trace-1", "parent", Referer::Api, CallOptions::default());
        let fork = parent.fork_parent();

        // Parent reaches a terminal state before the fork starts.
        parent.fail(Some("parent died".into()));

        let branch = Stack::from_fork(&fork, "branch", Referer::AgentFork, CallOptions::default());

        assert_eq!(branch.trace_id, parent.trace_id);
        assert_eq!(branch.parent_id, parent.id);
        assert_eq!(branch.depth, 1);
        assert_eq!(branch.path, vec![parent.id.clone(), branch.id.clone()]);
        assert!(branch.is_running());
    }

    #[test]
    fn test_complete_sets_duration() {
        let stack = Stack::new_root("t", "a", Referer::Api, CallOptions::default());
        std::thread::sleep(Duration::from_millis(10));
        stack.complete();

        assert_eq!(stack.status(), StackStatus::Completed);
        assert!(stack.completed_at().is_some());
        assert!(stack.duration_ms().unwrap() >= 10);
        assert!(stack.is_completed());
        assert!(!stack.is_running());
    }

    #[test]
    fn test_fail_and_timeout_are_terminal() {
        let failed = Stack::new_root("t", "a", Referer::Api, CallOptions::default());
        failed.fail(Some("boom".into()));
        assert_eq!(failed.status(), StackStatus::Failed);
        assert_eq!(failed.error().as_deref(), Some("boom"));
        assert!(failed.is_completed());

        let timed = Stack::new_root("t", "a", Referer::Api, CallOptions::default());
        timed.timeout();
        assert_eq!(timed.status(), StackStatus::Timeout);
        assert!(timed.is_completed());
    }

    #[test]
    fn test_terminal_transition_is_set_once() {
        let stack = Stack::new_root("t", "a", Referer::Api, CallOptions::default());
        stack.fail(Some("first".into()));

        // A later complete() must not overwrite the failure.
        stack.complete();
        assert_eq!(stack.status(), StackStatus::Failed);
        assert_eq!(stack.error().as_deref(), Some("first"));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let stack = Stack::new_root("trace-1", "agent-a", Referer::Api, CallOptions::default());
        stack.complete();

        let snapshot = stack.snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["trace_id"], "trace-1");
        assert!(json.get("parent_id").is_none());

        let back: StackSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, stack.id);
        assert_eq!(back.status, StackStatus::Completed);
    }
}
