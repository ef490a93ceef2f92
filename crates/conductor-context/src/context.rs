//! Request context: lifecycle, call-tree orchestration, interrupt
//! routing, and the traced tool-call surface.
//!
//! A `Context` is created per request and registered in a process-wide
//! table so an out-of-band caller (an HTTP cancel endpoint, another
//! task) can route interrupt signals to it by id. Release unregisters
//! and tears down owned resources; it is safe to call more than once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use conductor_core::config::RuntimeConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::trace::{TraceNodeOptions, TraceSink};
use conductor_core::types::{AuthInfo, CallOptions, InterruptSignal, Referer};
use conductor_dispatch::{call_all, call_any, call_race, ToolClient, ToolRequest, ToolResult};

use crate::interrupt::InterruptController;
use crate::stack::{ForkParent, Stack, StackSnapshot};

/// Process-wide registry for out-of-band interrupt addressing.
static REGISTRY: LazyLock<RwLock<HashMap<String, Arc<Context>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

pub struct Context {
    /// Unique id used for out-of-band interrupt addressing.
    pub id: String,
    pub chat_id: String,
    pub auth: Option<AuthInfo>,
    pub referer: Referer,

    /// Caller-supplied cancellation scope for the whole request.
    cancel: CancellationToken,
    config: RuntimeConfig,

    /// Current active stack, swapped on enter/exit.
    current: Mutex<Option<Arc<Stack>>>,
    /// Every stack created during this request, append-only.
    stacks: RwLock<HashMap<String, Arc<Stack>>>,
    /// Lineage snapshot set on forked contexts; consumed by the first
    /// `enter_stack`.
    fork_parent: Option<ForkParent>,

    /// Lazy; zero or one controller per context.
    interrupt: Mutex<Option<Arc<InterruptController>>>,

    trace: Option<Arc<dyn TraceSink>>,

    released: AtomicBool,
}

impl Context {
    pub fn new(
        cancel: CancellationToken,
        auth: Option<AuthInfo>,
        chat_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: format!("ctx-{}", Uuid::new_v4()),
            chat_id: chat_id.into(),
            auth,
            referer: Referer::Api,
            cancel,
            config: RuntimeConfig::default(),
            current: Mutex::new(None),
            stacks: RwLock::new(HashMap::new()),
            fork_parent: None,
            interrupt: Mutex::new(None),
            trace: None,
            released: AtomicBool::new(false),
        })
    }

    /// Builder-style setters, used between `new` and the first share
    /// of the context (registration, spawning). They require exclusive
    /// ownership of the `Arc`.
    pub fn with_referer(mut self: Arc<Self>, referer: Referer) -> Arc<Self> {
        Self::exclusive(&mut self).referer = referer;
        self
    }

    pub fn with_config(mut self: Arc<Self>, config: RuntimeConfig) -> Arc<Self> {
        Self::exclusive(&mut self).config = config;
        self
    }

    pub fn with_trace_sink(mut self: Arc<Self>, sink: Arc<dyn TraceSink>) -> Arc<Self> {
        Self::exclusive(&mut self).trace = Some(sink);
        self
    }

    fn exclusive(this: &mut Arc<Self>) -> &mut Self {
        Arc::get_mut(this).expect("configure the context before sharing it")
    }

    // --- Interrupt ---

    /// Create (on first call) and return the interrupt controller.
    pub fn init_interrupt(self: &Arc<Self>) -> Arc<InterruptController> {
        let mut slot = self.interrupt.lock().unwrap();
        if let Some(controller) = slot.as_ref() {
            return controller.clone();
        }
        let controller = InterruptController::new(&self.config);
        controller.start(&self.id);
        *slot = Some(controller.clone());
        controller
    }

    pub fn interrupt(&self) -> Option<Arc<InterruptController>> {
        self.interrupt.lock().unwrap().clone()
    }

    /// Cancellation scope for in-flight operations: the interrupt
    /// controller's current token when one exists, else the request's
    /// own scope.
    pub fn cancel_token(&self) -> CancellationToken {
        match self.interrupt() {
            Some(controller) => controller.cancel_token(),
            None => self.cancel.clone(),
        }
    }

    // --- Call tree ---

    /// Begin a unit of work. Three cases:
    /// 1. no current stack + fork metadata: child from the snapshot;
    /// 2. no current stack, no metadata: fresh root with a new trace id;
    /// 3. a current stack exists: nested child, prior stack remembered.
    ///
    /// The returned guard completes the stack (if nothing set a
    /// terminal state first) and restores the prior current stack when
    /// dropped, so cleanup runs on early returns and panics alike.
    pub fn enter_stack(
        self: &Arc<Self>,
        target_id: &str,
        options: CallOptions,
    ) -> (Arc<Stack>, String, StackGuard) {
        let mut current = self.current.lock().unwrap();

        let (stack, prior) = match current.take() {
            Some(parent) => {
                let child = Stack::new_child(&parent, target_id, Referer::Agent, options);
                (child, Some(parent))
            }
            None => match &self.fork_parent {
                Some(fork) => (
                    Stack::from_fork(fork, target_id, Referer::AgentFork, options),
                    None,
                ),
                None => (Stack::new_root("", target_id, self.referer, options), None),
            },
        };

        *current = Some(stack.clone());
        drop(current);

        self.stacks
            .write()
            .unwrap()
            .insert(stack.id.clone(), stack.clone());

        let trace_id = stack.trace_id.clone();
        let guard = StackGuard {
            context: self.clone(),
            stack: stack.clone(),
            prior,
            armed: true,
        };
        (stack, trace_id, guard)
    }

    pub fn current_stack(&self) -> Option<Arc<Stack>> {
        self.current.lock().unwrap().clone()
    }

    pub fn trace_id(&self) -> Option<String> {
        self.current_stack().map(|s| s.trace_id.clone())
    }

    pub fn stack_by_id(&self, id: &str) -> Option<Arc<Stack>> {
        self.stacks.read().unwrap().get(id).cloned()
    }

    pub fn stacks_by_trace_id(&self, trace_id: &str) -> Vec<Arc<Stack>> {
        self.stacks
            .read()
            .unwrap()
            .values()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect()
    }

    pub fn root_stack(&self) -> Option<Arc<Stack>> {
        self.stacks
            .read()
            .unwrap()
            .values()
            .find(|s| s.is_root())
            .cloned()
    }

    pub fn all_stacks(&self) -> Vec<Arc<Stack>> {
        self.stacks.read().unwrap().values().cloned().collect()
    }

    /// Snapshots of every stack, for trace reconstruction.
    pub fn stack_snapshots(&self) -> Vec<StackSnapshot> {
        self.stacks
            .read()
            .unwrap()
            .values()
            .map(|s| s.snapshot())
            .collect()
    }

    // --- Forking ---

    /// Detached context for a parallel branch. Carries a lineage
    /// snapshot of the current stack (never the live object) so the
    /// branch's first `enter_stack` hangs under this call tree without
    /// racing the parent. The fork shares the chat id and auth but has
    /// its own id and is not registered globally; interrupts address
    /// the root request context.
    pub fn fork(self: &Arc<Self>) -> Arc<Context> {
        let fork_parent = self.current_stack().map(|s| s.fork_parent());
        Arc::new(Self {
            id: format!("ctx-{}", Uuid::new_v4()),
            chat_id: self.chat_id.clone(),
            auth: self.auth.clone(),
            referer: Referer::AgentFork,
            cancel: self.cancel.child_token(),
            config: self.config.clone(),
            current: Mutex::new(None),
            stacks: RwLock::new(HashMap::new()),
            fork_parent,
            interrupt: Mutex::new(None),
            trace: self.trace.clone(),
            released: AtomicBool::new(false),
        })
    }

    // --- Lifecycle ---

    /// Unregister and tear down owned resources. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        remove(&self.id);

        if let Some(controller) = self.interrupt.lock().unwrap().take() {
            debug!(context_id = %self.id, "cleanup: interrupt controller");
            controller.stop();
        }

        let count = {
            let mut stacks = self.stacks.write().unwrap();
            let count = stacks.len();
            stacks.clear();
            count
        };
        if count > 0 {
            debug!(context_id = %self.id, stacks = count, "cleanup: stacks");
        }
        self.current.lock().unwrap().take();
    }

    // --- Traced tool-call surface ---

    /// Single traced tool invocation. One trace node per call when a
    /// sink is present and the current stack does not skip tracing.
    pub async fn call_tool(
        &self,
        client: &dyn ToolClient,
        endpoint: &str,
        operation: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let node = self.trace_node(
            serde_json::json!({
                "endpoint": endpoint,
                "operation": operation,
                "arguments": arguments.clone(),
            }),
            "tool",
            format!("Call tool '{operation}' on '{endpoint}'"),
        );

        match client
            .invoke(self.cancel_token(), endpoint, operation, arguments)
            .await
        {
            Ok(value) => {
                if let Some(node) = node {
                    node.complete(value.clone());
                }
                Ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                if let Some(node) = node {
                    node.fail(&message);
                }
                Err(ConductorError::Dispatch(message))
            }
        }
    }

    /// Fan out concurrently and wait for all requests to settle.
    pub async fn call_tool_all(
        &self,
        client: Arc<dyn ToolClient>,
        requests: Vec<ToolRequest>,
    ) -> Vec<ToolResult> {
        let node = self.fanout_node("all", &requests);
        let results = call_all(client, self.cancel_token(), requests).await;
        self.finish_fanout_node(node, &results);
        results
    }

    /// Fan out concurrently, first success wins.
    pub async fn call_tool_any(
        &self,
        client: Arc<dyn ToolClient>,
        requests: Vec<ToolRequest>,
    ) -> Vec<ToolResult> {
        let node = self.fanout_node("any", &requests);
        let results = call_any(client, self.cancel_token(), requests).await;
        self.finish_fanout_node(node, &results);
        results
    }

    /// Fan out concurrently, first finish wins.
    pub async fn call_tool_race(
        &self,
        client: Arc<dyn ToolClient>,
        requests: Vec<ToolRequest>,
    ) -> Vec<ToolResult> {
        let node = self.fanout_node("race", &requests);
        let results = call_race(client, self.cancel_token(), requests).await;
        self.finish_fanout_node(node, &results);
        results
    }

    fn skip_trace(&self) -> bool {
        self.current_stack()
            .and_then(|s| s.options.skip)
            .map(|skip| skip.trace)
            .unwrap_or(false)
    }

    fn trace_node(
        &self,
        input: serde_json::Value,
        kind: &str,
        label: String,
    ) -> Option<Box<dyn conductor_core::trace::TraceNode>> {
        if self.skip_trace() {
            return None;
        }
        let sink = self.trace.as_ref()?;
        Some(sink.add_node(
            input,
            TraceNodeOptions {
                kind: Some(kind.to_string()),
                label: Some(label),
                stack_id: self.current_stack().map(|s| s.id.clone()),
            },
        ))
    }

    fn fanout_node(
        &self,
        mode: &str,
        requests: &[ToolRequest],
    ) -> Option<Box<dyn conductor_core::trace::TraceNode>> {
        self.trace_node(
            serde_json::json!({
                "mode": mode,
                "count": requests.len(),
                "endpoints": requests.iter().map(|r| r.endpoint.as_str()).collect::<Vec<_>>(),
            }),
            "fanout",
            format!("Fan out {} tool calls ({mode})", requests.len()),
        )
    }

    fn finish_fanout_node(
        &self,
        node: Option<Box<dyn conductor_core::trace::TraceNode>>,
        results: &[ToolResult],
    ) {
        if let Some(node) = node {
            let failures = results.iter().filter(|r| !r.is_success()).count();
            node.complete(serde_json::json!({
                "results": results.len(),
                "failures": failures,
            }));
        }
    }
}

/// RAII completion for `enter_stack`. Dropping the guard completes the
/// stack when no terminal state was set and restores the prior current
/// stack (a no-op for root and forked entries).
pub struct StackGuard {
    context: Arc<Context>,
    stack: Arc<Stack>,
    prior: Option<Arc<Stack>>,
    armed: bool,
}

impl StackGuard {
    /// Mark the stack failed before the guard runs its restore logic.
    pub fn fail(mut self, error: impl Into<String>) {
        self.stack.fail(Some(error.into()));
        self.finish();
        self.armed = false;
    }

    fn finish(&mut self) {
        if !self.stack.is_completed() {
            self.stack.complete();
        }
        *self.context.current.lock().unwrap() = self.prior.take();
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if self.armed {
            self.finish();
        }
    }
}

// --- Process-wide registry ---

/// Register a context for out-of-band interrupt addressing.
pub fn register(context: &Arc<Context>) -> Result<()> {
    if context.id.is_empty() {
        return Err(ConductorError::Context("context id is empty".to_string()));
    }
    REGISTRY
        .write()
        .unwrap()
        .insert(context.id.clone(), context.clone());
    Ok(())
}

/// Look a registered context up by id.
pub fn get(context_id: &str) -> Result<Arc<Context>> {
    REGISTRY
        .read()
        .unwrap()
        .get(context_id)
        .cloned()
        .ok_or_else(|| ConductorError::ContextNotFound(context_id.to_string()))
}

/// Remove a context from the registry. Missing ids are a no-op.
pub fn remove(context_id: &str) {
    REGISTRY.write().unwrap().remove(context_id);
}

/// Route an interrupt signal to an in-flight context by id. The main
/// entry point for external interrupt requests.
pub async fn send_interrupt(context_id: &str, signal: InterruptSignal) -> Result<()> {
    let context = get(context_id)?;
    let Some(controller) = context.interrupt() else {
        return Err(ConductorError::Interrupt(format!(
            "interrupt controller not initialized for context: {context_id}"
        )));
    };
    controller.send_signal(signal).await
}
