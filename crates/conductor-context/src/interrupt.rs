//! Interrupt controller.
//!
//! One controller per request context. Callers push [`InterruptSignal`]s
//! into a bounded queue; a background listener drains them in arrival
//! order. A graceful signal is handed to the handler and parked in the
//! pending list for cooperative pickup. A force signal additionally
//! cancels the controller's current cancellation token and swaps in a
//! fresh one, so in-flight work aborts while the next execution cycle
//! starts with a clean scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conductor_core::config::RuntimeConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::types::{InterruptSignal, InterruptType};

/// Callback invoked by the listener for every signal, before the signal
/// is parked in the pending list. Errors are logged and never stop the
/// listener.
pub type InterruptHandler =
    Arc<dyn Fn(&InterruptSignal) -> anyhow::Result<()> + Send + Sync + 'static>;

struct ControllerState {
    /// Signals already processed by the listener, in arrival order,
    /// awaiting cooperative pickup via check/peek/merge.
    pending: Vec<InterruptSignal>,
    /// Current cancellable scope; replaced on every force interrupt.
    cancel: CancellationToken,
    handler: Option<InterruptHandler>,
}

pub struct InterruptController {
    tx: mpsc::Sender<InterruptSignal>,
    /// Taken by the listener on `start`.
    rx: Mutex<Option<mpsc::Receiver<InterruptSignal>>>,
    state: Mutex<ControllerState>,
    listener_started: AtomicBool,
    /// Stops the listener task on release.
    shutdown: CancellationToken,
    send_timeout: std::time::Duration,
}

impl InterruptController {
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.interrupt_queue_capacity());
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            state: Mutex::new(ControllerState {
                pending: Vec::new(),
                cancel: CancellationToken::new(),
                handler: None,
            }),
            listener_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            send_timeout: config.interrupt_send_timeout(),
        })
    }

    /// Spawn the background listener. Idempotent; only the first call
    /// starts a task.
    pub fn start(self: &Arc<Self>, context_id: &str) {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.rx.lock().unwrap().take() else {
            return;
        };

        let controller = self.clone();
        let context_id = context_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = controller.shutdown.cancelled() => break,
                    signal = rx.recv() => {
                        let Some(signal) = signal else { break };
                        controller.handle_signal(&context_id, signal);
                    }
                }
            }
            debug!(context_id = %context_id, "interrupt listener stopped");
        });
    }

    /// Enqueue a signal. Waits up to the configured send timeout when
    /// the queue is full; a timeout is back-pressure surfaced to the
    /// caller, not a crash.
    pub async fn send_signal(&self, signal: InterruptSignal) -> Result<()> {
        self.tx
            .send_timeout(signal, self.send_timeout)
            .await
            .map_err(|_| {
                ConductorError::Interrupt("signal queue is full, send timed out".to_string())
            })
    }

    fn handle_signal(&self, context_id: &str, signal: InterruptSignal) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            if signal.kind == InterruptType::Force {
                // Cancel the live scope and atomically swap in a fresh
                // one; readers of cancel_token() see old or new, never
                // a torn reference.
                state.cancel.cancel();
                state.cancel = CancellationToken::new();
                debug!(context_id = %context_id, "force interrupt: cancelled current scope");
            }
            state.handler.clone()
        };

        if let Some(handler) = handler {
            if let Err(err) = handler(&signal) {
                warn!(context_id = %context_id, "interrupt handler failed: {err:#}");
            }
        }

        self.state.lock().unwrap().pending.push(signal);
    }

    pub fn set_handler(&self, handler: InterruptHandler) {
        self.state.lock().unwrap().handler = Some(handler);
    }

    /// Most recently queued pending signal, left in place.
    pub fn peek(&self) -> Option<InterruptSignal> {
        self.state.lock().unwrap().pending.last().cloned()
    }

    /// Remove and return the most recent pending signal.
    pub fn check(&self) -> Option<InterruptSignal> {
        self.state.lock().unwrap().pending.pop()
    }

    /// Drain all pending signals. Two or more are merged into a single
    /// signal whose messages concatenate in arrival order, marked with
    /// `merged=true` and `merged_count=N`. A single signal comes back
    /// unmodified. Force outranks graceful when kinds are mixed.
    pub fn check_with_merge(&self) -> Option<InterruptSignal> {
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending);
        match pending.len() {
            0 => None,
            1 => pending.into_iter().next(),
            count => {
                let kind = if pending.iter().any(|s| s.kind == InterruptType::Force) {
                    InterruptType::Force
                } else {
                    InterruptType::Graceful
                };
                let timestamp = pending.last().map(|s| s.timestamp).unwrap_or_default();
                let messages = pending.into_iter().flat_map(|s| s.messages).collect();

                let mut metadata = serde_json::Map::new();
                metadata.insert("merged".into(), serde_json::Value::Bool(true));
                metadata.insert("merged_count".into(), serde_json::Value::from(count));

                Some(InterruptSignal {
                    kind,
                    messages,
                    timestamp,
                    metadata,
                })
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().pending.clear();
    }

    /// Current cancellable scope. Pass this into cancellable operations
    /// so a force interrupt aborts in-flight work promptly.
    pub fn cancel_token(&self) -> CancellationToken {
        self.state.lock().unwrap().cancel.clone()
    }

    /// True iff the current scope is already cancelled. A force
    /// interrupt replaces the scope as part of handling, so this reads
    /// false right after one; callers tracking "was my work aborted"
    /// hold the token they obtained before starting that work.
    pub fn is_interrupted(&self) -> bool {
        self.state.lock().unwrap().cancel.is_cancelled()
    }

    /// Stop the listener and cancel the current scope. Called on
    /// context release.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.state.lock().unwrap().cancel.cancel();
    }
}
