//! All / Any / Race aggregation over concurrent tool calls.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ToolClient, ToolRequest, ToolResult};

/// Run all requests concurrently and wait for every one to settle.
/// Results come back in input order regardless of completion order.
pub async fn call_all(
    client: Arc<dyn ToolClient>,
    cancel: CancellationToken,
    requests: Vec<ToolRequest>,
) -> Vec<ToolResult> {
    let total = requests.len();
    if total == 0 {
        return Vec::new();
    }

    let mut rx = spawn_branches(client, cancel, requests);

    let mut indexed = Vec::with_capacity(total);
    while let Some(entry) = rx.recv().await {
        indexed.push(entry);
    }
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, result)| result).collect()
}

/// Run all requests concurrently and return as soon as one succeeds,
/// as a single-element list. If every branch fails, waits for all of
/// them and returns every failure in completion order.
pub async fn call_any(
    client: Arc<dyn ToolClient>,
    cancel: CancellationToken,
    requests: Vec<ToolRequest>,
) -> Vec<ToolResult> {
    let total = requests.len();
    if total == 0 {
        return Vec::new();
    }

    let mut rx = spawn_branches(client, cancel, requests);

    let mut failures = Vec::with_capacity(total);
    while let Some((_, result)) = rx.recv().await {
        if result.is_success() {
            drain_remaining(rx);
            return vec![result];
        }
        failures.push(result);
    }
    failures
}

/// Run all requests concurrently and return the very first settled
/// result, success or failure.
pub async fn call_race(
    client: Arc<dyn ToolClient>,
    cancel: CancellationToken,
    requests: Vec<ToolRequest>,
) -> Vec<ToolResult> {
    if requests.is_empty() {
        return Vec::new();
    }

    let mut rx = spawn_branches(client, cancel, requests);

    // The channel cannot close before at least one branch reports.
    match rx.recv().await {
        Some((_, first)) => {
            drain_remaining(rx);
            vec![first]
        }
        None => Vec::new(),
    }
}

/// Spawn one task per request. The channel is sized to the request
/// count so no branch ever blocks on send, even after the caller has
/// returned and only the drain task is still reading.
fn spawn_branches(
    client: Arc<dyn ToolClient>,
    cancel: CancellationToken,
    requests: Vec<ToolRequest>,
) -> mpsc::Receiver<(usize, ToolResult)> {
    let (tx, rx) = mpsc::channel(requests.len());

    for (index, request) in requests.into_iter().enumerate() {
        let client = client.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let result = run_branch(client.as_ref(), cancel, &request).await;
            let _ = tx.send((index, result)).await;
        });
    }

    rx
}

/// Execute one branch, converting executor errors and panics into a
/// per-branch error result.
async fn run_branch(
    client: &dyn ToolClient,
    cancel: CancellationToken,
    request: &ToolRequest,
) -> ToolResult {
    let outcome = std::panic::AssertUnwindSafe(client.invoke(
        cancel,
        &request.endpoint,
        &request.operation,
        request.arguments.clone(),
    ))
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(value)) => ToolResult::ok(request, value),
        Ok(Err(err)) => ToolResult::err(request, err.to_string()),
        Err(panic) => {
            let message = panic_message(panic);
            debug!(
                endpoint = %request.endpoint,
                operation = %request.operation,
                "fan-out branch panicked: {message}"
            );
            ToolResult::err(request, format!("branch panicked: {message}"))
        }
    }
}

/// Consume the losers of an Any/Race in the background so their tasks
/// finish cleanly. Bounded work: at most the remaining branch count.
fn drain_remaining(mut rx: mpsc::Receiver<(usize, ToolResult)>) {
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    /// Executor whose behavior is driven by the operation name:
    /// `ok:<ms>` succeeds after a delay, `fail:<ms>` errors after a
    /// delay, `panic` panics.
    struct ScriptedClient;

    #[async_trait]
    impl ToolClient for ScriptedClient {
        async fn invoke(
            &self,
            cancel: CancellationToken,
            endpoint: &str,
            operation: &str,
            _arguments: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            if operation == "panic" {
                panic!("scripted panic");
            }
            let (verb, ms) = operation.split_once(':').unwrap_or((operation, "0"));
            let delay = Duration::from_millis(ms.parse().unwrap_or(0));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            }
            match verb {
                "ok" => Ok(serde_json::json!({"endpoint": endpoint})),
                _ => anyhow::bail!("scripted failure from {endpoint}"),
            }
        }
    }

    fn requests(entries: &[(&str, &str)]) -> Vec<ToolRequest> {
        entries
            .iter()
            .map(|(endpoint, op)| ToolRequest::new(*endpoint, *op, serde_json::Value::Null))
            .collect()
    }

    #[tokio::test]
    async fn test_all_preserves_input_order() {
        let results = call_all(
            Arc::new(ScriptedClient),
            CancellationToken::new(),
            requests(&[("a", "ok:30"), ("b", "ok:0"), ("c", "fail:10")]),
        )
        .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].endpoint, "a");
        assert_eq!(results[1].endpoint, "b");
        assert_eq!(results[2].endpoint, "c");
        assert!(results[0].is_success());
        assert!(!results[2].is_success());
    }

    #[tokio::test]
    async fn test_all_empty_input() {
        let results = call_all(
            Arc::new(ScriptedClient),
            CancellationToken::new(),
            Vec::new(),
        )
        .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_all_recovers_branch_panic() {
        let results = call_all(
            Arc::new(ScriptedClient),
            CancellationToken::new(),
            requests(&[("a", "ok:0"), ("b", "panic")]),
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_success());
        let error = results[1].error.as_deref().unwrap();
        assert!(error.contains("panicked"), "got: {error}");
    }

    #[tokio::test]
    async fn test_any_returns_first_success() {
        let results = call_any(
            Arc::new(ScriptedClient),
            CancellationToken::new(),
            requests(&[("slow", "ok:200"), ("fast", "ok:5"), ("bad", "fail:0")]),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].endpoint, "fast");
        assert!(results[0].is_success());
    }

    #[tokio::test]
    async fn test_any_all_failures() {
        let results = call_any(
            Arc::new(ScriptedClient),
            CancellationToken::new(),
            requests(&[("a", "fail:10"), ("b", "fail:0"), ("c", "fail:5")]),
        )
        .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.is_success()));
        // Completion order, not input order.
        assert_eq!(results[0].endpoint, "b");
    }

    #[tokio::test]
    async fn test_race_returns_first_finish_even_failure() {
        let results = call_race(
            Arc::new(ScriptedClient),
            CancellationToken::new(),
            requests(&[("slow", "ok:200"), ("fast-fail", "fail:0")]),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].endpoint, "fast-fail");
        assert!(!results[0].is_success());
    }

    #[tokio::test]
    async fn test_race_empty_input() {
        let results = call_race(
            Arc::new(ScriptedClient),
            CancellationToken::new(),
            Vec::new(),
        )
        .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_reaches_branches() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = call_all(
            Arc::new(ScriptedClient),
            cancel,
            requests(&[("a", "ok:5000")]),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error.as_deref(), Some("cancelled"));
    }
}
