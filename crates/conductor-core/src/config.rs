//! Runtime tuning knobs for the execution core.

use serde::{Deserialize, Serialize};

/// Runtime configuration for interrupt handling and chat continuation.
///
/// All fields are optional; accessors fall back to the built-in defaults
/// so an empty `{}` config is fully usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of the per-request interrupt signal queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_queue_capacity: Option<usize>,

    /// How long `send_signal` waits for a slot when the queue is full,
    /// in milliseconds, before reporting back-pressure to the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_send_timeout_ms: Option<u64>,

    /// Trailing window of user messages hashed for chat continuation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint_window: Option<usize>,
}

impl RuntimeConfig {
    pub fn interrupt_queue_capacity(&self) -> usize {
        self.interrupt_queue_capacity.unwrap_or(10)
    }

    pub fn interrupt_send_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interrupt_send_timeout_ms.unwrap_or(500))
    }

    pub fn fingerprint_window(&self) -> usize {
        self.fingerprint_window.unwrap_or(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.interrupt_queue_capacity(), 10);
        assert_eq!(config.interrupt_send_timeout().as_millis(), 500);
        assert_eq!(config.fingerprint_window(), 2);
    }

    #[test]
    fn test_overrides_from_json() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"interrupt_queue_capacity": 4, "fingerprint_window": 3}"#)
                .unwrap();
        assert_eq!(config.interrupt_queue_capacity(), 4);
        assert_eq!(config.fingerprint_window(), 3);
        // Untouched field keeps its default.
        assert_eq!(config.interrupt_send_timeout().as_millis(), 500);
    }
}
