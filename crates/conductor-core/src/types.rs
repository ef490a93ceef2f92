use serde::{Deserialize, Serialize};

/// Role of a message author, OpenAI-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Developer,
    System,
    User,
    Assistant,
    Tool,
}

/// A conversation message.
///
/// `content` is kept opaque (string or multimodal parts) since the core
/// never inspects it beyond hashing user text for chat continuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(serde_json::Value::String(text.into())),
            name: None,
            tool_call_id: None,
        }
    }

    /// Plain-text assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(serde_json::Value::String(text.into())),
            name: None,
            tool_call_id: None,
        }
    }

    /// Content rendered as text, for fingerprinting. Non-string content
    /// falls back to its JSON encoding.
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }
}

/// Who initiated a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Referer {
    /// Top-level HTTP API request.
    #[default]
    Api,
    /// In-process procedure call.
    Process,
    /// Inbound protocol-server request.
    Mcp,
    /// Embedded script SDK.
    Jssdk,
    /// Agent-to-agent delegate call (same conversation).
    Agent,
    /// Agent-to-agent fork call (parallel branch, detached lineage).
    AgentFork,
    /// Tool or function execution.
    Tool,
    /// Hook trigger (on_message, on_error, ...).
    Hook,
    /// Scheduled task.
    Schedule,
    /// Custom script execution.
    Script,
    /// Internal system call.
    Internal,
}

impl Referer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Referer::Api => "api",
            Referer::Process => "process",
            Referer::Mcp => "mcp",
            Referer::Jssdk => "jssdk",
            Referer::Agent => "agent",
            Referer::AgentFork => "agent_fork",
            Referer::Tool => "tool",
            Referer::Hook => "hook",
            Referer::Schedule => "schedule",
            Referer::Script => "script",
            Referer::Internal => "internal",
        }
    }
}

/// Lifecycle state of a call-tree node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    /// Materialized but not executing yet.
    Pending,
    #[default]
    Running,
    Completed,
    Failed,
    Timeout,
}

impl StackStatus {
    /// Terminal states are set exactly once and never overwritten.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StackStatus::Completed | StackStatus::Failed | StackStatus::Timeout
        )
    }
}

/// Two-tier interruption model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
    /// Finish the current step, then incorporate the new messages.
    Graceful,
    /// Cancel in-flight work immediately; messages (possibly empty)
    /// carry over to the next execution cycle.
    Force,
}

/// An interrupt signal sent into a running request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptSignal {
    #[serde(rename = "type")]
    pub kind: InterruptType,

    /// New messages from the interrupting caller, in send order.
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Unix timestamp in milliseconds.
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl InterruptSignal {
    pub fn new(kind: InterruptType, messages: Vec<Message>) -> Self {
        Self {
            kind,
            messages,
            timestamp: chrono::Utc::now().timestamp_millis(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn graceful(messages: Vec<Message>) -> Self {
        Self::new(InterruptType::Graceful, messages)
    }

    pub fn force(messages: Vec<Message>) -> Self {
        Self::new(InterruptType::Force, messages)
    }
}

/// Authorization principal attached to a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// What to skip for a given unit of work.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Skip {
    /// Skip persisting chat history (internal calls like title generation).
    #[serde(default)]
    pub history: bool,

    /// Skip trace logging.
    #[serde(default)]
    pub trace: bool,

    /// Skip streaming output to the client.
    #[serde(default)]
    pub output: bool,
}

/// Per-call options carried on a call-tree node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<Skip>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CallOptions {
    /// Options for a parallel fork branch: the branch produces response
    /// data only, so its messages stay out of the chat history.
    pub fn for_fork(mut self) -> Self {
        let skip = self.skip.get_or_insert_with(Skip::default);
        skip.history = true;
        self
    }
}
