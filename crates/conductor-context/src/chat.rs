//! Conversation fingerprint resolver.
//!
//! Maps a trailing window of user-authored messages to a stable chat
//! id through the cache store. A single user message always allocates
//! a fresh id, so two unrelated single-turn requests that start with
//! identical text are never joined; with two or more user messages the
//! trailing window preceding the newest one is hashed and looked up,
//! and a hit means the request continues an existing conversation.
//! Assistant and tool messages never participate, so tool-call
//! branching does not break continuity.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use conductor_core::cache::CacheStore;
use conductor_core::config::RuntimeConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::types::{Message, MessageRole};

const FINGERPRINT_PREFIX: &str = "chat:fingerprint:";

pub fn gen_chat_id() -> String {
    format!("chat-{}", Uuid::new_v4())
}

/// Resolve the chat id for a message list: cache hit on the trailing
/// fingerprint means continuation, otherwise a fresh id. The resolved
/// id is re-cached under the full trailing window so the next request
/// (with one more user message) can find it.
pub fn resolve_chat_id(
    cache: &dyn CacheStore,
    config: &RuntimeConfig,
    messages: &[Message],
) -> Result<String> {
    if messages.is_empty() {
        return Err(ConductorError::Chat("messages are empty".to_string()));
    }

    let user_messages = user_messages(messages);
    if user_messages.is_empty() {
        return Err(ConductorError::Chat(
            "no user messages to fingerprint".to_string(),
        ));
    }

    let window = config.fingerprint_window();
    let count = user_messages.len();

    let chat_id = if count == 1 {
        // A lone message is never matched against the cache.
        gen_chat_id()
    } else {
        // Hash the window preceding the newest message: that window is
        // exactly what the previous request cached.
        let lookup_window = window.min(count - 1);
        let preceding = &user_messages[..count - 1];
        let key = fingerprint_key(&preceding[preceding.len() - lookup_window..]);
        match cache.get(&key) {
            Some(existing) => existing,
            None => gen_chat_id(),
        }
    };

    cache_chat_id(cache, config, messages, &chat_id)?;
    Ok(chat_id)
}

/// Store the chat id under the fingerprint of the trailing user-message
/// window, for the next request to resolve against.
pub fn cache_chat_id(
    cache: &dyn CacheStore,
    config: &RuntimeConfig,
    messages: &[Message],
    chat_id: &str,
) -> Result<()> {
    if messages.is_empty() {
        return Err(ConductorError::Chat("messages are empty".to_string()));
    }
    if chat_id.is_empty() {
        return Err(ConductorError::Chat("chat id is empty".to_string()));
    }

    let user_messages = user_messages(messages);
    if user_messages.is_empty() {
        return Err(ConductorError::Chat(
            "no user messages to fingerprint".to_string(),
        ));
    }

    let window = config.fingerprint_window().min(user_messages.len());
    let key = fingerprint_key(&user_messages[user_messages.len() - window..]);
    cache.set(&key, chat_id);
    Ok(())
}

fn user_messages(messages: &[Message]) -> Vec<&Message> {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .collect()
}

fn fingerprint_key(window: &[&Message]) -> String {
    let mut hasher = Sha256::new();
    for message in window {
        hasher.update(message.content_text().as_bytes());
        hasher.update([0u8]);
    }
    format!("{FINGERPRINT_PREFIX}{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::cache::MemoryCache;

    fn config() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[test]
    fn test_single_message_always_fresh_id() {
        let cache = MemoryCache::new();
        let messages = vec![Message::user("Hello")];

        let first = resolve_chat_id(&cache, &config(), &messages).unwrap();
        let second = resolve_chat_id(&cache, &config(), &messages).unwrap();

        assert!(!first.is_empty());
        assert_ne!(first, second);
    }

    #[test]
    fn test_continuation_reuses_chat_id() {
        let cache = MemoryCache::new();

        let first = resolve_chat_id(&cache, &config(), &[Message::user("First message")]).unwrap();

        let second = resolve_chat_id(
            &cache,
            &config(),
            &[
                Message::user("First message"),
                Message::user("Second message"),
            ],
        )
        .unwrap();

        assert_eq!(first, second);

        // And a third turn still continues the same conversation.
        let third = resolve_chat_id(
            &cache,
            &config(),
            &[
                Message::user("First message"),
                Message::user("Second message"),
                Message::user("Third message"),
            ],
        )
        .unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_assistant_and_tool_messages_do_not_break_continuity() {
        let cache = MemoryCache::new();

        let first = resolve_chat_id(&cache, &config(), &[Message::user("What is Rust?")]).unwrap();

        let second = resolve_chat_id(
            &cache,
            &config(),
            &[
                Message::user("What is Rust?"),
                Message::assistant("A systems language."),
                Message {
                    role: MessageRole::Tool,
                    content: Some(serde_json::json!("tool output")),
                    name: None,
                    tool_call_id: Some("call-1".into()),
                },
                Message::user("Tell me more"),
            ],
        )
        .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_unrelated_history_gets_new_id() {
        let cache = MemoryCache::new();

        let first = resolve_chat_id(&cache, &config(), &[Message::user("Topic A")]).unwrap();

        let other = resolve_chat_id(
            &cache,
            &config(),
            &[Message::user("Topic B"), Message::user("continued")],
        )
        .unwrap();

        assert_ne!(first, other);
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let cache = MemoryCache::new();

        assert!(resolve_chat_id(&cache, &config(), &[]).is_err());
        assert!(cache_chat_id(&cache, &config(), &[], "chat-1").is_err());
        assert!(cache_chat_id(&cache, &config(), &[Message::user("hi")], "").is_err());
        assert!(resolve_chat_id(&cache, &config(), &[Message::assistant("no user")]).is_err());
    }

    #[test]
    fn test_explicit_cache_chat_id() {
        let cache = MemoryCache::new();
        let messages = vec![Message::user("pinned")];

        cache_chat_id(&cache, &config(), &messages, "chat-pinned").unwrap();

        let resolved = resolve_chat_id(
            &cache,
            &config(),
            &[Message::user("pinned"), Message::user("next")],
        )
        .unwrap();
        assert_eq!(resolved, "chat-pinned");
    }
}
