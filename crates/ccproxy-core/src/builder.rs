//! Assembles the upstream envelope and header set for one attempt.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use ccproxy_protocol::claude::types::{ContentBlockParam, MessageParam, MessageRole};
use ccproxy_protocol::cloudcode::{ClientMetadata, GenerateContentEnvelope};
use ccproxy_protocol::gemini::GenerateContentRequest;

use crate::models::{ModelFamily, family_of, is_thinking};

const CLIENT_VERSION: &str = "1.15.8";
const X_GOOG_API_CLIENT: &str = "gl-node/22.11.0";
const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

pub fn user_agent() -> String {
    format!(
        "antigravity/{CLIENT_VERSION} {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Stable digest of the first user turn. Upstream keys its prompt cache on
/// this, so it must not change across retries of the same conversation.
pub fn session_id(messages: &[MessageParam]) -> String {
    let seed = messages
        .iter()
        .find(|message| message.role == MessageRole::User)
        .map(first_text)
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn first_text(message: &MessageParam) -> String {
    message
        .content
        .blocks()
        .iter()
        .filter_map(|block| match block {
            ContentBlockParam::Text { text } => Some(text.clone()),
            _ => None,
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// Fresh per attempt; upstream correlates retries by session, not request.
pub fn request_id() -> String {
    format!("agent-{}", Uuid::new_v4())
}

pub fn build_envelope(
    model: &str,
    project: &str,
    request: GenerateContentRequest,
) -> GenerateContentEnvelope {
    GenerateContentEnvelope {
        model: model.to_string(),
        project: project.to_string(),
        user_agent: user_agent(),
        request_type: "agent".to_string(),
        request_id: request_id(),
        request,
    }
}

pub fn build_headers(token: &str, model: &str, streaming: bool) -> Vec<(String, String)> {
    let metadata = serde_json::to_string(&ClientMetadata::default()).unwrap_or_default();
    let mut headers = vec![
        ("Authorization".to_string(), format!("Bearer {token}")),
        ("User-Agent".to_string(), user_agent()),
        ("X-Goog-Api-Client".to_string(), X_GOOG_API_CLIENT.to_string()),
        ("Client-Metadata".to_string(), metadata),
        ("Content-Type".to_string(), "application/json".to_string()),
    ];
    if streaming {
        headers.push(("Accept".to_string(), "text/event-stream".to_string()));
    } else {
        headers.push(("Accept".to_string(), "application/json".to_string()));
    }
    if family_of(model) == ModelFamily::Claude && is_thinking(model) {
        headers.push(("anthropic-beta".to_string(), INTERLEAVED_THINKING_BETA.to_string()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use ccproxy_protocol::claude::types::MessageContent;

    use super::*;

    fn message(role: MessageRole, text: &str) -> MessageParam {
        MessageParam {
            role,
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[test]
    fn session_id_stable_across_retries() {
        let messages = vec![
            message(MessageRole::User, "hello"),
            message(MessageRole::Assistant, "hi"),
            message(MessageRole::User, "more"),
        ];
        let first = session_id(&messages);
        assert_eq!(first, session_id(&messages));
        assert_eq!(first.len(), 64);
        // Appending turns keeps the conversation key; the seed is the first
        // user message only.
        let mut longer = messages.clone();
        longer.push(message(MessageRole::User, "and more"));
        assert_eq!(first, session_id(&longer));
        // A different opening user turn is a different conversation.
        let other = vec![message(MessageRole::User, "howdy")];
        assert_ne!(first, session_id(&other));
    }

    #[test]
    fn request_ids_are_fresh_per_attempt() {
        let a = request_id();
        let b = request_id();
        assert!(a.starts_with("agent-"));
        assert_ne!(a, b);
    }

    #[test]
    fn claude_thinking_models_get_beta_header() {
        let headers = build_headers("tok", "claude-sonnet-4-5-thinking", true);
        assert!(headers.iter().any(|(k, v)| {
            k == "anthropic-beta" && v == INTERLEAVED_THINKING_BETA
        }));
        assert!(headers.iter().any(|(k, v)| k == "Accept" && v == "text/event-stream"));

        let headers = build_headers("tok", "gemini-2.5-pro", false);
        assert!(!headers.iter().any(|(k, _)| k == "anthropic-beta"));
        assert!(headers.iter().any(|(k, v)| k == "Accept" && v == "application/json"));
    }

    #[test]
    fn envelope_carries_agent_request_type() {
        let envelope = build_envelope(
            "gemini-2.5-pro",
            "project-1",
            GenerateContentRequest {
                contents: Vec::new(),
                system_instruction: None,
                tools: None,
                generation_config: None,
                session_id: Some("abc".to_string()),
            },
        );
        assert_eq!(envelope.request_type, "agent");
        assert_eq!(envelope.project, "project-1");
        assert!(envelope.request_id.starts_with("agent-"));
        assert!(envelope.user_agent.starts_with("antigravity/"));
    }
}
