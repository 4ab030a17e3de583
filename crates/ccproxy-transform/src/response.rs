//! Gemini → Claude one-shot response translation.

use serde_json::json;

use ccproxy_protocol::claude::{AssistantRole, Message, MessageKind};
use ccproxy_protocol::claude::types::{ContentBlock, StopReason, Usage};
use ccproxy_protocol::gemini::{FinishReason, GenerateContentResponse, UsageMetadata};

pub const SAFETY_NOTICE: &str = "[Response blocked by upstream safety filters]";

pub fn to_message(model: &str, response: &GenerateContentResponse) -> Message {
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut saw_tool_use = false;
    let mut finish_reason = None;

    if let Some(candidate) = response.candidates.first() {
        finish_reason = candidate.finish_reason;
        let parts = candidate
            .content
            .as_ref()
            .map(|c| c.parts.as_slice())
            .unwrap_or_default();
        for part in parts {
            if let Some(call) = &part.function_call {
                saw_tool_use = true;
                content.push(ContentBlock::ToolUse {
                    id: call.id.clone().unwrap_or_else(crate::new_tool_call_id),
                    name: call.name.clone(),
                    input: call.args.clone().unwrap_or_else(|| json!({})),
                });
                continue;
            }
            let Some(text) = &part.text else { continue };
            if text.is_empty() {
                continue;
            }
            if part.is_thought() {
                content.push(ContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: part.thought_signature.clone(),
                });
                continue;
            }
            // Contiguous plain text runs merge into one block.
            match content.last_mut() {
                Some(ContentBlock::Text { text: existing }) => existing.push_str(text),
                _ => content.push(ContentBlock::Text { text: text.clone() }),
            }
        }
    }

    let stop_reason = map_finish_reason(finish_reason, saw_tool_use);
    if matches!(stop_reason, Some(StopReason::StopSequence)) && content.is_empty() {
        content.push(ContentBlock::Text {
            text: SAFETY_NOTICE.to_string(),
        });
    }

    Message {
        id: response
            .response_id
            .clone()
            .unwrap_or_else(crate::new_message_id),
        kind: MessageKind::Message,
        role: AssistantRole::Assistant,
        model: model.to_string(),
        content,
        stop_reason,
        stop_sequence: None,
        usage: map_usage(response.usage_metadata.as_ref()),
    }
}

pub(crate) fn map_finish_reason(
    reason: Option<FinishReason>,
    saw_tool_use: bool,
) -> Option<StopReason> {
    if saw_tool_use {
        return Some(StopReason::ToolUse);
    }
    Some(match reason? {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::MaxTokens => StopReason::MaxTokens,
        FinishReason::Safety
        | FinishReason::Recitation
        | FinishReason::Blocklist
        | FinishReason::ProhibitedContent
        | FinishReason::Spii => StopReason::StopSequence,
        FinishReason::MalformedFunctionCall | FinishReason::Other => StopReason::EndTurn,
    })
}

pub(crate) fn map_usage(usage: Option<&UsageMetadata>) -> Usage {
    Usage {
        input_tokens: usage.and_then(|u| u.prompt_token_count).unwrap_or(0),
        output_tokens: usage.and_then(|u| u.candidates_token_count).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use ccproxy_protocol::gemini::{Candidate, Content, FunctionCall, Part};

    use super::*;

    fn response(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: Some(12),
                candidates_token_count: Some(7),
                thoughts_token_count: None,
                total_token_count: Some(19),
            }),
            model_version: None,
            response_id: Some("resp-1".to_string()),
        }
    }

    #[test]
    fn merges_contiguous_text_runs() {
        let message = to_message(
            "gemini-2.5-pro",
            &response(
                vec![
                    Part::text("hello "),
                    Part::text("world"),
                    Part::thought("hmm", Some("sig".to_string())),
                    Part::text("bye"),
                ],
                Some(FinishReason::Stop),
            ),
        );
        assert_eq!(message.content.len(), 3);
        assert_eq!(
            message.content[0],
            ContentBlock::Text {
                text: "hello world".to_string()
            }
        );
        assert!(matches!(message.content[1], ContentBlock::Thinking { .. }));
        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(message.usage.input_tokens, 12);
        assert_eq!(message.usage.output_tokens, 7);
    }

    #[test]
    fn function_call_becomes_tool_use_with_synthesized_id() {
        let message = to_message(
            "gemini-2.5-pro",
            &response(
                vec![Part::function_call(FunctionCall {
                    id: None,
                    name: "search".to_string(),
                    args: Some(serde_json::json!({"q": 1})),
                })],
                Some(FinishReason::Stop),
            ),
        );
        match &message.content[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert!(id.starts_with("call_"));
                assert_eq!(name, "search");
                assert_eq!(input["q"], 1);
            }
            other => panic!("unexpected block: {other:?}"),
        }
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn safety_block_synthesizes_notice() {
        let message = to_message("gemini-2.5-pro", &response(vec![], Some(FinishReason::Safety)));
        assert_eq!(message.stop_reason, Some(StopReason::StopSequence));
        assert_eq!(
            message.content,
            vec![ContentBlock::Text {
                text: SAFETY_NOTICE.to_string()
            }]
        );
    }

    #[test]
    fn max_tokens_maps_through() {
        let message = to_message(
            "gemini-2.5-pro",
            &response(vec![Part::text("trunc")], Some(FinishReason::MaxTokens)),
        );
        assert_eq!(message.stop_reason, Some(StopReason::MaxTokens));
    }
}
