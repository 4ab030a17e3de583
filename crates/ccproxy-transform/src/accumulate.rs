//! Aggregates a canonical event stream back into a complete message, for the
//! one-shot entry point when the upstream call had to run over SSE.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use ccproxy_protocol::claude::stream::{
    ContentBlockDelta, StreamContentBlock, StreamEvent,
};
use ccproxy_protocol::claude::types::{ContentBlock, StopReason, Usage};
use ccproxy_protocol::claude::{AssistantRole, Message, MessageKind};

#[derive(Debug, Default)]
pub struct MessageAccumulator {
    id: Option<String>,
    model: Option<String>,
    open_blocks: BTreeMap<u32, StreamContentBlock>,
    pending_json: BTreeMap<u32, String>,
    closed_blocks: BTreeMap<u32, ContentBlock>,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    usage: Usage,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = Some(message.id.clone());
                self.model = Some(message.model.clone());
                if let Some(input) = message.usage.input_tokens {
                    self.usage.input_tokens = input;
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.open_blocks.insert(*index, content_block.clone());
            }
            StreamEvent::ContentBlockDelta { index, delta } => self.push_delta(*index, delta),
            StreamEvent::ContentBlockStop { index } => self.close_block(*index),
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence = delta.stop_sequence.clone();
                }
                if let Some(input) = usage.input_tokens {
                    self.usage.input_tokens = input;
                }
                if let Some(output) = usage.output_tokens {
                    self.usage.output_tokens = output;
                }
            }
            StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => {}
        }
    }

    pub fn finalize(mut self, fallback_model: &str) -> Message {
        // Blocks never explicitly stopped still count.
        let indices: Vec<u32> = self.open_blocks.keys().copied().collect();
        for index in indices {
            self.close_block(index);
        }
        Message {
            id: self.id.unwrap_or_else(crate::new_message_id),
            kind: MessageKind::Message,
            role: AssistantRole::Assistant,
            model: self.model.unwrap_or_else(|| fallback_model.to_string()),
            content: self.closed_blocks.into_values().collect(),
            stop_reason: self.stop_reason,
            stop_sequence: self.stop_sequence,
            usage: self.usage,
        }
    }

    fn push_delta(&mut self, index: u32, delta: &ContentBlockDelta) {
        match delta {
            ContentBlockDelta::TextDelta { text } => {
                if let Some(StreamContentBlock::Text { text: existing }) =
                    self.open_blocks.get_mut(&index)
                {
                    existing.push_str(text);
                }
            }
            ContentBlockDelta::ThinkingDelta { thinking } => {
                if let Some(StreamContentBlock::Thinking {
                    thinking: existing, ..
                }) = self.open_blocks.get_mut(&index)
                {
                    existing.push_str(thinking);
                }
            }
            ContentBlockDelta::SignatureDelta { signature } => {
                if let Some(StreamContentBlock::Thinking {
                    signature: existing,
                    ..
                }) = self.open_blocks.get_mut(&index)
                {
                    *existing = Some(signature.clone());
                }
            }
            ContentBlockDelta::InputJsonDelta { partial_json } => {
                self.pending_json
                    .entry(index)
                    .and_modify(|value| value.push_str(partial_json))
                    .or_insert_with(|| partial_json.clone());
            }
        }
    }

    fn close_block(&mut self, index: u32) {
        let Some(block) = self.open_blocks.remove(&index) else {
            return;
        };
        let closed = match block {
            StreamContentBlock::Text { text } => ContentBlock::Text { text },
            StreamContentBlock::Thinking {
                thinking,
                signature,
            } => ContentBlock::Thinking {
                thinking,
                signature,
            },
            StreamContentBlock::ToolUse { id, name, input } => {
                let input = match self.pending_json.remove(&index) {
                    Some(raw) => serde_json::from_str::<JsonValue>(&raw).unwrap_or(input),
                    None => input,
                };
                ContentBlock::ToolUse { id, name, input }
            }
        };
        self.closed_blocks.insert(index, closed);
    }
}

#[cfg(test)]
mod tests {
    use ccproxy_protocol::gemini::{
        Candidate, Content, FinishReason, FunctionCall, GenerateContentResponse, Part,
        UsageMetadata,
    };

    use crate::stream::StreamAdapter;

    use super::*;

    #[test]
    fn accumulates_adapter_output() {
        let mut adapter = StreamAdapter::new("claude-sonnet-4-5-thinking");
        let mut accumulator = MessageAccumulator::new();

        let fragments = vec![
            GenerateContentResponse {
                candidates: vec![Candidate {
                    content: Some(Content::model(vec![
                        Part::thought("weighing options", Some("sig-1".to_string())),
                        Part::text("the answer "),
                    ])),
                    finish_reason: None,
                    index: Some(0),
                }],
                usage_metadata: None,
                model_version: None,
                response_id: Some("resp-7".to_string()),
            },
            GenerateContentResponse {
                candidates: vec![Candidate {
                    content: Some(Content::model(vec![
                        Part::text("is 42"),
                        Part::function_call(FunctionCall {
                            id: Some("call_9".to_string()),
                            name: "submit".to_string(),
                            args: Some(serde_json::json!({"value": 42})),
                        }),
                    ])),
                    finish_reason: Some(FinishReason::Stop),
                    index: Some(0),
                }],
                usage_metadata: Some(UsageMetadata {
                    prompt_token_count: Some(20),
                    candidates_token_count: Some(11),
                    thoughts_token_count: Some(4),
                    total_token_count: Some(31),
                }),
                model_version: None,
                response_id: None,
            },
        ];

        for fragment in &fragments {
            for event in adapter.on_response(fragment) {
                accumulator.push_event(&event);
            }
        }
        for event in adapter.finish() {
            accumulator.push_event(&event);
        }

        let message = accumulator.finalize("claude-sonnet-4-5-thinking");
        assert_eq!(message.id, "resp-7");
        assert_eq!(message.content.len(), 3);
        assert_eq!(
            message.content[0],
            ContentBlock::Thinking {
                thinking: "weighing options".to_string(),
                signature: Some("sig-1".to_string()),
            }
        );
        assert_eq!(
            message.content[1],
            ContentBlock::Text {
                text: "the answer is 42".to_string()
            }
        );
        assert_eq!(
            message.content[2],
            ContentBlock::ToolUse {
                id: "call_9".to_string(),
                name: "submit".to_string(),
                input: serde_json::json!({"value": 42}),
            }
        );
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(message.usage.input_tokens, 20);
        assert_eq!(message.usage.output_tokens, 11);
    }
}
