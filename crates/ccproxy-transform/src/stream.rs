//! Streaming adapter: Gemini response fragments → canonical stream events.
//!
//! A state machine over the currently open content block. Every opened block
//! is stopped before `message_stop`, indices are monotone from zero, and the
//! whole message is never buffered; fragments are translated as they arrive.

use serde_json::json;

use ccproxy_protocol::claude::stream::{
    ContentBlockDelta, MessageDelta, StreamContentBlock, StreamEvent, StreamMessage, StreamUsage,
};
use ccproxy_protocol::claude::ErrorDetail;
use ccproxy_protocol::gemini::{FinishReason, GenerateContentResponse, Part, UsageMetadata};

use crate::response::map_finish_reason;

#[derive(Debug)]
enum Open {
    Idle,
    Text {
        index: u32,
    },
    Thinking {
        index: u32,
        buffer: String,
        signature: Option<String>,
    },
}

#[derive(Debug)]
pub struct StreamAdapter {
    model: String,
    message_id: String,
    started: bool,
    finished: bool,
    next_index: u32,
    open: Open,
    finish_reason: Option<FinishReason>,
    usage: Option<UsageMetadata>,
    saw_payload: bool,
    saw_tool_use: bool,
    captured_signatures: Vec<(String, String)>,
}

impl StreamAdapter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: crate::new_message_id(),
            started: false,
            finished: false,
            next_index: 0,
            open: Open::Idle,
            finish_reason: None,
            usage: None,
            saw_payload: false,
            saw_tool_use: false,
            captured_signatures: Vec::new(),
        }
    }

    /// Feed one upstream fragment; returns the canonical events it produces.
    pub fn on_response(&mut self, response: &GenerateContentResponse) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if let Some(id) = &response.response_id {
            self.message_id = id.clone();
        }
        if response.usage_metadata.is_some() {
            self.usage = response.usage_metadata;
        }

        let mut events = Vec::new();
        if let Some(candidate) = response.candidates.first() {
            let parts = candidate
                .content
                .as_ref()
                .map(|c| c.parts.as_slice())
                .unwrap_or_default();
            for part in parts {
                events.extend(self.handle_part(part));
            }
            if let Some(reason) = candidate.finish_reason {
                self.finish_reason = Some(reason);
                events.extend(self.emit_tail());
            }
        }
        events
    }

    /// End of stream: close anything still open and emit the message tail.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished || !self.started {
            return Vec::new();
        }
        self.emit_tail()
    }

    /// Terminal error: close open blocks, then exactly one error event.
    pub fn abort(&mut self, kind: &str, message: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut events = self.close_open_block();
        events.push(StreamEvent::Error {
            error: ErrorDetail {
                kind: kind.to_string(),
                message: message.to_string(),
            },
        });
        events
    }

    /// True once the message tail (or a terminal error) has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True when the stream carried no text, no calls, and zero output
    /// tokens.
    pub fn is_empty_response(&self) -> bool {
        let output_tokens = self
            .usage
            .and_then(|u| u.candidates_token_count)
            .unwrap_or(0);
        !self.saw_payload && output_tokens == 0
    }

    /// Signatures observed on closed thinking blocks, for the replay cache.
    pub fn take_captured_signatures(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.captured_signatures)
    }

    /// `message_start` is deferred until the first payload-bearing part so an
    /// entirely empty stream can be retried without having emitted anything.
    fn ensure_started(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        let input_tokens = self.usage.and_then(|u| u.prompt_token_count);
        vec![StreamEvent::MessageStart {
            message: StreamMessage {
                id: self.message_id.clone(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: StreamUsage {
                    input_tokens,
                    output_tokens: None,
                },
            },
        }]
    }

    fn handle_part(&mut self, part: &Part) -> Vec<StreamEvent> {
        if let Some(call) = &part.function_call {
            self.saw_payload = true;
            self.saw_tool_use = true;
            let mut events = self.ensure_started();
            events.extend(self.close_open_block());
            let index = self.next_index;
            self.next_index += 1;
            let args = call.args.clone().unwrap_or_else(|| json!({}));
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: StreamContentBlock::ToolUse {
                    id: call.id.clone().unwrap_or_else(crate::new_tool_call_id),
                    name: call.name.clone(),
                    input: json!({}),
                },
            });
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentBlockDelta::InputJsonDelta {
                    partial_json: args.to_string(),
                },
            });
            events.push(StreamEvent::ContentBlockStop { index });
            return events;
        }

        let Some(text) = &part.text else {
            // Unknown part kind: tolerated, never fails the stream.
            return Vec::new();
        };
        if text.is_empty() && part.thought_signature.is_none() {
            return Vec::new();
        }

        if part.is_thought() {
            self.saw_payload = self.saw_payload || !text.is_empty();
            let mut events = self.ensure_started();
            if !matches!(self.open, Open::Thinking { .. }) {
                events.extend(self.close_open_block());
                let index = self.next_index;
                self.next_index += 1;
                self.open = Open::Thinking {
                    index,
                    buffer: String::new(),
                    signature: None,
                };
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: StreamContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                });
            }
            if let Open::Thinking {
                index,
                buffer,
                signature,
            } = &mut self.open
            {
                buffer.push_str(text);
                if part.thought_signature.is_some() {
                    *signature = part.thought_signature.clone();
                }
                if !text.is_empty() {
                    events.push(StreamEvent::ContentBlockDelta {
                        index: *index,
                        delta: ContentBlockDelta::ThinkingDelta {
                            thinking: text.clone(),
                        },
                    });
                }
            }
            return events;
        }

        self.saw_payload = true;
        let mut events = self.ensure_started();
        if !matches!(self.open, Open::Text { .. }) {
            events.extend(self.close_open_block());
            let index = self.next_index;
            self.next_index += 1;
            self.open = Open::Text { index };
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: StreamContentBlock::Text {
                    text: String::new(),
                },
            });
        }
        if let Open::Text { index } = self.open {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentBlockDelta::TextDelta { text: text.clone() },
            });
        }
        events
    }

    fn close_open_block(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match std::mem::replace(&mut self.open, Open::Idle) {
            Open::Idle => {}
            Open::Text { index } => {
                events.push(StreamEvent::ContentBlockStop { index });
            }
            Open::Thinking {
                index,
                buffer,
                signature,
            } => {
                if let Some(signature) = signature {
                    self.captured_signatures.push((buffer, signature.clone()));
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentBlockDelta::SignatureDelta { signature },
                    });
                }
                events.push(StreamEvent::ContentBlockStop { index });
            }
        }
        events
    }

    fn emit_tail(&mut self) -> Vec<StreamEvent> {
        self.finished = true;
        if !self.started && self.is_empty_response() {
            return Vec::new();
        }
        let mut events = self.ensure_started();
        events.extend(self.close_open_block());
        let stop_reason = map_finish_reason(
            Some(self.finish_reason.unwrap_or(FinishReason::Stop)),
            self.saw_tool_use,
        );
        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason,
                stop_sequence: None,
            },
            usage: StreamUsage {
                input_tokens: self.usage.and_then(|u| u.prompt_token_count),
                output_tokens: Some(
                    self.usage
                        .and_then(|u| u.candidates_token_count)
                        .unwrap_or(0),
                ),
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

#[cfg(test)]
mod tests {
    use ccproxy_protocol::claude::types::StopReason;
    use ccproxy_protocol::gemini::{Candidate, Content, FunctionCall};

    use super::*;

    fn fragment(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: finish.map(|_| UsageMetadata {
                prompt_token_count: Some(10),
                candidates_token_count: Some(5),
                thoughts_token_count: None,
                total_token_count: Some(15),
            }),
            model_version: None,
            response_id: None,
        }
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::name).collect()
    }

    #[test]
    fn text_thinking_tool_sequence() {
        let mut adapter = StreamAdapter::new("claude-sonnet-4-5-thinking");
        let mut events = Vec::new();
        events.extend(adapter.on_response(&fragment(vec![Part::text("hello ")], None)));
        events.extend(adapter.on_response(&fragment(vec![Part::text("world")], None)));
        events.extend(adapter.on_response(&fragment(
            vec![Part::thought("mull it over", Some("sig-9".to_string()))],
            None,
        )));
        events.extend(adapter.on_response(&fragment(
            vec![Part::function_call(FunctionCall {
                id: None,
                name: "search".to_string(),
                args: Some(json!({"q": 1})),
            })],
            Some(FinishReason::Stop),
        )));

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta", // signature
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // Indices are monotone from zero per block.
        match &events[1] {
            StreamEvent::ContentBlockStart { index, .. } => assert_eq!(*index, 0),
            other => panic!("unexpected: {other:?}"),
        }
        match &events[5] {
            StreamEvent::ContentBlockStart { index, content_block } => {
                assert_eq!(*index, 1);
                assert!(matches!(content_block, StreamContentBlock::Thinking { .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &events[9] {
            StreamEvent::ContentBlockStart { index, content_block } => {
                assert_eq!(*index, 2);
                assert!(matches!(content_block, StreamContentBlock::ToolUse { .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &events[12] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
                assert_eq!(usage.output_tokens, Some(5));
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert_eq!(
            adapter.take_captured_signatures(),
            vec![("mull it over".to_string(), "sig-9".to_string())]
        );
        assert!(!adapter.is_empty_response());
    }

    #[test]
    fn thinking_closed_when_text_resumes() {
        let mut adapter = StreamAdapter::new("gemini-2.5-pro");
        let mut events = Vec::new();
        events.extend(adapter.on_response(&fragment(vec![Part::thought("hmm", None)], None)));
        events.extend(adapter.on_response(&fragment(vec![Part::text("answer")], None)));
        events.extend(adapter.finish());

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn empty_stream_emits_nothing_and_is_detected() {
        let mut adapter = StreamAdapter::new("gemini-2.5-pro");
        assert!(adapter.on_response(&GenerateContentResponse::default()).is_empty());
        assert!(adapter.finish().is_empty());
        assert!(adapter.is_empty_response());
    }

    #[test]
    fn unknown_parts_are_tolerated() {
        let mut adapter = StreamAdapter::new("gemini-2.5-pro");
        let mut events = Vec::new();
        events.extend(adapter.on_response(&fragment(vec![Part::default()], None)));
        events.extend(adapter.on_response(&fragment(vec![Part::text("ok")], Some(FinishReason::Stop))));
        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(!adapter.is_empty_response());
    }

    #[test]
    fn abort_closes_open_block_with_single_error() {
        let mut adapter = StreamAdapter::new("gemini-2.5-pro");
        adapter.on_response(&fragment(vec![Part::text("partial")], None));
        let events = adapter.abort("upstream_disconnect", "connection reset");
        assert_eq!(names(&events), vec!["content_block_stop", "error"]);
        // Terminal: further fragments are ignored.
        assert!(adapter.on_response(&fragment(vec![Part::text("x")], None)).is_empty());
        assert!(adapter.finish().is_empty());
    }

    #[test]
    fn finish_reason_tail_emitted_once() {
        let mut adapter = StreamAdapter::new("gemini-2.5-pro");
        let events =
            adapter.on_response(&fragment(vec![Part::text("done")], Some(FinishReason::Stop)));
        assert_eq!(names(&events).last(), Some(&"message_stop"));
        assert!(adapter.finish().is_empty());
    }
}
