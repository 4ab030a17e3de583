//! Claude → Gemini request translation, and the reverse direction used when
//! reconstructing canonical messages from upstream contents.

use std::collections::HashMap;

use serde_json::{Value as JsonValue, json};

use ccproxy_protocol::claude::CreateMessageBody;
use ccproxy_protocol::claude::types::{
    ContentBlockParam, MessageContent, MessageParam, MessageRole, ToolResultContent,
};
use ccproxy_protocol::gemini::{
    Content, FunctionCall, FunctionDeclaration, FunctionResponse, GenerateContentRequest,
    GenerationConfig, Part, ThinkingConfig, Tool,
};

use crate::preamble::IDENTITY_PREAMBLE;
use crate::signature::{SKIP_SIGNATURE_SENTINEL, SignatureCache};

/// Model-dependent knobs resolved by the caller from the model table.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Hard ceiling for `maxOutputTokens` (Gemini family); `None` passes the
    /// client budget through untouched.
    pub max_output_cap: Option<u32>,
    /// Ask upstream to include thought parts (thinking-capable models).
    pub include_thoughts: bool,
}

pub fn to_generate_content(
    body: &CreateMessageBody,
    signatures: &SignatureCache,
    options: RequestOptions,
) -> GenerateContentRequest {
    let mut tool_names: HashMap<String, String> = HashMap::new();
    let mut contents = Vec::new();

    for message in &body.messages {
        if let Some(content) = map_message(message, signatures, &mut tool_names) {
            contents.push(content);
        }
    }

    GenerateContentRequest {
        contents,
        system_instruction: Some(system_instruction(body)),
        tools: map_tools(body),
        generation_config: Some(generation_config(body, options)),
        session_id: None,
    }
}

/// The identity preamble always leads; caller system text follows it.
fn system_instruction(body: &CreateMessageBody) -> Content {
    let mut text = IDENTITY_PREAMBLE.to_string();
    if let Some(system) = &body.system {
        let extra = system.flatten_text();
        if !extra.is_empty() {
            text.push_str("\n\n");
            text.push_str(&extra);
        }
    }
    Content::user(vec![Part::text(text)])
}

fn map_message(
    message: &MessageParam,
    signatures: &SignatureCache,
    tool_names: &mut HashMap<String, String>,
) -> Option<Content> {
    let mut parts = Vec::new();
    for block in message.content.blocks() {
        match block {
            ContentBlockParam::Text { text } => {
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
            }
            ContentBlockParam::Thinking {
                thinking,
                signature,
            } => {
                let signature = match signature.filter(|s| !s.is_empty()) {
                    Some(signature) => signature,
                    None => signatures.lookup(&thinking),
                };
                parts.push(Part::thought(thinking, Some(signature)));
            }
            ContentBlockParam::ToolUse { id, name, input } => {
                tool_names.insert(id.clone(), name.clone());
                parts.push(Part::function_call(FunctionCall {
                    id: Some(id),
                    name,
                    args: Some(input),
                }));
            }
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Upstream addresses results by function name; recover it
                // from the tool_use block that issued the call.
                let name = tool_names
                    .get(&tool_use_id)
                    .cloned()
                    .unwrap_or_else(|| tool_use_id.clone());
                let mut response = json!({ "content": content.flatten_text() });
                if is_error {
                    response["is_error"] = JsonValue::Bool(true);
                }
                parts.push(Part::function_response(FunctionResponse {
                    id: Some(tool_use_id),
                    name,
                    response,
                }));
            }
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(match message.role {
        MessageRole::User => Content::user(parts),
        MessageRole::Assistant => Content::model(parts),
    })
}

fn map_tools(body: &CreateMessageBody) -> Option<Vec<Tool>> {
    let tools = body.tools.as_ref()?;
    if tools.is_empty() {
        return None;
    }
    let declarations = tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            parameters: Some(tool.input_schema.clone()),
        })
        .collect();
    Some(vec![Tool {
        function_declarations: Some(declarations),
    }])
}

fn generation_config(body: &CreateMessageBody, options: RequestOptions) -> GenerationConfig {
    let max_output_tokens = match (body.max_tokens, options.max_output_cap) {
        (Some(requested), Some(cap)) => Some(requested.min(cap)),
        (Some(requested), None) => Some(requested),
        (None, cap) => cap,
    };
    let thinking_config = options.include_thoughts.then_some(ThinkingConfig {
        include_thoughts: true,
        thinking_budget: None,
    });
    GenerationConfig {
        max_output_tokens,
        temperature: None,
        top_p: None,
        thinking_config,
    }
}

/// Gemini contents → canonical messages. Function responses are matched to
/// calls by order within the preceding model turn (1st call ↔ 1st result);
/// the skip sentinel never round-trips as a real signature.
pub fn to_message_params(contents: &[Content]) -> Vec<MessageParam> {
    let mut messages = Vec::new();
    let mut pending_call_ids: Vec<String> = Vec::new();

    for content in contents {
        let role = match content.role {
            Some(ccproxy_protocol::gemini::ContentRole::Model) => MessageRole::Assistant,
            _ => MessageRole::User,
        };
        if role == MessageRole::Assistant {
            pending_call_ids.clear();
        }

        let mut blocks = Vec::new();
        for part in &content.parts {
            if let Some(call) = &part.function_call {
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(crate::new_tool_call_id);
                pending_call_ids.push(id.clone());
                blocks.push(ContentBlockParam::ToolUse {
                    id,
                    name: call.name.clone(),
                    input: call.args.clone().unwrap_or_else(|| json!({})),
                });
                continue;
            }
            if let Some(response) = &part.function_response {
                let tool_use_id = response
                    .id
                    .clone()
                    .or_else(|| {
                        if pending_call_ids.is_empty() {
                            None
                        } else {
                            Some(pending_call_ids.remove(0))
                        }
                    })
                    .unwrap_or_else(|| response.name.clone());
                let text = response
                    .response
                    .get("content")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| response.response.to_string());
                let is_error = response
                    .response
                    .get("is_error")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false);
                blocks.push(ContentBlockParam::ToolResult {
                    tool_use_id,
                    content: ToolResultContent::Text(text),
                    is_error,
                });
                continue;
            }
            if let Some(text) = &part.text {
                if part.is_thought() {
                    let signature = part
                        .thought_signature
                        .clone()
                        .filter(|s| !s.is_empty() && s != SKIP_SIGNATURE_SENTINEL);
                    blocks.push(ContentBlockParam::Thinking {
                        thinking: text.clone(),
                        signature,
                    });
                } else if !text.is_empty() {
                    blocks.push(ContentBlockParam::Text { text: text.clone() });
                }
            }
        }

        if !blocks.is_empty() {
            messages.push(MessageParam {
                role,
                content: MessageContent::Blocks(blocks),
            });
        }
    }

    messages
}
