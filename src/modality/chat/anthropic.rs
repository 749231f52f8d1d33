use super::helpers::{from_json, from_json_str, new_id, parse_request, to_json, to_json_str};
use super::ir::*;
use super::stream::SseFrame;
use super::{Decoder, Encoder, StreamDecoder, StreamEncoder};
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Claude requires `max_tokens`; used when the client did not send one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicCodec;

// --- Anthropic Wire Types (Request) ---

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>, // string or array of content blocks (for prompt caching)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<AnthropicToolChoice>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        content: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicToolChoice {
    #[serde(rename = "type")]
    pub choice_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// --- Anthropic Wire Types (Response) ---

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicResponse {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub resp_type: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Vec<AnthropicBlock>,
    #[serde(default)]
    pub model: String,
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

impl From<&AnthropicUsage> for IrUsage {
    fn from(u: &AnthropicUsage) -> Self {
        let prompt = u
            .input_tokens
            .saturating_add(u.cache_creation_input_tokens.unwrap_or(0))
            .saturating_add(u.cache_read_input_tokens.unwrap_or(0));
        IrUsage {
            prompt_tokens: prompt,
            completion_tokens: u.output_tokens,
            total_tokens: None,
        }
    }
}

impl From<&IrUsage> for AnthropicUsage {
    fn from(u: &IrUsage) -> Self {
        AnthropicUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            ..Default::default()
        }
    }
}

// --- Streaming event types ---
// Anthropic SSE uses `event:` + `data:` lines.
// The `data:` payload always has a `type` field matching the event name.

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    MessageStart {
        message: StreamMessageInfo,
    },
    ContentBlockStart {
        index: u32,
        content_block: AnthropicBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: StreamDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        delta: StreamMessageDeltaInner,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StreamMessageInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamMessageDeltaInner {
    pub stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicErrorBody {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

// --- Conversion helpers ---

fn anthropic_stop_to_ir(reason: &str) -> IrFinishReason {
    match reason {
        "max_tokens" => IrFinishReason::Length,
        "tool_use" => IrFinishReason::ToolCalls,
        "refusal" => IrFinishReason::ContentFilter,
        _ => IrFinishReason::Stop,
    }
}

fn ir_finish_to_anthropic(reason: IrFinishReason, has_tool_use: bool) -> &'static str {
    match reason {
        IrFinishReason::Stop if has_tool_use => "tool_use",
        IrFinishReason::Stop => "end_turn",
        IrFinishReason::Length => "max_tokens",
        IrFinishReason::ToolCalls => "tool_use",
        IrFinishReason::ContentFilter => "refusal",
    }
}

/// Tool result content is a string or an array of text blocks.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn system_text(system: &Value) -> Option<String> {
    let text = match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn block_to_ir(block: AnthropicBlock) -> Option<IrContentPart> {
    match block {
        AnthropicBlock::Text { text } => Some(IrContentPart::Text { text }),
        AnthropicBlock::Image { source } => Some(match source {
            AnthropicImageSource::Base64 { media_type, data } => IrContentPart::Image {
                media_type: Some(media_type),
                data: Some(data),
                url: None,
            },
            AnthropicImageSource::Url { url } => IrContentPart::image_from_url(&url),
        }),
        AnthropicBlock::ToolUse { id, name, input } => Some(IrContentPart::ToolUse {
            id,
            name,
            input: if input.is_null() {
                Value::Object(Map::new())
            } else {
                input
            },
        }),
        AnthropicBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(IrContentPart::ToolResult {
            tool_use_id,
            name: None,
            content: tool_result_text(&content),
            is_error,
        }),
        AnthropicBlock::Thinking {
            thinking,
            signature,
        } => Some(IrContentPart::Thinking {
            text: thinking,
            signature,
        }),
        AnthropicBlock::Unknown => None,
    }
}

fn ir_to_block(part: &IrContentPart) -> Option<AnthropicBlock> {
    match part {
        IrContentPart::Text { text } if !text.is_empty() => {
            Some(AnthropicBlock::Text { text: text.clone() })
        }
        IrContentPart::Text { .. } => None,
        IrContentPart::Image {
            media_type,
            data,
            url,
        } => {
            let source = match (data, url) {
                (Some(data), _) => AnthropicImageSource::Base64 {
                    media_type: media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                    data: data.clone(),
                },
                (None, Some(url)) => AnthropicImageSource::Url { url: url.clone() },
                (None, None) => return None,
            };
            Some(AnthropicBlock::Image { source })
        }
        IrContentPart::ToolUse { id, name, input } => Some(AnthropicBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: if input.is_object() {
                input.clone()
            } else {
                serde_json::json!({ "value": input })
            },
        }),
        IrContentPart::ToolResult {
            tool_use_id,
            content,
            is_error,
            ..
        } => Some(AnthropicBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: Value::String(content.clone()),
            is_error: *is_error,
        }),
        // Upstream Claude rejects thinking blocks it did not sign.
        IrContentPart::Thinking {
            text,
            signature: Some(signature),
        } => Some(AnthropicBlock::Thinking {
            thinking: text.clone(),
            signature: Some(signature.clone()),
        }),
        IrContentPart::Thinking { .. } => None,
    }
}

fn encode_messages(messages: &[IrMessage]) -> Vec<AnthropicMessage> {
    let mut out: Vec<(IrRole, Vec<AnthropicBlock>)> = Vec::new();

    for msg in messages {
        let mut blocks: Vec<AnthropicBlock> = msg.content.iter().filter_map(ir_to_block).collect();
        if msg.role == IrRole::User {
            // tool results must lead a user turn
            blocks.sort_by_key(|b| !matches!(b, AnthropicBlock::ToolResult { .. }));
        }
        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some((role, existing)) if *role == msg.role => existing.extend(blocks),
            _ => out.push((msg.role, blocks)),
        }
    }

    out.into_iter()
        .map(|(role, blocks)| AnthropicMessage {
            role: match role {
                IrRole::User => "user".to_string(),
                IrRole::Assistant => "assistant".to_string(),
            },
            content: AnthropicContent::Blocks(blocks),
        })
        .collect()
}

// --- Decoder impl ---

impl Decoder for AnthropicCodec {
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError> {
        let req: AnthropicRequest = parse_request(body)?;

        let messages = req
            .messages
            .into_iter()
            .map(|m| {
                let role = if m.role == "assistant" {
                    IrRole::Assistant
                } else {
                    IrRole::User
                };
                let content = match m.content {
                    AnthropicContent::Text(text) => vec![IrContentPart::Text { text }],
                    AnthropicContent::Blocks(blocks) => {
                        blocks.into_iter().filter_map(block_to_ir).collect()
                    }
                };
                IrMessage::new(role, content)
            })
            .collect();

        let tools = req.tools.map(|ts| {
            ts.into_iter()
                .map(|t| IrTool {
                    name: t.name,
                    description: t.description,
                    parameters: t.input_schema,
                })
                .collect()
        });

        let tool_choice = req.tool_choice.and_then(|tc| match tc.choice_type.as_str() {
            "auto" => Some(IrToolChoice::Auto),
            "any" => Some(IrToolChoice::Any),
            "none" => Some(IrToolChoice::None),
            "tool" => tc.name.map(|name| IrToolChoice::Tool { name }),
            _ => None,
        });

        Ok(IrChatRequest {
            model: req.model,
            messages,
            system: req.system.as_ref().and_then(system_text),
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
            stream: req.stream.unwrap_or(false),
            stop: req.stop_sequences,
            tools,
            tool_choice,
            extra: req.extra,
        })
    }

    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError> {
        let resp: AnthropicResponse = from_json(body)?;
        Ok(IrChatResponse {
            id: resp.id,
            model: resp.model,
            content: resp.content.into_iter().filter_map(block_to_ir).collect(),
            finish_reason: resp.stop_reason.as_deref().map(anthropic_stop_to_ir),
            usage: resp.usage.as_ref().map(IrUsage::from),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamDecoder::default())
    }
}

// --- Encoder impl ---

impl Encoder for AnthropicCodec {
    fn encode_request(&self, ir: &IrChatRequest, model: &str) -> Result<Vec<u8>, AppError> {
        let tools = ir.tools.as_ref().map(|ts| {
            ts.iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: if t.parameters.is_object() {
                        t.parameters.clone()
                    } else {
                        empty_schema()
                    },
                })
                .collect()
        });

        let tool_choice = ir.tool_choice.as_ref().map(|tc| {
            let (choice_type, name) = match tc {
                IrToolChoice::Auto => ("auto", None),
                IrToolChoice::None => ("none", None),
                IrToolChoice::Any => ("any", None),
                IrToolChoice::Tool { name } => ("tool", Some(name.clone())),
            };
            AnthropicToolChoice {
                choice_type: choice_type.to_string(),
                name,
            }
        });

        let req = AnthropicRequest {
            model: model.to_string(),
            messages: encode_messages(&ir.messages),
            max_tokens: Some(ir.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
            system: ir
                .system
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.clone())),
            temperature: ir.temperature,
            top_p: ir.top_p,
            stop_sequences: ir.stop.clone(),
            stream: if ir.stream { Some(true) } else { None },
            tools,
            tool_choice,
            extra: ir.extra.clone(),
        };

        to_json(&req)
    }

    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError> {
        let content: Vec<AnthropicBlock> = ir
            .content
            .iter()
            .filter_map(|p| match p {
                // downstream clients accept unsigned thinking
                IrContentPart::Thinking { text, signature } => Some(AnthropicBlock::Thinking {
                    thinking: text.clone(),
                    signature: signature.clone(),
                }),
                other => ir_to_block(other),
            })
            .collect();

        let resp = AnthropicResponse {
            id: if ir.id.starts_with("msg_") {
                ir.id.clone()
            } else {
                new_id("msg_")
            },
            resp_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: ir.model.clone(),
            stop_reason: Some(
                ir_finish_to_anthropic(
                    ir.finish_reason.unwrap_or(IrFinishReason::Stop),
                    ir.has_tool_use(),
                )
                .to_string(),
            ),
            stop_sequence: None,
            usage: Some(ir.usage.as_ref().map(AnthropicUsage::from).unwrap_or_default()),
        };

        to_json(&resp)
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(AnthropicStreamEncoder::default())
    }
}

// --- Stream decoding ---

/// Claude events already have block structure; indices are renumbered so
/// that skipped block types (redacted thinking, server tools) leave no gaps.
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder {
    indices: HashMap<u32, u32>,
    next_index: u32,
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode_frame(&mut self, frame: &SseFrame) -> Result<Vec<IrStreamEvent>, AppError> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let event: AnthropicStreamEvent = from_json_str(&frame.data)?;

        let events = match event {
            AnthropicStreamEvent::MessageStart { message } => vec![IrStreamEvent::MessageStart {
                id: message.id,
                model: message.model,
                usage: message.usage.as_ref().map(IrUsage::from),
            }],
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let (block, initial) = match content_block {
                    AnthropicBlock::Text { text } => (IrBlockStart::Text, Some(IrDelta::Text(text))),
                    AnthropicBlock::Thinking { thinking, .. } => {
                        (IrBlockStart::Thinking, Some(IrDelta::Thinking(thinking)))
                    }
                    AnthropicBlock::ToolUse { id, name, input } => {
                        let initial = match &input {
                            Value::Object(map) if !map.is_empty() => {
                                Some(IrDelta::ToolArgs(input_to_arguments(&input)))
                            }
                            _ => None,
                        };
                        (IrBlockStart::ToolUse { id, name }, initial)
                    }
                    _ => return Ok(Vec::new()),
                };
                let ir_index = self.next_index;
                self.next_index += 1;
                self.indices.insert(index, ir_index);

                let mut events = vec![IrStreamEvent::ContentBlockStart {
                    index: ir_index,
                    block,
                }];
                if let Some(delta) = initial.filter(|d| !d.is_empty()) {
                    events.push(IrStreamEvent::ContentDelta {
                        index: ir_index,
                        delta,
                    });
                }
                events
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                let Some(ir_index) = self.indices.get(&index).copied() else {
                    return Ok(Vec::new());
                };
                let delta = match delta {
                    StreamDelta::TextDelta { text } => IrDelta::Text(text),
                    StreamDelta::InputJsonDelta { partial_json } => IrDelta::ToolArgs(partial_json),
                    StreamDelta::ThinkingDelta { thinking } => IrDelta::Thinking(thinking),
                    StreamDelta::SignatureDelta { .. } | StreamDelta::Other => {
                        return Ok(Vec::new())
                    }
                };
                vec![IrStreamEvent::ContentDelta {
                    index: ir_index,
                    delta,
                }]
            }
            AnthropicStreamEvent::ContentBlockStop { index } => match self.indices.get(&index) {
                Some(ir_index) => vec![IrStreamEvent::ContentBlockStop { index: *ir_index }],
                None => Vec::new(),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                vec![IrStreamEvent::MessageDelta {
                    finish_reason: delta.stop_reason.as_deref().map(anthropic_stop_to_ir),
                    usage: usage.as_ref().map(IrUsage::from),
                }]
            }
            AnthropicStreamEvent::MessageStop => vec![IrStreamEvent::MessageStop],
            AnthropicStreamEvent::Ping => vec![IrStreamEvent::Ping],
            AnthropicStreamEvent::Error { error } => vec![IrStreamEvent::Error {
                kind: if error.error_type.is_empty() {
                    "api_error".to_string()
                } else {
                    error.error_type
                },
                message: error.message,
            }],
            AnthropicStreamEvent::Unknown => Vec::new(),
        };
        Ok(events)
    }

    fn finish(&mut self) -> Vec<IrStreamEvent> {
        Vec::new()
    }
}

// --- Stream encoding ---

#[derive(Debug, Default)]
pub struct AnthropicStreamEncoder {
    saw_tool_use: bool,
}

fn named(event: &str, payload: Value) -> Result<SseFrame, AppError> {
    Ok(SseFrame::named(event, to_json_str(&payload)?))
}

impl StreamEncoder for AnthropicStreamEncoder {
    fn encode_event(&mut self, event: &IrStreamEvent) -> Result<Vec<SseFrame>, AppError> {
        let frame = match event {
            IrStreamEvent::MessageStart { id, model, usage } => {
                let id = if id.starts_with("msg_") {
                    id.clone()
                } else {
                    new_id("msg_")
                };
                named(
                    "message_start",
                    serde_json::json!({
                        "type": "message_start",
                        "message": {
                            "id": id,
                            "type": "message",
                            "role": "assistant",
                            "model": model,
                            "content": [],
                            "stop_reason": null,
                            "stop_sequence": null,
                            "usage": {
                                "input_tokens": usage.map(|u| u.prompt_tokens).unwrap_or(0),
                                "output_tokens": 0
                            }
                        }
                    }),
                )?
            }
            IrStreamEvent::ContentBlockStart { index, block } => {
                let content_block = match block {
                    IrBlockStart::Text => serde_json::json!({"type": "text", "text": ""}),
                    IrBlockStart::Thinking => {
                        serde_json::json!({"type": "thinking", "thinking": ""})
                    }
                    IrBlockStart::ToolUse { id, name } => {
                        self.saw_tool_use = true;
                        serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": {}})
                    }
                };
                named(
                    "content_block_start",
                    serde_json::json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": content_block
                    }),
                )?
            }
            IrStreamEvent::ContentDelta { index, delta } => {
                let delta = match delta {
                    IrDelta::Text(text) => serde_json::json!({"type": "text_delta", "text": text}),
                    IrDelta::ToolArgs(args) => {
                        serde_json::json!({"type": "input_json_delta", "partial_json": args})
                    }
                    IrDelta::Thinking(text) => {
                        serde_json::json!({"type": "thinking_delta", "thinking": text})
                    }
                };
                named(
                    "content_block_delta",
                    serde_json::json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": delta
                    }),
                )?
            }
            IrStreamEvent::ContentBlockStop { index } => named(
                "content_block_stop",
                serde_json::json!({"type": "content_block_stop", "index": index}),
            )?,
            IrStreamEvent::MessageDelta {
                finish_reason,
                usage,
            } => {
                let usage = usage.unwrap_or_default();
                named(
                    "message_delta",
                    serde_json::json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": ir_finish_to_anthropic(
                                finish_reason.unwrap_or(IrFinishReason::Stop),
                                self.saw_tool_use,
                            ),
                            "stop_sequence": null
                        },
                        "usage": {
                            "input_tokens": usage.prompt_tokens,
                            "output_tokens": usage.completion_tokens
                        }
                    }),
                )?
            }
            IrStreamEvent::MessageStop => {
                named("message_stop", serde_json::json!({"type": "message_stop"}))?
            }
            IrStreamEvent::Ping => named("ping", serde_json::json!({"type": "ping"}))?,
            IrStreamEvent::Error { kind, message } => {
                let error_type = if kind.ends_with("_error") {
                    kind.as_str()
                } else {
                    "api_error"
                };
                named(
                    "error",
                    serde_json::json!({
                        "type": "error",
                        "error": {"type": error_type, "message": message}
                    }),
                )?
            }
        };
        Ok(vec![frame])
    }
}
