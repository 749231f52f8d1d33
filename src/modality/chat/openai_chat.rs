use super::helpers::{from_json, from_json_str, new_call_id, new_id, parse_request, to_json, to_json_str, unix_now};
use super::ir::*;
use super::stream::SseFrame;
use super::{Decoder, Dialect, Encoder, StreamDecoder, StreamEncoder};
use crate::error::{error_body, AppError};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

pub struct OpenAiChatCodec;

// --- OpenAI Wire Types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<OaiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OaiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<OaiStreamOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OaiMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: OaiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiTool {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: OaiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiToolFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

fn function_type() -> String {
    "function".to_string()
}

// --- Response types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<OaiChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<OaiUsage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: OaiMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OaiUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl From<&OaiUsage> for IrUsage {
    fn from(u: &OaiUsage) -> Self {
        IrUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: Some(u.total_tokens).filter(|t| *t > 0),
        }
    }
}

impl From<&IrUsage> for OaiUsage {
    fn from(u: &IrUsage) -> Self {
        OaiUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total(),
        }
    }
}

// --- Streaming types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OaiStreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<OaiUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: OaiStreamDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OaiStreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OaiStreamToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamToolCall {
    #[serde(default)]
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<OaiStreamFunction>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

// --- Conversion helpers ---

fn oai_content_to_parts(content: &Option<Value>) -> Vec<IrContentPart> {
    match content {
        Some(Value::String(s)) if !s.is_empty() => vec![IrContentPart::Text { text: s.clone() }],
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| match p.get("type")?.as_str()? {
                "text" | "input_text" => Some(IrContentPart::Text {
                    text: p.get("text")?.as_str()?.to_string(),
                }),
                "image_url" => {
                    let image = p.get("image_url")?;
                    let url = image
                        .as_str()
                        .or_else(|| image.get("url").and_then(Value::as_str))?;
                    Some(IrContentPart::image_from_url(url))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn content_text(content: &Option<Value>) -> String {
    parts_text(&oai_content_to_parts(content))
}

/// Text-only content collapses to a plain string; anything else is a parts array.
fn parts_to_oai_content(parts: &[IrContentPart]) -> Option<Value> {
    let has_image = parts
        .iter()
        .any(|p| matches!(p, IrContentPart::Image { .. }));
    if !has_image {
        let text = parts_text(parts);
        return if text.is_empty() {
            None
        } else {
            Some(Value::String(text))
        };
    }
    let items: Vec<Value> = parts
        .iter()
        .filter_map(|p| match p {
            IrContentPart::Text { text } => Some(serde_json::json!({"type": "text", "text": text})),
            IrContentPart::Image {
                media_type,
                data,
                url,
            } => {
                let url = match (url, data) {
                    (Some(url), _) => url.clone(),
                    (None, Some(data)) => format!(
                        "data:{};base64,{}",
                        media_type.as_deref().unwrap_or("image/png"),
                        data
                    ),
                    (None, None) => return None,
                };
                Some(serde_json::json!({"type": "image_url", "image_url": {"url": url}}))
            }
            _ => None,
        })
        .collect();
    Some(Value::Array(items))
}

pub(crate) fn oai_finish_to_ir(reason: &str) -> IrFinishReason {
    match reason {
        "length" => IrFinishReason::Length,
        "tool_calls" | "function_call" => IrFinishReason::ToolCalls,
        "content_filter" => IrFinishReason::ContentFilter,
        _ => IrFinishReason::Stop,
    }
}

pub(crate) fn ir_finish_to_oai(reason: IrFinishReason) -> &'static str {
    match reason {
        IrFinishReason::Stop => "stop",
        IrFinishReason::Length => "length",
        IrFinishReason::ToolCalls => "tool_calls",
        IrFinishReason::ContentFilter => "content_filter",
    }
}

fn decode_stop(stop: Option<Value>) -> Option<Vec<String>> {
    match stop? {
        Value::String(s) => Some(vec![s]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
        ),
        _ => None,
    }
}

fn decode_tool_choice(tc: Value) -> Option<IrToolChoice> {
    match &tc {
        Value::String(s) => match s.as_str() {
            "auto" => Some(IrToolChoice::Auto),
            "none" => Some(IrToolChoice::None),
            "required" => Some(IrToolChoice::Any),
            _ => None,
        },
        _ => {
            let name = tc.get("function")?.get("name")?.as_str()?.to_string();
            Some(IrToolChoice::Tool { name })
        }
    }
}

fn tool_calls_to_parts(calls: &[OaiToolCall]) -> impl Iterator<Item = IrContentPart> + '_ {
    calls.iter().map(|tc| IrContentPart::ToolUse {
        id: if tc.id.is_empty() {
            new_call_id()
        } else {
            tc.id.clone()
        },
        name: tc.function.name.clone(),
        input: arguments_to_input(&tc.function.arguments),
    })
}

fn parts_to_tool_calls(parts: &[IrContentPart]) -> Option<Vec<OaiToolCall>> {
    let calls: Vec<OaiToolCall> = parts
        .iter()
        .filter_map(|p| match p {
            IrContentPart::ToolUse { id, name, input } => Some(OaiToolCall {
                id: id.clone(),
                call_type: function_type(),
                function: OaiFunction {
                    name: name.clone(),
                    arguments: input_to_arguments(input),
                },
            }),
            _ => None,
        })
        .collect();
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

fn thinking_text(parts: &[IrContentPart]) -> Option<String> {
    let text: String = parts
        .iter()
        .filter_map(|p| match p {
            IrContentPart::Thinking { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

pub(crate) fn decode_messages(messages: &[OaiMessage]) -> (Option<String>, Vec<IrMessage>) {
    let mut system: Vec<String> = Vec::new();
    let mut out: Vec<IrMessage> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                let text = content_text(&msg.content);
                if !text.is_empty() {
                    system.push(text);
                }
            }
            "assistant" => {
                let mut content = Vec::new();
                if let Some(reasoning) = msg.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
                    content.push(IrContentPart::Thinking {
                        text: reasoning.clone(),
                        signature: None,
                    });
                }
                content.extend(oai_content_to_parts(&msg.content));
                if let Some(calls) = &msg.tool_calls {
                    content.extend(tool_calls_to_parts(calls));
                }
                out.push(IrMessage::new(IrRole::Assistant, content));
            }
            "tool" | "function" => {
                let result = IrContentPart::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    name: msg.name.clone(),
                    content: content_text(&msg.content),
                    is_error: false,
                };
                // consecutive tool messages answer one assistant turn
                match out.last_mut() {
                    Some(last) if last.role == IrRole::User && last.has_tool_results() => {
                        last.content.push(result)
                    }
                    _ => out.push(IrMessage::new(IrRole::User, vec![result])),
                }
            }
            _ => out.push(IrMessage::new(IrRole::User, oai_content_to_parts(&msg.content))),
        }
    }

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, out)
}

fn encode_messages(ir: &IrChatRequest) -> Vec<OaiMessage> {
    let mut messages = Vec::new();

    if let Some(sys) = ir.system.as_ref().filter(|s| !s.is_empty()) {
        messages.push(OaiMessage {
            role: "system".to_string(),
            content: Some(Value::String(sys.clone())),
            ..Default::default()
        });
    }

    for msg in &ir.messages {
        match msg.role {
            IrRole::Assistant => {
                let tool_calls = parts_to_tool_calls(&msg.content);
                let content = parts_to_oai_content(&msg.content);
                if content.is_none() && tool_calls.is_none() {
                    continue;
                }
                messages.push(OaiMessage {
                    role: "assistant".to_string(),
                    content: Some(content.unwrap_or(Value::Null)),
                    tool_calls,
                    ..Default::default()
                });
            }
            IrRole::User => {
                for part in &msg.content {
                    if let IrContentPart::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = part
                    {
                        messages.push(OaiMessage {
                            role: "tool".to_string(),
                            content: Some(Value::String(content.clone())),
                            tool_call_id: Some(tool_use_id.clone()),
                            ..Default::default()
                        });
                    }
                }
                if let Some(content) = parts_to_oai_content(&msg.content) {
                    messages.push(OaiMessage {
                        role: "user".to_string(),
                        content: Some(content),
                        ..Default::default()
                    });
                }
            }
        }
    }

    messages
}

// --- Decoder impl ---

impl Decoder for OpenAiChatCodec {
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError> {
        let req: OaiRequest = parse_request(body)?;
        let (system, messages) = decode_messages(&req.messages);

        let tools = req.tools.map(|ts| {
            ts.into_iter()
                .map(|t| IrTool {
                    name: t.function.name,
                    description: t.function.description,
                    parameters: t.function.parameters.unwrap_or(serde_json::json!({})),
                })
                .collect()
        });

        Ok(IrChatRequest {
            model: req.model,
            messages,
            system,
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens.or(req.max_completion_tokens),
            stream: req.stream.unwrap_or(false),
            stop: decode_stop(req.stop),
            tools,
            tool_choice: req.tool_choice.and_then(decode_tool_choice),
            extra: req.extra,
        })
    }

    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError> {
        let resp: OaiResponse = from_json(body)?;

        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Translation("No choices in response".to_string()))?;

        let mut content = Vec::new();
        if let Some(reasoning) = choice
            .message
            .reasoning_content
            .as_ref()
            .filter(|r| !r.is_empty())
        {
            content.push(IrContentPart::Thinking {
                text: reasoning.clone(),
                signature: None,
            });
        }
        content.extend(oai_content_to_parts(&choice.message.content));
        if let Some(calls) = &choice.message.tool_calls {
            content.extend(tool_calls_to_parts(calls));
        }

        Ok(IrChatResponse {
            id: resp.id,
            model: resp.model,
            content,
            finish_reason: choice.finish_reason.as_deref().map(oai_finish_to_ir),
            usage: resp.usage.as_ref().map(IrUsage::from),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::default())
    }
}

// --- Encoder impl ---

impl Encoder for OpenAiChatCodec {
    fn encode_request(&self, ir: &IrChatRequest, model: &str) -> Result<Vec<u8>, AppError> {
        let tools = ir.tools.as_ref().map(|ts| {
            ts.iter()
                .map(|t| OaiTool {
                    tool_type: function_type(),
                    function: OaiToolFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.parameters.clone()),
                    },
                })
                .collect()
        });

        let tool_choice = ir.tool_choice.as_ref().map(|tc| match tc {
            IrToolChoice::Auto => serde_json::json!("auto"),
            IrToolChoice::None => serde_json::json!("none"),
            IrToolChoice::Any => serde_json::json!("required"),
            IrToolChoice::Tool { name } => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            }),
        });

        let req = OaiRequest {
            model: model.to_string(),
            messages: encode_messages(ir),
            temperature: ir.temperature,
            top_p: ir.top_p,
            max_tokens: ir.max_tokens,
            max_completion_tokens: None,
            stream: if ir.stream { Some(true) } else { None },
            stop: ir.stop.as_ref().map(|s| serde_json::json!(s)),
            tools,
            tool_choice,
            stream_options: if ir.stream {
                Some(OaiStreamOptions {
                    include_usage: true,
                })
            } else {
                None
            },
            extra: ir.extra.clone(),
        };

        to_json(&req)
    }

    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError> {
        let tool_calls = parts_to_tool_calls(&ir.content);
        let content = parts_to_oai_content(&ir.content).unwrap_or(Value::Null);
        let message = OaiMessage {
            role: "assistant".to_string(),
            content: Some(content),
            reasoning_content: thinking_text(&ir.content),
            tool_calls,
            ..Default::default()
        };

        let resp = OaiResponse {
            id: if ir.id.is_empty() {
                new_id("chatcmpl-")
            } else {
                ir.id.clone()
            },
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: ir.model.clone(),
            choices: vec![OaiChoice {
                index: 0,
                message,
                finish_reason: Some(
                    ir_finish_to_oai(ir.finish_reason.unwrap_or(IrFinishReason::Stop)).to_string(),
                ),
            }],
            usage: ir.usage.as_ref().map(OaiUsage::from),
        };

        to_json(&resp)
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(OpenAiStreamEncoder::default())
    }
}

// --- Stream decoding ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Tool,
}

/// OpenAI chunks are flat deltas; this rebuilds block boundaries from them.
/// Tool call fragments are collected per `tool_calls[].index` and emitted as
/// whole blocks once the calls are complete, since upstreams may interleave
/// fragments of different calls. The finish is held back until usage arrives
/// (it comes in a trailing `choices: []` chunk when `include_usage` is on),
/// `[DONE]`, or EOF.
#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder {
    started: bool,
    open: Option<(u32, BlockKind)>,
    next_index: u32,
    tool_calls: BTreeMap<u32, PendingCall>,
    pending_finish: Option<IrFinishReason>,
    usage: Option<IrUsage>,
    done: bool,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

impl OpenAiStreamDecoder {
    fn close(&mut self, events: &mut Vec<IrStreamEvent>) {
        if let Some((index, _)) = self.open.take() {
            events.push(IrStreamEvent::ContentBlockStop { index });
        }
    }

    fn open_block(
        &mut self,
        kind: BlockKind,
        block: IrBlockStart,
        events: &mut Vec<IrStreamEvent>,
    ) -> u32 {
        self.close(events);
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));
        events.push(IrStreamEvent::ContentBlockStart { index, block });
        index
    }

    fn ensure_block(&mut self, kind: BlockKind, events: &mut Vec<IrStreamEvent>) -> u32 {
        match self.open {
            Some((index, open_kind)) if open_kind == kind => index,
            _ => {
                let block = match kind {
                    BlockKind::Thinking => IrBlockStart::Thinking,
                    _ => IrBlockStart::Text,
                };
                self.open_block(kind, block, events)
            }
        }
    }

    /// Emit collected tool calls in index order, one block each.
    fn flush_tool_calls(&mut self, events: &mut Vec<IrStreamEvent>) {
        for (_, call) in std::mem::take(&mut self.tool_calls) {
            let block = IrBlockStart::ToolUse {
                id: if call.id.is_empty() {
                    new_call_id()
                } else {
                    call.id
                },
                name: call.name,
            };
            let index = self.open_block(BlockKind::Tool, block, events);
            if !call.arguments.is_empty() {
                events.push(IrStreamEvent::ContentDelta {
                    index,
                    delta: IrDelta::ToolArgs(call.arguments),
                });
            }
            self.close(events);
        }
    }

    fn finalize(&mut self, events: &mut Vec<IrStreamEvent>) {
        if self.done || !self.started {
            return;
        }
        self.done = true;
        self.flush_tool_calls(events);
        self.close(events);
        events.push(IrStreamEvent::MessageDelta {
            finish_reason: Some(self.pending_finish.unwrap_or(IrFinishReason::Stop)),
            usage: self.usage,
        });
        events.push(IrStreamEvent::MessageStop);
    }
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode_frame(&mut self, frame: &SseFrame) -> Result<Vec<IrStreamEvent>, AppError> {
        let mut events = Vec::new();
        if self.done {
            return Ok(events);
        }
        if frame.is_done_marker() {
            self.finalize(&mut events);
            return Ok(events);
        }
        if frame.data.trim().is_empty() {
            return Ok(events);
        }

        let chunk: OaiStreamChunk = from_json_str(&frame.data)?;

        if let Some(err) = chunk.error {
            self.done = true;
            let kind = err
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("api_error")
                .to_string();
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| err.to_string());
            events.push(IrStreamEvent::Error { kind, message });
            return Ok(events);
        }

        if !self.started {
            self.started = true;
            events.push(IrStreamEvent::MessageStart {
                id: chunk.id.clone(),
                model: chunk.model.clone().unwrap_or_default(),
                usage: None,
            });
        }

        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.into());
        }

        if let Some(choice) = chunk.choices.into_iter().next() {
            let delta = choice.delta;

            let has_text = delta.reasoning_content.as_ref().is_some_and(|r| !r.is_empty())
                || delta.content.as_ref().is_some_and(|c| !c.is_empty());
            if has_text && !self.tool_calls.is_empty() {
                self.flush_tool_calls(&mut events);
            }

            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                let index = self.ensure_block(BlockKind::Thinking, &mut events);
                events.push(IrStreamEvent::ContentDelta {
                    index,
                    delta: IrDelta::Thinking(reasoning),
                });
            }

            if let Some(text) = delta.content.filter(|c| !c.is_empty()) {
                let index = self.ensure_block(BlockKind::Text, &mut events);
                events.push(IrStreamEvent::ContentDelta {
                    index,
                    delta: IrDelta::Text(text),
                });
            }

            for tc in delta.tool_calls.unwrap_or_default() {
                if self.tool_calls.is_empty() {
                    self.close(&mut events);
                }
                let call = self.tool_calls.entry(tc.index).or_default();
                if let Some(id) = tc.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name.filter(|n| !n.is_empty()) {
                        call.name = name;
                    }
                    if let Some(args) = f.arguments {
                        call.arguments.push_str(&args);
                    }
                }
            }

            if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
                self.flush_tool_calls(&mut events);
                self.close(&mut events);
                self.pending_finish = Some(oai_finish_to_ir(&reason));
            }
        }

        if self.pending_finish.is_some() && self.usage.is_some() {
            self.finalize(&mut events);
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<IrStreamEvent> {
        let mut events = Vec::new();
        self.finalize(&mut events);
        events
    }
}

// --- Stream encoding ---

#[derive(Debug, Default)]
pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: i64,
    tool_slots: HashMap<u32, u32>,
    next_tool: u32,
}

impl OpenAiStreamEncoder {
    fn chunk(
        &self,
        delta: OaiStreamDelta,
        finish_reason: Option<String>,
        usage: Option<OaiUsage>,
    ) -> Result<SseFrame, AppError> {
        let chunk = OaiStreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: Some(self.model.clone()),
            choices: vec![OaiStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
            error: None,
        };
        Ok(SseFrame::data(to_json_str(&chunk)?))
    }
}

impl StreamEncoder for OpenAiStreamEncoder {
    fn encode_event(&mut self, event: &IrStreamEvent) -> Result<Vec<SseFrame>, AppError> {
        let frame = match event {
            IrStreamEvent::MessageStart { id, model, .. } => {
                self.id = if id.starts_with("chatcmpl") {
                    id.clone()
                } else {
                    new_id("chatcmpl-")
                };
                self.model = model.clone();
                self.created = unix_now();
                self.chunk(
                    OaiStreamDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                        ..Default::default()
                    },
                    None,
                    None,
                )?
            }
            IrStreamEvent::ContentBlockStart {
                index,
                block: IrBlockStart::ToolUse { id, name },
            } => {
                let slot = self.next_tool;
                self.next_tool += 1;
                self.tool_slots.insert(*index, slot);
                self.chunk(
                    OaiStreamDelta {
                        tool_calls: Some(vec![OaiStreamToolCall {
                            index: slot,
                            id: Some(id.clone()),
                            call_type: Some(function_type()),
                            function: Some(OaiStreamFunction {
                                name: Some(name.clone()),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                    None,
                )?
            }
            IrStreamEvent::ContentDelta { index, delta } => {
                let delta = match delta {
                    IrDelta::Text(text) => OaiStreamDelta {
                        content: Some(text.clone()),
                        ..Default::default()
                    },
                    IrDelta::Thinking(text) => OaiStreamDelta {
                        reasoning_content: Some(text.clone()),
                        ..Default::default()
                    },
                    IrDelta::ToolArgs(args) => {
                        let Some(slot) = self.tool_slots.get(index) else {
                            return Ok(Vec::new());
                        };
                        OaiStreamDelta {
                            tool_calls: Some(vec![OaiStreamToolCall {
                                index: *slot,
                                id: None,
                                call_type: None,
                                function: Some(OaiStreamFunction {
                                    name: None,
                                    arguments: Some(args.clone()),
                                }),
                            }]),
                            ..Default::default()
                        }
                    }
                };
                self.chunk(delta, None, None)?
            }
            IrStreamEvent::MessageDelta {
                finish_reason,
                usage,
            } => self.chunk(
                OaiStreamDelta::default(),
                Some(ir_finish_to_oai(finish_reason.unwrap_or(IrFinishReason::Stop)).to_string()),
                usage.as_ref().map(OaiUsage::from),
            )?,
            IrStreamEvent::MessageStop => SseFrame::data("[DONE]"),
            IrStreamEvent::Error { kind, message } => SseFrame::data(to_json_str(&error_body(
                Dialect::Openai,
                StatusCode::INTERNAL_SERVER_ERROR,
                kind,
                message,
            ))?),
            IrStreamEvent::ContentBlockStart { .. }
            | IrStreamEvent::ContentBlockStop { .. }
            | IrStreamEvent::Ping => return Ok(Vec::new()),
        };
        Ok(vec![frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: Value) -> IrChatRequest {
        OpenAiChatCodec
            .decode_request(serde_json::to_vec(&body).unwrap().as_slice())
            .unwrap()
    }

    #[test]
    fn decode_request_extracts_system_and_tools() {
        let ir = decode(serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": [
                    {"type": "text", "text": "What is in this image?"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBOR"}}
                ]}
            ],
            "tools": [{"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}],
            "tool_choice": "required",
            "stop": "END",
            "max_completion_tokens": 64,
            "user": "abc"
        }));

        assert_eq!(ir.system.as_deref(), Some("Be terse."));
        assert_eq!(ir.messages.len(), 1);
        assert_eq!(ir.messages[0].content.len(), 2);
        assert!(matches!(
            &ir.messages[0].content[1],
            IrContentPart::Image { media_type: Some(m), data: Some(_), .. } if m == "image/png"
        ));
        assert_eq!(ir.tools.as_ref().unwrap()[0].name, "lookup");
        assert_eq!(ir.tool_choice, Some(IrToolChoice::Any));
        assert_eq!(ir.stop, Some(vec!["END".to_string()]));
        assert_eq!(ir.max_tokens, Some(64));
        assert_eq!(ir.extra.get("user"), Some(&serde_json::json!("abc")));
        assert!(!ir.stream);
    }

    #[test]
    fn tool_messages_fold_into_one_user_turn() {
        let ir = decode(serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "weather in two cities"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "w", "arguments": "{\"city\":\"Paris\"}"}},
                    {"id": "c2", "type": "function", "function": {"name": "w", "arguments": "not json"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "sunny"},
                {"role": "tool", "tool_call_id": "c2", "content": "rain"}
            ]
        }));

        assert_eq!(ir.messages.len(), 3);
        let calls: Vec<_> = ir.messages[1].tool_uses().collect();
        assert_eq!(calls[0].2, &serde_json::json!({"city": "Paris"}));
        assert_eq!(calls[1].2, &serde_json::json!({"raw": "not json"}));
        assert_eq!(ir.messages[2].role, IrRole::User);
        assert_eq!(ir.messages[2].content.len(), 2);
    }

    #[test]
    fn encode_request_injects_stream_options_and_expands_tool_results() {
        let ir = IrChatRequest {
            model: "client".into(),
            system: Some("sys".into()),
            stream: true,
            messages: vec![
                IrMessage::new(
                    IrRole::Assistant,
                    vec![IrContentPart::ToolUse {
                        id: "t1".into(),
                        name: "w".into(),
                        input: serde_json::json!({"raw": "{bad"}),
                    }],
                ),
                IrMessage::new(
                    IrRole::User,
                    vec![
                        IrContentPart::ToolResult {
                            tool_use_id: "t1".into(),
                            name: None,
                            content: "ok".into(),
                            is_error: false,
                        },
                        IrContentPart::Text { text: "thanks".into() },
                    ],
                ),
            ],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&OpenAiChatCodec.encode_request(&ir, "gpt-4o").unwrap()).unwrap();

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream_options"]["include_usage"], true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], Value::Null);
        assert_eq!(messages[1]["tool_calls"][0]["function"]["arguments"], "{bad");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "t1");
        assert_eq!(messages[3]["content"], "thanks");
    }

    #[test]
    fn decode_response_with_reasoning_and_tool_calls() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "deepseek-reasoner",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "",
                    "reasoning_content": "think",
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13}
        });
        let ir = OpenAiChatCodec
            .decode_response(&serde_json::to_vec(&body).unwrap())
            .unwrap();

        assert_eq!(ir.content.len(), 2);
        assert!(matches!(&ir.content[0], IrContentPart::Thinking { text, .. } if text == "think"));
        assert_eq!(ir.finish_reason, Some(IrFinishReason::ToolCalls));
        assert_eq!(ir.usage.unwrap().total(), 13);
    }

    #[test]
    fn decode_response_without_choices_is_a_translation_error() {
        let err = OpenAiChatCodec
            .decode_response(br#"{"id":"x","choices":[]}"#)
            .unwrap_err();
        assert!(matches!(err, AppError::Translation(_)));
    }

    #[test]
    fn encode_response_sets_null_content_for_tool_only_messages() {
        let ir = IrChatResponse {
            id: "msg_1".into(),
            model: "m".into(),
            content: vec![IrContentPart::ToolUse {
                id: "toolu_1".into(),
                name: "w".into(),
                input: serde_json::json!({"a": 1}),
            }],
            finish_reason: Some(IrFinishReason::ToolCalls),
            usage: Some(IrUsage::new(1, 2)),
        };
        let body: Value =
            serde_json::from_slice(&OpenAiChatCodec.encode_response(&ir).unwrap()).unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], Value::Null);
        assert_eq!(body["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(body["usage"]["total_tokens"], 3);
    }

    #[test]
    fn stream_decoder_keeps_interleaved_tool_arguments() {
        let mut decoder = OpenAiStreamDecoder::default();
        let chunks = [
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"w","arguments":"{\"city\":"}}]}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"t","arguments":"{}"}}]}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Paris\"}"}}]}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ];
        let events: Vec<IrStreamEvent> = chunks
            .iter()
            .flat_map(|c| decoder.decode_frame(&SseFrame::data(*c)).unwrap())
            .collect();

        let starts: Vec<(u32, &str, &str)> = events
            .iter()
            .filter_map(|e| match e {
                IrStreamEvent::ContentBlockStart {
                    index,
                    block: IrBlockStart::ToolUse { id, name },
                } => Some((*index, id.as_str(), name.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![(0, "a", "w"), (1, "b", "t")]);

        let args = |want: u32| -> String {
            events
                .iter()
                .filter_map(|e| match e {
                    IrStreamEvent::ContentDelta {
                        index,
                        delta: IrDelta::ToolArgs(a),
                    } if *index == want => Some(a.as_str()),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(args(0), "{\"city\":\"Paris\"}");
        assert_eq!(args(1), "{}");
        let stops = events
            .iter()
            .filter(|e| matches!(e, IrStreamEvent::ContentBlockStop { .. }))
            .count();
        assert_eq!(stops, 2);
        assert!(events.contains(&IrStreamEvent::MessageDelta {
            finish_reason: Some(IrFinishReason::ToolCalls),
            usage: None,
        }));
        assert_eq!(events.last(), Some(&IrStreamEvent::MessageStop));
    }

    #[test]
    fn stream_decoder_reports_upstream_error_frames() {
        let mut decoder = OpenAiStreamDecoder::default();
        let events = decoder
            .decode_frame(&SseFrame::data(
                r#"{"error":{"message":"overloaded","type":"server_error"}}"#,
            ))
            .unwrap();
        assert_eq!(
            events,
            vec![IrStreamEvent::Error {
                kind: "server_error".into(),
                message: "overloaded".into()
            }]
        );
        assert!(decoder.finish().is_empty());
    }
}
