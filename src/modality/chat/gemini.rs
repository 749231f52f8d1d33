use super::helpers::{from_json, from_json_str, new_call_id, parse_request, to_json, to_json_str};
use super::ir::*;
use super::stream::SseFrame;
use super::{Decoder, Dialect, Encoder, StreamDecoder, StreamEncoder};
use crate::error::{error_body, AppError};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};

pub struct GeminiCodec;

/// Key under which unknown `generationConfig` fields travel in `IrChatRequest::extra`.
const GENERATION_CONFIG_EXTRA: &str = "generationConfig";

// --- Gemini Wire Types (Request) ---

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    #[serde(default)]
    pub contents: Vec<GeminiContent>,
    #[serde(alias = "system_instruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(alias = "generation_config", skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiToolDeclaration>>,
    #[serde(alias = "tool_config", skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<GeminiToolConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(alias = "inline_data", skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<GeminiInlineData>,
    #[serde(alias = "file_data", skip_serializing_if = "Option::is_none")]
    pub file_data: Option<GeminiFileData>,
    #[serde(alias = "function_call", skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(alias = "function_response", skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiInlineData {
    #[serde(alias = "mime_type")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFileData {
    #[serde(alias = "mime_type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(alias = "file_uri")]
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(alias = "top_p", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(alias = "max_output_tokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(alias = "stop_sequences", skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolDeclaration {
    #[serde(default, alias = "function_declarations")]
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolConfig {
    #[serde(alias = "function_calling_config")]
    pub function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFunctionCallingConfig {
    #[serde(default)]
    pub mode: String,
    #[serde(alias = "allowed_function_names", skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

// --- Gemini Wire Types (Response) ---

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_feedback: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: GeminiContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<u32>,
}

impl From<&GeminiUsageMetadata> for IrUsage {
    fn from(u: &GeminiUsageMetadata) -> Self {
        IrUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u
                .candidates_token_count
                .saturating_add(u.thoughts_token_count.unwrap_or(0)),
            total_tokens: Some(u.total_token_count).filter(|t| *t > 0),
        }
    }
}

impl From<&IrUsage> for GeminiUsageMetadata {
    fn from(u: &IrUsage) -> Self {
        GeminiUsageMetadata {
            prompt_token_count: u.prompt_tokens,
            candidates_token_count: u.completion_tokens,
            total_token_count: u.total(),
            thoughts_token_count: None,
        }
    }
}

// --- Conversion helpers ---

fn gemini_finish_to_ir(reason: &str, has_function_call: bool) -> IrFinishReason {
    match reason {
        "MAX_TOKENS" => IrFinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            IrFinishReason::ContentFilter
        }
        _ if has_function_call => IrFinishReason::ToolCalls,
        _ => IrFinishReason::Stop,
    }
}

fn ir_finish_to_gemini(reason: IrFinishReason) -> &'static str {
    match reason {
        IrFinishReason::Stop | IrFinishReason::ToolCalls => "STOP",
        IrFinishReason::Length => "MAX_TOKENS",
        IrFinishReason::ContentFilter => "SAFETY",
    }
}

/// Gemini's function schema is an OpenAPI subset and rejects JSON Schema
/// meta keys.
fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "$schema" && k.as_str() != "additionalProperties")
                .map(|(k, v)| (k.clone(), clean_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

fn guess_mime(url: &str) -> &'static str {
    let lower = url.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// A function response body as tool-result text; single string payloads unwrap.
fn function_response_text(response: &Value) -> String {
    if let Value::Object(map) = response {
        if map.len() == 1 {
            if let Some(Value::String(s)) = map.get("content").or_else(|| map.get("result")) {
                return s.clone();
            }
        }
    }
    match response {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text_to_function_response(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(v @ Value::Object(_)) => v,
        _ => serde_json::json!({ "content": content }),
    }
}

/// Gemini carries no call ids; calls and responses pair up by name, in order.
#[derive(Default)]
struct CallIds {
    pending: HashMap<String, VecDeque<String>>,
}

impl CallIds {
    fn issue(&mut self, name: &str) -> String {
        let id = new_call_id();
        self.pending
            .entry(name.to_string())
            .or_default()
            .push_back(id.clone());
        id
    }

    fn resolve(&mut self, name: &str) -> String {
        self.pending
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(new_call_id)
    }
}

fn part_to_ir(part: &GeminiPart, ids: &mut CallIds) -> Option<IrContentPart> {
    if let Some(fc) = &part.function_call {
        return Some(IrContentPart::ToolUse {
            id: ids.issue(&fc.name),
            name: fc.name.clone(),
            input: if fc.args.is_null() {
                Value::Object(Map::new())
            } else {
                fc.args.clone()
            },
        });
    }
    if let Some(fr) = &part.function_response {
        return Some(IrContentPart::ToolResult {
            tool_use_id: ids.resolve(&fr.name),
            name: Some(fr.name.clone()),
            content: function_response_text(&fr.response),
            is_error: false,
        });
    }
    if let Some(inline) = &part.inline_data {
        return Some(IrContentPart::Image {
            media_type: Some(inline.mime_type.clone()),
            data: Some(inline.data.clone()),
            url: None,
        });
    }
    if let Some(file) = &part.file_data {
        return Some(IrContentPart::Image {
            media_type: file.mime_type.clone(),
            data: None,
            url: Some(file.file_uri.clone()),
        });
    }
    let text = part.text.as_ref()?;
    if part.thought == Some(true) {
        Some(IrContentPart::Thinking {
            text: text.clone(),
            signature: part.thought_signature.clone(),
        })
    } else {
        Some(IrContentPart::Text { text: text.clone() })
    }
}

fn ir_to_part(part: &IrContentPart, names: &HashMap<String, String>) -> Option<GeminiPart> {
    match part {
        IrContentPart::Text { text } if !text.is_empty() => Some(GeminiPart {
            text: Some(text.clone()),
            ..Default::default()
        }),
        IrContentPart::Image {
            media_type,
            data,
            url,
        } => match (data, url) {
            (Some(data), _) => Some(GeminiPart {
                inline_data: Some(GeminiInlineData {
                    mime_type: media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                    data: data.clone(),
                }),
                ..Default::default()
            }),
            (None, Some(url)) => Some(GeminiPart {
                file_data: Some(GeminiFileData {
                    mime_type: Some(
                        media_type
                            .clone()
                            .unwrap_or_else(|| guess_mime(url).to_string()),
                    ),
                    file_uri: url.clone(),
                }),
                ..Default::default()
            }),
            (None, None) => None,
        },
        IrContentPart::ToolUse { name, input, .. } => Some(GeminiPart {
            function_call: Some(GeminiFunctionCall {
                name: name.clone(),
                args: input.clone(),
            }),
            ..Default::default()
        }),
        IrContentPart::ToolResult {
            tool_use_id,
            name,
            content,
            ..
        } => {
            let name = name
                .clone()
                .or_else(|| names.get(tool_use_id).cloned())
                .unwrap_or_default();
            Some(GeminiPart {
                function_response: Some(GeminiFunctionResponse {
                    name,
                    response: text_to_function_response(content),
                }),
                ..Default::default()
            })
        }
        _ => None,
    }
}

fn parts_to_ir_response(parts: &[GeminiPart]) -> Vec<IrContentPart> {
    let mut ids = CallIds::default();
    parts.iter().filter_map(|p| part_to_ir(p, &mut ids)).collect()
}

fn ir_to_response_part(part: &IrContentPart) -> Option<GeminiPart> {
    match part {
        IrContentPart::Thinking { text, signature } => Some(GeminiPart {
            text: Some(text.clone()),
            thought: Some(true),
            thought_signature: signature.clone(),
            ..Default::default()
        }),
        other => ir_to_part(other, &HashMap::new()),
    }
}

// --- Decoder impl ---

impl Decoder for GeminiCodec {
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError> {
        let mut req: GeminiRequest = parse_request(body)?;

        let system = req.system_instruction.as_ref().and_then(|si| {
            let text = si
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n\n");
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        });

        let mut ids = CallIds::default();
        let messages = req
            .contents
            .iter()
            .map(|content| {
                let role = match content.role.as_deref() {
                    Some("model") | Some("assistant") => IrRole::Assistant,
                    _ => IrRole::User,
                };
                let parts = content
                    .parts
                    .iter()
                    .filter_map(|p| part_to_ir(p, &mut ids))
                    .collect();
                IrMessage::new(role, parts)
            })
            .collect();

        let tools: Option<Vec<IrTool>> = req.tools.as_ref().map(|ts| {
            ts.iter()
                .flat_map(|t| {
                    t.function_declarations.iter().map(|fd| IrTool {
                        name: fd.name.clone(),
                        description: fd.description.clone(),
                        parameters: fd.parameters.clone().unwrap_or(serde_json::json!({})),
                    })
                })
                .collect()
        });

        let tool_choice = req.tool_config.as_ref().map(|tc| {
            let config = &tc.function_calling_config;
            match config.mode.as_str() {
                "NONE" => IrToolChoice::None,
                "ANY" => match config.allowed_function_names.as_deref() {
                    Some([name]) => IrToolChoice::Tool { name: name.clone() },
                    _ => IrToolChoice::Any,
                },
                _ => IrToolChoice::Auto,
            }
        });

        let mut extra = std::mem::take(&mut req.extra);
        // `/gemini/completions` carries these in the body
        let model = extra
            .remove("model")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        let stream = extra
            .remove("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let generation = req.generation_config.unwrap_or_default();
        if !generation.extra.is_empty() {
            extra.insert(
                GENERATION_CONFIG_EXTRA.to_string(),
                Value::Object(generation.extra),
            );
        }

        Ok(IrChatRequest {
            model,
            messages,
            system,
            temperature: generation.temperature,
            top_p: generation.top_p,
            max_tokens: generation.max_output_tokens,
            stream,
            stop: generation.stop_sequences,
            tools: tools.filter(|t| !t.is_empty()),
            tool_choice,
            extra,
        })
    }

    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError> {
        let resp: GeminiResponse = from_json(body)?;

        let usage = resp.usage_metadata.as_ref().map(IrUsage::from);
        let id = resp.response_id.clone().unwrap_or_default();
        let model = resp.model_version.clone().unwrap_or_default();

        let Some(candidate) = resp.candidates.into_iter().next() else {
            // prompt blocked before generation
            if resp.prompt_feedback.is_some() {
                return Ok(IrChatResponse {
                    id,
                    model,
                    content: Vec::new(),
                    finish_reason: Some(IrFinishReason::ContentFilter),
                    usage,
                });
            }
            return Err(AppError::Translation(
                "No candidates in Gemini response".to_string(),
            ));
        };

        let content = parts_to_ir_response(&candidate.content.parts);
        let has_call = content
            .iter()
            .any(|p| matches!(p, IrContentPart::ToolUse { .. }));
        let finish_reason = match candidate.finish_reason.as_deref() {
            Some(reason) => Some(gemini_finish_to_ir(reason, has_call)),
            None if has_call => Some(IrFinishReason::ToolCalls),
            None => None,
        };

        Ok(IrChatResponse {
            id,
            model,
            content,
            finish_reason,
            usage,
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GeminiStreamDecoder::default())
    }
}

// --- Encoder impl ---

impl Encoder for GeminiCodec {
    fn encode_request(&self, ir: &IrChatRequest, _model: &str) -> Result<Vec<u8>, AppError> {
        let names: HashMap<String, String> = ir
            .messages
            .iter()
            .flat_map(|m| m.tool_uses())
            .map(|(id, name, _)| (id.to_string(), name.to_string()))
            .collect();

        let mut contents: Vec<GeminiContent> = Vec::new();
        for msg in &ir.messages {
            let parts: Vec<GeminiPart> = msg
                .content
                .iter()
                .filter_map(|p| ir_to_part(p, &names))
                .collect();
            if parts.is_empty() {
                continue;
            }
            let role = match msg.role {
                IrRole::User => "user",
                IrRole::Assistant => "model",
            };
            match contents.last_mut() {
                Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
                _ => contents.push(GeminiContent {
                    role: Some(role.to_string()),
                    parts,
                }),
            }
        }

        let system_instruction = ir
            .system
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: Some(s.clone()),
                    ..Default::default()
                }],
            });

        let mut extra = ir.extra.clone();
        let generation_extra = match extra.remove(GENERATION_CONFIG_EXTRA) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let generation_config = GeminiGenerationConfig {
            temperature: ir.temperature,
            top_p: ir.top_p,
            max_output_tokens: ir.max_tokens,
            stop_sequences: ir.stop.clone(),
            extra: generation_extra,
        };
        let has_generation = generation_config.temperature.is_some()
            || generation_config.top_p.is_some()
            || generation_config.max_output_tokens.is_some()
            || generation_config.stop_sequences.is_some()
            || !generation_config.extra.is_empty();

        let tools = ir.tools.as_ref().filter(|t| !t.is_empty()).map(|ts| {
            vec![GeminiToolDeclaration {
                function_declarations: ts
                    .iter()
                    .map(|t| GeminiFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(clean_schema(&t.parameters)),
                    })
                    .collect(),
            }]
        });

        let tool_config = ir.tool_choice.as_ref().map(|tc| {
            let (mode, allowed) = match tc {
                IrToolChoice::Auto => ("AUTO", None),
                IrToolChoice::None => ("NONE", None),
                IrToolChoice::Any => ("ANY", None),
                IrToolChoice::Tool { name } => ("ANY", Some(vec![name.clone()])),
            };
            GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode: mode.to_string(),
                    allowed_function_names: allowed,
                },
            }
        });

        let req = GeminiRequest {
            contents,
            system_instruction,
            generation_config: if has_generation {
                Some(generation_config)
            } else {
                None
            },
            tools,
            tool_config,
            extra,
        };

        to_json(&req)
    }

    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError> {
        let parts: Vec<GeminiPart> = ir.content.iter().filter_map(ir_to_response_part).collect();

        let resp = GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason: Some(
                    ir_finish_to_gemini(ir.finish_reason.unwrap_or(IrFinishReason::Stop))
                        .to_string(),
                ),
                index: 0,
            }],
            usage_metadata: ir.usage.as_ref().map(GeminiUsageMetadata::from),
            model_version: Some(ir.model.clone()).filter(|m| !m.is_empty()),
            response_id: Some(ir.id.clone()).filter(|id| !id.is_empty()),
            ..Default::default()
        };

        to_json(&resp)
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(GeminiStreamEncoder::default())
    }
}

// --- Stream decoding ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Text,
    Thinking,
}

/// Gemini chunks carry `candidates[].content.parts`. Most upstreams send
/// increments, some resend the full text so far. The mode is fixed per text
/// kind by the second chunk: only a strict extension of the first switches
/// to snapshot diffing. Function calls are never split and are de-duplicated
/// by name and arguments.
#[derive(Debug, Default)]
pub struct GeminiStreamDecoder {
    started: bool,
    open: Option<(u32, TextKind)>,
    next_index: u32,
    text: TextTrack,
    thought: TextTrack,
    seen_calls: HashSet<String>,
    saw_call: bool,
    usage: Option<IrUsage>,
    done: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum TrackMode {
    #[default]
    Undecided,
    Incremental,
    Cumulative,
}

#[derive(Debug, Default)]
struct TextTrack {
    mode: TrackMode,
    accumulated: String,
}

impl TextTrack {
    /// New text carried by `incoming`, if any.
    fn delta(&mut self, incoming: &str) -> Option<String> {
        if incoming.is_empty() {
            return None;
        }
        if self.accumulated.is_empty() {
            self.accumulated.push_str(incoming);
            return Some(incoming.to_string());
        }
        if self.mode == TrackMode::Undecided {
            self.mode = if incoming.len() > self.accumulated.len()
                && incoming.starts_with(self.accumulated.as_str())
            {
                TrackMode::Cumulative
            } else {
                TrackMode::Incremental
            };
        }
        match self.mode {
            TrackMode::Cumulative if incoming.starts_with(self.accumulated.as_str()) => {
                let suffix = incoming[self.accumulated.len()..].to_string();
                self.accumulated = incoming.to_string();
                Some(suffix).filter(|s| !s.is_empty())
            }
            TrackMode::Cumulative => {
                log::warn!("Gemini snapshot diverged from previous text, forwarding as is");
                self.accumulated = incoming.to_string();
                Some(incoming.to_string())
            }
            _ => Some(incoming.to_string()),
        }
    }
}

impl GeminiStreamDecoder {
    fn close(&mut self, events: &mut Vec<IrStreamEvent>) {
        if let Some((index, _)) = self.open.take() {
            events.push(IrStreamEvent::ContentBlockStop { index });
        }
    }

    fn allocate(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn text_delta(&mut self, kind: TextKind, text: String, events: &mut Vec<IrStreamEvent>) {
        let index = match self.open {
            Some((index, open_kind)) if open_kind == kind => index,
            _ => {
                self.close(events);
                let index = self.allocate();
                self.open = Some((index, kind));
                events.push(IrStreamEvent::ContentBlockStart {
                    index,
                    block: match kind {
                        TextKind::Text => IrBlockStart::Text,
                        TextKind::Thinking => IrBlockStart::Thinking,
                    },
                });
                index
            }
        };
        let delta = match kind {
            TextKind::Text => IrDelta::Text(text),
            TextKind::Thinking => IrDelta::Thinking(text),
        };
        events.push(IrStreamEvent::ContentDelta { index, delta });
    }

    fn function_call(&mut self, call: &GeminiFunctionCall, events: &mut Vec<IrStreamEvent>) {
        let key = format!("{}\u{0}{}", call.name, call.args);
        if !self.seen_calls.insert(key) {
            return;
        }
        self.saw_call = true;
        self.close(events);
        let index = self.allocate();
        events.push(IrStreamEvent::ContentBlockStart {
            index,
            block: IrBlockStart::ToolUse {
                id: new_call_id(),
                name: call.name.clone(),
            },
        });
        let args = if call.args.is_null() {
            "{}".to_string()
        } else {
            input_to_arguments(&call.args)
        };
        events.push(IrStreamEvent::ContentDelta {
            index,
            delta: IrDelta::ToolArgs(args),
        });
        events.push(IrStreamEvent::ContentBlockStop { index });
    }

    fn finalize(&mut self, reason: Option<&str>, events: &mut Vec<IrStreamEvent>) {
        if self.done || !self.started {
            return;
        }
        self.done = true;
        self.close(events);
        let finish = match reason {
            Some(reason) => gemini_finish_to_ir(reason, self.saw_call),
            None if self.saw_call => IrFinishReason::ToolCalls,
            None => IrFinishReason::Stop,
        };
        events.push(IrStreamEvent::MessageDelta {
            finish_reason: Some(finish),
            usage: self.usage,
        });
        events.push(IrStreamEvent::MessageStop);
    }
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode_frame(&mut self, frame: &SseFrame) -> Result<Vec<IrStreamEvent>, AppError> {
        let mut events = Vec::new();
        if self.done || frame.data.trim().is_empty() {
            return Ok(events);
        }

        let chunk: GeminiResponse = from_json_str(&frame.data)?;

        if let Some(err) = &chunk.error {
            self.done = true;
            events.push(IrStreamEvent::Error {
                kind: err
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("api_error")
                    .to_string(),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| err.to_string()),
            });
            return Ok(events);
        }

        if !self.started {
            self.started = true;
            events.push(IrStreamEvent::MessageStart {
                id: chunk.response_id.clone().unwrap_or_default(),
                model: chunk.model_version.clone().unwrap_or_default(),
                usage: None,
            });
        }

        if let Some(usage) = &chunk.usage_metadata {
            self.usage = Some(usage.into());
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(events);
        };

        for part in &candidate.content.parts {
            if let Some(call) = &part.function_call {
                self.function_call(call, &mut events);
                continue;
            }
            let Some(text) = &part.text else {
                continue;
            };
            if part.thought == Some(true) {
                if let Some(delta) = self.thought.delta(text) {
                    self.text_delta(TextKind::Thinking, delta, &mut events);
                }
            } else if let Some(delta) = self.text.delta(text) {
                self.text_delta(TextKind::Text, delta, &mut events);
            }
        }

        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.finalize(Some(reason), &mut events);
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<IrStreamEvent> {
        let mut events = Vec::new();
        self.finalize(None, &mut events);
        events
    }
}

// --- Stream encoding ---

#[derive(Debug, Default)]
pub struct GeminiStreamEncoder {
    id: String,
    model: String,
    pending_calls: HashMap<u32, (String, String)>,
}

impl GeminiStreamEncoder {
    fn frame(
        &self,
        parts: Vec<GeminiPart>,
        finish_reason: Option<&str>,
        usage: Option<&IrUsage>,
    ) -> Result<SseFrame, AppError> {
        let chunk = GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason: finish_reason.map(String::from),
                index: 0,
            }],
            usage_metadata: usage.map(GeminiUsageMetadata::from),
            model_version: Some(self.model.clone()).filter(|m| !m.is_empty()),
            response_id: Some(self.id.clone()).filter(|id| !id.is_empty()),
            ..Default::default()
        };
        Ok(SseFrame::data(to_json_str(&chunk)?))
    }
}

impl StreamEncoder for GeminiStreamEncoder {
    fn encode_event(&mut self, event: &IrStreamEvent) -> Result<Vec<SseFrame>, AppError> {
        let frame = match event {
            IrStreamEvent::MessageStart { id, model, .. } => {
                self.id = id.clone();
                self.model = model.clone();
                return Ok(Vec::new());
            }
            IrStreamEvent::ContentBlockStart {
                index,
                block: IrBlockStart::ToolUse { name, .. },
            } => {
                self.pending_calls
                    .insert(*index, (name.clone(), String::new()));
                return Ok(Vec::new());
            }
            IrStreamEvent::ContentDelta { index, delta } => match delta {
                IrDelta::Text(text) => self.frame(
                    vec![GeminiPart {
                        text: Some(text.clone()),
                        ..Default::default()
                    }],
                    None,
                    None,
                )?,
                IrDelta::Thinking(text) => self.frame(
                    vec![GeminiPart {
                        text: Some(text.clone()),
                        thought: Some(true),
                        ..Default::default()
                    }],
                    None,
                    None,
                )?,
                IrDelta::ToolArgs(args) => {
                    if let Some((_, buffered)) = self.pending_calls.get_mut(index) {
                        buffered.push_str(args);
                    }
                    return Ok(Vec::new());
                }
            },
            IrStreamEvent::ContentBlockStop { index } => {
                let Some((name, args)) = self.pending_calls.remove(index) else {
                    return Ok(Vec::new());
                };
                self.frame(
                    vec![GeminiPart {
                        function_call: Some(GeminiFunctionCall {
                            name,
                            args: arguments_to_input(&args),
                        }),
                        ..Default::default()
                    }],
                    None,
                    None,
                )?
            }
            IrStreamEvent::MessageDelta {
                finish_reason,
                usage,
            } => self.frame(
                vec![GeminiPart {
                    text: Some(String::new()),
                    ..Default::default()
                }],
                Some(ir_finish_to_gemini(
                    finish_reason.unwrap_or(IrFinishReason::Stop),
                )),
                usage.as_ref(),
            )?,
            IrStreamEvent::Error { kind, message } => SseFrame::data(to_json_str(&error_body(
                Dialect::Gemini,
                StatusCode::INTERNAL_SERVER_ERROR,
                kind,
                message,
            ))?),
            IrStreamEvent::ContentBlockStart { .. }
            | IrStreamEvent::MessageStop
            | IrStreamEvent::Ping => return Ok(Vec::new()),
        };
        Ok(vec![frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: Value) -> IrChatRequest {
        GeminiCodec
            .decode_request(serde_json::to_vec(&body).unwrap().as_slice())
            .unwrap()
    }

    #[test]
    fn decode_request_pairs_calls_and_responses_by_name() {
        let ir = decode(serde_json::json!({
            "systemInstruction": {"parts": [{"text": "Be brief."}]},
            "contents": [
                {"role": "user", "parts": [{"text": "weather?"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "get_weather", "response": {"content": "sunny"}}}]}
            ],
            "generationConfig": {"temperature": 0.2, "maxOutputTokens": 100, "topK": 4},
            "toolConfig": {"functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": ["get_weather"]}},
            "safetySettings": []
        }));

        assert_eq!(ir.system.as_deref(), Some("Be brief."));
        assert_eq!(ir.messages[1].role, IrRole::Assistant);
        let (call_id, _, _) = ir.messages[1].tool_uses().next().unwrap();
        match &ir.messages[2].content[0] {
            IrContentPart::ToolResult {
                tool_use_id,
                content,
                name,
                ..
            } => {
                assert_eq!(tool_use_id, call_id);
                assert_eq!(content, "sunny");
                assert_eq!(name.as_deref(), Some("get_weather"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ir.max_tokens, Some(100));
        assert_eq!(
            ir.tool_choice,
            Some(IrToolChoice::Tool {
                name: "get_weather".into()
            })
        );
        assert_eq!(ir.extra[GENERATION_CONFIG_EXTRA]["topK"], 4);
        assert!(ir.extra.contains_key("safetySettings"));
    }

    #[test]
    fn completions_body_carries_model_and_stream() {
        let ir = decode(serde_json::json!({
            "model": "gemini-1.5-pro",
            "stream": true,
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
        }));
        assert_eq!(ir.model, "gemini-1.5-pro");
        assert!(ir.stream);
        assert!(ir.extra.is_empty());
    }

    #[test]
    fn encode_request_restores_generation_config_and_function_names() {
        let mut extra = Map::new();
        extra.insert(
            GENERATION_CONFIG_EXTRA.to_string(),
            serde_json::json!({"topK": 4}),
        );
        let ir = IrChatRequest {
            model: "m".into(),
            messages: vec![
                IrMessage::new(
                    IrRole::Assistant,
                    vec![IrContentPart::ToolUse {
                        id: "c1".into(),
                        name: "get_weather".into(),
                        input: serde_json::json!({"city": "Paris"}),
                    }],
                ),
                IrMessage::new(
                    IrRole::User,
                    vec![IrContentPart::ToolResult {
                        tool_use_id: "c1".into(),
                        name: None,
                        content: "sunny".into(),
                        is_error: false,
                    }],
                ),
            ],
            temperature: Some(0.5),
            tools: Some(vec![IrTool {
                name: "get_weather".into(),
                description: None,
                parameters: serde_json::json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {"city": {"type": "string"}}
                }),
            }]),
            extra,
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&GeminiCodec.encode_request(&ir, "m").unwrap()).unwrap();

        assert_eq!(body["generationConfig"]["topK"], 4);
        assert_eq!(body["generationConfig"]["temperature"], 0.5);
        assert_eq!(body["contents"][1]["parts"][0]["functionResponse"]["name"], "get_weather");
        assert_eq!(
            body["contents"][1]["parts"][0]["functionResponse"]["response"],
            serde_json::json!({"content": "sunny"})
        );
        let params = &body["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(params.get("$schema").is_none());
        assert!(params.get("additionalProperties").is_none());
        assert!(body.get("model").is_none());
    }

    #[test]
    fn decode_response_marks_function_calls() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15}
        });
        let ir = GeminiCodec
            .decode_response(&serde_json::to_vec(&body).unwrap())
            .unwrap();
        assert_eq!(ir.finish_reason, Some(IrFinishReason::ToolCalls));
        assert!(ir.has_tool_use());
        assert_eq!(ir.usage.unwrap().total(), 15);
    }

    #[test]
    fn encode_response_maps_tool_calls_to_stop() {
        let ir = IrChatResponse {
            id: "chatcmpl-1".into(),
            model: "gpt-4o".into(),
            content: vec![IrContentPart::ToolUse {
                id: "c1".into(),
                name: "get_weather".into(),
                input: serde_json::json!({"city": "Paris"}),
            }],
            finish_reason: Some(IrFinishReason::ToolCalls),
            usage: None,
        };
        let body: Value =
            serde_json::from_slice(&GeminiCodec.encode_response(&ir).unwrap()).unwrap();
        assert_eq!(
            body["candidates"][0]["content"]["parts"][0]["functionCall"],
            serde_json::json!({"name": "get_weather", "args": {"city": "Paris"}})
        );
        assert_eq!(body["candidates"][0]["finishReason"], "STOP");
    }

    #[test]
    fn stream_decoder_diffs_cumulative_snapshots_and_dedups_calls() {
        let mut decoder = GeminiStreamDecoder::default();
        let chunks = [
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"f","args":{"a":1}}}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"f","args":{"a":1}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2,"totalTokenCount":5}}"#,
        ];
        let events: Vec<IrStreamEvent> = chunks
            .iter()
            .flat_map(|c| decoder.decode_frame(&SseFrame::data(*c)).unwrap())
            .collect();

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                IrStreamEvent::ContentDelta {
                    delta: IrDelta::Text(t),
                    ..
                } => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        let tool_starts = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    IrStreamEvent::ContentBlockStart {
                        block: IrBlockStart::ToolUse { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(tool_starts, 1);
        assert!(events.contains(&IrStreamEvent::MessageDelta {
            finish_reason: Some(IrFinishReason::ToolCalls),
            usage: Some(IrUsage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: Some(5)
            }),
        }));
        assert_eq!(events.last(), Some(&IrStreamEvent::MessageStop));
        assert!(decoder.finish().is_empty());
    }

    fn streamed_text(decoder: &mut GeminiStreamDecoder, texts: &[&str]) -> String {
        texts
            .iter()
            .flat_map(|t| {
                let chunk = serde_json::json!({
                    "candidates": [{"content": {"role": "model", "parts": [{"text": t}]}}]
                });
                decoder
                    .decode_frame(&SseFrame::data(chunk.to_string()))
                    .unwrap()
            })
            .filter_map(|e| match e {
                IrStreamEvent::ContentDelta {
                    delta: IrDelta::Text(t),
                    ..
                } => Some(t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn stream_decoder_keeps_repeated_increments() {
        let mut decoder = GeminiStreamDecoder::default();
        assert_eq!(streamed_text(&mut decoder, &["ha", "ha", "ha!"]), "hahaha!");

        let mut decoder = GeminiStreamDecoder::default();
        assert_eq!(streamed_text(&mut decoder, &["a", "a", "a"]), "aaa");

        let mut decoder = GeminiStreamDecoder::default();
        assert_eq!(
            streamed_text(&mut decoder, &["The", "The", " cat"]),
            "TheThe cat"
        );
    }

    #[test]
    fn stream_decoder_diffs_snapshots_once_detected() {
        let mut decoder = GeminiStreamDecoder::default();
        assert_eq!(
            streamed_text(&mut decoder, &["ha", "haha", "haha", "hahaha!"]),
            "hahaha!"
        );
    }

    #[test]
    fn stream_encoder_buffers_tool_arguments_until_block_stop() {
        let mut encoder = GeminiStreamEncoder::default();
        let mut frames = Vec::new();
        for event in [
            IrStreamEvent::ContentBlockStart {
                index: 0,
                block: IrBlockStart::ToolUse {
                    id: "c1".into(),
                    name: "get_weather".into(),
                },
            },
            IrStreamEvent::ContentDelta {
                index: 0,
                delta: IrDelta::ToolArgs("{\"city\":".into()),
            },
            IrStreamEvent::ContentDelta {
                index: 0,
                delta: IrDelta::ToolArgs("\"Paris\"}".into()),
            },
            IrStreamEvent::ContentBlockStop { index: 0 },
        ] {
            frames.extend(encoder.encode_event(&event).unwrap());
        }
        assert_eq!(frames.len(), 1);
        let chunk: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(
            chunk["candidates"][0]["content"]["parts"][0]["functionCall"]["args"]["city"],
            "Paris"
        );
    }
}
