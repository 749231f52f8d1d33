use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// IR Chat Request — the dialect-neutral form every parser produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IrChatRequest {
    pub model: String,
    pub messages: Vec<IrMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<IrTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<IrToolChoice>,
    /// Fields the source dialect sent that have no IR counterpart. Only
    /// re-emitted when the target dialect is the source dialect.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrMessage {
    pub role: IrRole,
    pub content: Vec<IrContentPart>,
}

impl IrMessage {
    pub fn new(role: IrRole, content: Vec<IrContentPart>) -> Self {
        Self { role, content }
    }

    pub fn text(role: IrRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![IrContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text parts.
    pub fn to_text(&self) -> String {
        parts_text(&self.content)
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|p| match p {
            IrContentPart::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }

    pub fn has_tool_results(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, IrContentPart::ToolResult { .. }))
    }
}

pub fn parts_text(parts: &[IrContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            IrContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IrRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IrContentPart {
    Text {
        text: String,
    },
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// Function name, when the source dialect carries it (Gemini needs it).
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        content: String,
        is_error: bool,
    },
    Thinking {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl IrContentPart {
    /// Split a `data:` URL into (mime, base64) when possible.
    pub fn image_from_url(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((meta, data)) = rest.split_once(',') {
                let media_type = meta.trim_end_matches(";base64").to_string();
                return IrContentPart::Image {
                    media_type: Some(media_type),
                    data: Some(data.to_string()),
                    url: None,
                };
            }
        }
        IrContentPart::Image {
            media_type: None,
            data: None,
            url: Some(url.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrToolChoice {
    Auto,
    None,
    Any,
    Tool { name: String },
}

// --- Tool argument encoding ---

/// OpenAI carries tool arguments as a JSON string; everyone else as an
/// object. Malformed strings survive as `{"raw": "..."}`.
pub fn arguments_to_input(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(v @ Value::Object(_)) => v,
        _ => serde_json::json!({ "raw": arguments }),
    }
}

pub fn input_to_arguments(input: &Value) -> String {
    if let Value::Object(map) = input {
        if map.len() == 1 {
            if let Some(Value::String(raw)) = map.get("raw") {
                return raw.clone();
            }
        }
    }
    serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string())
}

// --- Response IR ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrChatResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<IrContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<IrFinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<IrUsage>,
}

impl IrChatResponse {
    pub fn text(&self) -> String {
        parts_text(&self.content)
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, IrContentPart::ToolUse { .. }))
    }

    /// Bytes of generated content, for usage approximation.
    pub fn content_len(&self) -> usize {
        self.content
            .iter()
            .map(|p| match p {
                IrContentPart::Text { text } | IrContentPart::Thinking { text, .. } => text.len(),
                IrContentPart::ToolUse { name, input, .. } => {
                    name.len() + input_to_arguments(input).len()
                }
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IrFinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

impl IrUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: Some(prompt_tokens.saturating_add(completion_tokens)),
        }
    }

    pub fn total(&self) -> u32 {
        self.total_tokens
            .unwrap_or(self.prompt_tokens.saturating_add(self.completion_tokens))
    }
}

// --- Streaming IR ---

/// Canonical stream event. Block-structured: every `ContentBlockStart` is
/// matched by a `ContentBlockStop` with the same index, and a stream ends with
/// exactly one `MessageStop` or one `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum IrStreamEvent {
    MessageStart {
        id: String,
        model: String,
        usage: Option<IrUsage>,
    },
    ContentBlockStart {
        index: u32,
        block: IrBlockStart,
    },
    ContentDelta {
        index: u32,
        delta: IrDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        finish_reason: Option<IrFinishReason>,
        usage: Option<IrUsage>,
    },
    MessageStop,
    Ping,
    Error {
        kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrBlockStart {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrDelta {
    Text(String),
    ToolArgs(String),
    Thinking(String),
}

impl IrDelta {
    pub fn len(&self) -> usize {
        match self {
            IrDelta::Text(s) | IrDelta::ToolArgs(s) | IrDelta::Thinking(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
