pub mod anthropic;
pub mod cursor;
pub mod gemini;
pub mod helpers;
pub mod ir;
pub mod openai_chat;
pub mod stream;

use crate::error::AppError;
use ir::{IrChatRequest, IrChatResponse, IrStreamEvent};
use stream::SseFrame;

/// One of the four wire protocols a client or upstream can speak.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Dialect {
    Openai,
    Claude,
    Gemini,
    Cursor,
}

impl Dialect {
    pub const ALL: [Dialect; 4] = [Self::Openai, Self::Claude, Self::Gemini, Self::Cursor];

    /// Parse from a stored tag, header value, or provider name.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "openai-chat" | "openai_chat" => Some(Self::Openai),
            "claude" | "anthropic" => Some(Self::Claude),
            "gemini" | "google" => Some(Self::Gemini),
            "cursor" => Some(Self::Cursor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Cursor => "cursor",
        }
    }

    /// Dialects that share a wire format. Cursor is OpenAI on the wire.
    pub fn wire_family(&self) -> Dialect {
        match self {
            Self::Cursor => Self::Openai,
            other => *other,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes a provider-specific format into IR.
pub trait Decoder: Send + Sync {
    /// Decode an incoming HTTP request body into IR.
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError>;

    /// Decode a non-streaming upstream response body into IR.
    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError>;

    /// Fresh per-stream decoder state.
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;
}

/// Encodes IR into a provider-specific format.
pub trait Encoder: Send + Sync {
    /// Encode IR request into bytes to send upstream.
    fn encode_request(&self, ir: &IrChatRequest, model: &str) -> Result<Vec<u8>, AppError>;

    /// Encode IR response into bytes to send downstream.
    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError>;

    /// Fresh per-stream encoder state.
    fn stream_encoder(&self) -> Box<dyn StreamEncoder>;
}

/// Turns upstream SSE frames into canonical stream events.
pub trait StreamDecoder: Send {
    fn decode_frame(&mut self, frame: &SseFrame) -> Result<Vec<IrStreamEvent>, AppError>;

    /// Upstream closed the stream. Emit whatever was held back.
    fn finish(&mut self) -> Vec<IrStreamEvent>;
}

/// Turns canonical stream events into downstream SSE frames.
pub trait StreamEncoder: Send {
    fn encode_event(&mut self, event: &IrStreamEvent) -> Result<Vec<SseFrame>, AppError>;
}

/// Get a decoder for a given dialect.
pub fn get_decoder(dialect: Dialect) -> Box<dyn Decoder> {
    match dialect {
        Dialect::Openai => Box::new(openai_chat::OpenAiChatCodec),
        Dialect::Claude => Box::new(anthropic::AnthropicCodec),
        Dialect::Gemini => Box::new(gemini::GeminiCodec),
        Dialect::Cursor => Box::new(cursor::CursorCodec),
    }
}

/// Get an encoder for a given dialect.
pub fn get_encoder(dialect: Dialect) -> Box<dyn Encoder> {
    match dialect {
        Dialect::Openai => Box::new(openai_chat::OpenAiChatCodec),
        Dialect::Claude => Box::new(anthropic::AnthropicCodec),
        Dialect::Gemini => Box::new(gemini::GeminiCodec),
        Dialect::Cursor => Box::new(cursor::CursorCodec),
    }
}
