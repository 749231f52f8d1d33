use super::helpers::{parse_request, to_json};
use super::ir::*;
use super::openai_chat::OpenAiChatCodec;
use super::{Decoder, Encoder, StreamDecoder, StreamEncoder};
use crate::error::AppError;
use serde_json::{json, Map, Value};

/// Cursor codec: OpenAI chat completions on the wire, except that message
/// content may arrive as Claude-style parts. Requests are normalized to plain
/// OpenAI before decoding; everything else delegates.
pub struct CursorCodec;

fn block_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn image_block_to_image_url(block: &Value) -> Option<Value> {
    let source = block.get("source")?;
    let url = match source.get("type").and_then(Value::as_str) {
        Some("url") => source.get("url")?.as_str()?.to_string(),
        _ => format!(
            "data:{};base64,{}",
            source
                .get("media_type")
                .and_then(Value::as_str)
                .unwrap_or("image/png"),
            source.get("data")?.as_str()?
        ),
    };
    Some(json!({ "type": "image_url", "image_url": { "url": url } }))
}

/// Rewrite one message whose content is a parts array. Returns the tool
/// messages it expands into, followed by the message itself when anything
/// is left of it.
fn normalize_message(mut message: Map<String, Value>) -> Vec<Value> {
    let Some(Value::Array(parts)) = message.get("content").cloned() else {
        return vec![Value::Object(message)];
    };

    let mut text = String::new();
    let mut images = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_messages = Vec::new();

    for part in &parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") | Some("input_text") => {
                if let Some(t) = part.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("image_url") => images.push(part.clone()),
            Some("image") => images.extend(image_block_to_image_url(part)),
            Some("tool_use") => {
                let input = part.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(json!({
                    "id": part.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": part.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": input_to_arguments(&input),
                    }
                }));
            }
            Some("tool_result") => tool_messages.push(json!({
                "role": "tool",
                "tool_call_id": part.get("tool_use_id").cloned().unwrap_or(Value::Null),
                "content": block_text(part.get("content").unwrap_or(&Value::Null)),
            })),
            _ => {}
        }
    }

    let content = if images.is_empty() {
        if text.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        }
    } else {
        let mut items = Vec::with_capacity(images.len() + 1);
        if !text.is_empty() {
            items.push(json!({ "type": "text", "text": text }));
        }
        items.extend(images);
        Value::Array(items)
    };

    if !tool_calls.is_empty() {
        match message.get_mut("tool_calls") {
            Some(Value::Array(existing)) => existing.extend(tool_calls),
            _ => {
                message.insert("tool_calls".to_string(), Value::Array(tool_calls));
            }
        }
    }

    let keep = !content.is_null() || message.contains_key("tool_calls");
    message.insert("content".to_string(), content);

    let mut out = tool_messages;
    if keep {
        out.push(Value::Object(message));
    }
    out
}

/// Collapse Claude-style message parts into the OpenAI chat shape.
pub fn normalize_body(mut body: Value) -> Value {
    if let Some(Value::Array(messages)) = body.get_mut("messages") {
        let normalized: Vec<Value> = std::mem::take(messages)
            .into_iter()
            .flat_map(|m| match m {
                Value::Object(map) => normalize_message(map),
                other => vec![other],
            })
            .collect();
        *messages = normalized;
    }
    body
}

impl Decoder for CursorCodec {
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError> {
        let value: Value = parse_request(body)?;
        let normalized = to_json(&normalize_body(value))?;
        OpenAiChatCodec.decode_request(&normalized)
    }

    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError> {
        OpenAiChatCodec.decode_response(body)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        OpenAiChatCodec.stream_decoder()
    }
}

impl Encoder for CursorCodec {
    fn encode_request(&self, ir: &IrChatRequest, model: &str) -> Result<Vec<u8>, AppError> {
        OpenAiChatCodec.encode_request(ir, model)
    }

    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError> {
        OpenAiChatCodec.encode_response(ir)
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        OpenAiChatCodec.stream_encoder()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: Value) -> IrChatRequest {
        CursorCodec
            .decode_request(serde_json::to_vec(&body).unwrap().as_slice())
            .unwrap()
    }

    #[test]
    fn collapses_text_parts_to_a_string() {
        let body = normalize_body(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "there"}
            ]}]
        }));
        assert_eq!(body["messages"][0]["content"], "Hello there");
    }

    #[test]
    fn tool_use_parts_become_tool_calls() {
        let ir = decode(json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Checking."},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "sunny"}]},
                    {"type": "text", "text": "thanks"}
                ]}
            ]
        }));

        let (id, name, input) = ir.messages[1].tool_uses().next().unwrap();
        assert_eq!(id, "toolu_1");
        assert_eq!(name, "get_weather");
        assert_eq!(input["city"], "Paris");
        assert_eq!(ir.messages[1].to_text(), "Checking.");

        assert_eq!(ir.messages.len(), 4);
        assert!(matches!(
            &ir.messages[2].content[0],
            IrContentPart::ToolResult { tool_use_id, content, .. }
                if tool_use_id == "toolu_1" && content == "sunny"
        ));
        assert_eq!(ir.messages[3].to_text(), "thanks");
    }

    #[test]
    fn base64_image_blocks_become_data_urls() {
        let body = normalize_body(json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
            ]}]
        }));
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    #[test]
    fn plain_openai_bodies_pass_through() {
        let ir = decode(json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "hi"}]
        }));
        assert_eq!(ir.system.as_deref(), Some("sys"));
        assert!(ir.stream);
        assert_eq!(ir.messages.len(), 1);
    }
}
