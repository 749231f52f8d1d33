use super::helpers::{new_call_id, new_id};
use super::ir::*;
use super::{StreamDecoder, StreamEncoder};
use crate::error::AppError;
use bytes::Bytes;
use std::collections::BTreeSet;

/// One server-sent event: an optional `event:` name and its `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }

    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser. Upstream chunks may split frames, lines, or even
/// UTF-8 sequences anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line, &mut frames);
        }
        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let mut frames = Vec::new();
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.process_line(&line, &mut frames);
        }
        self.dispatch(&mut frames);
        frames.pop()
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.dispatch(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, frames: &mut Vec<SseFrame>) {
        if self.data.is_empty() {
            self.event = None;
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed { kind: String, message: String },
}

/// Drives one upstream stream through a decoder and a downstream encoder.
///
/// Whatever the upstream does, the client sees a well-formed event sequence:
/// a single message start, balanced block start/stop pairs, and exactly one
/// terminal (message stop or error). Usage is accumulated along the way and
/// falls back to a bytes/4 estimate when the upstream never reports it.
pub struct StreamTranslator {
    decoder: Box<dyn StreamDecoder>,
    encoder: Box<dyn StreamEncoder>,
    model: String,
    prompt_estimate: u32,
    started: bool,
    open: BTreeSet<u32>,
    saw_message_delta: bool,
    outcome: Option<StreamOutcome>,
    usage: IrUsage,
    output_bytes: usize,
    blocks_started: usize,
    blocks_stopped: usize,
}

impl StreamTranslator {
    pub fn new(
        decoder: Box<dyn StreamDecoder>,
        encoder: Box<dyn StreamEncoder>,
        model: impl Into<String>,
        prompt_estimate: u32,
    ) -> Self {
        Self {
            decoder,
            encoder,
            model: model.into(),
            prompt_estimate,
            started: false,
            open: BTreeSet::new(),
            saw_message_delta: false,
            outcome: None,
            usage: IrUsage::default(),
            output_bytes: 0,
            blocks_started: 0,
            blocks_stopped: 0,
        }
    }

    pub fn feed(&mut self, frame: &SseFrame) -> Result<Vec<SseFrame>, AppError> {
        if self.outcome.is_some() {
            return Ok(Vec::new());
        }
        let events = match self.decoder.decode_frame(frame) {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Skipping undecodable upstream frame: {}", e);
                return Ok(Vec::new());
            }
        };
        self.process(events)
    }

    /// Upstream reached EOF.
    pub fn finish(&mut self) -> Result<Vec<SseFrame>, AppError> {
        if self.outcome.is_some() {
            return Ok(Vec::new());
        }
        let events = self.decoder.finish();
        let mut out = self.process(events)?;
        if self.outcome.is_none() {
            if self.started {
                self.apply(IrStreamEvent::MessageStop, &mut out)?;
            } else {
                out.extend(self.fail("api_error", "upstream closed the stream without data")?);
            }
        }
        Ok(out)
    }

    /// Terminate with an error frame (idle timeout, transport failure).
    pub fn fail(&mut self, kind: &str, message: &str) -> Result<Vec<SseFrame>, AppError> {
        let mut out = Vec::new();
        if self.outcome.is_none() {
            self.apply(
                IrStreamEvent::Error {
                    kind: kind.to_string(),
                    message: message.to_string(),
                },
                &mut out,
            )?;
        }
        Ok(out)
    }

    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    /// A message start has gone downstream.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn output_bytes(&self) -> usize {
        self.output_bytes
    }

    pub fn blocks_balanced(&self) -> bool {
        self.blocks_started == self.blocks_stopped
    }

    /// Upstream-reported usage where present, estimated otherwise.
    pub fn usage(&self) -> IrUsage {
        let prompt_reported = self.usage.prompt_tokens > 0;
        let completion_reported = self.usage.completion_tokens > 0;
        let prompt = if prompt_reported {
            self.usage.prompt_tokens
        } else {
            self.prompt_estimate
        };
        let completion = if completion_reported {
            self.usage.completion_tokens
        } else {
            estimate_tokens(self.output_bytes)
        };
        match self.usage.total_tokens {
            Some(total) if prompt_reported && completion_reported && total > 0 => IrUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: Some(total),
            },
            _ => IrUsage::new(prompt, completion),
        }
    }

    fn process(&mut self, events: Vec<IrStreamEvent>) -> Result<Vec<SseFrame>, AppError> {
        let mut out = Vec::new();
        for event in events {
            if self.outcome.is_some() {
                break;
            }
            self.apply(event, &mut out)?;
        }
        Ok(out)
    }

    fn emit(&mut self, event: IrStreamEvent, out: &mut Vec<SseFrame>) -> Result<(), AppError> {
        out.extend(self.encoder.encode_event(&event)?);
        Ok(())
    }

    fn merge_usage(&mut self, usage: Option<IrUsage>) {
        if let Some(u) = usage {
            if u.prompt_tokens > 0 {
                self.usage.prompt_tokens = u.prompt_tokens;
            }
            if u.completion_tokens > 0 {
                self.usage.completion_tokens = u.completion_tokens;
            }
            if let Some(total) = u.total_tokens.filter(|t| *t > 0) {
                self.usage.total_tokens = Some(total);
            }
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<SseFrame>) -> Result<(), AppError> {
        if !self.started {
            self.started = true;
            let event = IrStreamEvent::MessageStart {
                id: new_id("msg_"),
                model: self.model.clone(),
                usage: None,
            };
            self.emit(event, out)?;
        }
        Ok(())
    }

    fn close_open(&mut self, out: &mut Vec<SseFrame>) -> Result<(), AppError> {
        for index in std::mem::take(&mut self.open) {
            self.blocks_stopped += 1;
            self.emit(IrStreamEvent::ContentBlockStop { index }, out)?;
        }
        Ok(())
    }

    fn apply(&mut self, event: IrStreamEvent, out: &mut Vec<SseFrame>) -> Result<(), AppError> {
        match event {
            IrStreamEvent::MessageStart { id, model, usage } => {
                self.merge_usage(usage);
                if self.started {
                    return Ok(());
                }
                self.started = true;
                let id = if id.is_empty() { new_id("msg_") } else { id };
                let model = if model.is_empty() {
                    self.model.clone()
                } else {
                    model
                };
                self.emit(IrStreamEvent::MessageStart { id, model, usage }, out)
            }
            IrStreamEvent::ContentBlockStart { index, block } => {
                self.ensure_started(out)?;
                if !self.open.insert(index) {
                    return Ok(());
                }
                self.blocks_started += 1;
                self.emit(IrStreamEvent::ContentBlockStart { index, block }, out)
            }
            IrStreamEvent::ContentDelta { index, delta } => {
                self.ensure_started(out)?;
                if delta.is_empty() {
                    return Ok(());
                }
                if !self.open.contains(&index) {
                    let block = match &delta {
                        IrDelta::Text(_) => IrBlockStart::Text,
                        IrDelta::Thinking(_) => IrBlockStart::Thinking,
                        IrDelta::ToolArgs(_) => IrBlockStart::ToolUse {
                            id: new_call_id(),
                            name: String::new(),
                        },
                    };
                    self.apply(IrStreamEvent::ContentBlockStart { index, block }, out)?;
                }
                self.output_bytes += delta.len();
                self.emit(IrStreamEvent::ContentDelta { index, delta }, out)
            }
            IrStreamEvent::ContentBlockStop { index } => {
                if self.open.remove(&index) {
                    self.blocks_stopped += 1;
                    self.emit(IrStreamEvent::ContentBlockStop { index }, out)?;
                }
                Ok(())
            }
            IrStreamEvent::MessageDelta {
                finish_reason,
                usage,
            } => {
                self.ensure_started(out)?;
                self.close_open(out)?;
                self.merge_usage(usage);
                self.saw_message_delta = true;
                let usage = Some(self.usage());
                self.emit(
                    IrStreamEvent::MessageDelta {
                        finish_reason,
                        usage,
                    },
                    out,
                )
            }
            IrStreamEvent::MessageStop => {
                self.ensure_started(out)?;
                self.close_open(out)?;
                if !self.saw_message_delta {
                    self.saw_message_delta = true;
                    let usage = Some(self.usage());
                    self.emit(
                        IrStreamEvent::MessageDelta {
                            finish_reason: Some(IrFinishReason::Stop),
                            usage,
                        },
                        out,
                    )?;
                }
                self.outcome = Some(StreamOutcome::Completed);
                self.emit(IrStreamEvent::MessageStop, out)
            }
            IrStreamEvent::Ping => self.emit(IrStreamEvent::Ping, out),
            IrStreamEvent::Error { kind, message } => {
                self.close_open(out)?;
                self.outcome = Some(StreamOutcome::Failed {
                    kind: kind.clone(),
                    message: message.clone(),
                });
                self.emit(IrStreamEvent::Error { kind, message }, out)
            }
        }
    }
}

/// Byte-length approximation used when an upstream reports no usage.
pub fn estimate_tokens(bytes: usize) -> u32 {
    bytes.div_ceil(4).min(u32::MAX as usize) as u32
}
