//! Stream framing and record decoding.
//!
//! Backends disagree on record shape: OpenAI-compatible servers send
//! `choices[].delta`, Ollama sends `message`/`response` objects with a `done`
//! flag, llama.cpp sends `content` with a `stop` flag. All of them decode into
//! one `PartialResult`.

use serde::Deserialize;

use crate::dispatch::{PartialResult, ToolCallDelta, Usage};
use crate::error::GustError;

/// Outcome of decoding a single frame.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Record(PartialResult),
    /// End-of-stream sentinel (`[DONE]`).
    Done,
    /// Keep-alives, comments and blank lines.
    Skip,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct StreamRecord {
    choices: Option<Vec<ChoiceRecord>>,
    message: Option<MessageRecord>,
    response: Option<String>,
    content: Option<String>,
    done: Option<bool>,
    stop: Option<bool>,
    usage: Option<UsageRecord>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
    tokens_evaluated: Option<u64>,
    tokens_predicted: Option<u64>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ChoiceRecord {
    delta: Option<MessageRecord>,
    message: Option<MessageRecord>,
    text: Option<String>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct MessageRecord {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallRecord>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ToolCallRecord {
    index: Option<usize>,
    id: Option<String>,
    function: Option<FunctionRecord>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FunctionRecord {
    name: Option<String>,
    arguments: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct UsageRecord {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Strip SSE field syntax from a raw line. Returns `None` for lines that
/// carry no data (comments, `event:`/`id:`/`retry:` fields).
pub fn strip_sse_prefix(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(rest.trim_start());
    }
    if ["event:", "id:", "retry:"].iter().any(|p| line.starts_with(p)) {
        return None;
    }
    Some(line)
}

/// Decode one frame payload (already stripped of SSE syntax).
pub fn decode_record(payload: &str) -> Result<Decoded, GustError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Decoded::Skip);
    }
    if payload == "[DONE]" {
        return Ok(Decoded::Done);
    }

    let record: StreamRecord = serde_json::from_str(payload)
        .map_err(|e| GustError::SchemaParse(format!("stream record: {e}")))?;

    if let Some(err) = record.error {
        let message = match err {
            serde_json::Value::String(s) => s,
            serde_json::Value::Object(ref o) => o
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
            other => other.to_string(),
        };
        return Err(GustError::Upstream {
            provider: "stream".to_string(),
            message,
            status: None,
        });
    }

    let mut result = PartialResult::default();
    let mut finished = record.done.unwrap_or(false) || record.stop.unwrap_or(false);

    if let Some(choice) = record.choices.and_then(|c| c.into_iter().next()) {
        if choice.finish_reason.is_some() {
            finished = true;
        }
        if let Some(text) = choice.text {
            result.content.push_str(&text);
        }
        for msg in [choice.delta, choice.message].into_iter().flatten() {
            absorb_message(&mut result, msg);
        }
    }
    if let Some(msg) = record.message {
        absorb_message(&mut result, msg);
    }
    if let Some(text) = record.response.or(record.content) {
        result.content.push_str(&text);
    }

    result.usage = match (record.usage, record.prompt_eval_count.or(record.tokens_evaluated)) {
        (Some(u), _) => Some(Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
        (None, Some(prompt)) => Some(Usage {
            prompt_tokens: prompt,
            completion_tokens: record.eval_count.or(record.tokens_predicted).unwrap_or(0),
        }),
        (None, None) => None,
    };
    result.done = finished;
    Ok(Decoded::Record(result))
}

fn absorb_message(result: &mut PartialResult, msg: MessageRecord) {
    if let Some(text) = msg.content {
        result.content.push_str(&text);
    }
    for (position, call) in msg.tool_calls.unwrap_or_default().into_iter().enumerate() {
        let function = call.function.unwrap_or_default();
        let arguments = match function.arguments {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        result.tool_calls.push(ToolCallDelta {
            index: call.index.unwrap_or(position),
            id: call.id,
            name: function.name,
            arguments,
        });
    }
}

/// Accumulates raw bytes and yields complete newline-terminated lines.
/// Bytes are kept until a full line is present so multi-byte characters
/// split across network chunks decode correctly. A line longer than `limit`
/// bytes is an error.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, GustError> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            if pos > self.limit {
                return Err(self.overflow());
            }
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        if self.buf.len() > self.limit {
            return Err(self.overflow());
        }
        Ok(lines)
    }

    fn overflow(&mut self) -> GustError {
        self.buf.clear();
        GustError::SchemaParse(format!("stream line exceeds {} bytes", self.limit))
    }

    /// Whatever remains after the stream closed without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}
