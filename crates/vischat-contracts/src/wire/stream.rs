use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;

/// One framed line of a streamed completion body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Payload(String),
    Done,
}

/// Splits a streamed body into lines, carrying partial lines across reads.
///
/// A tail without a newline is released early when it is already a complete
/// JSON payload or the `[DONE]` marker, so servers that send one event per
/// write without line terminators still stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamLine> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = classify_line(&String::from_utf8_lossy(&raw)) {
                lines.push(line);
            }
        }
        if let Some(line) = self.take_complete_tail() {
            lines.push(line);
        }
        lines
    }

    /// Flushes whatever is left once the body is exhausted.
    pub fn finish(&mut self) -> Option<StreamLine> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        classify_line(&String::from_utf8_lossy(&raw))
    }

    fn take_complete_tail(&mut self) -> Option<StreamLine> {
        let text = std::str::from_utf8(&self.pending).ok()?;
        let line = match classify_line(text)? {
            StreamLine::Done => StreamLine::Done,
            StreamLine::Payload(payload)
                if serde_json::from_str::<IgnoredAny>(&payload).is_ok() =>
            {
                StreamLine::Payload(payload)
            }
            StreamLine::Payload(_) => return None,
        };
        self.pending.clear();
        Some(line)
    }
}

/// Trims a raw line and strips the `data:` token. Blank lines and SSE
/// comments yield nothing.
pub fn classify_line(raw: &str) -> Option<StreamLine> {
    let trimmed = raw.trim();
    if trimmed.starts_with(':') {
        return None;
    }
    let payload = trimmed.strip_prefix("data:").unwrap_or(trimmed).trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(StreamLine::Done);
    }
    Some(StreamLine::Payload(payload.to_string()))
}

/// Text carried by one chunk, tagged with the shape it was found in.
///
/// Precedence when several are present: `Message` > `ChoiceMessage` >
/// `ChoiceDelta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkContent {
    /// `{"message": {"content": ...}}`, as sent by Ollama-style servers.
    Message(String),
    /// `{"choices": [{"message": {"content": ...}}]}`, a full completion.
    ChoiceMessage(String),
    /// `{"choices": [{"delta": {"content": ...}}]}`, an incremental delta.
    ChoiceDelta(String),
    Empty,
}

impl ChunkContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            ChunkContent::Message(text)
            | ChunkContent::ChoiceMessage(text)
            | ChunkContent::ChoiceDelta(text) => Some(text.as_str()),
            ChunkContent::Empty => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamErrorKind {
    InvalidJson,
    Provider,
}

#[derive(Debug, Clone)]
pub struct StreamError {
    kind: StreamErrorKind,
    message: String,
}

impl StreamError {
    fn invalid_json(line: &str, err: serde_json::Error) -> Self {
        Self {
            kind: StreamErrorKind::InvalidJson,
            message: format!("invalid stream chunk ({err}): {}", truncate_line(line, 120)),
        }
    }

    fn provider(message: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Provider,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> StreamErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StreamError {}

#[derive(Debug, Deserialize)]
struct RawChunk {
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    delta: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Option<Value>,
}

impl RawMessage {
    fn text(&self) -> Option<String> {
        self.content
            .as_ref()
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

pub fn decode_chunk(line: &str) -> Result<ChunkContent, StreamError> {
    let chunk: RawChunk =
        serde_json::from_str(line).map_err(|err| StreamError::invalid_json(line, err))?;

    if let Some(error) = chunk.error.as_ref().filter(|value| !value.is_null()) {
        return Err(StreamError::provider(provider_error_message(error)));
    }

    if let Some(text) = chunk.message.as_ref().and_then(RawMessage::text) {
        return Ok(ChunkContent::Message(text));
    }
    let first = chunk.choices.first();
    if let Some(text) = first
        .and_then(|choice| choice.message.as_ref())
        .and_then(RawMessage::text)
    {
        return Ok(ChunkContent::ChoiceMessage(text));
    }
    if let Some(text) = first
        .and_then(|choice| choice.delta.as_ref())
        .and_then(RawMessage::text)
    {
        return Ok(ChunkContent::ChoiceDelta(text));
    }
    Ok(ChunkContent::Empty)
}

fn provider_error_message(error: &Value) -> String {
    if let Some(object) = error.as_object() {
        for key in ["message", "type", "code"] {
            if let Some(value) = object
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
            {
                return format!("provider error: {value}");
            }
        }
    }
    if let Some(text) = error.as_str().map(str::trim).filter(|text| !text.is_empty()) {
        return format!("provider error: {text}");
    }
    format!("provider error: {error}")
}

fn truncate_line(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::{classify_line, decode_chunk, ChunkContent, LineFramer, StreamErrorKind, StreamLine};

    #[test]
    fn classify_strips_data_prefix_and_blank_lines() {
        assert_eq!(
            classify_line("  data: {\"a\":1}  \r"),
            Some(StreamLine::Payload("{\"a\":1}".to_string()))
        );
        assert_eq!(classify_line("data:[DONE]"), Some(StreamLine::Done));
        assert_eq!(classify_line("data:   "), None);
        assert_eq!(classify_line(": keep-alive"), None);
        assert_eq!(classify_line("   "), None);
    }

    #[test]
    fn framer_carries_partial_lines() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"data: {\"choices\":[{\"del").is_empty());
        let lines = framer.push(b"ta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(
            lines,
            vec![
                StreamLine::Payload("{\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}".to_string()),
                StreamLine::Done,
            ]
        );
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn framer_releases_unterminated_complete_events() {
        let mut framer = LineFramer::new();
        let first = framer.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}");
        assert_eq!(first.len(), 1);
        assert_eq!(framer.push(b"[DONE]"), vec![StreamLine::Done]);
    }

    #[test]
    fn framer_keeps_split_multibyte_characters() {
        let mut framer = LineFramer::new();
        let text = "data: {\"message\":{\"content\":\"é\"}}\n".as_bytes();
        let split = text.len() - 5;
        assert!(framer.push(&text[..split]).is_empty());
        let lines = framer.push(&text[split..]);
        assert_eq!(
            lines,
            vec![StreamLine::Payload("{\"message\":{\"content\":\"é\"}}".to_string())]
        );
    }

    #[test]
    fn decode_prefers_direct_message_then_full_then_delta() {
        assert_eq!(
            decode_chunk(r#"{"message":{"content":"a"},"choices":[{"delta":{"content":"b"}}]}"#)
                .unwrap(),
            ChunkContent::Message("a".to_string())
        );
        assert_eq!(
            decode_chunk(r#"{"choices":[{"message":{"content":"full"},"delta":{"content":"d"}}]}"#)
                .unwrap(),
            ChunkContent::ChoiceMessage("full".to_string())
        );
        assert_eq!(
            decode_chunk(r#"{"message":{"content":""},"choices":[{"delta":{"content":"d"}}]}"#)
                .unwrap(),
            ChunkContent::ChoiceDelta("d".to_string())
        );
    }

    #[test]
    fn decode_role_only_delta_is_empty() {
        let content = decode_chunk(r#"{"choices":[{"delta":{"role":"assistant","content":null}}]}"#)
            .unwrap();
        assert_eq!(content, ChunkContent::Empty);
        assert_eq!(content.text(), None);
        assert_eq!(decode_chunk("{}").unwrap(), ChunkContent::Empty);
    }

    #[test]
    fn decode_reports_invalid_json() {
        let err = decode_chunk("{not json").unwrap_err();
        assert_eq!(err.kind(), StreamErrorKind::InvalidJson);
        assert!(err.message().contains("{not json"));
    }

    #[test]
    fn decode_reports_provider_errors() {
        let err = decode_chunk(r#"{"error":{"message":"rate limited","type":"rate_limit"}}"#)
            .unwrap_err();
        assert_eq!(err.kind(), StreamErrorKind::Provider);
        assert_eq!(err.to_string(), "provider error: rate limited");
    }
}
