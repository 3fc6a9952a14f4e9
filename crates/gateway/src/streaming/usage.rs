use serde_json::Value;

/// Usage totals accumulated over one SSE stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl StreamUsage {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Split complete SSE frames off the front of `buffer`. Returns
/// `(payload, raw)` pairs where `raw` includes the frame separator, so
/// filters can re-emit kept frames byte-for-byte. Frames are delimited by
/// `\r\n\r\n` or `\n\n`; a trailing partial frame stays in the buffer.
pub(crate) fn drain_frames(buffer: &mut String) -> Vec<(String, String)> {
    let mut frames = Vec::new();

    loop {
        let crlf = buffer.find("\r\n\r\n");
        let lf = buffer.find("\n\n");
        let (at, separator_len) = match (crlf, lf) {
            (Some(c), Some(l)) if c < l => (c, 4),
            (Some(c), None) => (c, 4),
            (_, Some(l)) => (l, 2),
            (None, None) => break,
        };

        let raw: String = buffer.drain(..at + separator_len).collect();
        let payload = raw[..at].to_string();
        frames.push((payload, raw));
    }

    frames
}

/// Join a frame's `data:` lines into one payload. Returns None for frames
/// with no data lines (comments, event-only frames).
pub(crate) fn frame_data(payload: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in payload.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Incremental usage parser over an SSE byte stream.
///
/// Recognises frame separators as bytes arrive, joins `data:` lines, ignores
/// `[DONE]`, and attempts one JSON decode per frame. Token counts are read
/// only from structured `usage` objects, never from delta text content, so
/// token-like key names inside streamed text cannot corrupt the totals.
/// Output tokens take the maximum seen across frames; the other fields take
/// the latest non-zero value.
#[derive(Default)]
pub struct UsageParser {
    buffer: String,
    usage: StreamUsage,
}

impl UsageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        for (payload, _) in drain_frames(&mut self.buffer) {
            self.process_frame(&payload);
        }
    }

    /// Flush the trailing partial frame and return the totals. Only called
    /// at end-of-stream.
    pub fn finish(&mut self) -> StreamUsage {
        let trailing = std::mem::take(&mut self.buffer);
        if !trailing.trim().is_empty() {
            self.process_frame(&trailing);
        }
        self.usage
    }

    pub fn usage(&self) -> StreamUsage {
        self.usage
    }

    fn process_frame(&mut self, payload: &str) {
        let Some(data) = frame_data(payload) else {
            return;
        };
        if data.trim() == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(&data) else {
            return;
        };

        // Anthropic nests the opening usage under `message` (message_start);
        // later frames carry a top-level `usage`.
        for usage in [value.get("usage"), value.pointer("/message/usage")]
            .into_iter()
            .flatten()
        {
            self.apply(usage);
        }
    }

    fn apply(&mut self, usage: &Value) {
        let read = |keys: &[&str]| -> Option<u64> {
            keys.iter().find_map(|k| usage.get(*k).and_then(Value::as_u64))
        };

        if let Some(input) = read(&["input_tokens", "prompt_tokens"]) {
            if input > 0 {
                self.usage.input_tokens = input;
            }
        }
        if let Some(output) = read(&["output_tokens", "completion_tokens"]) {
            self.usage.output_tokens = self.usage.output_tokens.max(output);
        }
        if let Some(creation) = read(&["cache_creation_input_tokens"]) {
            if creation > 0 {
                self.usage.cache_creation_input_tokens = creation;
            }
        }
        let cached = read(&["cache_read_input_tokens"]).or_else(|| {
            usage
                .pointer("/prompt_tokens_details/cached_tokens")
                .and_then(Value::as_u64)
        });
        if let Some(cached) = cached {
            if cached > 0 {
                self.usage.cache_read_input_tokens = cached;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
