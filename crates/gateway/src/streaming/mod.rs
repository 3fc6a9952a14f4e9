pub mod usage;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

use tokengate_common::Result as GwResult;

use crate::adapters::{Adapter, CompressedContent, Provider};
use crate::phantom::EXPAND_TOOL_NAME;
use crate::shadow::{marker_shadow_id, ShadowStore};

pub use usage::{StreamUsage, UsageParser};

use usage::{drain_frames, frame_data};

/// Headers set on every proxied SSE response. Content-Type is preserved from
/// the upstream.
fn apply_sse_headers(headers: &mut HeaderMap) {
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    // Lengths no longer match once the gateway may splice the stream.
    headers.remove("content-length");
}

fn response_from(status: u16, headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()));
    let mut out = headers.clone();
    apply_sse_headers(&mut out);
    *response.headers_mut() = out;
    response
}

struct TailState {
    upstream: reqwest::Response,
    parser: UsageParser,
    on_usage: Option<Box<dyn FnOnce(StreamUsage) + Send>>,
    failed: bool,
}

/// Stream `prefix` chunks, then the rest of `upstream`, feeding every byte
/// to the usage parser. The usage callback fires exactly once, at
/// end-of-stream.
fn chunk_stream(
    prefix: Vec<Bytes>,
    upstream: reqwest::Response,
    mut parser: UsageParser,
    on_usage: Box<dyn FnOnce(StreamUsage) + Send>,
) -> Body {
    for chunk in &prefix {
        parser.feed(chunk);
    }
    let state = TailState {
        upstream,
        parser,
        on_usage: Some(on_usage),
        failed: false,
    };

    let head = futures_util::stream::iter(prefix.into_iter().map(Ok::<Bytes, reqwest::Error>));
    let tail = futures_util::stream::unfold(state, |mut state| async move {
        if state.failed {
            return None;
        }
        match state.upstream.chunk().await {
            Ok(Some(chunk)) => {
                state.parser.feed(&chunk);
                Some((Ok(chunk), state))
            }
            Ok(None) => {
                let usage = state.parser.finish();
                if let Some(on_usage) = state.on_usage.take() {
                    on_usage(usage);
                }
                None
            }
            Err(e) => {
                state.failed = true;
                Some((Err(e), state))
            }
        }
    });

    Body::from_stream(futures_util::StreamExt::chain(head, tail))
}

/// Proxy an SSE response without buffering: fixed read buffer upstream,
/// flush-per-chunk semantics downstream, usage parsed as a side channel.
pub fn stream_passthrough(
    upstream: reqwest::Response,
    on_usage: Box<dyn FnOnce(StreamUsage) + Send>,
) -> Response {
    let status = upstream.status().as_u16();
    let headers = upstream.headers().clone();
    let body = chunk_stream(Vec::new(), upstream, UsageParser::new(), on_usage);
    response_from(status, &headers, body)
}

// ---------------------------------------------------------------------------
// Expand-call detection in a buffered stream
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingCall {
    name: String,
    arguments: String,
}

/// Scans a buffered SSE stream for `expand_context` invocations, assembling
/// streamed tool-call arguments per provider.
pub struct ExpandScanner {
    provider: Provider,
    buffer: String,
    /// Anthropic block index / OpenAI call index → pending call.
    by_index: HashMap<u64, PendingCall>,
    /// Responses item id → pending call.
    by_item: HashMap<String, PendingCall>,
    /// Fully-formed ids (Gemini, argument `done` events).
    complete: Vec<String>,
}

impl ExpandScanner {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            buffer: String::new(),
            by_index: HashMap::new(),
            by_item: HashMap::new(),
            complete: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        for (payload, _) in drain_frames(&mut self.buffer) {
            self.scan_frame(&payload);
        }
    }

    /// Shadow ids requested via expand_context, in order of appearance.
    pub fn finish(mut self) -> Vec<String> {
        let trailing = std::mem::take(&mut self.buffer);
        if !trailing.trim().is_empty() {
            self.scan_frame(&trailing);
        }

        let mut ids = self.complete;
        let assembled = self
            .by_index
            .into_values()
            .chain(self.by_item.into_values());
        for pending in assembled {
            if pending.name != EXPAND_TOOL_NAME {
                continue;
            }
            if let Ok(args) = serde_json::from_str::<Value>(&pending.arguments) {
                if let Some(id) = args.get("id").and_then(Value::as_str) {
                    ids.push(id.to_string());
                }
            }
        }
        ids.dedup();
        ids
    }

    fn scan_frame(&mut self, payload: &str) {
        let Some(data) = frame_data(payload) else {
            return;
        };
        if data.trim() == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(&data) else {
            return;
        };

        match self.provider {
            Provider::Anthropic | Provider::Bedrock => self.scan_anthropic(&value),
            Provider::OpenAi | Provider::Ollama => {
                self.scan_openai_chat(&value);
                self.scan_responses(&value);
            }
            Provider::Gemini => self.scan_gemini(&value),
            Provider::Unknown => {}
        }
    }

    fn scan_anthropic(&mut self, value: &Value) {
        match value.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                let is_expand = value.pointer("/content_block/type").and_then(Value::as_str)
                    == Some("tool_use")
                    && value.pointer("/content_block/name").and_then(Value::as_str)
                        == Some(EXPAND_TOOL_NAME);
                if is_expand {
                    if let Some(index) = value.get("index").and_then(Value::as_u64) {
                        self.by_index.insert(
                            index,
                            PendingCall {
                                name: EXPAND_TOOL_NAME.into(),
                                arguments: String::new(),
                            },
                        );
                    }
                }
            }
            Some("content_block_delta") => {
                let Some(index) = value.get("index").and_then(Value::as_u64) else {
                    return;
                };
                if let Some(pending) = self.by_index.get_mut(&index) {
                    if let Some(partial) =
                        value.pointer("/delta/partial_json").and_then(Value::as_str)
                    {
                        pending.arguments.push_str(partial);
                    }
                }
            }
            _ => {}
        }
    }

    fn scan_openai_chat(&mut self, value: &Value) {
        let Some(calls) = value
            .pointer("/choices/0/delta/tool_calls")
            .and_then(Value::as_array)
        else {
            return;
        };
        for call in calls {
            let Some(index) = call.get("index").and_then(Value::as_u64) else {
                continue;
            };
            let pending = self.by_index.entry(index).or_default();
            if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                pending.name = name.to_string();
            }
            if let Some(arguments) = call.pointer("/function/arguments").and_then(Value::as_str) {
                pending.arguments.push_str(arguments);
            }
        }
    }

    fn scan_responses(&mut self, value: &Value) {
        match value.get("type").and_then(Value::as_str) {
            Some("response.output_item.added") => {
                let item = value.get("item");
                let is_expand = item
                    .and_then(|i| i.get("name"))
                    .and_then(Value::as_str)
                    == Some(EXPAND_TOOL_NAME);
                if is_expand {
                    if let Some(id) = item
                        .and_then(|i| i.get("id"))
                        .and_then(Value::as_str)
                    {
                        self.by_item.insert(
                            id.to_string(),
                            PendingCall {
                                name: EXPAND_TOOL_NAME.into(),
                                arguments: String::new(),
                            },
                        );
                    }
                }
            }
            Some("response.function_call_arguments.delta") => {
                let Some(item_id) = value.get("item_id").and_then(Value::as_str) else {
                    return;
                };
                if let Some(pending) = self.by_item.get_mut(item_id) {
                    if let Some(delta) = value.get("delta").and_then(Value::as_str) {
                        pending.arguments.push_str(delta);
                    }
                }
            }
            Some("response.function_call_arguments.done") => {
                let Some(item_id) = value.get("item_id").and_then(Value::as_str) else {
                    return;
                };
                if let Some(pending) = self.by_item.get_mut(item_id) {
                    if let Some(arguments) = value.get("arguments").and_then(Value::as_str) {
                        pending.arguments = arguments.to_string();
                    }
                }
            }
            _ => {}
        }
    }

    fn scan_gemini(&mut self, value: &Value) {
        let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        else {
            return;
        };
        for part in parts {
            let Some(call) = part.get("functionCall") else {
                continue;
            };
            if call.get("name").and_then(Value::as_str) != Some(EXPAND_TOOL_NAME) {
                continue;
            }
            if let Some(id) = call.pointer("/args/id").and_then(Value::as_str) {
                self.complete.push(id.to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Phantom-trace filtering on a retry stream
// ---------------------------------------------------------------------------

/// Drops SSE frames that reference phantom tools from a replayed stream.
/// Kept frames are re-emitted byte-for-byte.
pub struct PhantomFrameFilter {
    provider: Provider,
    names: HashSet<String>,
    buffer: String,
    blocked_indices: HashSet<u64>,
    blocked_items: HashSet<String>,
}

impl PhantomFrameFilter {
    pub fn new(provider: Provider, names: HashSet<String>) -> Self {
        Self {
            provider,
            names,
            buffer: String::new(),
            blocked_indices: HashSet::new(),
            blocked_items: HashSet::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut kept = Vec::new();
        for (payload, raw) in drain_frames(&mut self.buffer) {
            if self.keep_frame(&payload) {
                kept.extend_from_slice(raw.as_bytes());
            }
        }
        kept
    }

    /// Emit whatever trailing bytes remain at end-of-stream.
    pub fn finish(mut self) -> Vec<u8> {
        let trailing = std::mem::take(&mut self.buffer);
        if trailing.trim().is_empty() || !self.keep_frame(&trailing) {
            return Vec::new();
        }
        trailing.into_bytes()
    }

    fn keep_frame(&mut self, payload: &str) -> bool {
        let Some(data) = frame_data(payload) else {
            return true;
        };
        if data.trim() == "[DONE]" {
            return true;
        }
        let Ok(value) = serde_json::from_str::<Value>(&data) else {
            return true;
        };

        match self.provider {
            Provider::Anthropic | Provider::Bedrock => self.keep_anthropic(&value),
            Provider::OpenAi | Provider::Ollama => {
                self.keep_openai_chat(&value) && self.keep_responses(&value)
            }
            Provider::Gemini => self.keep_gemini(&value),
            Provider::Unknown => true,
        }
    }

    fn keep_anthropic(&mut self, value: &Value) -> bool {
        let index = value.get("index").and_then(Value::as_u64);
        match value.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                let phantom = value.pointer("/content_block/type").and_then(Value::as_str)
                    == Some("tool_use")
                    && value
                        .pointer("/content_block/name")
                        .and_then(Value::as_str)
                        .is_some_and(|n| self.names.contains(n));
                if phantom {
                    if let Some(index) = index {
                        self.blocked_indices.insert(index);
                    }
                    return false;
                }
                true
            }
            Some("content_block_delta") | Some("content_block_stop") => {
                !index.is_some_and(|i| self.blocked_indices.contains(&i))
            }
            _ => true,
        }
    }

    fn keep_openai_chat(&mut self, value: &Value) -> bool {
        let Some(calls) = value
            .pointer("/choices/0/delta/tool_calls")
            .and_then(Value::as_array)
        else {
            return true;
        };
        let mut phantom = false;
        for call in calls {
            let index = call.get("index").and_then(Value::as_u64);
            let named_phantom = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .is_some_and(|n| self.names.contains(n));
            if named_phantom {
                if let Some(index) = index {
                    self.blocked_indices.insert(index);
                }
                phantom = true;
            } else if index.is_some_and(|i| self.blocked_indices.contains(&i)) {
                phantom = true;
            }
        }
        !phantom
    }

    fn keep_responses(&mut self, value: &Value) -> bool {
        match value.get("type").and_then(Value::as_str) {
            Some("response.output_item.added") | Some("response.output_item.done") => {
                let item = value.get("item");
                let phantom = item
                    .and_then(|i| i.get("name"))
                    .and_then(Value::as_str)
                    .is_some_and(|n| self.names.contains(n));
                if phantom {
                    if let Some(id) = item.and_then(|i| i.get("id")).and_then(Value::as_str) {
                        self.blocked_items.insert(id.to_string());
                    }
                    return false;
                }
                true
            }
            Some("response.function_call_arguments.delta")
            | Some("response.function_call_arguments.done") => !value
                .get("item_id")
                .and_then(Value::as_str)
                .is_some_and(|id| self.blocked_items.contains(id)),
            _ => true,
        }
    }

    fn keep_gemini(&mut self, value: &Value) -> bool {
        let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        else {
            return true;
        };
        !parts.iter().any(|p| {
            p.pointer("/functionCall/name")
                .and_then(Value::as_str)
                .is_some_and(|n| self.names.contains(n))
        })
    }
}

// ---------------------------------------------------------------------------
// Expand-aware mediation
// ---------------------------------------------------------------------------

/// Splice stored originals back into the forwarded body for the given shadow
/// ids, and invalidate their compressed cache entries. Returns None when no
/// slot matched (nothing to replay).
pub async fn rebuild_with_originals(
    adapter: &Arc<dyn Adapter>,
    store: &Arc<ShadowStore>,
    forward_body: &[u8],
    expand_ids: &[String],
) -> Option<Vec<u8>> {
    let wanted: HashSet<&str> = expand_ids.iter().map(String::as_str).collect();
    let parsed = adapter.parse_request(forward_body).ok()?;

    let mut results = Vec::new();
    for extraction in adapter.extract_tool_output(&parsed) {
        let Some(marker_id) = marker_shadow_id(&extraction.content) else {
            continue;
        };
        if !wanted.contains(marker_id) {
            continue;
        }
        let Some(original) = store.get(marker_id).await else {
            tracing::warn!(shadow_id = marker_id, "Original expired before stream replay");
            continue;
        };
        store.delete_compressed(marker_id).await;
        results.push(CompressedContent {
            id: extraction.id.clone(),
            compressed: original,
            shadow_ref: Some(marker_id.to_string()),
            keep: true,
        });
    }

    if results.is_empty() {
        return None;
    }
    adapter.apply_tool_output(&parsed, &results).ok()
}

/// Buffer a streamed response long enough to detect `expand_context` calls.
/// Either flushes the buffered bytes untouched, or replays the request with
/// expanded history and streams the retry through a phantom-trace filter.
#[allow(clippy::too_many_arguments)]
pub async fn stream_with_expand<F, Fut>(
    provider: Provider,
    adapter: Arc<dyn Adapter>,
    store: Arc<ShadowStore>,
    forward_body: Vec<u8>,
    upstream: reqwest::Response,
    max_buffer: usize,
    on_usage: Box<dyn FnOnce(StreamUsage) + Send>,
    replay: F,
) -> Response
where
    F: FnOnce(Vec<u8>) -> Fut,
    Fut: Future<Output = GwResult<reqwest::Response>>,
{
    let status = upstream.status().as_u16();
    let headers = upstream.headers().clone();

    let mut upstream = upstream;
    let mut scanner = ExpandScanner::new(provider);
    let mut buffered: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    loop {
        match upstream.chunk().await {
            Ok(Some(chunk)) => {
                total += chunk.len();
                scanner.feed(&chunk);
                buffered.push(chunk);
                if total > max_buffer {
                    // Response too large to hold; flush and revert to
                    // passthrough for the remainder.
                    tracing::warn!(total, max_buffer, "Stream buffer cap hit, flushing");
                    let body = chunk_stream(buffered, upstream, UsageParser::new(), on_usage);
                    return response_from(status, &headers, body);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Upstream stream error while buffering");
                break;
            }
        }
    }

    let expand_ids = scanner.finish();
    if expand_ids.is_empty() {
        let mut parser = UsageParser::new();
        for chunk in &buffered {
            parser.feed(chunk);
        }
        on_usage(parser.finish());
        return response_from(status, &headers, Body::from_stream(
            futures_util::stream::iter(buffered.into_iter().map(Ok::<Bytes, reqwest::Error>)),
        ));
    }

    tracing::info!(ids = expand_ids.len(), "Expand calls detected in stream, replaying");
    metrics::counter!("streaming.expand_replays").increment(1);

    let Some(rebuilt) = rebuild_with_originals(&adapter, &store, &forward_body, &expand_ids).await
    else {
        // Nothing matched (expired or unknown ids): serve what we have.
        on_usage(StreamUsage::default());
        return response_from(status, &headers, Body::from_stream(
            futures_util::stream::iter(buffered.into_iter().map(Ok::<Bytes, reqwest::Error>)),
        ));
    };

    match replay(rebuilt).await {
        Ok(retry) => {
            let retry_status = retry.status().as_u16();
            let retry_headers = retry.headers().clone();
            let mut names = HashSet::new();
            names.insert(EXPAND_TOOL_NAME.to_string());
            let body = filtered_stream(retry, PhantomFrameFilter::new(provider, names), on_usage);
            response_from(retry_status, &retry_headers, body)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Stream replay failed, serving buffered response");
            on_usage(StreamUsage::default());
            response_from(status, &headers, Body::from_stream(
                futures_util::stream::iter(buffered.into_iter().map(Ok::<Bytes, reqwest::Error>)),
            ))
        }
    }
}

struct FilterState {
    upstream: reqwest::Response,
    filter: Option<PhantomFrameFilter>,
    parser: UsageParser,
    on_usage: Option<Box<dyn FnOnce(StreamUsage) + Send>>,
    failed: bool,
}

fn filtered_stream(
    upstream: reqwest::Response,
    filter: PhantomFrameFilter,
    on_usage: Box<dyn FnOnce(StreamUsage) + Send>,
) -> Body {
    let state = FilterState {
        upstream,
        filter: Some(filter),
        parser: UsageParser::new(),
        on_usage: Some(on_usage),
        failed: false,
    };

    Body::from_stream(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if state.failed {
                return None;
            }
            match state.upstream.chunk().await {
                Ok(Some(chunk)) => {
                    state.parser.feed(&chunk);
                    let kept = match state.filter.as_mut() {
                        Some(filter) => filter.feed(&chunk),
                        None => chunk.to_vec(),
                    };
                    if kept.is_empty() {
                        continue;
                    }
                    return Some((Ok(Bytes::from(kept)), state));
                }
                Ok(None) => {
                    let usage = state.parser.finish();
                    if let Some(on_usage) = state.on_usage.take() {
                        on_usage(usage);
                    }
                    let trailing = state.filter.take().map(PhantomFrameFilter::finish);
                    match trailing {
                        Some(bytes) if !bytes.is_empty() => {
                            state.failed = true; // terminal: emit trailing once
                            return Some((Ok(Bytes::from(bytes)), state));
                        }
                        _ => return None,
                    }
                }
                Err(e) => {
                    state.failed = true;
                    return Some((Err(e), state));
                }
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
