pub mod expand;
pub mod search;

use std::collections::HashSet;
use std::future::Future;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::{json, Value};

use tokengate_common::Result;

use crate::adapters::Provider;
use crate::pipes::PipelineContext;

pub use expand::ExpandHandler;
pub use search::SearchHandler;

/// Name of the gateway tool that restores compressed context.
pub const EXPAND_TOOL_NAME: &str = "expand_context";

/// A phantom-tool invocation found in an upstream response.
#[derive(Clone, Debug)]
pub struct PhantomCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One tool result produced by a handler, format-neutral; the loop renders
/// it in the provider's wire shape.
#[derive(Clone, Debug)]
pub struct PhantomToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub content: String,
}

/// Mutation applied to the request body before the next iteration (e.g.
/// merging found tool definitions into `tools[]`).
pub type RequestModifier = Box<dyn FnOnce(&mut Value) + Send>;

/// What a handler did with its calls.
pub struct PhantomOutcome {
    pub tool_results: Vec<PhantomToolResult>,
    pub request_modifier: Option<RequestModifier>,
    /// Terminal: filter the current response and return it as-is.
    pub stop: bool,
}

/// A gateway-injected tool: intercepted by the loop, handled internally,
/// never visible to the client.
#[async_trait]
pub trait PhantomHandler: Send {
    fn tool_name(&self) -> &str;

    async fn handle(&mut self, calls: &[PhantomCall], ctx: &PipelineContext) -> PhantomOutcome;

    /// Remove this handler's traces from a response body.
    fn filter_from_response(&self, response: &mut Value, provider: Provider) {
        let mut names = HashSet::new();
        names.insert(self.tool_name().to_string());
        filter_phantom_traces(response, provider, &names);
    }
}

/// A buffered upstream response as seen by the loop.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Response parsing per provider
// ---------------------------------------------------------------------------

fn parse_arguments(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
        Some(value) => value.clone(),
        None => Value::Null,
    }
}

/// Collect every tool call in a response whose name is in `names`.
pub fn collect_phantom_calls(
    response: &Value,
    provider: Provider,
    names: &HashSet<String>,
) -> Vec<PhantomCall> {
    let mut calls = Vec::new();

    match provider {
        Provider::Anthropic | Provider::Bedrock => {
            if let Some(blocks) = response.get("content").and_then(Value::as_array) {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                        continue;
                    }
                    let Some(name) = block.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    if !names.contains(name) {
                        continue;
                    }
                    calls.push(PhantomCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: name.to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
            }
        }
        Provider::OpenAi | Provider::Ollama => {
            // Chat Completions shape.
            if let Some(choices) = response.get("choices").and_then(Value::as_array) {
                for choice in choices {
                    let Some(tool_calls) =
                        choice.pointer("/message/tool_calls").and_then(Value::as_array)
                    else {
                        continue;
                    };
                    for call in tool_calls {
                        let Some(name) = call.pointer("/function/name").and_then(Value::as_str)
                        else {
                            continue;
                        };
                        if !names.contains(name) {
                            continue;
                        }
                        calls.push(PhantomCall {
                            id: call
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            name: name.to_string(),
                            input: parse_arguments(call.pointer("/function/arguments")),
                        });
                    }
                }
            }
            // Responses shape.
            if let Some(output) = response.get("output").and_then(Value::as_array) {
                for item in output {
                    if item.get("type").and_then(Value::as_str) != Some("function_call") {
                        continue;
                    }
                    let Some(name) = item.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    if !names.contains(name) {
                        continue;
                    }
                    calls.push(PhantomCall {
                        id: item
                            .get("call_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: name.to_string(),
                        input: parse_arguments(item.get("arguments")),
                    });
                }
            }
        }
        Provider::Gemini => {
            if let Some(parts) = response
                .pointer("/candidates/0/content/parts")
                .and_then(Value::as_array)
            {
                for part in parts {
                    let Some(call) = part.get("functionCall") else {
                        continue;
                    };
                    let Some(name) = call.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    if !names.contains(name) {
                        continue;
                    }
                    calls.push(PhantomCall {
                        id: name.to_string(),
                        name: name.to_string(),
                        input: call.get("args").cloned().unwrap_or(Value::Null),
                    });
                }
            }
        }
        Provider::Unknown => {}
    }

    calls
}

// ---------------------------------------------------------------------------
// History append per provider
// ---------------------------------------------------------------------------

/// Append the assistant turn (as emitted) and the collected tool results to
/// the request. Anthropic groups results into one user message of typed
/// blocks; OpenAI chat emits one `role:"tool"` message per result.
pub fn append_exchange(
    request: &mut Value,
    response: &Value,
    results: &[PhantomToolResult],
    provider: Provider,
    adapter_name: &str,
) {
    match provider {
        Provider::Anthropic | Provider::Bedrock => {
            let Some(messages) = request.get_mut("messages").and_then(Value::as_array_mut) else {
                return;
            };
            messages.push(json!({
                "role": "assistant",
                "content": response.get("content").cloned().unwrap_or(json!([])),
            }));
            let blocks: Vec<Value> = results
                .iter()
                .map(|r| {
                    json!({
                        "type": "tool_result",
                        "tool_use_id": r.call_id,
                        "content": r.content,
                    })
                })
                .collect();
            messages.push(json!({ "role": "user", "content": blocks }));
        }
        Provider::OpenAi | Provider::Ollama => {
            if adapter_name == "openai-responses" {
                let Some(input) = request.get_mut("input").and_then(Value::as_array_mut) else {
                    return;
                };
                if let Some(output) = response.get("output").and_then(Value::as_array) {
                    input.extend(output.iter().cloned());
                }
                for result in results {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": result.call_id,
                        "output": result.content,
                    }));
                }
            } else {
                let Some(messages) = request.get_mut("messages").and_then(Value::as_array_mut)
                else {
                    return;
                };
                if let Some(message) = response.pointer("/choices/0/message") {
                    messages.push(message.clone());
                }
                for result in results {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": result.call_id,
                        "content": result.content,
                    }));
                }
            }
        }
        Provider::Gemini => {
            let Some(contents) = request.get_mut("contents").and_then(Value::as_array_mut) else {
                return;
            };
            if let Some(content) = response.pointer("/candidates/0/content") {
                contents.push(content.clone());
            }
            let parts: Vec<Value> = results
                .iter()
                .map(|r| {
                    json!({
                        "functionResponse": {
                            "name": r.tool_name,
                            "response": { "result": r.content },
                        }
                    })
                })
                .collect();
            contents.push(json!({ "role": "user", "parts": parts }));
        }
        Provider::Unknown => {}
    }
}

// ---------------------------------------------------------------------------
// Trace filtering per provider
// ---------------------------------------------------------------------------

/// Strip phantom tool calls from a response body so the client never sees
/// them.
pub fn filter_phantom_traces(response: &mut Value, provider: Provider, names: &HashSet<String>) {
    let is_phantom_anthropic = |block: &Value| {
        block.get("type").and_then(Value::as_str) == Some("tool_use")
            && block
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| names.contains(n))
    };

    match provider {
        Provider::Anthropic | Provider::Bedrock => {
            if let Some(blocks) = response.get_mut("content").and_then(Value::as_array_mut) {
                blocks.retain(|b| !is_phantom_anthropic(b));
                let has_tool_use = blocks
                    .iter()
                    .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"));
                if !has_tool_use
                    && response.get("stop_reason").and_then(Value::as_str) == Some("tool_use")
                {
                    response["stop_reason"] = json!("end_turn");
                }
            }
        }
        Provider::OpenAi | Provider::Ollama => {
            if let Some(choices) = response.get_mut("choices").and_then(Value::as_array_mut) {
                for choice in choices {
                    let mut emptied = false;
                    if let Some(calls) = choice
                        .pointer_mut("/message/tool_calls")
                        .and_then(Value::as_array_mut)
                    {
                        calls.retain(|c| {
                            c.pointer("/function/name")
                                .and_then(Value::as_str)
                                .map_or(true, |n| !names.contains(n))
                        });
                        emptied = calls.is_empty();
                    }
                    if emptied {
                        if let Some(message) =
                            choice.get_mut("message").and_then(Value::as_object_mut)
                        {
                            message.remove("tool_calls");
                        }
                        if choice.get("finish_reason").and_then(Value::as_str)
                            == Some("tool_calls")
                        {
                            choice["finish_reason"] = json!("stop");
                        }
                    }
                }
            }
            if let Some(output) = response.get_mut("output").and_then(Value::as_array_mut) {
                output.retain(|item| {
                    item.get("type").and_then(Value::as_str) != Some("function_call")
                        || item
                            .get("name")
                            .and_then(Value::as_str)
                            .map_or(true, |n| !names.contains(n))
                });
            }
        }
        Provider::Gemini => {
            if let Some(candidates) = response.get_mut("candidates").and_then(Value::as_array_mut)
            {
                for candidate in candidates {
                    if let Some(parts) = candidate
                        .pointer_mut("/content/parts")
                        .and_then(Value::as_array_mut)
                    {
                        parts.retain(|p| {
                            p.pointer("/functionCall/name")
                                .and_then(Value::as_str)
                                .map_or(true, |n| !names.contains(n))
                        });
                    }
                }
            }
        }
        Provider::Unknown => {}
    }
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

/// Drive the upstream until no registered phantom tool is called, a handler
/// stops the loop, or `max_loops` is reached. The returned response carries
/// no phantom trace unless the cap was hit mid-conversation.
pub async fn run_loop<F, Fut>(
    ctx: &PipelineContext,
    initial_body: Vec<u8>,
    handlers: &mut [Box<dyn PhantomHandler>],
    max_loops: u32,
    forward: F,
) -> Result<UpstreamResponse>
where
    F: Fn(Vec<u8>) -> Fut,
    Fut: Future<Output = Result<UpstreamResponse>>,
{
    let names: HashSet<String> = handlers.iter().map(|h| h.tool_name().to_string()).collect();
    let max_loops = max_loops.max(1);
    let mut body = initial_body;

    for iteration in 0..max_loops {
        let response = forward(body.clone()).await?;

        // Upstream errors pass through verbatim.
        if !(200..300).contains(&response.status) {
            return Ok(response);
        }

        let Ok(mut response_value) = serde_json::from_slice::<Value>(&response.body) else {
            return Ok(response);
        };

        let calls = collect_phantom_calls(&response_value, ctx.provider, &names);
        if calls.is_empty() {
            // First round with nothing to intercept: hand back the upstream
            // bytes untouched.
            if iteration == 0 {
                return Ok(response);
            }
            filter_phantom_traces(&mut response_value, ctx.provider, &names);
            return Ok(rewrite(response, &response_value)?);
        }

        metrics::counter!("phantom.iterations").increment(1);
        tracing::debug!(
            iteration,
            calls = calls.len(),
            "Phantom tool calls intercepted"
        );

        let mut all_results = Vec::new();
        let mut modifiers = Vec::new();
        for handler in handlers.iter_mut() {
            let own: Vec<PhantomCall> = calls
                .iter()
                .filter(|c| c.name == handler.tool_name())
                .cloned()
                .collect();
            if own.is_empty() {
                continue;
            }
            let outcome = handler.handle(&own, ctx).await;
            if outcome.stop {
                filter_phantom_traces(&mut response_value, ctx.provider, &names);
                return Ok(rewrite(response, &response_value)?);
            }
            all_results.extend(outcome.tool_results);
            if let Some(modifier) = outcome.request_modifier {
                modifiers.push(modifier);
            }
        }

        let mut request_value: Value = serde_json::from_slice(&body)
            .map_err(|e| tokengate_common::GatewayError::Parse(format!("loop request: {}", e)))?;
        append_exchange(
            &mut request_value,
            &response_value,
            &all_results,
            ctx.provider,
            ctx.adapter.name(),
        );
        for modifier in modifiers {
            modifier(&mut request_value);
        }
        body = serde_json::to_vec(&request_value)?;

        // Cap reached: filter what we have and return it.
        if iteration + 1 == max_loops {
            tracing::warn!(max_loops, "Phantom loop cap reached");
            metrics::counter!("phantom.cap_reached").increment(1);
            filter_phantom_traces(&mut response_value, ctx.provider, &names);
            return Ok(rewrite(response, &response_value)?);
        }
    }

    unreachable!("loop always returns within max_loops iterations");
}

fn rewrite(mut response: UpstreamResponse, value: &Value) -> Result<UpstreamResponse> {
    response.body = serde_json::to_vec(value)?;
    // The body changed; a stale length header would truncate the client read.
    response.headers.remove("content-length");
    Ok(response)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
