use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use tokengate_common::config::GatewayConfig;
use tokengate_common::GatewayError;

use crate::adapters::{self, inject_tool, Adapter, Provider};
use crate::compressor::Compressor;
use crate::forward::{AuthMode, AuthReport, ForwardReply, ForwardRequest, Forwarder};
use crate::phantom::{
    self, ExpandHandler, PhantomHandler, SearchHandler, UpstreamResponse, EXPAND_TOOL_NAME,
};
use crate::pipes::{PipelineContext, ToolDiscoveryPipe, ToolOutputPipe};
use crate::sessions::{derive_session_id, AuthFallbackStore, ToolSessionStore};
use crate::shadow::{ShadowStore, SHADOW_MARKER_PREFIX};
use crate::streaming::{self, StreamUsage};
use crate::telemetry::{CostTracker, RequestRecord, TelemetrySink};

/// Paths owned by collaborator services, never treated as LLM traffic.
const RESERVED_PREFIXES: &[&str] = &["/stats", "/costs", "/expand", "/telemetry", "/analytics"];

/// Known provider prefixes stripped from the model field before forwarding.
const MODEL_PREFIXES: &[&str] = &["anthropic/", "openai/", "google/", "gemini/", "meta/"];

/// Shared application state accessible from axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub shadow: Arc<ShadowStore>,
    pub tool_sessions: Arc<ToolSessionStore>,
    pub auth_fallback: Arc<AuthFallbackStore>,
    pub tool_output_pipe: ToolOutputPipe,
    pub tool_discovery_pipe: ToolDiscoveryPipe,
    pub forwarder: Forwarder,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub cost: Arc<dyn CostTracker>,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({ "error": { "message": message } });
    (status, axum::Json(body)).into_response()
}

/// Pull the target model out of a body, falling back to the Gemini path
/// segment (`/v1beta/models/{model}:generateContent`).
fn extract_model(value: &Value, path: &str) -> String {
    if let Some(model) = value.get("model").and_then(Value::as_str) {
        return model.to_string();
    }
    if let Some(rest) = path.strip_prefix("/v1beta/models/") {
        if let Some(model) = rest.split(':').next() {
            return model.to_string();
        }
    }
    String::new()
}

/// Strip known provider prefixes from the model field. Bedrock model ids
/// keep their vendor prefix.
fn strip_model_prefix(value: &mut Value) -> bool {
    let Some(model) = value.get("model").and_then(Value::as_str) else {
        return false;
    };
    for prefix in MODEL_PREFIXES {
        if let Some(bare) = model.strip_prefix(prefix) {
            let bare = bare.to_string();
            value["model"] = Value::String(bare);
            return true;
        }
    }
    false
}

/// Whether this request expects an SSE response.
fn is_streaming(value: &Value, path: &str) -> bool {
    value.get("stream").and_then(Value::as_bool).unwrap_or(false)
        || path.contains(":streamGenerateContent")
}

/// Provider-shaped "budget exceeded" body, served with HTTP 200 so agent
/// clients render it as an assistant message.
fn synthetic_budget_body(provider: Provider, adapter_name: &str, message: &str) -> Value {
    match provider {
        Provider::Anthropic | Provider::Bedrock => json!({
            "id": "msg_budget_exceeded",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": message}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }),
        Provider::OpenAi | Provider::Ollama if adapter_name == "openai-responses" => json!({
            "id": "resp_budget_exceeded",
            "object": "response",
            "status": "completed",
            "output": [{
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": message}]
            }],
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }),
        Provider::OpenAi | Provider::Ollama => json!({
            "id": "chatcmpl_budget_exceeded",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": message},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0}
        }),
        Provider::Gemini => json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": message}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 0, "candidatesTokenCount": 0}
        }),
        Provider::Unknown => json!({ "error": message }),
    }
}

/// Entry point for every non-reserved POST. Identifies the provider, runs
/// the configured pipes, and dispatches to the streaming mediator or the
/// phantom loop.
pub async fn handle_request(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    let started = std::time::Instant::now();
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let headers = parts.headers;

    if RESERVED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return error_response(StatusCode::NOT_FOUND, "reserved path not handled by gateway");
    }
    if parts.method != axum::http::Method::POST {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "only POST is proxied");
    }

    let body = match axum::body::to_bytes(body, state.config.server.max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let provider = adapters::identify(&path, &headers, state.config.upstream.bedrock_enabled);
    if provider == Provider::Unknown {
        return error_response(StatusCode::BAD_REQUEST, "unknown provider for this path");
    }
    let Some(adapter) = adapters::adapter_for(provider, &path) else {
        return error_response(StatusCode::BAD_REQUEST, "no adapter for this provider");
    };

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match process(state, provider, adapter, path, headers, body, request_id, started).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Request failed");
            let status = if e.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::BAD_GATEWAY
            };
            error_response(status, &e.to_string())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process(
    state: Arc<AppState>,
    provider: Provider,
    adapter: Arc<dyn Adapter>,
    path: String,
    headers: HeaderMap,
    body: Vec<u8>,
    request_id: String,
    started: std::time::Instant,
) -> tokengate_common::Result<Response> {
    // Parse once at the driver for session identity, model, and the model
    // prefix rewrite. A non-JSON body still forwards (pipes pass through).
    let mut body = body;
    let mut model = String::new();
    let mut streaming = false;
    let mut user_messages = Vec::new();

    if let Ok(parsed) = adapter.parse_request(&body) {
        user_messages = adapter.extract_user_messages(&parsed);
    }
    if let Ok(mut value) = serde_json::from_slice::<Value>(&body) {
        model = extract_model(&value, &path);
        streaming = is_streaming(&value, &path);
        if provider != Provider::Bedrock && strip_model_prefix(&mut value) {
            model = value["model"].as_str().unwrap_or_default().to_string();
            body = serde_json::to_vec(&value)?;
        }
    }

    let mut ctx = PipelineContext::new(provider, Arc::clone(&adapter), model, request_id.clone());
    ctx.passthrough = state.config.passthrough;
    ctx.bearer_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    ctx.beta_header = headers
        .get("anthropic-beta")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ctx.threshold_override = headers
        .get("x-compression-threshold")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let session_id = derive_session_id(&user_messages, state.config.sessions.hash_messages);
    ctx.tool_session_id = session_id.clone();
    ctx.cost_session_id = session_id.clone();

    // Budget gate: over-budget sessions get a synthetic 200 the client can
    // display, and nothing is forwarded.
    let budget = state.cost.check_budget(&ctx.cost_session_id);
    if !budget.allowed {
        tracing::warn!(session_id = %session_id, "Session over budget, short-circuiting");
        let message = format!(
            "This session has exceeded its cost budget (${:.2} of ${:.2}). \
             Further requests are blocked.",
            budget.session_cost, budget.session_cap
        );
        let body = synthetic_budget_body(provider, adapter.name(), &message);
        let mut response = (StatusCode::OK, axum::Json(body)).into_response();
        let h = response.headers_mut();
        h.insert("x-synthetic-response", HeaderValue::from_static("true"));
        h.insert("x-budget-exceeded", HeaderValue::from_static("true"));
        insert_cost_header(h, "x-session-cost", budget.session_cost);
        insert_cost_header(h, "x-session-cap", budget.session_cap);
        insert_cost_header(h, "x-global-cost", budget.global_cost);
        insert_cost_header(h, "x-global-cap", budget.global_cap);
        return Ok(response);
    }

    // Pipes: discovery first so tool-output sees the reduced tool set.
    let mut forward_body = state.tool_discovery_pipe.process(&mut ctx, &body).await;
    forward_body = state.tool_output_pipe.process(&mut ctx, &forward_body).await;

    if ctx.tools_filtered {
        state
            .tool_sessions
            .store_deferred(&ctx.tool_session_id, ctx.deferred_tools.clone())
            .await;
    }

    // Shadow markers instruct the LLM that expansion is available, so the
    // expand tool must exist whenever markers are in flight.
    let carries_markers = contains_marker(&forward_body);
    let expand_active = state.config.phantom.expand_enabled
        && (!ctx.shadow_refs.is_empty() || carries_markers);
    if expand_active {
        if let Ok(mut value) = serde_json::from_slice::<Value>(&forward_body) {
            inject_tool(
                &mut value,
                adapter.name(),
                EXPAND_TOOL_NAME,
                "Retrieve the full original content behind a <<<SHADOW:id>>> marker. \
                 Call this only when the compressed summary is insufficient.",
                json!({
                    "type": "object",
                    "properties": {
                        "id": {"type": "string", "description": "The shadow id from the marker"}
                    },
                    "required": ["id"]
                }),
            );
            forward_body = serde_json::to_vec(&value)?;
        }
    }

    let target_url = crate::forward::resolve_target(&path, &headers, provider, &state.config.upstream)?;

    let auth_report: Arc<Mutex<Option<AuthReport>>> = Arc::new(Mutex::new(None));
    let usage_model = ctx.model.clone();

    let response = if streaming {
        dispatch_streaming(
            &state,
            &ctx,
            &headers,
            target_url,
            forward_body,
            expand_active,
            Arc::clone(&auth_report),
        )
        .await?
    } else {
        dispatch_loop(
            &state,
            &ctx,
            &headers,
            target_url,
            forward_body,
            expand_active,
            Arc::clone(&auth_report),
        )
        .await?
    };

    let report = auth_report.lock().unwrap().unwrap_or(AuthReport {
        initial_mode: AuthMode::Unknown,
        effective_mode: AuthMode::Unknown,
        fallback_used: false,
    });
    state.telemetry.record_request(&RequestRecord {
        timestamp: chrono::Utc::now(),
        request_id,
        provider: provider.as_str(),
        model: usage_model,
        pipe_type: ctx.pipe_type(),
        auth_mode_initial: report.initial_mode.as_str(),
        auth_mode_effective: report.effective_mode.as_str(),
        auth_fallback_used: report.fallback_used,
        status: response.status().as_u16(),
        streamed: streaming,
        duration_ms: started.elapsed().as_millis() as u64,
    });

    Ok(response)
}

fn insert_cost_header(headers: &mut HeaderMap, name: &'static str, value: f64) {
    if let Ok(value) = HeaderValue::from_str(&format!("{:.4}", value)) {
        headers.insert(name, value);
    }
}

fn contains_marker(body: &[u8]) -> bool {
    body.windows(SHADOW_MARKER_PREFIX.len())
        .any(|w| w == SHADOW_MARKER_PREFIX.as_bytes())
}

/// Non-streaming dispatch: drive the upstream through the phantom loop.
#[allow(clippy::too_many_arguments)]
async fn dispatch_loop(
    state: &Arc<AppState>,
    ctx: &PipelineContext,
    headers: &HeaderMap,
    target_url: String,
    forward_body: Vec<u8>,
    expand_active: bool,
    auth_report: Arc<Mutex<Option<AuthReport>>>,
) -> tokengate_common::Result<Response> {
    let mut handlers: Vec<Box<dyn PhantomHandler>> = Vec::new();
    if expand_active {
        handlers.push(Box::new(ExpandHandler::new(
            Arc::clone(&state.shadow),
            Arc::clone(&state.telemetry),
        )));
    }

    let mut deferred = ctx.deferred_tools.clone();
    for tool in state.tool_sessions.get_deferred(&ctx.tool_session_id).await {
        let name = tool.tool_name.as_deref().unwrap_or(&tool.id);
        if !deferred
            .iter()
            .any(|t| t.tool_name.as_deref().unwrap_or(&t.id) == name)
        {
            deferred.push(tool);
        }
    }
    if !deferred.is_empty() {
        handlers.push(Box::new(SearchHandler::new(
            state.config.discovery.clone(),
            Arc::clone(&state.tool_sessions),
            state.compressor.clone(),
            Arc::clone(&state.telemetry),
            deferred,
        )));
    }

    let forward = |body: Vec<u8>| {
        let state = Arc::clone(state);
        let headers = headers.clone();
        let target_url = target_url.clone();
        let session_id = ctx.tool_session_id.clone();
        let auth_report = Arc::clone(&auth_report);
        let provider = ctx.provider;
        async move {
            let (reply, report) = state
                .forwarder
                .dispatch(ForwardRequest {
                    target_url,
                    provider,
                    headers,
                    body,
                    session_id,
                })
                .await?;
            *auth_report.lock().unwrap() = Some(report);
            match reply {
                ForwardReply::Stream(response) => {
                    let status = response.status().as_u16();
                    let headers = response.headers().clone();
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| GatewayError::Upstream(e.to_string()))?;
                    Ok(UpstreamResponse {
                        status,
                        headers,
                        body: body.to_vec(),
                    })
                }
                ForwardReply::Buffered {
                    status,
                    headers,
                    body,
                } => Ok(UpstreamResponse {
                    status,
                    headers,
                    body: body.to_vec(),
                }),
            }
        }
    };

    let reply = phantom::run_loop(
        ctx,
        forward_body,
        &mut handlers,
        state.config.phantom.max_loops,
        forward,
    )
    .await?;

    // Account usage off the final upstream body.
    if let Some(usage) = ctx.adapter.extract_usage(&reply.body) {
        state
            .cost
            .record_usage(&ctx.cost_session_id, &ctx.model, &usage);
    }

    let mut response = Response::builder()
        .status(StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK))
        .body(Body::from(reply.body))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    *response.headers_mut() = reply.headers;
    response.headers_mut().remove("content-length");
    Ok(response)
}

/// Streaming dispatch: passthrough SSE, or buffer-and-maybe-replay when
/// shadow refs are in flight.
#[allow(clippy::too_many_arguments)]
async fn dispatch_streaming(
    state: &Arc<AppState>,
    ctx: &PipelineContext,
    headers: &HeaderMap,
    target_url: String,
    forward_body: Vec<u8>,
    expand_active: bool,
    auth_report: Arc<Mutex<Option<AuthReport>>>,
) -> tokengate_common::Result<Response> {
    let (reply, report) = state
        .forwarder
        .dispatch(ForwardRequest {
            target_url: target_url.clone(),
            provider: ctx.provider,
            headers: headers.clone(),
            body: forward_body.clone(),
            session_id: ctx.tool_session_id.clone(),
        })
        .await?;
    *auth_report.lock().unwrap() = Some(report);

    let upstream = match reply {
        ForwardReply::Stream(response) => response,
        ForwardReply::Buffered {
            status,
            headers,
            body,
        } => {
            // Exhaustion-check path buffered a non-2xx body; relay it.
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
                .body(Body::from(body))
                .unwrap_or_else(|_| Response::new(Body::empty()));
            *response.headers_mut() = headers;
            response.headers_mut().remove("content-length");
            return Ok(response);
        }
    };

    let cost = Arc::clone(&state.cost);
    let session = ctx.cost_session_id.clone();
    let model = ctx.model.clone();
    let on_usage: Box<dyn FnOnce(StreamUsage) + Send> = Box::new(move |usage: StreamUsage| {
        if !usage.is_empty() {
            cost.record_usage(
                &session,
                &model,
                &crate::adapters::TokenUsage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cache_creation_input_tokens: usage.cache_creation_input_tokens,
                    cache_read_input_tokens: usage.cache_read_input_tokens,
                },
            );
        }
    });

    // Only buffer when an expansion could actually arrive.
    if !expand_active {
        return Ok(streaming::stream_passthrough(upstream, on_usage));
    }

    let replay = {
        let state = Arc::clone(state);
        let headers = headers.clone();
        let session_id = ctx.tool_session_id.clone();
        let provider = ctx.provider;
        move |body: Vec<u8>| async move {
            let (reply, _) = state
                .forwarder
                .dispatch(ForwardRequest {
                    target_url,
                    provider,
                    headers,
                    body,
                    session_id,
                })
                .await?;
            match reply {
                ForwardReply::Stream(response) => Ok(response),
                ForwardReply::Buffered { status, .. } => Err(GatewayError::Upstream(format!(
                    "replay returned status {}",
                    status
                ))),
            }
        }
    };

    Ok(streaming::stream_with_expand(
        ctx.provider,
        Arc::clone(&ctx.adapter),
        Arc::clone(&state.shadow),
        forward_body,
        upstream,
        state.config.server.max_response_bytes,
        on_usage,
        replay,
    )
    .await)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
