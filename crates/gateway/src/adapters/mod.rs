mod anthropic;
mod gemini;
mod openai;
mod responses;

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tokengate_common::{GatewayError, Result};

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use responses::ResponsesAdapter;

/// Upstream provider tag, identified from the request path and headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
    Bedrock,
    Ollama,
    Unknown,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::Bedrock => "bedrock",
            Provider::Ollama => "ollama",
            Provider::Unknown => "unknown",
        }
    }

    /// Whether bodies on this route use the Anthropic messages format.
    pub fn is_anthropic_format(&self) -> bool {
        matches!(self, Provider::Anthropic | Provider::Bedrock)
    }
}

/// What kind of content an extraction refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    ToolResult,
    UserMessage,
    ToolDef,
}

/// A uniform record produced by adapter extraction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedContent {
    /// Stable identifier: tool-call id, tool name, or message index.
    pub id: String,
    /// Text to compress or score.
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub message_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<usize>,
    /// Opaque bag carried through to apply (e.g. the raw JSON of a tool
    /// definition).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The mirror of an extraction after a pipe has processed it.
#[derive(Clone, Debug)]
pub struct CompressedContent {
    pub id: String,
    pub compressed: String,
    pub shadow_ref: Option<String>,
    /// Used by filtering pipes: false means drop this entry on apply.
    pub keep: bool,
}

/// Token accounting from a non-streamed response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// A provider-specific parsed body. Opaque outside the adapter layer; the
/// JSON is parsed once per request and reused by every extraction.
pub struct ParsedRequest {
    value: Value,
}

impl ParsedRequest {
    fn new(value: Value) -> Self {
        Self { value }
    }

    fn value(&self) -> &Value {
        &self.value
    }
}

/// Per-provider extract/apply capability set over parsed wire bodies.
///
/// Extraction is order-preserving, pure, and side-effect-free. Apply never
/// invents or reorders ids; unknown ids are silently skipped. Extraction on
/// an unrecognised shape returns an empty sequence, not an error.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn provider(&self) -> Provider;

    /// Parse the raw body. A parse failure is a typed error; pipes respond by
    /// passing the original body through unchanged.
    fn parse_request(&self, body: &[u8]) -> Result<ParsedRequest>;

    /// Every tool-result message in the body, in order.
    fn extract_tool_output(&self, request: &ParsedRequest) -> Vec<ExtractedContent>;

    /// Every tool definition, with `metadata.raw_json` carrying the
    /// round-trip definition.
    fn extract_tool_discovery(&self, request: &ParsedRequest) -> Vec<ExtractedContent>;

    /// Content of the last user message.
    fn extract_user_query(&self, request: &ParsedRequest) -> Option<String>;

    /// All user-message contents in order (session-id derivation).
    fn extract_user_messages(&self, request: &ParsedRequest) -> Vec<String>;

    /// Names of tools already called in this conversation (recency signal
    /// for discovery scoring).
    fn extract_tool_calls(&self, request: &ParsedRequest) -> Vec<String>;

    /// Splice compressed texts back into the tool-result slots identified by
    /// `id`. Entries with an empty `compressed` are skipped.
    fn apply_tool_output(
        &self,
        request: &ParsedRequest,
        results: &[CompressedContent],
    ) -> Result<Vec<u8>>;

    /// Emit the body with only the tool definitions whose `keep` is true,
    /// preserving order. Definitions absent from `results` are kept.
    fn apply_tool_discovery(
        &self,
        request: &ParsedRequest,
        results: &[CompressedContent],
    ) -> Result<Vec<u8>>;

    /// Provider-specific token accounting from a non-streamed response body.
    fn extract_usage(&self, response: &[u8]) -> Option<TokenUsage>;
}

fn parse_json(name: &str, body: &[u8]) -> Result<ParsedRequest> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::Parse(format!("{} request body: {}", name, e)))?;
    if !value.is_object() {
        return Err(GatewayError::Parse(format!(
            "{} request body is not a JSON object",
            name
        )));
    }
    Ok(ParsedRequest::new(value))
}

fn to_bytes(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

// ---------------------------------------------------------------------------
// Identification
// ---------------------------------------------------------------------------

/// Static path-prefix table, consulted last.
const PATH_TABLE: &[(&str, Provider)] = &[
    ("/v1/messages", Provider::Anthropic),
    ("/v1/chat/completions", Provider::OpenAi),
    ("/v1/responses", Provider::OpenAi),
    ("/v1beta/models", Provider::Gemini),
    ("/v1beta/", Provider::Gemini),
    ("/api/chat", Provider::Ollama),
    ("/api/generate", Provider::Ollama),
];

/// Bedrock invocation paths: `/model/{model-id}/invoke`,
/// `/model/{model-id}/invoke-with-response-stream`,
/// `/model/{model-id}/converse`, `/model/{model-id}/converse-stream`.
pub fn is_bedrock_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix("/model/") else {
        return false;
    };
    let Some(action) = rest.rsplit('/').next() else {
        return false;
    };
    rest.contains('/')
        && matches!(
            action,
            "invoke" | "invoke-with-response-stream" | "converse" | "converse-stream"
        )
}

/// Select exactly one provider tag for a request. Rules are evaluated in
/// order; the first match wins.
pub fn identify(path: &str, headers: &HeaderMap, bedrock_enabled: bool) -> Provider {
    if headers.contains_key("anthropic-version") {
        return Provider::Anthropic;
    }

    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if key.starts_with("sk-ant-") {
            return Provider::Anthropic;
        }
    }

    if headers.contains_key("x-goog-api-key") {
        return Provider::Gemini;
    }

    if bedrock_enabled && is_bedrock_path(path) {
        return Provider::Bedrock;
    }

    for (prefix, provider) in PATH_TABLE {
        if path.starts_with(prefix) {
            return *provider;
        }
    }

    // Gemini routes carry the action as a path suffix (`…:generateContent`).
    if path.contains(":generateContent") || path.contains(":streamGenerateContent") {
        return Provider::Gemini;
    }

    Provider::Unknown
}

/// Resolve the adapter for a provider tag. Bedrock bodies use the Anthropic
/// messages format; Ollama speaks the OpenAI chat format; the OpenAI
/// Responses endpoint has its own shape.
pub fn adapter_for(provider: Provider, path: &str) -> Option<Arc<dyn Adapter>> {
    match provider {
        Provider::Anthropic | Provider::Bedrock => Some(Arc::new(AnthropicAdapter)),
        Provider::OpenAi => {
            if path.starts_with("/v1/responses") {
                Some(Arc::new(ResponsesAdapter))
            } else {
                Some(Arc::new(OpenAiAdapter))
            }
        }
        Provider::Ollama => Some(Arc::new(OpenAiAdapter)),
        Provider::Gemini => Some(Arc::new(GeminiAdapter)),
        Provider::Unknown => None,
    }
}

// ---------------------------------------------------------------------------
// Gateway-tool injection
// ---------------------------------------------------------------------------

/// Append a gateway-controlled tool definition to a request body, in the
/// wire shape the adapter's provider expects. Existing definitions with the
/// same name are left alone (no duplicate is added).
pub fn inject_tool(
    body: &mut Value,
    adapter_name: &str,
    name: &str,
    description: &str,
    parameters: Value,
) {
    let definition = match adapter_name {
        "anthropic" => json!({
            "name": name,
            "description": description,
            "input_schema": parameters,
        }),
        "openai" => json!({
            "type": "function",
            "function": {
                "name": name,
                "description": description,
                "parameters": parameters,
            },
        }),
        "openai-responses" => json!({
            "type": "function",
            "name": name,
            "description": description,
            "parameters": parameters,
        }),
        "gemini" => json!({
            "name": name,
            "description": description,
            "parameters": parameters,
        }),
        _ => return,
    };
    merge_raw_tool(body, adapter_name, definition);
}

/// Read the tool name out of a provider-shaped raw definition.
pub fn raw_tool_name<'a>(adapter_name: &str, raw: &'a Value) -> Option<&'a str> {
    match adapter_name {
        "openai" => raw.pointer("/function/name").and_then(Value::as_str),
        _ => raw.get("name").and_then(Value::as_str),
    }
}

/// Merge one provider-shaped raw tool definition into the body's catalog,
/// deduplicating by name. Gemini declarations land in the first
/// `functionDeclarations` entry (created on demand).
pub fn merge_raw_tool(body: &mut Value, adapter_name: &str, raw: Value) {
    let Some(name) = raw_tool_name(adapter_name, &raw).map(str::to_string) else {
        return;
    };

    if adapter_name == "gemini" {
        let tools = body
            .as_object_mut()
            .map(|o| o.entry("tools").or_insert_with(|| json!([])));
        let Some(tools) = tools.and_then(Value::as_array_mut) else {
            return;
        };
        let declared = tools.iter().any(|t| {
            t.get("functionDeclarations")
                .and_then(Value::as_array)
                .is_some_and(|ds| {
                    ds.iter()
                        .any(|d| d.get("name").and_then(Value::as_str) == Some(name.as_str()))
                })
        });
        if declared {
            return;
        }
        let slot = tools.iter().position(|t| {
            t.get("functionDeclarations").and_then(Value::as_array).is_some()
        });
        match slot {
            Some(i) => {
                if let Some(declarations) = tools[i]
                    .get_mut("functionDeclarations")
                    .and_then(Value::as_array_mut)
                {
                    declarations.push(raw);
                }
            }
            None => tools.push(json!({ "functionDeclarations": [raw] })),
        }
        return;
    }

    let tools = body
        .as_object_mut()
        .map(|o| o.entry("tools").or_insert_with(|| json!([])));
    let Some(tools) = tools.and_then(Value::as_array_mut) else {
        return;
    };
    let exists = tools
        .iter()
        .any(|t| raw_tool_name(adapter_name, t) == Some(name.as_str()));
    if !exists {
        tools.push(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_anthropic_version_header_wins() {
        let h = headers(&[("anthropic-version", "2023-06-01")]);
        assert_eq!(
            identify("/v1/chat/completions", &h, false),
            Provider::Anthropic
        );
    }

    #[test]
    fn test_anthropic_api_key_prefix() {
        let h = headers(&[("x-api-key", "sk-ant-api03-xyz")]);
        assert_eq!(identify("/v1/messages", &h, false), Provider::Anthropic);
    }

    #[test]
    fn test_goog_api_key() {
        let h = headers(&[("x-goog-api-key", "AIza-xyz")]);
        assert_eq!(identify("/anything", &h, false), Provider::Gemini);
    }

    #[test]
    fn test_bedrock_path_gated_on_enabled() {
        let h = HeaderMap::new();
        let path = "/model/anthropic.claude-sonnet-4/invoke";
        assert_eq!(identify(path, &h, true), Provider::Bedrock);
        assert_eq!(identify(path, &h, false), Provider::Unknown);
    }

    #[test]
    fn test_bedrock_path_variants() {
        assert!(is_bedrock_path("/model/m1/invoke"));
        assert!(is_bedrock_path("/model/m1/invoke-with-response-stream"));
        assert!(is_bedrock_path("/model/m1/converse"));
        assert!(is_bedrock_path("/model/m1/converse-stream"));
        assert!(!is_bedrock_path("/model/m1/other"));
        assert!(!is_bedrock_path("/v1/messages"));
    }

    #[test]
    fn test_path_table() {
        let h = HeaderMap::new();
        assert_eq!(identify("/v1/messages", &h, false), Provider::Anthropic);
        assert_eq!(identify("/v1/chat/completions", &h, false), Provider::OpenAi);
        assert_eq!(identify("/v1/responses", &h, false), Provider::OpenAi);
        assert_eq!(identify("/api/chat", &h, false), Provider::Ollama);
        assert_eq!(
            identify("/v1beta/models/gemini-2.5-flash:generateContent", &h, false),
            Provider::Gemini
        );
        assert_eq!(identify("/unknown/path", &h, false), Provider::Unknown);
    }

    #[test]
    fn test_adapter_resolution() {
        assert_eq!(
            adapter_for(Provider::Anthropic, "/v1/messages")
                .unwrap()
                .name(),
            "anthropic"
        );
        assert_eq!(
            adapter_for(Provider::Bedrock, "/model/m/invoke").unwrap().name(),
            "anthropic"
        );
        assert_eq!(
            adapter_for(Provider::OpenAi, "/v1/responses").unwrap().name(),
            "openai-responses"
        );
        assert_eq!(
            adapter_for(Provider::OpenAi, "/v1/chat/completions")
                .unwrap()
                .name(),
            "openai"
        );
        assert_eq!(
            adapter_for(Provider::Ollama, "/api/chat").unwrap().name(),
            "openai"
        );
        assert!(adapter_for(Provider::Unknown, "/x").is_none());
    }

    #[test]
    fn test_inject_tool_shapes() {
        let schema = json!({"type": "object", "properties": {"query": {"type": "string"}}});

        let mut body = json!({"model": "claude-sonnet-4"});
        inject_tool(&mut body, "anthropic", "gateway_search_tools", "Search.", schema.clone());
        assert_eq!(body["tools"][0]["name"], "gateway_search_tools");
        assert!(body["tools"][0]["input_schema"].is_object());

        let mut body = json!({"model": "gpt-4o", "tools": []});
        inject_tool(&mut body, "openai", "gateway_search_tools", "Search.", schema.clone());
        assert_eq!(body["tools"][0]["function"]["name"], "gateway_search_tools");

        let mut body = json!({"model": "gpt-4.1"});
        inject_tool(&mut body, "openai-responses", "gateway_search_tools", "Search.", schema.clone());
        assert_eq!(body["tools"][0]["name"], "gateway_search_tools");
        assert!(body["tools"][0]["parameters"].is_object());

        let mut body = json!({"contents": []});
        inject_tool(&mut body, "gemini", "gateway_search_tools", "Search.", schema);
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "gateway_search_tools"
        );
    }

    #[test]
    fn test_merge_raw_tool_dedups_by_name() {
        let mut body = json!({"tools": [
            {"name": "deploy", "description": "old", "input_schema": {}}
        ]});
        merge_raw_tool(
            &mut body,
            "anthropic",
            json!({"name": "deploy", "description": "new", "input_schema": {}}),
        );
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
        assert_eq!(body["tools"][0]["description"], "old");
    }
}
