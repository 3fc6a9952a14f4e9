use std::collections::HashMap;

use serde_json::{json, Value};

use tokengate_common::Result;

use super::{
    parse_json, to_bytes, Adapter, CompressedContent, ContentType, ExtractedContent,
    ParsedRequest, Provider, TokenUsage,
};

/// Adapter for the OpenAI Responses format (`{model, input:[…]}` with mixed
/// items: messages, `function_call`, `function_call_output`; tools are flat
/// objects with `parameters`).
pub struct ResponsesAdapter;

fn item_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text = parts
                .iter()
                .filter(|p| {
                    matches!(
                        p.get("type").and_then(Value::as_str),
                        Some("input_text") | Some("output_text") | Some("text")
                    )
                })
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}

fn is_user_message(item: &Value) -> bool {
    let is_message = matches!(
        item.get("type").and_then(Value::as_str),
        None | Some("message")
    );
    is_message && item.get("role").and_then(Value::as_str) == Some("user")
}

/// Map call_id → function name across `function_call` items.
fn call_name_index(input: &[Value]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for item in input {
        if item.get("type").and_then(Value::as_str) != Some("function_call") {
            continue;
        }
        if let (Some(id), Some(name)) = (
            item.get("call_id").and_then(Value::as_str),
            item.get("name").and_then(Value::as_str),
        ) {
            index.insert(id.to_string(), name.to_string());
        }
    }
    index
}

impl Adapter for ResponsesAdapter {
    fn name(&self) -> &'static str {
        "openai-responses"
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn parse_request(&self, body: &[u8]) -> Result<ParsedRequest> {
        parse_json(self.name(), body)
    }

    fn extract_tool_output(&self, request: &ParsedRequest) -> Vec<ExtractedContent> {
        let Some(input) = request.value().get("input").and_then(Value::as_array) else {
            return Vec::new();
        };
        let names = call_name_index(input);

        input
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                item.get("type").and_then(Value::as_str) == Some("function_call_output")
            })
            .filter_map(|(message_index, item)| {
                let id = item.get("call_id").and_then(Value::as_str)?;
                let content = item
                    .get("output")
                    .and_then(item_text)
                    .unwrap_or_default();
                Some(ExtractedContent {
                    id: id.to_string(),
                    content,
                    content_type: ContentType::ToolResult,
                    tool_name: names.get(id).cloned(),
                    message_index,
                    block_index: None,
                    metadata: None,
                })
            })
            .collect()
    }

    fn extract_tool_discovery(&self, request: &ParsedRequest) -> Vec<ExtractedContent> {
        let Some(tools) = request.value().get("tools").and_then(Value::as_array) else {
            return Vec::new();
        };

        tools
            .iter()
            .enumerate()
            .filter_map(|(index, tool)| {
                let name = tool.get("name").and_then(Value::as_str)?;
                let description = tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Some(ExtractedContent {
                    id: name.to_string(),
                    content: format!("{}\n{}", name, description),
                    content_type: ContentType::ToolDef,
                    tool_name: Some(name.to_string()),
                    message_index: index,
                    block_index: None,
                    metadata: Some(json!({ "raw_json": tool })),
                })
            })
            .collect()
    }

    fn extract_user_query(&self, request: &ParsedRequest) -> Option<String> {
        match request.value().get("input") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(input)) => input
                .iter()
                .rev()
                .find(|item| is_user_message(item))
                .and_then(|item| item.get("content"))
                .and_then(item_text),
            _ => None,
        }
    }

    fn extract_user_messages(&self, request: &ParsedRequest) -> Vec<String> {
        match request.value().get("input") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(input)) => input
                .iter()
                .filter(|item| is_user_message(item))
                .filter_map(|item| item.get("content"))
                .filter_map(item_text)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn extract_tool_calls(&self, request: &ParsedRequest) -> Vec<String> {
        let Some(input) = request.value().get("input").and_then(Value::as_array) else {
            return Vec::new();
        };
        input
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
            .filter_map(|item| item.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    fn apply_tool_output(
        &self,
        request: &ParsedRequest,
        results: &[CompressedContent],
    ) -> Result<Vec<u8>> {
        let mut body = request.value().clone();
        let replacements: HashMap<&str, &str> = results
            .iter()
            .filter(|r| !r.compressed.is_empty())
            .map(|r| (r.id.as_str(), r.compressed.as_str()))
            .collect();

        if let Some(input) = body.get_mut("input").and_then(Value::as_array_mut) {
            for item in input {
                if item.get("type").and_then(Value::as_str) != Some("function_call_output") {
                    continue;
                }
                let Some(id) = item.get("call_id").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(text) = replacements.get(id) {
                    item["output"] = Value::String(text.to_string());
                }
            }
        }

        to_bytes(&body)
    }

    fn apply_tool_discovery(
        &self,
        request: &ParsedRequest,
        results: &[CompressedContent],
    ) -> Result<Vec<u8>> {
        let mut body = request.value().clone();
        let decisions: HashMap<&str, bool> =
            results.iter().map(|r| (r.id.as_str(), r.keep)).collect();

        if let Some(tools) = body.get_mut("tools").and_then(Value::as_array_mut) {
            tools.retain(|tool| {
                tool.get("name")
                    .and_then(Value::as_str)
                    .map_or(true, |name| *decisions.get(name).unwrap_or(&true))
            });
        }

        to_bytes(&body)
    }

    fn extract_usage(&self, response: &[u8]) -> Option<TokenUsage> {
        let value: Value = serde_json::from_slice(response).ok()?;
        let usage = value.get("usage")?;
        Some(TokenUsage {
            input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: usage
                .pointer("/input_tokens_details/cached_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
