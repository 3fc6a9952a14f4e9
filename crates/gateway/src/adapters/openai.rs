use std::collections::HashMap;

use serde_json::{json, Value};

use tokengate_common::Result;

use super::{
    parse_json, to_bytes, Adapter, CompressedContent, ContentType, ExtractedContent,
    ParsedRequest, Provider, TokenUsage,
};

/// Adapter for the OpenAI Chat Completions format
/// (`{model, messages[], tools:[{type:"function", function:{…}}]}`), also
/// used for Ollama's OpenAI-compatible chat route.
pub struct OpenAiAdapter;

fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text = parts
                .iter()
                .filter(|p| {
                    matches!(
                        p.get("type").and_then(Value::as_str),
                        Some("text") | Some("input_text")
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

/// Map tool_call id → function name across assistant messages.
fn call_name_index(messages: &[Value]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for message in messages {
        let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
            continue;
        };
        for call in calls {
            if let (Some(id), Some(name)) = (
                call.get("id").and_then(Value::as_str),
                call.pointer("/function/name").and_then(Value::as_str),
            ) {
                index.insert(id.to_string(), name.to_string());
            }
        }
    }
    index
}

impl Adapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn parse_request(&self, body: &[u8]) -> Result<ParsedRequest> {
        parse_json(self.name(), body)
    }

    fn extract_tool_output(&self, request: &ParsedRequest) -> Vec<ExtractedContent> {
        let Some(messages) = request.value().get("messages").and_then(Value::as_array) else {
            return Vec::new();
        };
        let names = call_name_index(messages);

        messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.get("role").and_then(Value::as_str) == Some("tool"))
            .filter_map(|(message_index, message)| {
                let id = message.get("tool_call_id").and_then(Value::as_str)?;
                let content = message
                    .get("content")
                    .and_then(message_text)
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
                let function = tool.get("function")?;
                let name = function.get("name").and_then(Value::as_str)?;
                let description = function
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
        let messages = request.value().get("messages")?.as_array()?;
        messages
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .and_then(|m| m.get("content"))
            .and_then(message_text)
    }

    fn extract_user_messages(&self, request: &ParsedRequest) -> Vec<String> {
        let Some(messages) = request.value().get("messages").and_then(Value::as_array) else {
            return Vec::new();
        };
        messages
            .iter()
            .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .filter_map(|m| m.get("content"))
            .filter_map(message_text)
            .collect()
    }

    fn extract_tool_calls(&self, request: &ParsedRequest) -> Vec<String> {
        let Some(messages) = request.value().get("messages").and_then(Value::as_array) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for message in messages {
            let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
                continue;
            };
            for call in calls {
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    names.push(name.to_string());
                }
            }
        }
        names
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

        if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages {
                if message.get("role").and_then(Value::as_str) != Some("tool") {
                    continue;
                }
                let Some(id) = message.get("tool_call_id").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(text) = replacements.get(id) {
                    message["content"] = Value::String(text.to_string());
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
                tool.pointer("/function/name")
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
            input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: usage
                .pointer("/prompt_tokens_details/cached_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body() -> Vec<u8> {
        json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "Run the tests"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "run_tests", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1",
                 "content": "test output: 40 passed, 2 failed"},
                {"role": "user", "content": [{"type": "text", "text": "Fix the failures"}]}
            ],
            "tools": [
                {"type": "function", "function":
                    {"name": "run_tests", "description": "Run the test suite", "parameters": {}}},
                {"type": "function", "function":
                    {"name": "deploy", "description": "Deploy to production", "parameters": {}}}
            ]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_extract_tool_output() {
        let adapter = OpenAiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let outputs = adapter.extract_tool_output(&parsed);

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].id, "call_1");
        assert_eq!(outputs[0].tool_name.as_deref(), Some("run_tests"));
        assert_eq!(outputs[0].message_index, 2);
    }

    #[test]
    fn test_extract_discovery_unwraps_function() {
        let adapter = OpenAiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let tools = adapter.extract_tool_discovery(&parsed);

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1].id, "deploy");
        assert!(tools[1].content.contains("Deploy to production"));
        // raw_json carries the wrapped definition for round-trip injection.
        let raw = &tools[1].metadata.as_ref().unwrap()["raw_json"];
        assert_eq!(raw["type"], "function");
    }

    #[test]
    fn test_user_query_joins_parts() {
        let adapter = OpenAiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        assert_eq!(
            adapter.extract_user_query(&parsed).as_deref(),
            Some("Fix the failures")
        );
    }

    #[test]
    fn test_apply_tool_output() {
        let adapter = OpenAiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let results = vec![CompressedContent {
            id: "call_1".into(),
            compressed: "2 failures in auth tests".into(),
            shadow_ref: None,
            keep: true,
        }];

        let emitted = adapter.apply_tool_output(&parsed, &results).unwrap();
        let value: Value = serde_json::from_slice(&emitted).unwrap();
        assert_eq!(value["messages"][2]["content"], "2 failures in auth tests");
    }

    #[test]
    fn test_apply_discovery_keep_all_is_identity() {
        let adapter = OpenAiAdapter;
        let body = sample_body();
        let parsed = adapter.parse_request(&body).unwrap();
        let results: Vec<CompressedContent> = adapter
            .extract_tool_discovery(&parsed)
            .iter()
            .map(|t| CompressedContent {
                id: t.id.clone(),
                compressed: String::new(),
                shadow_ref: None,
                keep: true,
            })
            .collect();

        let emitted = adapter.apply_tool_discovery(&parsed, &results).unwrap();
        let before: Value = serde_json::from_slice(&body).unwrap();
        let after: Value = serde_json::from_slice(&emitted).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_apply_discovery_drops_rejected() {
        let adapter = OpenAiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let results = vec![CompressedContent {
            id: "deploy".into(),
            compressed: String::new(),
            shadow_ref: None,
            keep: false,
        }];

        let emitted = adapter.apply_tool_discovery(&parsed, &results).unwrap();
        let value: Value = serde_json::from_slice(&emitted).unwrap();
        let tools = value["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["name"], "run_tests");
    }

    #[test]
    fn test_extract_usage_with_cached_tokens() {
        let adapter = OpenAiAdapter;
        let response = json!({
            "choices": [],
            "usage": {
                "prompt_tokens": 500,
                "completion_tokens": 40,
                "prompt_tokens_details": {"cached_tokens": 300}
            }
        })
        .to_string();

        let usage = adapter.extract_usage(response.as_bytes()).unwrap();
        assert_eq!(usage.input_tokens, 500);
        assert_eq!(usage.output_tokens, 40);
        assert_eq!(usage.cache_read_input_tokens, 300);
    }
}
