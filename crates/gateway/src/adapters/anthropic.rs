use std::collections::HashMap;

use serde_json::{json, Value};

use tokengate_common::Result;

use super::{
    parse_json, to_bytes, Adapter, CompressedContent, ContentType, ExtractedContent,
    ParsedRequest, Provider, TokenUsage,
};

/// Adapter for the Anthropic messages format
/// (`{model, system, messages[], tools[], max_tokens}`), also used on
/// Bedrock invoke/converse routes.
pub struct AnthropicAdapter;

// ---------------------------------------------------------------------------
// Extraction helpers
// ---------------------------------------------------------------------------

/// Flatten a tool_result `content` slot: either a plain string or an array
/// of typed blocks whose text parts are joined.
fn flatten_block_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                if b.get("type").and_then(Value::as_str) == Some("text") {
                    b.get("text").and_then(Value::as_str).map(str::to_string)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Map tool_use id → tool name across all assistant messages.
fn tool_name_index(messages: &[Value]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(blocks) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                if let (Some(id), Some(name)) = (
                    block.get("id").and_then(Value::as_str),
                    block.get("name").and_then(Value::as_str),
                ) {
                    index.insert(id.to_string(), name.to_string());
                }
            }
        }
    }
    index
}

fn user_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => {
            let text = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
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

impl Adapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn parse_request(&self, body: &[u8]) -> Result<ParsedRequest> {
        parse_json(self.name(), body)
    }

    fn extract_tool_output(&self, request: &ParsedRequest) -> Vec<ExtractedContent> {
        let Some(messages) = request.value().get("messages").and_then(Value::as_array) else {
            return Vec::new();
        };
        let names = tool_name_index(messages);

        let mut extracted = Vec::new();
        for (message_index, message) in messages.iter().enumerate() {
            if message.get("role").and_then(Value::as_str) != Some("user") {
                continue;
            }
            let Some(blocks) = message.get("content").and_then(Value::as_array) else {
                continue;
            };
            for (block_index, block) in blocks.iter().enumerate() {
                if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                    continue;
                }
                let Some(id) = block.get("tool_use_id").and_then(Value::as_str) else {
                    continue;
                };
                let content = block.get("content").map(flatten_block_content).unwrap_or_default();
                extracted.push(ExtractedContent {
                    id: id.to_string(),
                    content,
                    content_type: ContentType::ToolResult,
                    tool_name: names.get(id).cloned(),
                    message_index,
                    block_index: Some(block_index),
                    metadata: None,
                });
            }
        }
        extracted
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
        let messages = request.value().get("messages")?.as_array()?;
        messages
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .and_then(user_text)
    }

    fn extract_user_messages(&self, request: &ParsedRequest) -> Vec<String> {
        let Some(messages) = request.value().get("messages").and_then(Value::as_array) else {
            return Vec::new();
        };
        messages
            .iter()
            .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .filter_map(user_text)
            .collect()
    }

    fn extract_tool_calls(&self, request: &ParsedRequest) -> Vec<String> {
        let Some(messages) = request.value().get("messages").and_then(Value::as_array) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for message in messages {
            if message.get("role").and_then(Value::as_str) != Some("assistant") {
                continue;
            }
            let Some(blocks) = message.get("content").and_then(Value::as_array) else {
                continue;
            };
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    if let Some(name) = block.get("name").and_then(Value::as_str) {
                        names.push(name.to_string());
                    }
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
                let Some(blocks) = message.get_mut("content").and_then(Value::as_array_mut) else {
                    continue;
                };
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                        continue;
                    }
                    let Some(id) = block.get("tool_use_id").and_then(Value::as_str) else {
                        continue;
                    };
                    if let Some(text) = replacements.get(id) {
                        block["content"] = Value::String(text.to_string());
                    }
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
            cache_creation_input_tokens: usage
                .get("cache_creation_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_read_input_tokens: usage
                .get("cache_read_input_tokens")
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
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "Run the tests"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Running."},
                    {"type": "tool_use", "id": "toolu_1", "name": "run_tests", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1",
                     "content": "test output: 40 passed, 2 failed <details>"}
                ]},
                {"role": "user", "content": "Fix the failures"}
            ],
            "tools": [
                {"name": "run_tests", "description": "Run the test suite", "input_schema": {"type": "object"}},
                {"name": "deploy", "description": "Deploy to production", "input_schema": {"type": "object"}}
            ]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_extract_tool_output_with_names() {
        let adapter = AnthropicAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let outputs = adapter.extract_tool_output(&parsed);

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].id, "toolu_1");
        assert_eq!(outputs[0].tool_name.as_deref(), Some("run_tests"));
        assert_eq!(outputs[0].content_type, ContentType::ToolResult);
        assert!(outputs[0].content.contains("40 passed"));
        assert_eq!(outputs[0].message_index, 2);
        assert_eq!(outputs[0].block_index, Some(0));
    }

    #[test]
    fn test_extract_discovery_carries_raw_json() {
        let adapter = AnthropicAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let tools = adapter.extract_tool_discovery(&parsed);

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].id, "run_tests");
        let raw = tools[0].metadata.as_ref().unwrap()["raw_json"].clone();
        assert_eq!(raw["name"], "run_tests");
        assert!(raw["input_schema"].is_object());
    }

    #[test]
    fn test_user_query_is_last_user_message() {
        let adapter = AnthropicAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        assert_eq!(
            adapter.extract_user_query(&parsed).as_deref(),
            Some("Fix the failures")
        );
    }

    #[test]
    fn test_user_messages_skip_tool_results() {
        let adapter = AnthropicAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let messages = adapter.extract_user_messages(&parsed);
        assert_eq!(messages, vec!["Run the tests", "Fix the failures"]);
    }

    #[test]
    fn test_tool_calls_recency_signal() {
        let adapter = AnthropicAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        assert_eq!(adapter.extract_tool_calls(&parsed), vec!["run_tests"]);
    }

    #[test]
    fn test_apply_tool_output_splices_by_id() {
        let adapter = AnthropicAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let results = vec![CompressedContent {
            id: "toolu_1".into(),
            compressed: "<<<SHADOW:shadow:0011223344556677889900112233445566>>>\n2 failures".into(),
            shadow_ref: Some("shadow:0011223344556677889900112233445566".into()),
            keep: true,
        }];

        let emitted = adapter.apply_tool_output(&parsed, &results).unwrap();
        let value: Value = serde_json::from_slice(&emitted).unwrap();
        let content = &value["messages"][2]["content"][0]["content"];
        assert!(content.as_str().unwrap().starts_with("<<<SHADOW:"));
    }

    #[test]
    fn test_apply_empty_results_is_identity() {
        let adapter = AnthropicAdapter;
        let body = sample_body();
        let parsed = adapter.parse_request(&body).unwrap();
        let emitted = adapter.apply_tool_output(&parsed, &[]).unwrap();

        let before: Value = serde_json::from_slice(&body).unwrap();
        let after: Value = serde_json::from_slice(&emitted).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_apply_unknown_id_skipped() {
        let adapter = AnthropicAdapter;
        let body = sample_body();
        let parsed = adapter.parse_request(&body).unwrap();
        let results = vec![CompressedContent {
            id: "toolu_nonexistent".into(),
            compressed: "ignored".into(),
            shadow_ref: None,
            keep: true,
        }];

        let emitted = adapter.apply_tool_output(&parsed, &results).unwrap();
        let before: Value = serde_json::from_slice(&body).unwrap();
        let after: Value = serde_json::from_slice(&emitted).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_apply_discovery_filters_and_preserves_order() {
        let adapter = AnthropicAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let results = vec![
            CompressedContent {
                id: "run_tests".into(),
                compressed: String::new(),
                shadow_ref: None,
                keep: true,
            },
            CompressedContent {
                id: "deploy".into(),
                compressed: String::new(),
                shadow_ref: None,
                keep: false,
            },
        ];

        let emitted = adapter.apply_tool_discovery(&parsed, &results).unwrap();
        let value: Value = serde_json::from_slice(&emitted).unwrap();
        let tools = value["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "run_tests");
    }

    #[test]
    fn test_apply_discovery_keep_all_is_identity() {
        let adapter = AnthropicAdapter;
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
    fn test_markup_survives_marshalling() {
        let adapter = AnthropicAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let emitted = adapter.apply_tool_output(&parsed, &[]).unwrap();
        let text = String::from_utf8(emitted).unwrap();
        // Bodies carry angle brackets; marshalling must not entity-escape them.
        assert!(text.contains("<details>"));
        assert!(!text.contains("\\u003c"));
    }

    #[test]
    fn test_extract_usage() {
        let adapter = AnthropicAdapter;
        let response = json!({
            "content": [{"type": "text", "text": "ok"}],
            "usage": {
                "input_tokens": 1200,
                "output_tokens": 80,
                "cache_read_input_tokens": 900
            }
        })
        .to_string();

        let usage = adapter.extract_usage(response.as_bytes()).unwrap();
        assert_eq!(usage.input_tokens, 1200);
        assert_eq!(usage.output_tokens, 80);
        assert_eq!(usage.cache_read_input_tokens, 900);
        assert_eq!(usage.cache_creation_input_tokens, 0);
    }

    #[test]
    fn test_unrecognised_shape_yields_empty() {
        let adapter = AnthropicAdapter;
        let parsed = adapter
            .parse_request(br#"{"model": "claude-sonnet-4"}"#)
            .unwrap();
        assert!(adapter.extract_tool_output(&parsed).is_empty());
        assert!(adapter.extract_tool_discovery(&parsed).is_empty());
        assert!(adapter.extract_user_query(&parsed).is_none());
    }
}
