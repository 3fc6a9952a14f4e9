use std::collections::HashMap;

use serde_json::{json, Value};

use tokengate_common::Result;

use super::{
    parse_json, to_bytes, Adapter, CompressedContent, ContentType, ExtractedContent,
    ParsedRequest, Provider, TokenUsage,
};

/// Adapter for the Gemini generateContent format
/// (`{systemInstruction, contents:[{role, parts:[…]}],
/// tools:[{functionDeclarations:[…]}]}`).
///
/// Gemini carries no call ids, so tool-result ids are synthesized from the
/// function name and the part's position. `functionResponse.response` is an
/// object, not text: extraction reads the first string under a
/// `result`/`content`/`output` key (falling back to the serialized object)
/// and apply writes the compressed text back to the same slot.
pub struct GeminiAdapter;

const RESPONSE_TEXT_KEYS: &[&str] = &["result", "content", "output"];

fn response_text(response: &Value) -> (String, Option<String>) {
    for key in RESPONSE_TEXT_KEYS {
        if let Some(text) = response.get(*key).and_then(Value::as_str) {
            return (text.to_string(), Some((*key).to_string()));
        }
    }
    (response.to_string(), None)
}

fn synth_id(name: &str, message_index: usize, block_index: usize) -> String {
    format!("{}#{}.{}", name, message_index, block_index)
}

fn content_text(content: &Value) -> Option<String> {
    let parts = content.get("parts")?.as_array()?;
    let text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

impl Adapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn parse_request(&self, body: &[u8]) -> Result<ParsedRequest> {
        parse_json(self.name(), body)
    }

    fn extract_tool_output(&self, request: &ParsedRequest) -> Vec<ExtractedContent> {
        let Some(contents) = request.value().get("contents").and_then(Value::as_array) else {
            return Vec::new();
        };

        let mut extracted = Vec::new();
        for (message_index, content) in contents.iter().enumerate() {
            let Some(parts) = content.get("parts").and_then(Value::as_array) else {
                continue;
            };
            for (block_index, part) in parts.iter().enumerate() {
                let Some(response) = part.get("functionResponse") else {
                    continue;
                };
                let Some(name) = response.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let (text, wrap_key) = response
                    .get("response")
                    .map(response_text)
                    .unwrap_or_default();
                extracted.push(ExtractedContent {
                    id: synth_id(name, message_index, block_index),
                    content: text,
                    content_type: ContentType::ToolResult,
                    tool_name: Some(name.to_string()),
                    message_index,
                    block_index: Some(block_index),
                    metadata: Some(json!({ "wrap_key": wrap_key })),
                });
            }
        }
        extracted
    }

    fn extract_tool_discovery(&self, request: &ParsedRequest) -> Vec<ExtractedContent> {
        let Some(tools) = request.value().get("tools").and_then(Value::as_array) else {
            return Vec::new();
        };

        let mut extracted = Vec::new();
        let mut index = 0usize;
        for tool in tools {
            let Some(declarations) = tool.get("functionDeclarations").and_then(Value::as_array)
            else {
                continue;
            };
            for declaration in declarations {
                let Some(name) = declaration.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let description = declaration
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                extracted.push(ExtractedContent {
                    id: name.to_string(),
                    content: format!("{}\n{}", name, description),
                    content_type: ContentType::ToolDef,
                    tool_name: Some(name.to_string()),
                    message_index: index,
                    block_index: None,
                    metadata: Some(json!({ "raw_json": declaration })),
                });
                index += 1;
            }
        }
        extracted
    }

    fn extract_user_query(&self, request: &ParsedRequest) -> Option<String> {
        let contents = request.value().get("contents")?.as_array()?;
        contents
            .iter()
            .rev()
            .find(|c| c.get("role").and_then(Value::as_str) == Some("user"))
            .and_then(content_text)
    }

    fn extract_user_messages(&self, request: &ParsedRequest) -> Vec<String> {
        let Some(contents) = request.value().get("contents").and_then(Value::as_array) else {
            return Vec::new();
        };
        contents
            .iter()
            .filter(|c| c.get("role").and_then(Value::as_str) == Some("user"))
            .filter_map(content_text)
            .collect()
    }

    fn extract_tool_calls(&self, request: &ParsedRequest) -> Vec<String> {
        let Some(contents) = request.value().get("contents").and_then(Value::as_array) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for content in contents {
            let Some(parts) = content.get("parts").and_then(Value::as_array) else {
                continue;
            };
            for part in parts {
                if let Some(name) = part.pointer("/functionCall/name").and_then(Value::as_str) {
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
        let replacements: HashMap<&str, &CompressedContent> = results
            .iter()
            .filter(|r| !r.compressed.is_empty())
            .map(|r| (r.id.as_str(), r))
            .collect();

        if let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) {
            for (message_index, content) in contents.iter_mut().enumerate() {
                let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
                    continue;
                };
                for (block_index, part) in parts.iter_mut().enumerate() {
                    let Some(response) = part.get_mut("functionResponse") else {
                        continue;
                    };
                    let Some(name) = response.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let id = synth_id(name, message_index, block_index);
                    let Some(result) = replacements.get(id.as_str()) else {
                        continue;
                    };
                    let wrap_key = response
                        .get("response")
                        .map(|r| response_text(r).1)
                        .unwrap_or(None);
                    let text = Value::String(result.compressed.clone());
                    match wrap_key {
                        Some(key) => response["response"][key.as_str()] = text,
                        None => response["response"] = json!({ "result": text }),
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
            for tool in tools.iter_mut() {
                let Some(declarations) =
                    tool.get_mut("functionDeclarations").and_then(Value::as_array_mut)
                else {
                    continue;
                };
                declarations.retain(|d| {
                    d.get("name")
                        .and_then(Value::as_str)
                        .map_or(true, |name| *decisions.get(name).unwrap_or(&true))
                });
            }
            // Entries holding only an emptied declaration list are dropped;
            // built-in tool entries (e.g. googleSearch) are untouched.
            tools.retain(|tool| {
                match tool.get("functionDeclarations").and_then(Value::as_array) {
                    Some(declarations) => {
                        !declarations.is_empty() || tool.as_object().is_some_and(|o| o.len() > 1)
                    }
                    None => true,
                }
            });
        }

        to_bytes(&body)
    }

    fn extract_usage(&self, response: &[u8]) -> Option<TokenUsage> {
        let value: Value = serde_json::from_slice(response).ok()?;
        let usage = value.get("usageMetadata")?;
        Some(TokenUsage {
            input_tokens: usage
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: usage
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: usage
                .get("cachedContentTokenCount")
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
            "systemInstruction": {"parts": [{"text": "Be helpful."}]},
            "contents": [
                {"role": "user", "parts": [{"text": "Run the tests"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "run_tests", "args": {}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "run_tests",
                     "response": {"result": "test output: 40 passed, 2 failed"}}}
                ]},
                {"role": "user", "parts": [{"text": "Fix the failures"}]}
            ],
            "tools": [
                {"functionDeclarations": [
                    {"name": "run_tests", "description": "Run the test suite", "parameters": {}},
                    {"name": "deploy", "description": "Deploy to production", "parameters": {}}
                ]}
            ]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_extract_tool_output_synthesizes_ids() {
        let adapter = GeminiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let outputs = adapter.extract_tool_output(&parsed);

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].id, "run_tests#2.0");
        assert_eq!(outputs[0].content, "test output: 40 passed, 2 failed");
        assert_eq!(
            outputs[0].metadata.as_ref().unwrap()["wrap_key"],
            "result"
        );
    }

    #[test]
    fn test_object_response_falls_back_to_serialized() {
        let adapter = GeminiAdapter;
        let body = json!({
            "contents": [
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "lookup",
                     "response": {"rows": [1, 2, 3], "count": 3}}}
                ]}
            ]
        })
        .to_string();

        let parsed = adapter.parse_request(body.as_bytes()).unwrap();
        let outputs = adapter.extract_tool_output(&parsed);
        assert!(outputs[0].content.contains("\"count\":3"));
        assert!(outputs[0].metadata.as_ref().unwrap()["wrap_key"].is_null());
    }

    #[test]
    fn test_discovery_flattens_declarations() {
        let adapter = GeminiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let tools = adapter.extract_tool_discovery(&parsed);

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].id, "run_tests");
        assert_eq!(
            tools[1].metadata.as_ref().unwrap()["raw_json"]["name"],
            "deploy"
        );
    }

    #[test]
    fn test_apply_tool_output_writes_same_key() {
        let adapter = GeminiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let results = vec![CompressedContent {
            id: "run_tests#2.0".into(),
            compressed: "2 failures".into(),
            shadow_ref: None,
            keep: true,
        }];

        let emitted = adapter.apply_tool_output(&parsed, &results).unwrap();
        let value: Value = serde_json::from_slice(&emitted).unwrap();
        assert_eq!(
            value["contents"][2]["parts"][0]["functionResponse"]["response"]["result"],
            "2 failures"
        );
    }

    #[test]
    fn test_apply_discovery_drops_emptied_entry() {
        let adapter = GeminiAdapter;
        let parsed = adapter.parse_request(&sample_body()).unwrap();
        let results = vec![
            CompressedContent {
                id: "run_tests".into(),
                compressed: String::new(),
                shadow_ref: None,
                keep: false,
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
        assert!(value["tools"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_apply_discovery_keep_all_is_identity() {
        let adapter = GeminiAdapter;
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
    fn test_extract_usage() {
        let adapter = GeminiAdapter;
        let response = json!({
            "candidates": [],
            "usageMetadata": {
                "promptTokenCount": 700,
                "candidatesTokenCount": 55,
                "cachedContentTokenCount": 200
            }
        })
        .to_string();

        let usage = adapter.extract_usage(response.as_bytes()).unwrap();
        assert_eq!(usage.input_tokens, 700);
        assert_eq!(usage.output_tokens, 55);
        assert_eq!(usage.cache_read_input_tokens, 200);
    }
}
