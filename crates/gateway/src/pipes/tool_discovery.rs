use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};

use tokengate_common::api::compressor::{FilterToolsRequest, ToolSummary};
use tokengate_common::config::{DiscoveryConfig, DiscoveryStrategy};

use crate::adapters::{inject_tool, CompressedContent, ExtractedContent};
use crate::compressor::Compressor;
use crate::sessions::ToolSessionStore;
use crate::telemetry::{DiscoveryEvent, TelemetrySink};

use super::PipelineContext;

/// Words too common to carry relevance signal.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "this", "that", "your", "you", "are", "can", "will",
    "how", "what", "when", "where", "all", "any", "please", "into", "out", "about", "then",
    "than", "them", "its", "not", "was", "has", "have",
];

/// Score one tool definition against the request. Higher is more relevant.
pub fn score_tool(
    tool: &ExtractedContent,
    query: &str,
    expanded: &HashSet<String>,
    always_keep: &HashSet<String>,
    recently_used: &HashSet<String>,
) -> i64 {
    let name = tool.tool_name.as_deref().unwrap_or(&tool.id);
    let mut score = 0i64;

    if expanded.contains(name) {
        score += 1000;
    }
    if always_keep.contains(name) {
        score += 100;
    }
    if recently_used.contains(name) {
        score += 100;
    }

    let query_lower = query.to_lowercase();
    if !query_lower.is_empty() && query_lower.contains(&name.to_lowercase()) {
        score += 50;
    }

    let haystack = tool.content.to_lowercase();
    for word in query_lower.split(|c: char| !c.is_alphanumeric()) {
        if word.len() < 3 || STOP_WORDS.contains(&word) {
            continue;
        }
        if haystack.contains(word) {
            score += 10;
        }
    }

    score
}

/// Keep-count formula: bounded by min_tools below and max_tools above.
fn keep_count(config: &DiscoveryConfig, total: usize) -> usize {
    let target = (config.target_ratio * total as f64).ceil() as usize;
    target.max(config.min_tools).min(config.max_tools)
}

/// Filters the tool catalog down to the definitions relevant to the current
/// request, deferring the rest into the session for search-based recall.
pub struct ToolDiscoveryPipe {
    config: DiscoveryConfig,
    sessions: Arc<ToolSessionStore>,
    compressor: Option<Arc<dyn Compressor>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ToolDiscoveryPipe {
    pub fn new(
        config: DiscoveryConfig,
        sessions: Arc<ToolSessionStore>,
        compressor: Option<Arc<dyn Compressor>>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            sessions,
            compressor,
            telemetry,
        }
    }

    /// JSON schema of the injected search tool.
    pub fn search_tool_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What capability you are looking for"
                }
            },
            "required": ["query"]
        })
    }

    fn search_tool_description(&self) -> String {
        "Search the catalog of additional tools that are not currently loaded. \
         Returns matching tool names and descriptions; matched tools become \
         available on your next call."
            .to_string()
    }

    /// Run the pipe over one request body. Always returns a body to forward.
    pub async fn process(&self, ctx: &mut PipelineContext, body: &[u8]) -> Vec<u8> {
        if !self.config.enabled || ctx.passthrough {
            return body.to_vec();
        }

        let parsed = match ctx.adapter.parse_request(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Tool-discovery pipe parse failure, passing through");
                return body.to_vec();
            }
        };

        let tools = ctx.adapter.extract_tool_discovery(&parsed);
        let total = tools.len();
        if total <= self.config.min_tools {
            return body.to_vec();
        }

        let query = ctx.adapter.extract_user_query(&parsed).unwrap_or_default();

        let decisions = match self.config.strategy {
            DiscoveryStrategy::Relevance => {
                let keep = keep_count(&self.config, total);
                if keep >= total {
                    return body.to_vec();
                }
                self.relevance_decisions(ctx, &parsed, &tools, &query, keep).await
            }
            DiscoveryStrategy::ToolSearch => {
                // Every original tool is deferred; only the search tool remains.
                tools.iter().map(|_| false).collect()
            }
            DiscoveryStrategy::Api => match self.api_decisions(&tools, &query).await {
                Some(decisions) => decisions,
                None => {
                    // Selection failed: keep everything, log the fallback.
                    self.telemetry.log_tool_discovery(&DiscoveryEvent {
                        strategy: "api",
                        total_tools: total,
                        kept_tools: total,
                        deferred_tools: 0,
                        fallback: true,
                    });
                    return body.to_vec();
                }
            },
        };

        let kept = decisions.iter().filter(|&&keep| keep).count();
        if kept == total {
            return body.to_vec();
        }

        let results: Vec<CompressedContent> = tools
            .iter()
            .zip(&decisions)
            .map(|(tool, &keep)| CompressedContent {
                id: tool.id.clone(),
                compressed: String::new(),
                shadow_ref: None,
                keep,
            })
            .collect();

        let mut emitted = match ctx.adapter.apply_tool_discovery(&parsed, &results) {
            Ok(emitted) => emitted,
            Err(e) => {
                tracing::warn!(error = %e, "apply_tool_discovery failed, passing through");
                return body.to_vec();
            }
        };

        let deferred: Vec<ExtractedContent> = tools
            .iter()
            .zip(&decisions)
            .filter(|(_, &keep)| !keep)
            .map(|(tool, _)| tool.clone())
            .collect();

        let inject_search = self.config.search_fallback
            || self.config.strategy == DiscoveryStrategy::ToolSearch;
        if inject_search && !deferred.is_empty() {
            if let Ok(mut value) = serde_json::from_slice::<Value>(&emitted) {
                inject_tool(
                    &mut value,
                    ctx.adapter.name(),
                    &self.config.search_tool_name,
                    &self.search_tool_description(),
                    Self::search_tool_schema(),
                );
                if let Ok(bytes) = serde_json::to_vec(&value) {
                    emitted = bytes;
                }
            }
        }

        self.telemetry.log_tool_discovery(&DiscoveryEvent {
            strategy: match self.config.strategy {
                DiscoveryStrategy::Relevance => "relevance",
                DiscoveryStrategy::Api => "api",
                DiscoveryStrategy::ToolSearch => "tool_search",
            },
            total_tools: total,
            kept_tools: kept,
            deferred_tools: deferred.len(),
            fallback: false,
        });

        ctx.deferred_tools = deferred;
        ctx.tools_filtered = true;
        emitted
    }

    async fn relevance_decisions(
        &self,
        ctx: &PipelineContext,
        parsed: &crate::adapters::ParsedRequest,
        tools: &[ExtractedContent],
        query: &str,
        keep: usize,
    ) -> Vec<bool> {
        let expanded = self.sessions.get_expanded(&ctx.tool_session_id).await;
        let always_keep: HashSet<String> = self.config.always_keep.iter().cloned().collect();
        let recently_used: HashSet<String> =
            ctx.adapter.extract_tool_calls(parsed).into_iter().collect();

        let mut scored: Vec<(usize, i64)> = tools
            .iter()
            .enumerate()
            .map(|(index, tool)| {
                (
                    index,
                    score_tool(tool, query, &expanded, &always_keep, &recently_used),
                )
            })
            .collect();
        // Stable sort keeps catalog order for tied scores.
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        let top: HashSet<usize> = scored.iter().take(keep).map(|(index, _)| *index).collect();

        tools
            .iter()
            .enumerate()
            .map(|(index, tool)| {
                let name = tool.tool_name.as_deref().unwrap_or(&tool.id);
                top.contains(&index)
                    || always_keep.contains(name)
                    || expanded.contains(name)
            })
            .collect()
    }

    async fn api_decisions(&self, tools: &[ExtractedContent], query: &str) -> Option<Vec<bool>> {
        let compressor = self.compressor.as_ref()?;

        let request = FilterToolsRequest {
            query: query.to_string(),
            tools: tools
                .iter()
                .map(|tool| ToolSummary {
                    name: tool.tool_name.clone().unwrap_or_else(|| tool.id.clone()),
                    description: tool
                        .content
                        .split_once('\n')
                        .map(|(_, d)| d.to_string())
                        .unwrap_or_default(),
                })
                .collect(),
            always_keep: self.config.always_keep.clone(),
            max_tools: self.config.max_tools,
            source: "gateway".into(),
        };

        let selected = match compressor.filter_tools(request).await {
            Ok(selected) if !selected.is_empty() => selected,
            Ok(_) => {
                tracing::warn!("Tool selector returned empty selection, keeping all tools");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tool selector failed, keeping all tools");
                return None;
            }
        };

        let selected: HashSet<String> = selected.into_iter().collect();
        Some(
            tools
                .iter()
                .map(|tool| {
                    let name = tool.tool_name.as_deref().unwrap_or(&tool.id);
                    selected.contains(name) || self.config.always_keep.iter().any(|k| k == name)
                })
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use tokengate_common::config::SessionConfig;

    use crate::adapters::{adapter_for, Provider};
    use crate::telemetry::LogTelemetry;

    fn catalog_body(count: usize) -> Vec<u8> {
        let tools: Vec<Value> = (0..count)
            .map(|i| {
                let (name, description) = match i {
                    0 => ("run_unit_tests".to_string(), "Run the unit test suite".into()),
                    1 => ("deploy_service".to_string(), "Deploy a service".into()),
                    _ => (format!("tool_{}", i), format!("Helper number {}", i)),
                };
                json!({"name": name, "description": description, "input_schema": {"type": "object"}})
            })
            .collect();

        json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "Run the unit tests"}],
            "tools": tools
        })
        .to_string()
        .into_bytes()
    }

    fn pipe_with(config: DiscoveryConfig) -> (ToolDiscoveryPipe, Arc<ToolSessionStore>) {
        let sessions = Arc::new(ToolSessionStore::new(&SessionConfig::default()));
        let pipe = ToolDiscoveryPipe::new(config, Arc::clone(&sessions), None, Arc::new(LogTelemetry));
        (pipe, sessions)
    }

    fn test_ctx() -> PipelineContext {
        let mut ctx = PipelineContext::new(
            Provider::Anthropic,
            adapter_for(Provider::Anthropic, "/v1/messages").unwrap(),
            "claude-sonnet-4".into(),
            "req-1".into(),
        );
        ctx.tool_session_id = "sess-disc".into();
        ctx
    }

    fn tool_def(name: &str, description: &str) -> ExtractedContent {
        ExtractedContent {
            id: name.to_string(),
            content: format!("{}\n{}", name, description),
            content_type: crate::adapters::ContentType::ToolDef,
            tool_name: Some(name.to_string()),
            message_index: 0,
            block_index: None,
            metadata: None,
        }
    }

    #[test]
    fn test_scoring_signals() {
        let tool = tool_def("run_unit_tests", "Run the unit test suite");
        let empty = HashSet::new();

        // Word overlap only: "unit" and "tests"/"test" match.
        let score = score_tool(&tool, "Run the unit tests", &empty, &empty, &empty);
        assert!(score >= 20, "score was {}", score);

        // Name substring bonus.
        let score_named = score_tool(&tool, "call run_unit_tests now", &empty, &empty, &empty);
        assert!(score_named >= 50);

        // Expanded dominates everything.
        let expanded: HashSet<String> = ["run_unit_tests".to_string()].into();
        assert!(score_tool(&tool, "", &expanded, &empty, &empty) >= 1000);
    }

    #[test]
    fn test_stop_words_ignored() {
        let tool = tool_def("the_thing", "the and for with");
        let empty = HashSet::new();
        assert_eq!(score_tool(&tool, "the and for with", &empty, &empty, &empty), 0);
    }

    #[test]
    fn test_keep_count_formula() {
        let config = DiscoveryConfig::default();
        // ceil(0.5 * 25) = 13, within [5, 20].
        assert_eq!(keep_count(&config, 25), 13);
        // Small catalog clamps up to min_tools.
        assert_eq!(keep_count(&config, 8), 5);
        // Huge catalog clamps down to max_tools.
        assert_eq!(keep_count(&config, 100), 20);
    }

    #[tokio::test]
    async fn test_small_catalog_is_noop() {
        let (pipe, _) = pipe_with(DiscoveryConfig::default());
        let mut ctx = test_ctx();
        let body = catalog_body(5);

        let emitted = pipe.process(&mut ctx, &body).await;
        assert_eq!(emitted, body);
        assert!(!ctx.tools_filtered);
    }

    #[tokio::test]
    async fn test_relevance_keeps_matching_and_injects_search() {
        let (pipe, _) = pipe_with(DiscoveryConfig {
            max_tools: 8,
            ..DiscoveryConfig::default()
        });
        let mut ctx = test_ctx();
        let body = catalog_body(25);

        let emitted = pipe.process(&mut ctx, &body).await;
        assert!(ctx.tools_filtered);
        assert!(!ctx.deferred_tools.is_empty());

        let value: Value = serde_json::from_slice(&emitted).unwrap();
        let names: Vec<&str> = value["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();

        // The query-relevant tool survives; the search tool is appended.
        assert!(names.contains(&"run_unit_tests"));
        assert!(names.contains(&"gateway_search_tools"));
        // 8 kept + 1 search tool.
        assert_eq!(names.len(), 9);
    }

    #[tokio::test]
    async fn test_expanded_tools_force_kept() {
        let (pipe, sessions) = pipe_with(DiscoveryConfig {
            max_tools: 6,
            ..DiscoveryConfig::default()
        });
        sessions.mark_expanded("sess-disc", &["tool_20".into()]).await;

        let mut ctx = test_ctx();
        let emitted = pipe.process(&mut ctx, &catalog_body(25)).await;

        let value: Value = serde_json::from_slice(&emitted).unwrap();
        let names: Vec<&str> = value["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"tool_20"));
    }

    #[tokio::test]
    async fn test_tool_search_strategy_defers_everything() {
        let (pipe, _) = pipe_with(DiscoveryConfig {
            strategy: DiscoveryStrategy::ToolSearch,
            ..DiscoveryConfig::default()
        });
        let mut ctx = test_ctx();

        let emitted = pipe.process(&mut ctx, &catalog_body(25)).await;
        assert_eq!(ctx.deferred_tools.len(), 25);

        let value: Value = serde_json::from_slice(&emitted).unwrap();
        let tools = value["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "gateway_search_tools");
    }

    #[tokio::test]
    async fn test_api_strategy_without_selector_keeps_all() {
        let (pipe, _) = pipe_with(DiscoveryConfig {
            strategy: DiscoveryStrategy::Api,
            ..DiscoveryConfig::default()
        });
        let mut ctx = test_ctx();
        let body = catalog_body(25);

        let emitted = pipe.process(&mut ctx, &body).await;
        assert_eq!(emitted, body);
        assert!(!ctx.tools_filtered);
    }

    #[tokio::test]
    async fn test_passthrough_mode_is_noop() {
        let (pipe, _) = pipe_with(DiscoveryConfig::default());
        let mut ctx = test_ctx();
        ctx.passthrough = true;
        let body = catalog_body(25);

        assert_eq!(pipe.process(&mut ctx, &body).await, body);
        assert!(!ctx.tools_filtered);
    }

    #[tokio::test]
    async fn test_disabled_pipe_is_noop() {
        let (pipe, _) = pipe_with(DiscoveryConfig {
            enabled: false,
            ..DiscoveryConfig::default()
        });
        let mut ctx = test_ctx();
        let body = catalog_body(25);
        assert_eq!(pipe.process(&mut ctx, &body).await, body);
    }
}
