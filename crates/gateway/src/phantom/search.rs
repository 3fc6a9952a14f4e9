use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tokengate_common::api::compressor::{FilterToolsRequest, ToolSummary};
use tokengate_common::config::{DiscoveryConfig, DiscoveryStrategy};

use crate::adapters::{merge_raw_tool, ExtractedContent};
use crate::compressor::Compressor;
use crate::pipes::tool_discovery::score_tool;
use crate::pipes::PipelineContext;
use crate::sessions::ToolSessionStore;
use crate::telemetry::{DiscoveryEvent, TelemetrySink};

use super::{PhantomCall, PhantomHandler, PhantomOutcome, PhantomToolResult, RequestModifier};

/// Handles `gateway_search_tools(query)` calls: scores the request's
/// deferred tools against the query, marks the matches as expanded in the
/// session, and injects their full definitions into the next forward.
pub struct SearchHandler {
    config: DiscoveryConfig,
    sessions: Arc<ToolSessionStore>,
    compressor: Option<Arc<dyn Compressor>>,
    telemetry: Arc<dyn TelemetrySink>,
    deferred: Vec<ExtractedContent>,
}

impl SearchHandler {
    pub fn new(
        config: DiscoveryConfig,
        sessions: Arc<ToolSessionStore>,
        compressor: Option<Arc<dyn Compressor>>,
        telemetry: Arc<dyn TelemetrySink>,
        deferred: Vec<ExtractedContent>,
    ) -> Self {
        Self {
            config,
            sessions,
            compressor,
            telemetry,
            deferred,
        }
    }

    /// Local scoring over the deferred list.
    fn score_deferred(&self, query: &str) -> Vec<ExtractedContent> {
        let empty = HashSet::new();
        let mut scored: Vec<(i64, &ExtractedContent)> = self
            .deferred
            .iter()
            .map(|tool| (score_tool(tool, query, &empty, &empty, &empty), tool))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        scored
            .into_iter()
            .take(self.config.max_search_results)
            .map(|(_, tool)| tool.clone())
            .collect()
    }

    /// Delegate selection to the external selector; on failure or an empty
    /// selection, report every deferred tool.
    async fn api_search(&self, query: &str) -> Vec<ExtractedContent> {
        let Some(compressor) = self.compressor.as_ref() else {
            return self.fallback_all();
        };

        let request = FilterToolsRequest {
            query: query.to_string(),
            tools: self
                .deferred
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
            always_keep: Vec::new(),
            max_tools: self.config.max_search_results,
            source: "gateway-search".into(),
        };

        match compressor.filter_tools(request).await {
            Ok(selected) if !selected.is_empty() => {
                let selected: HashSet<String> = selected.into_iter().collect();
                self.deferred
                    .iter()
                    .filter(|tool| {
                        let name = tool.tool_name.as_deref().unwrap_or(&tool.id);
                        selected.contains(name)
                    })
                    .take(self.config.max_search_results)
                    .cloned()
                    .collect()
            }
            Ok(_) | Err(_) => self.fallback_all(),
        }
    }

    fn fallback_all(&self) -> Vec<ExtractedContent> {
        self.telemetry.log_tool_discovery(&DiscoveryEvent {
            strategy: "api",
            total_tools: self.deferred.len(),
            kept_tools: self.deferred.len(),
            deferred_tools: 0,
            fallback: true,
        });
        self.deferred
            .iter()
            .take(self.config.max_search_results)
            .cloned()
            .collect()
    }

    fn render_listing(query: &str, found: &[ExtractedContent]) -> String {
        if found.is_empty() {
            return format!("No tools matching '{}' were found.", query);
        }
        let mut listing = format!("Found {} tool(s) matching '{}':\n", found.len(), query);
        for tool in found {
            let name = tool.tool_name.as_deref().unwrap_or(&tool.id);
            let description = tool.content.split_once('\n').map(|(_, d)| d).unwrap_or("");
            listing.push_str(&format!("- {}: {}\n", name, description.trim()));
        }
        listing.push_str("These tools are now available for your next call.");
        listing
    }
}

#[async_trait]
impl PhantomHandler for SearchHandler {
    fn tool_name(&self) -> &str {
        &self.config.search_tool_name
    }

    async fn handle(&mut self, calls: &[PhantomCall], ctx: &PipelineContext) -> PhantomOutcome {
        let mut results = Vec::new();
        let mut found_all: Vec<ExtractedContent> = Vec::new();

        for call in calls {
            let query = call
                .input
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let found = if self.config.strategy == DiscoveryStrategy::Api {
                self.api_search(&query).await
            } else {
                self.score_deferred(&query)
            };

            tracing::debug!(query = %query, found = found.len(), "Tool search handled");
            metrics::counter!("phantom.searches").increment(1);

            results.push(PhantomToolResult {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: Self::render_listing(&query, &found),
            });

            for tool in found {
                let name = tool.tool_name.clone().unwrap_or_else(|| tool.id.clone());
                if !found_all
                    .iter()
                    .any(|t| t.tool_name.as_deref().unwrap_or(&t.id) == name)
                {
                    found_all.push(tool);
                }
            }
        }

        let modifier: Option<RequestModifier> = if found_all.is_empty() {
            None
        } else {
            let names: Vec<String> = found_all
                .iter()
                .map(|t| t.tool_name.clone().unwrap_or_else(|| t.id.clone()))
                .collect();
            self.sessions.mark_expanded(&ctx.tool_session_id, &names).await;

            let adapter_name = ctx.adapter.name().to_string();
            let raw_definitions: Vec<Value> = found_all
                .iter()
                .filter_map(|t| t.metadata.as_ref())
                .filter_map(|m| m.get("raw_json").cloned())
                .collect();

            Some(Box::new(move |request: &mut Value| {
                for raw in raw_definitions {
                    merge_raw_tool(request, &adapter_name, raw);
                }
            }))
        };

        PhantomOutcome {
            tool_results: results,
            request_modifier: modifier,
            stop: false,
        }
    }
}
