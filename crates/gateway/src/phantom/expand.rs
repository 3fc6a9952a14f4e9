use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::pipes::PipelineContext;
use crate::shadow::ShadowStore;
use crate::telemetry::{ExpandEvent, TelemetrySink};

use super::{PhantomCall, PhantomHandler, PhantomOutcome, PhantomToolResult, EXPAND_TOOL_NAME};

/// Handles `expand_context(id)` calls by restoring originals from the shadow
/// store. Built per request: the dedup set must reset between requests.
pub struct ExpandHandler {
    store: Arc<ShadowStore>,
    telemetry: Arc<dyn TelemetrySink>,
    /// Ids already expanded in this request; repeats are dropped.
    expanded: HashSet<String>,
}

impl ExpandHandler {
    pub fn new(store: Arc<ShadowStore>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            store,
            telemetry,
            expanded: HashSet::new(),
        }
    }
}

#[async_trait]
impl PhantomHandler for ExpandHandler {
    fn tool_name(&self) -> &str {
        EXPAND_TOOL_NAME
    }

    async fn handle(&mut self, calls: &[PhantomCall], _ctx: &PipelineContext) -> PhantomOutcome {
        let mut results = Vec::new();
        let mut duplicates = 0usize;

        for call in calls {
            let id = call
                .input
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            if !self.expanded.insert(id.clone()) {
                duplicates += 1;
                continue;
            }

            let content = match self.store.get(&id).await {
                Some(original) => {
                    self.telemetry.record_expand(&ExpandEvent {
                        shadow_id: id.clone(),
                        found: true,
                    });
                    original
                }
                None => {
                    self.telemetry.record_expand(&ExpandEvent {
                        shadow_id: id.clone(),
                        found: false,
                    });
                    format!("Error: shadow reference '{}' not found or expired", id)
                }
            };

            results.push(PhantomToolResult {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content,
            });
        }

        // Every call a repeat: let the response fall through unchanged.
        let stop = results.is_empty() && duplicates > 0;
        if duplicates > 0 {
            tracing::debug!(duplicates, stop, "Duplicate expand calls dropped");
        }

        PhantomOutcome {
            tool_results: results,
            request_modifier: None,
            stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use tokengate_common::config::ShadowConfig;

    use crate::adapters::{adapter_for, Provider};
    use crate::shadow::shadow_id;
    use crate::telemetry::LogTelemetry;

    fn test_ctx() -> PipelineContext {
        PipelineContext::new(
            Provider::Anthropic,
            adapter_for(Provider::Anthropic, "/v1/messages").unwrap(),
            "claude-sonnet-4".into(),
            "req-1".into(),
        )
    }

    fn call(call_id: &str, shadow: &str) -> PhantomCall {
        PhantomCall {
            id: call_id.into(),
            name: EXPAND_TOOL_NAME.into(),
            input: json!({ "id": shadow }),
        }
    }

    #[tokio::test]
    async fn test_expand_returns_original() {
        let store = Arc::new(ShadowStore::new(&ShadowConfig::default()));
        let sid = shadow_id("the original output");
        store.set(&sid, "the original output".into()).await;

        let mut handler = ExpandHandler::new(Arc::clone(&store), Arc::new(LogTelemetry));
        let outcome = handler.handle(&[call("toolu_1", &sid)], &test_ctx()).await;

        assert!(!outcome.stop);
        assert!(outcome.request_modifier.is_none());
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_results[0].content, "the original output");
        assert_eq!(outcome.tool_results[0].call_id, "toolu_1");
    }

    #[tokio::test]
    async fn test_missing_id_reports_error() {
        let store = Arc::new(ShadowStore::new(&ShadowConfig::default()));
        let mut handler = ExpandHandler::new(store, Arc::new(LogTelemetry));

        let outcome = handler
            .handle(&[call("toolu_1", "shadow:deadbeef")], &test_ctx())
            .await;
        assert_eq!(
            outcome.tool_results[0].content,
            "Error: shadow reference 'shadow:deadbeef' not found or expired"
        );
    }

    #[tokio::test]
    async fn test_duplicate_expand_dropped() {
        let store = Arc::new(ShadowStore::new(&ShadowConfig::default()));
        let sid = shadow_id("data");
        store.set(&sid, "data".into()).await;

        let mut handler = ExpandHandler::new(store, Arc::new(LogTelemetry));
        let first = handler.handle(&[call("toolu_1", &sid)], &test_ctx()).await;
        assert_eq!(first.tool_results.len(), 1);

        // Second round, same id: all duplicates → stop.
        let second = handler.handle(&[call("toolu_2", &sid)], &test_ctx()).await;
        assert!(second.tool_results.is_empty());
        assert!(second.stop);
    }

    #[tokio::test]
    async fn test_mixed_duplicates_continue() {
        let store = Arc::new(ShadowStore::new(&ShadowConfig::default()));
        let sid_a = shadow_id("a");
        let sid_b = shadow_id("b");
        store.set(&sid_a, "a".into()).await;
        store.set(&sid_b, "b".into()).await;

        let mut handler = ExpandHandler::new(store, Arc::new(LogTelemetry));
        handler.handle(&[call("toolu_1", &sid_a)], &test_ctx()).await;

        let outcome = handler
            .handle(&[call("toolu_2", &sid_a), call("toolu_3", &sid_b)], &test_ctx())
            .await;
        assert!(!outcome.stop);
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_results[0].content, "b");
    }
}
