use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;

use tokengate_common::api::compressor::CompressRequest;
use tokengate_common::config::{CompressionConfig, CompressionFallback};

use crate::adapters::{CompressedContent, ExtractedContent};
use crate::compressor::Compressor;
use crate::pricing::input_price_per_mtok;
use crate::rate_limit::RateLimiter;
use crate::shadow::{has_shadow_marker, shadow_id, shadow_marker, ShadowStore};
use crate::telemetry::{CompressionEvent, TelemetrySink};

use super::{CompressionOutcome, CompressionRecord, PipelineContext};

/// Replaces bulky tool outputs with compressed summaries carrying a shadow
/// marker, and remembers the mapping so the LLM can ask for the original
/// back via `expand_context`.
pub struct ToolOutputPipe {
    config: CompressionConfig,
    store: Arc<ShadowStore>,
    compressor: Option<Arc<dyn Compressor>>,
    limiter: Arc<RateLimiter>,
    semaphore: Arc<Semaphore>,
    telemetry: Arc<dyn TelemetrySink>,
}

/// An entry that missed the cache and needs a compressor call.
struct QueuedEntry {
    shadow_id: String,
    content: String,
    tool_name: Option<String>,
    /// Indices into the extraction list sharing this shadow id.
    entry_indices: Vec<usize>,
}

impl ToolOutputPipe {
    pub fn new(
        config: CompressionConfig,
        store: Arc<ShadowStore>,
        compressor: Option<Arc<dyn Compressor>>,
        limiter: Arc<RateLimiter>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            store,
            compressor,
            limiter,
            semaphore,
            telemetry,
        }
    }

    /// Run the pipe over one request body. Always returns a body to forward;
    /// on any failure the original bytes pass through unchanged.
    pub async fn process(&self, ctx: &mut PipelineContext, body: &[u8]) -> Vec<u8> {
        if !self.config.enabled || ctx.passthrough {
            return body.to_vec();
        }
        let Some(compressor) = self.compressor.clone() else {
            return body.to_vec();
        };

        // Cheap models cost less to prompt than to compress.
        if let Some(price) = input_price_per_mtok(&ctx.model) {
            if price < self.config.min_input_price_per_mtok {
                tracing::debug!(model = %ctx.model, price, "Model below compression threshold");
                return body.to_vec();
            }
        }

        let parsed = match ctx.adapter.parse_request(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Tool-output pipe parse failure, passing through");
                return body.to_vec();
            }
        };

        let extractions = ctx.adapter.extract_tool_output(&parsed);
        if extractions.is_empty() {
            return body.to_vec();
        }

        let query = if compressor.query_agnostic() {
            None
        } else {
            ctx.adapter.extract_user_query(&parsed)
        };

        let min_bytes = ctx.threshold_override.unwrap_or(self.config.min_bytes);
        let skip_set = self.skip_set(ctx);

        // Per-extraction result slots; None means the entry is untouched.
        let mut splices: Vec<Option<String>> = vec![None; extractions.len()];
        let mut outcomes: Vec<Option<CompressionOutcome>> = vec![None; extractions.len()];
        let mut queued: Vec<QueuedEntry> = Vec::new();
        let mut queued_ids: HashMap<String, usize> = HashMap::new();

        for (index, extraction) in extractions.iter().enumerate() {
            let length = extraction.content.len();

            if has_shadow_marker(&extraction.content) {
                outcomes[index] = Some(CompressionOutcome::ExpansionSkipped);
                continue;
            }
            if length <= min_bytes {
                outcomes[index] = Some(CompressionOutcome::PassthroughSmall);
                continue;
            }
            if length > self.config.max_bytes {
                outcomes[index] = Some(CompressionOutcome::PassthroughLarge);
                continue;
            }
            if let Some(name) = &extraction.tool_name {
                if skip_set.contains(name.as_str()) {
                    outcomes[index] = Some(CompressionOutcome::SkippedByConfig);
                    continue;
                }
            }

            let sid = shadow_id(&extraction.content);

            // One producer per shadow id within a request: the cache check
            // runs before enqueue, and repeated contents join the first task.
            if let Some(&queue_index) = queued_ids.get(&sid) {
                queued[queue_index].entry_indices.push(index);
                continue;
            }

            if let Some(cached) = self.store.get_compressed(&sid).await {
                let payload = shadow_marker(&sid, &cached);
                if cached.len() < length && payload.len() < length {
                    // Touch the original so a later expand can still find it.
                    if self.store.get(&sid).await.is_none() {
                        self.store.set(&sid, extraction.content.clone()).await;
                    }
                    ctx.shadow_refs.insert(extraction.id.clone(), sid.clone());
                    splices[index] = Some(payload);
                    outcomes[index] = Some(CompressionOutcome::CacheHit);
                    metrics::counter!("compression.cache.hit").increment(1);
                    continue;
                }
            }
            metrics::counter!("compression.cache.miss").increment(1);

            self.store.set(&sid, extraction.content.clone()).await;
            queued_ids.insert(sid.clone(), queued.len());
            queued.push(QueuedEntry {
                shadow_id: sid,
                content: extraction.content.clone(),
                tool_name: extraction.tool_name.clone(),
                entry_indices: vec![index],
            });
        }

        // Compress misses concurrently, bounded by the semaphore and smoothed
        // by the token bucket. A refused rate-limit slot is a failure, not a
        // queue.
        let tasks = queued.iter().map(|entry| {
            let compressor = Arc::clone(&compressor);
            let limiter = Arc::clone(&self.limiter);
            let semaphore = Arc::clone(&self.semaphore);
            let query = query.clone();
            let model = ctx.model.clone();
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                if !limiter.try_acquire().await {
                    return Some(Err(CompressionOutcome::RateLimited));
                }
                let request = CompressRequest {
                    tool_output: entry.content.clone(),
                    query,
                    tool_name: entry.tool_name.clone(),
                    model,
                    source: "gateway".into(),
                };
                match compressor.compress(request).await {
                    Ok(compressed) => Some(Ok(compressed)),
                    Err(e) => {
                        tracing::warn!(
                            shadow_id = %entry.shadow_id,
                            error = %e,
                            "Compressor call failed"
                        );
                        Some(Err(CompressionOutcome::Passthrough))
                    }
                }
            }
        });
        let results = join_all(tasks).await;

        for (entry, result) in queued.iter().zip(results) {
            let original_len = entry.content.len();
            let outcome = match result {
                Some(Ok(compressed)) => {
                    let payload = shadow_marker(&entry.shadow_id, &compressed);
                    let effective = compressed.len() as f64
                        <= self.config.target_ratio * original_len as f64;
                    if effective && payload.len() < original_len {
                        self.store
                            .set_compressed(&entry.shadow_id, compressed)
                            .await;
                        for &index in &entry.entry_indices {
                            ctx.shadow_refs
                                .insert(extractions[index].id.clone(), entry.shadow_id.clone());
                            splices[index] = Some(payload.clone());
                        }
                        CompressionOutcome::Compressed
                    } else {
                        CompressionOutcome::Passthrough
                    }
                }
                Some(Err(outcome)) => outcome,
                // Semaphore closed mid-shutdown; leave the entry untouched.
                None => CompressionOutcome::Passthrough,
            };

            let failed = outcome != CompressionOutcome::Compressed;
            if failed && self.config.fallback == CompressionFallback::Abandon {
                // Abandon fails the entry only; the original text stays.
                self.store.delete(&entry.shadow_id).await;
            }
            for &index in &entry.entry_indices {
                outcomes[index] = Some(outcome);
            }
        }

        self.record(ctx, &extractions, &splices, &outcomes);

        let any_spliced = splices.iter().any(Option::is_some);
        if !any_spliced {
            return body.to_vec();
        }

        let results: Vec<CompressedContent> = extractions
            .iter()
            .zip(&splices)
            .filter_map(|(extraction, splice)| {
                splice.as_ref().map(|payload| CompressedContent {
                    id: extraction.id.clone(),
                    compressed: payload.clone(),
                    shadow_ref: ctx.shadow_refs.get(&extraction.id).cloned(),
                    keep: true,
                })
            })
            .collect();

        match ctx.adapter.apply_tool_output(&parsed, &results) {
            Ok(rewritten) if rewritten.len() <= body.len() => {
                ctx.compressed = true;
                rewritten
            }
            Ok(_) => {
                // Rewrites must be size-monotone; an inflated body is discarded.
                tracing::warn!("Compressed body larger than original, passing through");
                ctx.shadow_refs.clear();
                body.to_vec()
            }
            Err(e) => {
                tracing::warn!(error = %e, "apply_tool_output failed, passing through");
                ctx.shadow_refs.clear();
                body.to_vec()
            }
        }
    }

    fn skip_set(&self, ctx: &PipelineContext) -> HashSet<&str> {
        let mut set: HashSet<&str> = self.config.skip_tools.iter().map(String::as_str).collect();
        if let Some(extra) = self.config.provider_skip_tools.get(ctx.provider.as_str()) {
            set.extend(extra.iter().map(String::as_str));
        }
        set
    }

    fn record(
        &self,
        ctx: &mut PipelineContext,
        extractions: &[ExtractedContent],
        splices: &[Option<String>],
        outcomes: &[Option<CompressionOutcome>],
    ) {
        for ((extraction, splice), outcome) in extractions.iter().zip(splices).zip(outcomes) {
            let Some(outcome) = outcome else { continue };
            let record = CompressionRecord {
                tool_name: extraction.tool_name.clone().unwrap_or_default(),
                outcome: *outcome,
                original_bytes: extraction.content.len(),
                compressed_bytes: splice.as_ref().map_or(0, String::len),
            };
            self.telemetry.log_compression(&CompressionEvent {
                tool_name: record.tool_name.clone(),
                outcome: outcome.as_str(),
                original_bytes: record.original_bytes,
                compressed_bytes: record.compressed_bytes,
            });
            ctx.compressions.push(record);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::{json, Value};

    use tokengate_common::api::compressor::FilterToolsRequest;
    use tokengate_common::config::ShadowConfig;
    use tokengate_common::Result as GwResult;

    use crate::adapters::{adapter_for, Provider};
    use crate::telemetry::LogTelemetry;

    /// Compressor that returns a fixed summary and counts invocations.
    struct MockCompressor {
        calls: AtomicU32,
        response: GwResult<String>,
    }

    impl MockCompressor {
        fn returning(text: &str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                response: Ok(text.to_string()),
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                response: Err(tokengate_common::GatewayError::Compressor("down".into())),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Compressor for MockCompressor {
        fn compress<'a>(
            &'a self,
            _request: CompressRequest,
        ) -> Pin<Box<dyn Future<Output = GwResult<String>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = match &self.response {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(tokengate_common::GatewayError::Compressor("down".into())),
            };
            Box::pin(async move { result })
        }

        fn filter_tools<'a>(
            &'a self,
            _request: FilterToolsRequest,
        ) -> Pin<Box<dyn Future<Output = GwResult<Vec<String>>> + Send + 'a>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn query_agnostic(&self) -> bool {
            true
        }
    }

    fn body_with_output(output: &str) -> Vec<u8> {
        json!({
            "model": "claude-sonnet-4",
            "messages": [
                {"role": "user", "content": "Run it"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "run_tests", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": output}
                ]}
            ]
        })
        .to_string()
        .into_bytes()
    }

    fn pipe_with(
        compressor: Arc<MockCompressor>,
        store: Arc<ShadowStore>,
        config: CompressionConfig,
    ) -> ToolOutputPipe {
        ToolOutputPipe::new(
            config,
            store,
            Some(compressor),
            Arc::new(RateLimiter::new(1000.0)),
            Arc::new(LogTelemetry),
        )
    }

    fn test_ctx() -> PipelineContext {
        PipelineContext::new(
            Provider::Anthropic,
            adapter_for(Provider::Anthropic, "/v1/messages").unwrap(),
            "claude-sonnet-4".into(),
            "req-1".into(),
        )
    }

    fn fresh_store() -> Arc<ShadowStore> {
        Arc::new(ShadowStore::new(&ShadowConfig::default()))
    }

    #[tokio::test]
    async fn test_small_output_passes_through() {
        let compressor = Arc::new(MockCompressor::returning("tiny"));
        let pipe = pipe_with(
            Arc::clone(&compressor),
            fresh_store(),
            CompressionConfig::default(),
        );
        let mut ctx = test_ctx();

        let body = body_with_output("package main\n\nfunc main() {}");
        let forwarded = pipe.process(&mut ctx, &body).await;

        assert_eq!(forwarded, body);
        assert_eq!(compressor.calls(), 0);
        assert!(!ctx.compressed);
        assert_eq!(
            ctx.compressions[0].outcome,
            CompressionOutcome::PassthroughSmall
        );
        assert!(!String::from_utf8(forwarded).unwrap().contains("<<<SHADOW:"));
    }

    #[tokio::test]
    async fn test_boundary_sizes() {
        let compressor = Arc::new(MockCompressor::returning("s"));
        let config = CompressionConfig {
            min_bytes: 500,
            max_bytes: 1000,
            ..CompressionConfig::default()
        };
        let pipe = pipe_with(Arc::clone(&compressor), fresh_store(), config);

        // Exactly min_bytes → passthrough-small.
        let mut ctx = test_ctx();
        pipe.process(&mut ctx, &body_with_output(&"a".repeat(500)))
            .await;
        assert_eq!(
            ctx.compressions[0].outcome,
            CompressionOutcome::PassthroughSmall
        );

        // Exactly max_bytes + 1 → passthrough-large.
        let mut ctx = test_ctx();
        pipe.process(&mut ctx, &body_with_output(&"b".repeat(1001)))
            .await;
        assert_eq!(
            ctx.compressions[0].outcome,
            CompressionOutcome::PassthroughLarge
        );
        assert_eq!(compressor.calls(), 0);
    }

    #[tokio::test]
    async fn test_compression_splices_marker() {
        let compressor = Arc::new(MockCompressor::returning("40 passed, 2 failed"));
        let store = fresh_store();
        let pipe = pipe_with(
            Arc::clone(&compressor),
            Arc::clone(&store),
            CompressionConfig::default(),
        );
        let mut ctx = test_ctx();

        let long_output = "line of test output\n".repeat(60);
        let body = body_with_output(&long_output);
        let forwarded = pipe.process(&mut ctx, &body).await;

        assert!(forwarded.len() <= body.len());
        assert!(ctx.compressed);
        assert_eq!(compressor.calls(), 1);
        assert_eq!(ctx.shadow_refs.len(), 1);

        let value: Value = serde_json::from_slice(&forwarded).unwrap();
        let content = value["messages"][2]["content"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("<<<SHADOW:shadow:"));
        assert!(content.ends_with("40 passed, 2 failed"));

        // Original and compressed are both recoverable from the store.
        let sid = shadow_id(&long_output);
        assert_eq!(store.get(&sid).await.unwrap(), long_output);
        assert!(store.get_compressed(&sid).await.is_some());
    }

    #[tokio::test]
    async fn test_cache_reuse_invokes_compressor_once() {
        let compressor = Arc::new(MockCompressor::returning("summary"));
        let store = fresh_store();
        let pipe = pipe_with(
            Arc::clone(&compressor),
            Arc::clone(&store),
            CompressionConfig::default(),
        );

        let body = body_with_output(&"repeated tool output\n".repeat(60));
        let mut first = Vec::new();
        for _ in 0..3 {
            let mut ctx = test_ctx();
            let forwarded = pipe.process(&mut ctx, &body).await;
            if first.is_empty() {
                first = forwarded;
            } else {
                assert_eq!(forwarded, first);
            }
        }
        assert_eq!(compressor.calls(), 1);
    }

    #[tokio::test]
    async fn test_ineffective_compression_discarded() {
        // Compressor "shrinks" to 90% — above the 0.6 target.
        let long_output = "x".repeat(1000);
        let compressor = Arc::new(MockCompressor::returning(&"y".repeat(900)));
        let pipe = pipe_with(
            Arc::clone(&compressor),
            fresh_store(),
            CompressionConfig::default(),
        );
        let mut ctx = test_ctx();

        let body = body_with_output(&long_output);
        let forwarded = pipe.process(&mut ctx, &body).await;

        assert_eq!(forwarded, body);
        assert!(!ctx.compressed);
        assert_eq!(ctx.compressions[0].outcome, CompressionOutcome::Passthrough);
    }

    #[tokio::test]
    async fn test_compressor_failure_passes_through() {
        let compressor = Arc::new(MockCompressor::failing());
        let pipe = pipe_with(
            Arc::clone(&compressor),
            fresh_store(),
            CompressionConfig::default(),
        );
        let mut ctx = test_ctx();

        let body = body_with_output(&"important data\n".repeat(60));
        let forwarded = pipe.process(&mut ctx, &body).await;

        assert_eq!(forwarded, body);
        assert_eq!(ctx.compressions[0].outcome, CompressionOutcome::Passthrough);
    }

    #[tokio::test]
    async fn test_skip_tools_respected() {
        let compressor = Arc::new(MockCompressor::returning("summary"));
        let config = CompressionConfig {
            skip_tools: vec!["run_tests".into()],
            ..CompressionConfig::default()
        };
        let pipe = pipe_with(Arc::clone(&compressor), fresh_store(), config);
        let mut ctx = test_ctx();

        let body = body_with_output(&"output\n".repeat(200));
        let forwarded = pipe.process(&mut ctx, &body).await;

        assert_eq!(forwarded, body);
        assert_eq!(compressor.calls(), 0);
        assert_eq!(
            ctx.compressions[0].outcome,
            CompressionOutcome::SkippedByConfig
        );
    }

    #[tokio::test]
    async fn test_rate_limit_refusal_is_failure() {
        let compressor = Arc::new(MockCompressor::returning("summary"));
        let pipe = ToolOutputPipe::new(
            CompressionConfig::default(),
            fresh_store(),
            Some(Arc::clone(&compressor) as Arc<dyn Compressor>),
            // Drain the bucket before the pipe runs.
            Arc::new(RateLimiter::new(0.001)),
            Arc::new(LogTelemetry),
        );
        pipe.limiter.try_acquire().await;

        let mut ctx = test_ctx();
        let body = body_with_output(&"output\n".repeat(200));
        let forwarded = pipe.process(&mut ctx, &body).await;

        assert_eq!(forwarded, body);
        assert_eq!(compressor.calls(), 0);
        assert_eq!(ctx.compressions[0].outcome, CompressionOutcome::RateLimited);
    }

    #[tokio::test]
    async fn test_passthrough_mode_skips_pipe() {
        let compressor = Arc::new(MockCompressor::returning("summary"));
        let pipe = pipe_with(
            Arc::clone(&compressor),
            fresh_store(),
            CompressionConfig::default(),
        );
        let mut ctx = test_ctx();
        ctx.passthrough = true;

        let body = body_with_output(&"output\n".repeat(200));
        let forwarded = pipe.process(&mut ctx, &body).await;

        assert_eq!(forwarded, body);
        assert_eq!(compressor.calls(), 0);
        assert!(ctx.compressions.is_empty());
    }

    #[tokio::test]
    async fn test_cheap_model_skips_pipe() {
        let compressor = Arc::new(MockCompressor::returning("summary"));
        let pipe = pipe_with(
            Arc::clone(&compressor),
            fresh_store(),
            CompressionConfig::default(),
        );
        let mut ctx = test_ctx();
        ctx.model = "gpt-4o-mini".into();

        let body = body_with_output(&"output\n".repeat(200));
        let forwarded = pipe.process(&mut ctx, &body).await;

        assert_eq!(forwarded, body);
        assert_eq!(compressor.calls(), 0);
        assert!(ctx.compressions.is_empty());
    }

    #[tokio::test]
    async fn test_marker_payload_never_stored() {
        let compressor = Arc::new(MockCompressor::returning("summary"));
        let store = fresh_store();
        let pipe = pipe_with(
            Arc::clone(&compressor),
            Arc::clone(&store),
            CompressionConfig::default(),
        );
        let mut ctx = test_ctx();

        let output = "tool output here\n".repeat(60);
        pipe.process(&mut ctx, &body_with_output(&output)).await;

        let sid = shadow_id(&output);
        assert_eq!(store.get_compressed(&sid).await.unwrap(), "summary");
    }
}
