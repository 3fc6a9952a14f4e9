use crate::adapters::TokenUsage;

/// One row per completed request.
#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub request_id: String,
    pub provider: &'static str,
    pub model: String,
    /// Which pipes rewrote the body ("none", "tool_output",
    /// "tool_discovery", "tool_discovery+tool_output").
    pub pipe_type: String,
    pub auth_mode_initial: &'static str,
    pub auth_mode_effective: &'static str,
    pub auth_fallback_used: bool,
    pub status: u16,
    pub streamed: bool,
    pub duration_ms: u64,
}

/// One row per tool-output entry that went through the compression pipe.
#[derive(Clone, Debug)]
pub struct CompressionEvent {
    pub tool_name: String,
    pub outcome: &'static str,
    pub original_bytes: usize,
    pub compressed_bytes: usize,
}

/// One row per tool-discovery pass.
#[derive(Clone, Debug)]
pub struct DiscoveryEvent {
    pub strategy: &'static str,
    pub total_tools: usize,
    pub kept_tools: usize,
    pub deferred_tools: usize,
    /// Selection failed and the pipe kept everything.
    pub fallback: bool,
}

/// One row per expand_context call handled by the phantom loop.
#[derive(Clone, Debug)]
pub struct ExpandEvent {
    pub shadow_id: String,
    pub found: bool,
}

/// Narrow sink for request telemetry. The gateway core emits events; the
/// collaborator owns persistence and dashboards.
pub trait TelemetrySink: Send + Sync {
    fn record_request(&self, record: &RequestRecord);
    fn record_expand(&self, event: &ExpandEvent);
    fn log_compression(&self, event: &CompressionEvent);
    fn log_tool_discovery(&self, event: &DiscoveryEvent);
}

/// Budget check result for the cost gate.
#[derive(Clone, Debug)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub session_cost: f64,
    pub session_cap: f64,
    pub global_cost: f64,
    pub global_cap: f64,
}

/// Narrow sink for usage accounting and budget enforcement.
pub trait CostTracker: Send + Sync {
    fn record_usage(&self, session_id: &str, model: &str, usage: &TokenUsage);
    fn check_budget(&self, session_id: &str) -> BudgetDecision;
}

/// Default sink: structured logs plus Prometheus counters.
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn record_request(&self, record: &RequestRecord) {
        tracing::info!(
            timestamp = %record.timestamp.to_rfc3339(),
            request_id = %record.request_id,
            provider = record.provider,
            model = %record.model,
            pipe_type = %record.pipe_type,
            auth_mode_initial = record.auth_mode_initial,
            auth_mode_effective = record.auth_mode_effective,
            auth_fallback_used = record.auth_fallback_used,
            status = record.status,
            streamed = record.streamed,
            duration_ms = record.duration_ms,
            "Request completed"
        );
        metrics::counter!(
            "gateway.requests",
            "provider" => record.provider,
            "pipe_type" => record.pipe_type.clone()
        )
        .increment(1);
        metrics::histogram!("gateway.request.latency", "provider" => record.provider)
            .record(record.duration_ms as f64 / 1000.0);
        if record.auth_fallback_used {
            metrics::counter!("gateway.auth_fallback", "provider" => record.provider).increment(1);
        }
    }

    fn record_expand(&self, event: &ExpandEvent) {
        tracing::info!(shadow_id = %event.shadow_id, found = event.found, "Context expanded");
        metrics::counter!("gateway.expands", "found" => if event.found { "true" } else { "false" })
            .increment(1);
    }

    fn log_compression(&self, event: &CompressionEvent) {
        tracing::debug!(
            tool = %event.tool_name,
            outcome = event.outcome,
            original_bytes = event.original_bytes,
            compressed_bytes = event.compressed_bytes,
            "Tool output processed"
        );
        metrics::counter!("compression.entries", "outcome" => event.outcome).increment(1);
        if event.compressed_bytes > 0 && event.compressed_bytes < event.original_bytes {
            metrics::counter!("compression.bytes_saved")
                .increment((event.original_bytes - event.compressed_bytes) as u64);
        }
    }

    fn log_tool_discovery(&self, event: &DiscoveryEvent) {
        tracing::debug!(
            strategy = event.strategy,
            total = event.total_tools,
            kept = event.kept_tools,
            deferred = event.deferred_tools,
            fallback = event.fallback,
            "Tool catalog filtered"
        );
        metrics::counter!("discovery.runs", "strategy" => event.strategy).increment(1);
        metrics::counter!("discovery.deferred").increment(event.deferred_tools as u64);
        if event.fallback {
            metrics::counter!("discovery.fallbacks", "strategy" => event.strategy).increment(1);
        }
    }
}

/// Cost tracker that admits everything. Real budget enforcement lives in a
/// collaborator service.
pub struct UnlimitedCostTracker;

impl CostTracker for UnlimitedCostTracker {
    fn record_usage(&self, session_id: &str, model: &str, usage: &TokenUsage) {
        tracing::debug!(
            session_id = session_id,
            model = model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cache_read_tokens = usage.cache_read_input_tokens,
            "Usage recorded"
        );
        metrics::counter!("gateway.input_tokens").increment(usage.input_tokens);
        metrics::counter!("gateway.output_tokens").increment(usage.output_tokens);
    }

    fn check_budget(&self, _session_id: &str) -> BudgetDecision {
        BudgetDecision {
            allowed: true,
            session_cost: 0.0,
            session_cap: 0.0,
            global_cost: 0.0,
            global_cap: 0.0,
        }
    }
}
