pub mod tool_discovery;
pub mod tool_output;

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::{Adapter, ExtractedContent, Provider};

pub use tool_discovery::ToolDiscoveryPipe;
pub use tool_output::ToolOutputPipe;

/// Terminal state of one tool-output entry in the compression pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// Compressed and spliced with a shadow marker.
    Compressed,
    /// Served from the compressed cache.
    CacheHit,
    /// At or below min_bytes.
    PassthroughSmall,
    /// Above max_bytes.
    PassthroughLarge,
    /// Carries a shadow marker already (an expansion from a prior turn).
    ExpansionSkipped,
    /// Compressor failed or was ineffective; original kept.
    Passthrough,
    /// Rate limiter refused the slot.
    RateLimited,
    /// Tool name in the skip set.
    SkippedByConfig,
}

impl CompressionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compressed => "compressed",
            Self::CacheHit => "cache_hit",
            Self::PassthroughSmall => "passthrough_small",
            Self::PassthroughLarge => "passthrough_large",
            Self::ExpansionSkipped => "expansion_skipped",
            Self::Passthrough => "passthrough",
            Self::RateLimited => "rate_limited",
            Self::SkippedByConfig => "skipped_by_config",
        }
    }
}

/// Per-entry record accumulated for telemetry.
#[derive(Clone, Debug)]
pub struct CompressionRecord {
    pub tool_name: String,
    pub outcome: CompressionOutcome,
    pub original_bytes: usize,
    pub compressed_bytes: usize,
}

/// Per-request value threaded through the pipes and the phantom loop.
/// Everything here is request-scoped and dropped when the response is
/// written.
pub struct PipelineContext {
    pub provider: Provider,
    pub adapter: Arc<dyn Adapter>,
    pub model: String,
    pub request_id: String,

    // Auth captures from inbound headers.
    pub bearer_token: Option<String>,
    pub beta_header: Option<String>,

    // Session identity.
    pub tool_session_id: String,
    pub cost_session_id: String,

    /// X-Compression-Threshold override of compression.min_bytes.
    pub threshold_override: Option<usize>,
    /// Skip all rewriting for this request. The driver copies the global
    /// passthrough flag here when the gateway runs as a plain proxy.
    pub passthrough: bool,

    // Pipe outputs.
    /// Tool-result id → shadow id minted this request.
    pub shadow_refs: HashMap<String, String>,
    pub compressions: Vec<CompressionRecord>,
    pub deferred_tools: Vec<ExtractedContent>,
    pub tools_filtered: bool,
    pub compressed: bool,
}

impl PipelineContext {
    pub fn new(
        provider: Provider,
        adapter: Arc<dyn Adapter>,
        model: String,
        request_id: String,
    ) -> Self {
        Self {
            provider,
            adapter,
            model,
            request_id,
            bearer_token: None,
            beta_header: None,
            tool_session_id: "default".into(),
            cost_session_id: "default".into(),
            threshold_override: None,
            passthrough: false,
            shadow_refs: HashMap::new(),
            compressions: Vec::new(),
            deferred_tools: Vec::new(),
            tools_filtered: false,
            compressed: false,
        }
    }

    /// Pipe-type tag for the request telemetry row.
    pub fn pipe_type(&self) -> String {
        match (self.tools_filtered, self.compressed) {
            (false, false) => "none".into(),
            (false, true) => "tool_output".into(),
            (true, false) => "tool_discovery".into(),
            (true, true) => "tool_discovery+tool_output".into(),
        }
    }
}
