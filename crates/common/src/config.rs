use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration, deserialized from gateway.toml.
///
/// Every section and field carries a serde default so a partial file (or no
/// file at all) yields a working configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Passthrough mode: forward every request unmodified. Both pipes skip
    /// all rewriting; the gateway acts as a plain reverse proxy.
    pub passthrough: bool,
    pub server: ServerConfig,
    pub shadow: ShadowConfig,
    pub compression: CompressionConfig,
    pub discovery: DiscoveryConfig,
    pub sessions: SessionConfig,
    pub auth: AuthFallbackConfig,
    pub compressor: CompressorConfig,
    pub phantom: PhantomConfig,
    pub upstream: UpstreamConfig,
}

/// HTTP server limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Max inbound request body size in bytes.
    pub max_body_bytes: usize,
    /// Max buffered upstream response size (expand-aware streaming).
    pub max_response_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_body_bytes: 20 * 1024 * 1024,
            max_response_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Shadow store TTLs. Originals are short-lived and refreshed on read;
/// compressed entries live independently under the long TTL.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub original_ttl_seconds: u64,
    pub compressed_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            original_ttl_seconds: 300,
            compressed_ttl_seconds: 14_400,
            cleanup_interval_seconds: 300,
        }
    }
}

/// Fallback behavior when the compressor fails on an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFallback {
    /// Keep the original text for the failed entry.
    Passthrough,
    /// Abandon compression for the failed entry (same effect at the entry
    /// level; recorded distinctly for telemetry).
    Abandon,
}

/// Tool-output compression pipe settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Outputs at or below this size pass through untouched.
    pub min_bytes: usize,
    /// Outputs above this size pass through untouched.
    pub max_bytes: usize,
    /// Compression is kept only when |compressed| <= target_ratio * |original|.
    pub target_ratio: f64,
    pub fallback: CompressionFallback,
    /// Tool names never compressed, any provider.
    pub skip_tools: Vec<String>,
    /// Additional per-provider skip lists, keyed by provider name.
    pub provider_skip_tools: HashMap<String, Vec<String>>,
    /// Models with input price below this ($/Mtok) are not worth compressing.
    pub min_input_price_per_mtok: f64,
    /// Max concurrent compressor calls.
    pub max_concurrency: usize,
    /// Token-bucket refill rate for compressor calls.
    pub rate_limit_per_sec: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_bytes: 500,
            max_bytes: 262_144,
            target_ratio: 0.6,
            fallback: CompressionFallback::Passthrough,
            skip_tools: Vec::new(),
            provider_skip_tools: HashMap::new(),
            min_input_price_per_mtok: 0.5,
            max_concurrency: 8,
            rate_limit_per_sec: 10.0,
        }
    }
}

/// Tool-discovery filtering strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// Local relevance scoring.
    Relevance,
    /// Delegate selection to the external compressor service.
    Api,
    /// Replace the catalog with a single search tool.
    ToolSearch,
}

/// Tool-discovery pipe settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub strategy: DiscoveryStrategy,
    /// Catalogs at or below this count are never filtered.
    pub min_tools: usize,
    /// Upper bound on tools kept after filtering.
    pub max_tools: usize,
    /// keep = min(max_tools, max(min_tools, ceil(target_ratio * total))).
    pub target_ratio: f64,
    /// Tool names always kept regardless of score.
    pub always_keep: Vec<String>,
    /// Inject the search tool when any tools were deferred.
    pub search_fallback: bool,
    pub search_tool_name: String,
    pub max_search_results: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: DiscoveryStrategy::Relevance,
            min_tools: 5,
            max_tools: 20,
            target_ratio: 0.5,
            always_keep: Vec::new(),
            search_fallback: true,
            search_tool_name: "gateway_search_tools".into(),
            max_search_results: 10,
        }
    }
}

/// Tool-session store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    /// How many leading user messages feed the session hash.
    pub hash_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            cleanup_interval_seconds: 300,
            hash_messages: 3,
        }
    }
}

/// Subscription→api-key fallback settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthFallbackConfig {
    /// API key used after a subscription credential is exhausted.
    /// Fallback is disabled when unset.
    pub fallback_api_key: Option<String>,
    pub ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    /// HTTP statuses that may signal credential exhaustion.
    pub exhaustion_statuses: Vec<u16>,
    /// Case-insensitive body substrings that confirm exhaustion.
    pub exhaustion_markers: Vec<String>,
}

impl Default for AuthFallbackConfig {
    fn default() -> Self {
        Self {
            fallback_api_key: None,
            ttl_seconds: 3600,
            cleanup_interval_seconds: 300,
            exhaustion_statuses: vec![429, 529],
            exhaustion_markers: vec![
                "rate limit".into(),
                "usage limit".into(),
                "quota".into(),
                "exhausted".into(),
                "credit balance".into(),
                "overloaded".into(),
            ],
        }
    }
}

/// External compressor service settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    /// Base URL of the compression service. Tool-output compression is
    /// disabled when unset.
    pub url: Option<String>,
    /// Shared secret sent as X-API-Key.
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    /// Whether the compressor ignores the user query (query-agnostic
    /// compressors skip query extraction entirely).
    pub query_agnostic: bool,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_ms: 30_000,
            query_agnostic: false,
        }
    }
}

/// Phantom-tool loop settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PhantomConfig {
    pub max_loops: u32,
    /// Inject expand_context when compression minted shadow refs.
    pub expand_enabled: bool,
}

impl Default for PhantomConfig {
    fn default() -> Self {
        Self {
            max_loops: 5,
            expand_enabled: true,
        }
    }
}

/// Upstream dispatch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Host suffixes the gateway will forward to. Anything else fails fast.
    pub allowed_hosts: Vec<String>,
    pub timeout_ms: u64,
    pub bedrock_enabled: bool,
    pub bedrock_region: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: vec![
                "api.anthropic.com".into(),
                "api.openai.com".into(),
                "chatgpt.com".into(),
                "openrouter.ai".into(),
                "generativelanguage.googleapis.com".into(),
                "amazonaws.com".into(),
                "localhost".into(),
                "127.0.0.1".into(),
            ],
            timeout_ms: 600_000,
            bedrock_enabled: false,
            bedrock_region: "us-east-1".into(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file. A missing file yields defaults
    /// with a warning; a malformed file is a hard error.
    pub fn load(path: &Path) -> Result<Self, crate::GatewayError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::GatewayError::Config(format!("read {}: {}", path.display(), e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::GatewayError::Config(format!("parse {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Refuse to run on nonsense values. Fails loudly with the first problem.
    pub fn validate(&self) -> Result<(), crate::GatewayError> {
        if self.compression.min_bytes >= self.compression.max_bytes {
            return Err(crate::GatewayError::Config(format!(
                "compression.min_bytes ({}) must be below max_bytes ({})",
                self.compression.min_bytes, self.compression.max_bytes
            )));
        }
        if !(0.0..=1.0).contains(&self.compression.target_ratio) {
            return Err(crate::GatewayError::Config(
                "compression.target_ratio must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.discovery.target_ratio) {
            return Err(crate::GatewayError::Config(
                "discovery.target_ratio must be within [0, 1]".into(),
            ));
        }
        if self.discovery.max_tools < self.discovery.min_tools {
            return Err(crate::GatewayError::Config(format!(
                "discovery.max_tools ({}) must be at least min_tools ({})",
                self.discovery.max_tools, self.discovery.min_tools
            )));
        }
        if self.compression.max_concurrency == 0 {
            return Err(crate::GatewayError::Config(
                "compression.max_concurrency must be positive".into(),
            ));
        }
        if self.phantom.max_loops == 0 {
            return Err(crate::GatewayError::Config(
                "phantom.max_loops must be positive".into(),
            ));
        }
        if self.sessions.hash_messages == 0 {
            return Err(crate::GatewayError::Config(
                "sessions.hash_messages must be positive".into(),
            ));
        }
        Ok(())
    }
}
