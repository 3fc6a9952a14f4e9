use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;

use tokengate_common::config::{AuthFallbackConfig, UpstreamConfig};
use tokengate_common::{GatewayError, Result};

use crate::adapters::{is_bedrock_path, Provider};
use crate::sessions::AuthFallbackStore;

/// Classification of the inbound credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    Subscription,
    ApiKey,
    Bearer,
    OAuth,
    None,
    Unknown,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Subscription => "subscription",
            AuthMode::ApiKey => "api_key",
            AuthMode::Bearer => "bearer",
            AuthMode::OAuth => "oauth",
            AuthMode::None => "none",
            AuthMode::Unknown => "unknown",
        }
    }
}

/// Classify the inbound credential. API keys win over bearer tokens;
/// `sk-ant-oat…` bearers are subscription OAuth tokens; non-key bearers map
/// to the subscription backend.
pub fn classify_auth(headers: &HeaderMap) -> AuthMode {
    if headers.contains_key("x-api-key") || headers.contains_key("x-goog-api-key") {
        return AuthMode::ApiKey;
    }

    let Some(bearer) = bearer_token(headers) else {
        return AuthMode::None;
    };
    if bearer.starts_with("sk-ant-oat") {
        return AuthMode::OAuth;
    }
    if bearer.starts_with("sk-") {
        return AuthMode::Bearer;
    }
    if bearer.is_empty() {
        return AuthMode::Unknown;
    }
    AuthMode::Subscription
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Target resolution
// ---------------------------------------------------------------------------

const ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const OPENAI_BASE: &str = "https://api.openai.com";
const CHATGPT_BACKEND_BASE: &str = "https://chatgpt.com/backend-api";
const OPENROUTER_BASE: &str = "https://openrouter.ai/api";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";
const OLLAMA_BASE: &str = "http://localhost:11434";

/// Resolve the upstream URL for a request. Order: explicit header → Bedrock
/// path → `anthropic-version` → `x-api-key` prefix → bearer prefix → static
/// path table.
pub fn resolve_target(
    path: &str,
    headers: &HeaderMap,
    provider: Provider,
    config: &UpstreamConfig,
) -> Result<String> {
    if let Some(explicit) = headers.get("x-target-url").and_then(|v| v.to_str().ok()) {
        return Ok(explicit.trim_end_matches('/').to_string());
    }

    if config.bedrock_enabled && is_bedrock_path(path) {
        return Ok(format!(
            "https://bedrock-runtime.{}.amazonaws.com{}",
            config.bedrock_region, path
        ));
    }

    if headers.contains_key("anthropic-version") {
        return Ok(format!("{}{}", ANTHROPIC_BASE, path));
    }

    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if key.starts_with("sk-ant-") {
            return Ok(format!("{}{}", ANTHROPIC_BASE, path));
        }
    }

    if let Some(bearer) = bearer_token(headers) {
        if bearer.starts_with("sk-ant-") {
            return Ok(format!("{}{}", ANTHROPIC_BASE, path));
        }
        if bearer.starts_with("sk-or-") {
            return Ok(format!("{}{}", OPENROUTER_BASE, path));
        }
        if bearer.starts_with("sk-") {
            return Ok(format!("{}{}", OPENAI_BASE, path));
        }
        // Subscription tokens route to the ChatGPT backend.
        if !bearer.is_empty() && provider == Provider::OpenAi {
            return Ok(format!("{}{}", CHATGPT_BACKEND_BASE, path));
        }
    }

    let base = match provider {
        Provider::Anthropic => ANTHROPIC_BASE,
        Provider::OpenAi => OPENAI_BASE,
        Provider::Gemini => GEMINI_BASE,
        Provider::Ollama => OLLAMA_BASE,
        Provider::Bedrock | Provider::Unknown => {
            return Err(GatewayError::UnknownProvider(path.to_string()));
        }
    };
    Ok(format!("{}{}", base, path))
}

/// Suffix match against the allowlist; unmatched hosts fail fast.
pub fn host_allowed(url: &str, allowed_hosts: &[String]) -> bool {
    let Some(host) = url
        .split("//")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .map(|authority| authority.split(':').next().unwrap_or(authority))
    else {
        return false;
    };
    allowed_hosts
        .iter()
        .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)))
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Seam for Bedrock SigV4 signing; the signer implementation is a
/// collaborator, not part of the core.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, url: &str, headers: &mut HeaderMap, body: &[u8]) -> Result<()>;
}

/// Auth headers forwarded to the upstream; everything else is dropped.
const FORWARD_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    "x-api-key",
    "authorization",
    "anthropic-version",
    "anthropic-beta",
    "x-goog-api-key",
    "openai-beta",
    "openai-organization",
];

/// How the forwarder authenticated, reported up for telemetry.
#[derive(Clone, Copy, Debug)]
pub struct AuthReport {
    pub initial_mode: AuthMode,
    pub effective_mode: AuthMode,
    pub fallback_used: bool,
}

/// What came back from the upstream. Exhaustion-check paths buffer the body;
/// everything else stays streamable.
pub enum ForwardReply {
    Stream(reqwest::Response),
    Buffered {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
}

impl ForwardReply {
    pub fn status(&self) -> u16 {
        match self {
            ForwardReply::Stream(response) => response.status().as_u16(),
            ForwardReply::Buffered { status, .. } => *status,
        }
    }
}

pub struct ForwardRequest {
    pub target_url: String,
    pub provider: Provider,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub session_id: String,
}

/// Upstream HTTP dispatch with the sticky subscription→api-key fallback
/// state machine.
pub struct Forwarder {
    http: reqwest::Client,
    upstream: UpstreamConfig,
    auth: AuthFallbackConfig,
    fallback_store: Arc<AuthFallbackStore>,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl Forwarder {
    pub fn new(
        upstream: UpstreamConfig,
        auth: AuthFallbackConfig,
        fallback_store: Arc<AuthFallbackStore>,
        signer: Option<Arc<dyn RequestSigner>>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            upstream,
            auth,
            fallback_store,
            signer,
        }
    }

    /// Forward a request upstream. Applies the per-session fallback state:
    /// sessions already downgraded send the fallback credential from the
    /// outset; fresh exhaustion signals trigger one replay.
    pub async fn dispatch(&self, request: ForwardRequest) -> Result<(ForwardReply, AuthReport)> {
        if !host_allowed(&request.target_url, &self.upstream.allowed_hosts) {
            return Err(GatewayError::HostNotAllowed(request.target_url));
        }

        let initial_mode = classify_auth(&request.headers);

        // Sticky downgrade: no retry dance on later requests.
        let sticky = self.auth.fallback_api_key.is_some()
            && self
                .fallback_store
                .should_use_api_key_mode(&request.session_id)
                .await;
        if sticky {
            let response = self.send(&request, true).await?;
            return Ok((
                ForwardReply::Stream(response),
                AuthReport {
                    initial_mode,
                    effective_mode: AuthMode::ApiKey,
                    fallback_used: false,
                },
            ));
        }

        let response = self.send(&request, false).await?;
        let status = response.status().as_u16();

        let eligible = self.auth.fallback_api_key.is_some()
            && matches!(initial_mode, AuthMode::Subscription | AuthMode::OAuth)
            && self.auth.exhaustion_statuses.contains(&status);
        if !eligible {
            return Ok((
                ForwardReply::Stream(response),
                AuthReport {
                    initial_mode,
                    effective_mode: initial_mode,
                    fallback_used: false,
                },
            ));
        }

        // Exhaustion signal is status AND body marker; reading the body
        // consumes the response, so the no-marker path returns it buffered.
        let headers = response.headers().clone();
        let body = response.bytes().await.unwrap_or_default();
        let body_lower = String::from_utf8_lossy(&body).to_lowercase();
        let confirmed = self
            .auth
            .exhaustion_markers
            .iter()
            .any(|marker| body_lower.contains(&marker.to_lowercase()));

        if !confirmed {
            return Ok((
                ForwardReply::Buffered {
                    status,
                    headers,
                    body,
                },
                AuthReport {
                    initial_mode,
                    effective_mode: initial_mode,
                    fallback_used: false,
                },
            ));
        }

        tracing::warn!(
            session_id = %request.session_id,
            status,
            "Subscription credential exhausted, falling back to API key"
        );
        self.fallback_store
            .mark_api_key_mode(&request.session_id)
            .await;

        let retry = self.send(&request, true).await?;
        Ok((
            ForwardReply::Stream(retry),
            AuthReport {
                initial_mode,
                effective_mode: AuthMode::ApiKey,
                fallback_used: true,
            },
        ))
    }

    async fn send(&self, request: &ForwardRequest, use_fallback_key: bool) -> Result<reqwest::Response> {
        let mut headers = HeaderMap::new();
        for name in FORWARD_HEADERS {
            if let Some(value) = request.headers.get(*name) {
                headers.insert(*name, value.clone());
            }
        }

        if use_fallback_key {
            headers.remove("authorization");
            if let Some(key) = &self.auth.fallback_api_key {
                if let Ok(value) = HeaderValue::from_str(key) {
                    headers.insert("x-api-key", value);
                }
            }
        }

        if request.provider == Provider::Bedrock {
            let signer = self.signer.as_ref().ok_or_else(|| {
                GatewayError::Config("Bedrock enabled but no request signer installed".into())
            })?;
            signer.sign(&request.target_url, &mut headers, &request.body)?;
        }

        let start = std::time::Instant::now();
        let response = self
            .http
            .post(&request.target_url)
            .headers(headers)
            .timeout(std::time::Duration::from_millis(self.upstream.timeout_ms))
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(format!("upstream {}", request.target_url))
                } else {
                    GatewayError::Upstream(e.to_string())
                }
            })?;

        metrics::histogram!(
            "upstream.latency",
            "provider" => request.provider.as_str()
        )
        .record(start.elapsed().as_secs_f64());
        metrics::counter!(
            "upstream.requests",
            "provider" => request.provider.as_str(),
            "status" => response.status().as_u16().to_string()
        )
        .increment(1);

        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_classify_auth_modes() {
        assert_eq!(
            classify_auth(&headers(&[("x-api-key", "sk-ant-api03-x")])),
            AuthMode::ApiKey
        );
        assert_eq!(
            classify_auth(&headers(&[("authorization", "Bearer sk-ant-oat01-x")])),
            AuthMode::OAuth
        );
        assert_eq!(
            classify_auth(&headers(&[("authorization", "Bearer sk-proj-x")])),
            AuthMode::Bearer
        );
        assert_eq!(
            classify_auth(&headers(&[("authorization", "Bearer eyJhbGciOi")])),
            AuthMode::Subscription
        );
        assert_eq!(classify_auth(&HeaderMap::new()), AuthMode::None);
    }

    #[test]
    fn test_resolve_explicit_target_wins() {
        let h = headers(&[
            ("x-target-url", "https://proxy.internal:8443/v1/messages/"),
            ("anthropic-version", "2023-06-01"),
        ]);
        let url =
            resolve_target("/v1/messages", &h, Provider::Anthropic, &UpstreamConfig::default())
                .unwrap();
        assert_eq!(url, "https://proxy.internal:8443/v1/messages");
    }

    #[test]
    fn test_resolve_bearer_prefixes() {
        let config = UpstreamConfig::default();
        let cases = [
            ("Bearer sk-ant-api03-x", "https://api.anthropic.com/v1/messages"),
            ("Bearer sk-or-v1-x", "https://openrouter.ai/api/v1/messages"),
            ("Bearer sk-proj-x", "https://api.openai.com/v1/messages"),
        ];
        for (auth, expected) in cases {
            let h = headers(&[("authorization", auth)]);
            let url = resolve_target("/v1/messages", &h, Provider::Anthropic, &config).unwrap();
            assert_eq!(url, expected);
        }
    }

    #[test]
    fn test_resolve_subscription_token_to_chatgpt_backend() {
        let h = headers(&[("authorization", "Bearer eyJhbGciOi")]);
        let url = resolve_target(
            "/v1/responses",
            &h,
            Provider::OpenAi,
            &UpstreamConfig::default(),
        )
        .unwrap();
        assert_eq!(url, "https://chatgpt.com/backend-api/v1/responses");
    }

    #[test]
    fn test_resolve_static_table() {
        let config = UpstreamConfig::default();
        let h = HeaderMap::new();
        assert_eq!(
            resolve_target("/v1/chat/completions", &h, Provider::OpenAi, &config).unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            resolve_target("/api/chat", &h, Provider::Ollama, &config).unwrap(),
            "http://localhost:11434/api/chat"
        );
        assert!(resolve_target("/x", &h, Provider::Unknown, &config).is_err());
    }

    #[test]
    fn test_resolve_bedrock_path() {
        let config = UpstreamConfig {
            bedrock_enabled: true,
            bedrock_region: "eu-west-1".into(),
            ..UpstreamConfig::default()
        };
        let url = resolve_target(
            "/model/anthropic.claude-sonnet-4/invoke",
            &HeaderMap::new(),
            Provider::Bedrock,
            &config,
        )
        .unwrap();
        assert_eq!(
            url,
            "https://bedrock-runtime.eu-west-1.amazonaws.com/model/anthropic.claude-sonnet-4/invoke"
        );
    }

    #[test]
    fn test_host_allowlist_suffix_match() {
        let allowed = vec!["api.anthropic.com".to_string(), "amazonaws.com".to_string()];
        assert!(host_allowed("https://api.anthropic.com/v1/messages", &allowed));
        assert!(host_allowed(
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/m/invoke",
            &allowed
        ));
        assert!(!host_allowed("https://evil.example/v1/messages", &allowed));
        // Suffix matching must not cross label boundaries.
        assert!(!host_allowed("https://notamazonaws.com/x", &allowed));
    }

    #[test]
    fn test_host_allowlist_with_port() {
        let allowed = vec!["localhost".to_string()];
        assert!(host_allowed("http://localhost:11434/api/chat", &allowed));
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unlisted_host() {
        let store = Arc::new(AuthFallbackStore::new(&AuthFallbackConfig::default()));
        let forwarder = Forwarder::new(
            UpstreamConfig::default(),
            AuthFallbackConfig::default(),
            store,
            None,
        );

        let result = forwarder
            .dispatch(ForwardRequest {
                target_url: "https://evil.example/v1/messages".into(),
                provider: Provider::Anthropic,
                headers: HeaderMap::new(),
                body: Vec::new(),
                session_id: "sess".into(),
            })
            .await;

        assert!(matches!(result, Err(GatewayError::HostNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_bedrock_without_signer_fails_fast() {
        let store = Arc::new(AuthFallbackStore::new(&AuthFallbackConfig::default()));
        let config = UpstreamConfig {
            bedrock_enabled: true,
            ..UpstreamConfig::default()
        };
        let forwarder = Forwarder::new(config, AuthFallbackConfig::default(), store, None);

        let result = forwarder
            .dispatch(ForwardRequest {
                target_url: "https://bedrock-runtime.us-east-1.amazonaws.com/model/m/invoke".into(),
                provider: Provider::Bedrock,
                headers: HeaderMap::new(),
                body: b"{}".to_vec(),
                session_id: "sess".into(),
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
