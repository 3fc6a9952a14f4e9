use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokengate_common::api::compressor::{
    CompressRequest, CompressResponse, FilterToolsRequest, FilterToolsResponse,
};
use tokengate_common::config::CompressorConfig;
use tokengate_common::{GatewayError, Result};

/// Object-safe interface to the external compression service.
/// Tests provide mock compressors; production uses `HttpCompressor`.
pub trait Compressor: Send + Sync {
    fn compress<'a>(
        &'a self,
        request: CompressRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn filter_tools<'a>(
        &'a self,
        request: FilterToolsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>>;

    /// Query-agnostic compressors never see the user query, so the pipe can
    /// skip query extraction entirely.
    fn query_agnostic(&self) -> bool;
}

/// HTTP client for a remote compressor, authenticated by shared secret.
pub struct HttpCompressor {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    query_agnostic: bool,
}

impl HttpCompressor {
    /// Build from config. Returns None when no service URL is configured,
    /// which disables tool-output compression at startup.
    pub fn from_config(config: &CompressorConfig) -> Option<Self> {
        let base_url = match &config.url {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => {
                tracing::warn!("No compressor URL configured — tool-output compression disabled");
                return None;
            }
        };

        Some(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            query_agnostic: config.query_agnostic,
        })
    }

    async fn post_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut builder = self.http.post(&url).timeout(self.timeout).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("X-API-Key", key);
        }

        let start = std::time::Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(format!("compressor {}", endpoint))
            } else {
                GatewayError::Compressor(e.to_string())
            }
        })?;
        metrics::histogram!("compressor.latency", "endpoint" => endpoint.to_string())
            .record(start.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Compressor(format!("{}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Compressor(format!("parse response: {}", e)))
    }
}

impl Compressor for HttpCompressor {
    fn compress<'a>(
        &'a self,
        request: CompressRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let response: CompressResponse = self.post_json("/compress", &request).await?;
            Ok(response.compressed_output)
        })
    }

    fn filter_tools<'a>(
        &'a self,
        request: FilterToolsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            let response: FilterToolsResponse = self.post_json("/filter_tools", &request).await?;
            Ok(response.selected_names)
        })
    }

    fn query_agnostic(&self) -> bool {
        self.query_agnostic
    }
}
