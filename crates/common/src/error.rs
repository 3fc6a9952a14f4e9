use thiserror::Error;

/// Top-level error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    // --- Client-side errors (request rejected before forwarding) ---
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown provider for path '{0}'")]
    UnknownProvider(String),

    #[error("Host not allowed: {0}")]
    HostNotAllowed(String),

    // --- Wire-format errors ---
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Upstream and collaborator errors ---
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Compressor error: {0}")]
    Compressor(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // --- Operational errors ---
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether this error is the client's fault (maps to a 4xx status).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::UnknownProvider(_) | Self::HostNotAllowed(_)
        )
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(GatewayError::InvalidRequest("bad".into()).is_client_error());
        assert!(GatewayError::HostNotAllowed("evil.example".into()).is_client_error());
        assert!(!GatewayError::Upstream("500".into()).is_client_error());
    }
}
