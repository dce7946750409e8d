//! Error types for the Gateway

use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unauthorized: invalid or unknown token")]
    Unauthorized,

    #[error("Forbidden: not allowed to use model {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider stream failed: {0}")]
    ProviderStreamFailed(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code, shared by the wire protocol and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            GatewayError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            GatewayError::ProviderStreamFailed(_) => "PROVIDER_STREAM_FAILED",
            GatewayError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            GatewayError::InvalidRequest(_) | GatewayError::Serialization(_) => "INVALID_REQUEST",
            GatewayError::InvalidConfig(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the façade answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Unauthorized => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::ModelNotFound(_) => 404,
            GatewayError::ProviderUnavailable(_) => 503,
            GatewayError::ProviderStreamFailed(_) => 502,
            GatewayError::InvalidRequest(_)
            | GatewayError::Serialization(_)
            | GatewayError::ProtocolViolation(_) => 400,
            GatewayError::InvalidConfig(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => 500,
        }
    }

    /// Retry hint in seconds, set only for rate-limit rejections.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(e: toml::de::Error) -> Self {
        GatewayError::InvalidConfig(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::ProviderUnavailable(e.to_string())
    }
}

/// Result type for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
