//! The proxy-wide error taxonomy.
//!
//! `ProxyError` is a single enum every layer of the relay pipeline can
//! return: rather than writing a `From` impl for every combination of
//! rate-limiter error, monitor-ban error, and adaptor error, each layer
//! folds its failure into one of these variants and the server boundary
//! maps them to the OpenAI-compatible envelope in one place.

use std::time::Duration;

use thiserror::Error;

/// Outcome classification used by the relay controller's CLASSIFY step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    UpstreamRetryable,
    UpstreamFatal,
    UpstreamQuota,
    MalformedResponse,
    ClientCancelled,
}

impl Classification {
    /// Whether the relay controller should attempt another channel.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Classification::UpstreamRetryable
                | Classification::UpstreamQuota
                | Classification::MalformedResponse
        )
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("authentication failed")]
    Auth,

    #[error("insufficient balance")]
    Quota,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit { retry_after: Duration },

    #[error("client ip is blocked")]
    IpBlocked,

    #[error("model '{0}' is not allowed for this token")]
    ModelNotAllowed(String),

    #[error("no eligible channel for model '{0}'")]
    NoChannel(String),

    #[error("upstream error, retryable: {0}")]
    UpstreamRetryable(String),

    #[error("upstream error, fatal: {status} {message}")]
    UpstreamFatal { status: u16, message: String },

    #[error("upstream reports exhausted quota")]
    UpstreamQuota,

    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("client cancelled the request")]
    ClientCancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn classify(&self) -> Classification {
        match self {
            ProxyError::UpstreamRetryable(_) => Classification::UpstreamRetryable,
            ProxyError::UpstreamQuota => Classification::UpstreamQuota,
            ProxyError::MalformedResponse(_) => Classification::MalformedResponse,
            ProxyError::ClientCancelled => Classification::ClientCancelled,
            ProxyError::UpstreamFatal { .. } => Classification::UpstreamFatal,
            _ => Classification::UpstreamFatal,
        }
    }

    /// HTTP status code for the client-visible envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Auth => 401,
            ProxyError::Quota => 402,
            ProxyError::RateLimit { .. } => 429,
            ProxyError::IpBlocked | ProxyError::ModelNotAllowed(_) => 403,
            ProxyError::NoChannel(_) => 503,
            ProxyError::UpstreamRetryable(_) => 502,
            ProxyError::UpstreamFatal { status, .. } => *status,
            ProxyError::UpstreamQuota => 402,
            ProxyError::MalformedResponse(_) => 502,
            ProxyError::ClientCancelled => 499,
            ProxyError::Internal(_) => 500,
        }
    }

    /// The `type` field of the OpenAI-compatible error envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Auth => "invalid_request_error",
            ProxyError::Quota | ProxyError::UpstreamQuota => "insufficient_quota",
            ProxyError::RateLimit { .. } => "rate_limit_error",
            ProxyError::IpBlocked => "permission_error",
            ProxyError::ModelNotAllowed(_) => "permission_error",
            ProxyError::NoChannel(_) => "api_error",
            ProxyError::UpstreamRetryable(_) | ProxyError::UpstreamFatal { .. } => "api_error",
            ProxyError::MalformedResponse(_) => "api_error",
            ProxyError::ClientCancelled => "client_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    /// Redacts internal detail before it reaches a client.
    pub fn redacted_message(&self) -> String {
        match self {
            ProxyError::Internal(_) => "an internal error occurred".to_string(),
            ProxyError::UpstreamRetryable(_) => "upstream provider error".to_string(),
            other => other.to_string(),
        }
    }
}
