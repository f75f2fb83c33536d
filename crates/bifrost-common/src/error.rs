use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type BifrostResult<T> = Result<T, BifrostError>;

/// Closed set of failure kinds. The serialized form (`as_str`) is the stable
/// wire string; new kinds are additions to this enum, never ad-hoc strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    OperationNotAllowed,
    OperationUnsupported,
    NoKeyForModel,
    Unauthenticated,
    Forbidden,
    RateLimited,
    QuotaExceeded,
    Timeout,
    Cancelled,
    UpstreamUnavailable,
    MalformedResponse,
    ProviderShuttingDown,
    QueueTimeout,
    ToolNotFound,
    ToolExecutionFailed,
    ToolExecutionTimeout,
    MaxAgentDepthExceeded,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::OperationNotAllowed => "operation_not_allowed",
            ErrorKind::OperationUnsupported => "operation_unsupported",
            ErrorKind::NoKeyForModel => "no_key_for_model",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::ProviderShuttingDown => "provider_shutting_down",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::ToolExecutionFailed => "tool_execution_failed",
            ErrorKind::ToolExecutionTimeout => "tool_execution_timeout",
            ErrorKind::MaxAgentDepthExceeded => "max_agent_depth_exceeded",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Status code used when this error crosses an HTTP boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 422,
            ErrorKind::OperationNotAllowed => 403,
            ErrorKind::OperationUnsupported => 404,
            ErrorKind::NoKeyForModel => 409,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::RateLimited => 429,
            ErrorKind::QuotaExceeded => 429,
            ErrorKind::Timeout => 504,
            ErrorKind::Cancelled => 499,
            ErrorKind::UpstreamUnavailable => 502,
            ErrorKind::MalformedResponse => 502,
            ErrorKind::ProviderShuttingDown => 503,
            ErrorKind::QueueTimeout => 503,
            ErrorKind::ToolNotFound => 404,
            ErrorKind::ToolExecutionFailed => 500,
            ErrorKind::ToolExecutionTimeout => 504,
            ErrorKind::MaxAgentDepthExceeded => 422,
            ErrorKind::InternalError => 500,
        }
    }

    /// Transport-level transient failures are retried in place with backoff
    /// before any fallback target is considered.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::UpstreamUnavailable | ErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state fallback directive carried on every error.
///
/// `Default` lets the orchestrator walk the request's fallback list;
/// `ForceAllow` keeps walking even past normally-terminal kinds;
/// `ForceBlock` ends the request immediately (budget/policy denials).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    #[default]
    Default,
    ForceAllow,
    ForceBlock,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BifrostError {
    pub kind: ErrorKind,
    pub message: String,
    /// Upstream HTTP status, when one was observed.
    pub status: Option<u16>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub operation: Option<&'static str>,
    pub fallback_policy: FallbackPolicy,
    /// Upstream-suggested delay (Retry-After) for rate limits.
    pub retry_after: Option<Duration>,
    /// Stringified underlying cause, if any.
    pub cause: Option<String>,
}

impl BifrostError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let fallback_policy = match kind {
            ErrorKind::QuotaExceeded | ErrorKind::Forbidden | ErrorKind::Cancelled => {
                FallbackPolicy::ForceBlock
            }
            _ => FallbackPolicy::Default,
        };
        Self {
            kind,
            message: message.into(),
            status: None,
            provider: None,
            model: None,
            operation: None,
            fallback_policy,
            retry_after: None,
            cause: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request context was cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.fallback_policy = policy;
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Whether the fallback orchestrator may try the next target after this
    /// error. `ForceAllow` overrides terminal kinds; `cancelled` never falls
    /// back regardless of policy.
    pub fn allows_fallback(&self) -> bool {
        if self.kind == ErrorKind::Cancelled {
            return false;
        }
        !matches!(self.fallback_policy, FallbackPolicy::ForceBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_round_trip_through_serde() {
        let kinds = [
            ErrorKind::InvalidRequest,
            ErrorKind::RateLimited,
            ErrorKind::MaxAgentDepthExceeded,
            ErrorKind::ProviderShuttingDown,
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn policy_errors_block_fallback_by_default() {
        assert!(!BifrostError::new(ErrorKind::QuotaExceeded, "budget spent").allows_fallback());
        assert!(!BifrostError::new(ErrorKind::Forbidden, "denied").allows_fallback());
        assert!(BifrostError::new(ErrorKind::RateLimited, "slow down").allows_fallback());
    }

    #[test]
    fn cancelled_never_falls_back() {
        let err = BifrostError::cancelled().with_fallback_policy(FallbackPolicy::ForceAllow);
        assert!(!err.allows_fallback());
    }

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(ErrorKind::UpstreamUnavailable.is_transient());
        assert!(!ErrorKind::QuotaExceeded.is_transient());
        assert!(!ErrorKind::Cancelled.is_transient());
    }
}
