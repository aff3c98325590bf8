//! Audit error taxonomy.
//!
//! Every fallible operation in the audit pipeline returns one of these
//! kinds. Phase handlers swallow everything except [`AuditError::Cancelled`]
//! and [`AuditError::Internal`], recording the error on the audit state and
//! continuing; the orchestrator treats those two as pipeline-unwinding.

use serde::{Deserialize, Serialize};

/// The error kinds shared across the audit pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    /// Invalid URL, unknown tier, malformed configuration. Fatal at startup.
    #[error("invalid input: {0}")]
    Input(String),

    /// User or supervisor requested cancellation.
    #[error("cancelled")]
    Cancelled,

    /// A bounded operation exceeded its deadline.
    #[error("timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// A source's rate limit does not permit a request right now.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A source's circuit breaker is open.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// An external source returned an error or unparsable response.
    #[error("upstream failure from {source_name}: {message}")]
    Upstream { source_name: String, message: String },

    /// Progress-event transport failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A hard budget was exceeded.
    #[error("budget exhausted: {0}")]
    Budget(String),

    /// Invariant violation inside the orchestrator.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Snake-case tag for an error kind, used in error records and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Cancelled,
    Timeout,
    RateLimited,
    CircuitOpen,
    Upstream,
    Transport,
    Budget,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Input => "input",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::Upstream => "upstream",
            Self::Transport => "transport",
            Self::Budget => "budget",
            Self::Internal => "internal",
        };
        write!(f, "{tag}")
    }
}

impl AuditError {
    /// The kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) => ErrorKind::Input,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Budget(_) => ErrorKind::Budget,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error unwinds the whole pipeline instead of being
    /// recorded and skipped.
    pub fn unwinds_pipeline(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Internal(_))
    }

    /// Shorthand for a timeout error.
    pub fn timeout(operation: &str, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Shorthand for an upstream error.
    pub fn upstream(source: &str, message: impl Into<String>) -> Self {
        Self::Upstream {
            source_name: source.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_kind_tags() {
        assert_eq!(AuditError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            AuditError::timeout("dns", Duration::from_millis(1500)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate_limited");
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
    }

    #[test]
    fn test_unwinding_kinds() {
        assert!(AuditError::Cancelled.unwinds_pipeline());
        assert!(AuditError::Internal("bad state".into()).unwinds_pipeline());
        assert!(!AuditError::Transport("send failed".into()).unwinds_pipeline());
        assert!(!AuditError::Budget("pages".into()).unwinds_pipeline());
        assert!(!AuditError::upstream("whois", "HTTP 502").unwinds_pipeline());
    }

    #[test]
    fn test_display_carries_context() {
        let err = AuditError::timeout("scout https://example.com", Duration::from_secs(2));
        assert!(err.to_string().contains("2000ms"));
        assert!(err.to_string().contains("scout"));
    }
}
