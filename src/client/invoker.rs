//! The opaque external call and its failure classification.
//!
//! Epistemic foundation:
//! - K_i: A stage call is text in, text out
//! - B_i: The call may be throttled, time out, or be rejected → InvokeError
//! - I^B: Whether a rejection is transient is only known to the implementor

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Invokes one stage on one chunk.
///
/// Implementations make a single attempt; retry and admission control are
/// applied by the caller.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    async fn invoke(&self, stage_prompt: &str, chunk_text: &str) -> Result<String, InvokeError>;
}

/// Failure of a single external call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("Throttled by provider")]
    Throttled { retry_after: Option<Duration> },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rejected{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Rejected {
        status: Option<u16>,
        message: String,
        permanent: bool,
    },
}

impl InvokeError {
    /// Rejection that will not succeed on retry (malformed input, auth, policy).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Rejected {
            status: None,
            message: message.into(),
            permanent: true,
        }
    }

    /// Rejection expected to clear on its own (overloaded upstream, 5xx).
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Rejected {
            status: None,
            message: message.into(),
            permanent: false,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { permanent: true, .. })
    }

    /// Provider-supplied delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}
