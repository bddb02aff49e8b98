//! Error types for chunkwise.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad config, empty document, invalid graph)
//! - I^B materialized: Storage failures (disk full, permission denied)
//! - K_i violated: Internal invariant violations (bugs)
//!
//! External-call failures are not here: they are classified by
//! [`crate::client::InvokeError`] and isolated per (chunk, stage) pair.

use thiserror::Error;

/// Run-level error type for chunkwise.
///
/// Every variant aborts the run. Per-pair failures are reported through
/// [`crate::models::StageFailure`] instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (fatal at startup)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Document is empty")]
    EmptyDocument,

    #[error("Invalid stage graph: {0}")]
    InvalidGraph(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Durable storage became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Storage failure while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt persisted state: {0}")]
    CorruptState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a storage error with context.
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    /// Whether the error came from the durable store.
    ///
    /// Resume correctness depends on durability, so these always halt the run.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::CorruptState(_) | Self::Serialization(_)
        )
    }
}

/// Result type alias for chunkwise.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_classified() {
        let err = PipelineError::storage(
            "writing checkpoint",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(err.is_storage_failure());
        assert!(err.to_string().contains("writing checkpoint"));
        assert!(!PipelineError::EmptyDocument.is_storage_failure());
    }
}
