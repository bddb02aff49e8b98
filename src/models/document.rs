//! Document, chunk and result types for chunkwise.
//!
//! K_i: These types represent the core data flow through the pipeline.

use crate::graph::StageName;
use crate::models::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Input document, already extracted to text.
///
/// K_i: Immutable once loaded; the caller owns it for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    text: String,
}

impl Document {
    /// Wrap extracted text.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Load a UTF-8 text file produced by the extraction step.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::storage(format!("reading document {}", path.display()), e))?;
        Ok(Self::new(text))
    }

    /// Full document text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Length in characters (the chunker's unit).
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// A bounded, deterministically indexed slice of a document.
///
/// `offset` and `length` are byte positions in the document text; the size
/// bound the chunker enforces is in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position in the chunk sequence, contiguous from 0
    pub index: usize,
    /// Byte offset of the first character
    pub offset: usize,
    /// Length in bytes
    pub length: usize,
    /// Chunk text
    pub text: String,
}

impl Chunk {
    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Output of one successful (chunk, stage) execution.
///
/// K_i: Created once, never mutated, never overwritten in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Chunk the stage ran on
    pub chunk_index: usize,
    /// Stage that produced the output
    pub stage_name: StageName,
    /// Raw output text of the external call
    pub output_text: String,
    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Create a result stamped with the current time.
    pub fn new(chunk_index: usize, stage_name: StageName, output_text: String) -> Self {
        Self {
            chunk_index,
            stage_name,
            output_text,
            completed_at: Utc::now(),
        }
    }
}

/// A (chunk, stage) pair that failed permanently in this run.
///
/// Carries enough context to retry on the next invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub chunk_index: usize,
    pub stage_name: StageName,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Display form of the last error
    pub last_error: String,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chunk {} / {}: {} (after {} attempt(s))",
            self.chunk_index, self.stage_name, self.last_error, self.attempts
        )
    }
}

/// Summary of a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identity
    pub run_id: String,

    /// Chunks in the document
    pub chunks_total: usize,

    /// Chunks covered by the advanced checkpoint
    pub chunks_completed: usize,

    /// Advanced checkpoint position (-1 when nothing advanced)
    pub last_completed_chunk_index: i64,

    /// (chunk, stage) pairs in the whole run
    pub pairs_total: usize,

    /// Pairs with a recorded completion, including earlier runs
    pub succeeded: usize,

    /// Pairs executed by this invocation
    pub executed: usize,

    /// Pairs that failed permanently in this invocation
    pub failed: Vec<StageFailure>,

    /// Whether the run stopped on a cancellation signal
    pub interrupted: bool,

    /// Total runtime in seconds
    pub runtime_secs: f64,
}

impl RunReport {
    /// Whether every pair of every chunk is complete.
    pub fn is_complete(&self) -> bool {
        self.chunks_completed == self.chunks_total
    }

    /// Progress percentage over pairs.
    pub fn progress_percent(&self) -> f64 {
        if self.pairs_total == 0 {
            return 100.0;
        }
        (self.succeeded as f64 / self.pairs_total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lengths() {
        let doc = Document::new("héllo");
        assert_eq!(doc.len(), 6);
        assert_eq!(doc.char_len(), 5);
        assert!(!doc.is_empty());
        assert!(Document::new("").is_empty());
    }

    #[test]
    fn test_task_result_serializes_stage_name_as_string() {
        let result = TaskResult::new(2, StageName::new("RiskExpert").unwrap(), "ok".into());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["chunk_index"], 2);
        assert_eq!(json["stage_name"], "RiskExpert");
    }

    #[test]
    fn test_report_progress() {
        let report = RunReport {
            chunks_total: 3,
            chunks_completed: 3,
            pairs_total: 9,
            succeeded: 9,
            ..Default::default()
        };
        assert!(report.is_complete());
        assert_eq!(report.progress_percent(), 100.0);

        let empty = RunReport::default();
        assert_eq!(empty.progress_percent(), 100.0);
    }
}
