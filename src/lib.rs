//! chunkwise - Resumable, rate-limited chunk-processing pipeline for long documents.
//!
//! ## Architecture
//!
//! A document is split into deterministic chunks; every chunk is routed
//! through a fixed stage graph (sequential phases of concurrent stages):
//! - **Chunker**: Bounded, stably indexed chunks
//! - **RateGovernor**: Dual token/request budget over a rolling window
//! - **StagePool**: Bounded workers, classified retry, persist-then-record
//! - **CheckpointStore**: Durable completion facts and a monotonic advance pointer
//! - **Pipeline**: Drives chunks through phases and resumes from durable state
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (admission control, retry, backoff)

pub mod checkpoint;
pub mod chunking;
pub mod client;
pub mod graph;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, FileResultStore, MemoryCheckpointStore,
    MemoryResultStore, ResultStore,
};
pub use chunking::Chunker;
pub use client::{
    Clock, Decision, InvokeError, LLMClient, ManualClock, RateGovernor, RateLimits, StageInvoker,
    TokioClock,
};
pub use graph::{Stage, StageGraph, StageName};
pub use models::{
    Chunk, Config, Document, PipelineError, Result, RunReport, StageFailure, TaskResult,
};
pub use pipeline::{Pipeline, PipelineBuilder, ReportFormat, ReportWriter};
pub use pool::{RetryPolicy, StageOutcome, StagePool};
