//! Chunk-processing pipeline.
//!
//! Pipeline flow:
//! Document → Chunker → per chunk: phase 1 ∥ stages → barrier → phase 2 … → advance
//!
//! Epistemic foundation:
//! - K_i: Chunking is deterministic, so indices are stable across runs
//! - K_i: Durable state alone decides what is left to do
//! - B_i: A pair may fail permanently → only its chunk halts
//! - I^B: Storage may fail → the whole run aborts

use crate::checkpoint::{
    Checkpoint, CheckpointStore, Fingerprint, MemoryCheckpointStore, MemoryResultStore,
    ResultStore,
};
use crate::chunking::Chunker;
use crate::client::{Clock, RateGovernor, RateLimits, StageInvoker, TokioClock};
use crate::graph::{Stage, StageGraph};
use crate::models::{
    Chunk, Config, Document, MAX_DURATION_SECS, PipelineError, Result, RunReport, StageFailure,
};
use crate::pipeline::AdvanceTracker;
use crate::pool::{RetryPolicy, StageOutcome, StagePool};
use futures::StreamExt;
use futures::future::try_join_all;
use futures::stream;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builder for [`Pipeline`].
///
/// Defaults match [`Config::default`] with in-memory stores and the tokio clock.
pub struct PipelineBuilder {
    graph: StageGraph,
    invoker: Arc<dyn StageInvoker>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    results: Option<Arc<dyn ResultStore>>,
    clock: Option<Arc<dyn Clock>>,
    run_id: String,
    max_chunk_size: usize,
    limits: RateLimits,
    chars_per_token: usize,
    retry: RetryPolicy,
    chunk_concurrency: usize,
    stage_workers: usize,
    show_progress: bool,
}

impl PipelineBuilder {
    pub fn new(graph: StageGraph, invoker: Arc<dyn StageInvoker>) -> Self {
        Self {
            graph,
            invoker,
            checkpoints: None,
            results: None,
            clock: None,
            run_id: "default".to_string(),
            max_chunk_size: 0,
            limits: RateLimits::default(),
            chars_per_token: 0,
            retry: RetryPolicy::default(),
            chunk_concurrency: 0,
            stage_workers: 0,
            show_progress: false,
        }
        .config(&Config::default())
    }

    /// Apply every tunable from a loaded configuration.
    pub fn config(mut self, config: &Config) -> Self {
        self.max_chunk_size = config.chunking.max_chunk_size;
        self.limits = RateLimits {
            token_ceiling: config.rate_limit.token_ceiling,
            request_ceiling: config.rate_limit.request_ceiling,
            window: config.rate_limit.window(),
        };
        self.chars_per_token = config.rate_limit.chars_per_token;
        self.retry = RetryPolicy::from_config(&config.retry);
        self.chunk_concurrency = config.concurrency.chunk_concurrency;
        self.stage_workers = config.concurrency.stage_workers;
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.results = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn rate_limits(mut self, limits: RateLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn chars_per_token(mut self, chars: usize) -> Self {
        self.chars_per_token = chars;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn chunk_concurrency(mut self, n: usize) -> Self {
        self.chunk_concurrency = n;
        self
    }

    pub fn stage_workers(mut self, n: usize) -> Self {
        self.stage_workers = n;
        self
    }

    /// Draw a progress bar over chunks while running.
    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Validate settings and assemble the pipeline.
    pub fn build(self) -> Result<Pipeline> {
        let chunker = Chunker::new(self.max_chunk_size)?;

        let max_duration = Duration::from_secs(MAX_DURATION_SECS);
        let invalid = [
            (self.limits.token_ceiling == 0, "token_ceiling must be > 0"),
            (self.limits.request_ceiling == 0, "request_ceiling must be > 0"),
            (self.limits.window.is_zero(), "window duration must be > 0"),
            (self.limits.window > max_duration, "window duration must be at most one week"),
            (self.retry.backoff > max_duration, "retry backoff must be at most one week"),
            (self.chars_per_token == 0, "chars_per_token must be > 0"),
            (self.chunk_concurrency == 0, "chunk_concurrency must be > 0"),
            (self.stage_workers == 0, "stage_workers must be > 0"),
        ];
        if let Some((_, message)) = invalid.iter().find(|(failed, _)| *failed) {
            return Err(PipelineError::InvalidConfig((*message).to_string()));
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(TokioClock),
        };
        let checkpoints: Arc<dyn CheckpointStore> = match self.checkpoints {
            Some(store) => store,
            None => Arc::new(MemoryCheckpointStore::new()),
        };
        let results: Arc<dyn ResultStore> = match self.results {
            Some(store) => store,
            None => Arc::new(MemoryResultStore::new()),
        };
        let governor = Arc::new(RateGovernor::new(self.limits, Arc::clone(&clock)));

        let pool = StagePool::new(
            self.invoker,
            Arc::clone(&governor),
            clock,
            Arc::clone(&checkpoints),
            Arc::clone(&results),
            self.stage_workers,
            self.retry,
            self.chars_per_token,
        );

        Ok(Pipeline {
            run_id: self.run_id,
            graph: self.graph,
            chunker,
            pool,
            governor,
            checkpoints,
            results,
            chunk_concurrency: self.chunk_concurrency,
            show_progress: self.show_progress,
            cancel: CancellationToken::new(),
        })
    }
}

/// What happened to one chunk in this run.
#[derive(Debug, Default)]
struct ChunkOutcome {
    /// Pairs that needed external calls and succeeded
    executed: usize,
    failures: Vec<StageFailure>,
    cancelled: bool,
}

/// Resumable, rate-limited pipeline over one document.
pub struct Pipeline {
    run_id: String,
    graph: StageGraph,
    chunker: Chunker,
    pool: StagePool,
    governor: Arc<RateGovernor>,
    checkpoints: Arc<dyn CheckpointStore>,
    results: Arc<dyn ResultStore>,
    /// Chunks in flight at once
    chunk_concurrency: usize,
    show_progress: bool,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn builder(graph: StageGraph, invoker: Arc<dyn StageInvoker>) -> PipelineBuilder {
        PipelineBuilder::new(graph, invoker)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn results(&self) -> &Arc<dyn ResultStore> {
        &self.results
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// External calls made so far, retries included.
    pub fn invocations(&self) -> u64 {
        self.pool.invocations()
    }

    /// Token that stops the run; in-flight calls are abandoned and their
    /// pairs re-attempted on the next run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process every pending (chunk, stage) pair of the document.
    pub async fn run(&self, document: &Document) -> Result<RunReport> {
        let start = Instant::now();
        let chunks = self.chunker.split(document)?;
        let checkpoint = self.resume_state(document, &chunks).await?;
        self.check_estimates(&chunks)?;

        let pending: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| !checkpoint.covers(c.index))
            .collect();

        info!(
            run_id = %self.run_id,
            chunks = chunks.len(),
            pending = pending.len(),
            resume_after = checkpoint.last_completed_chunk_index,
            stages = self.graph.stage_count(),
            chunk_concurrency = self.chunk_concurrency,
            stage_workers = self.pool.pool_size(),
            max_retries = self.pool.retry_policy().max_retries,
            "Starting pipeline"
        );

        let pb = self.progress_bar(chunks.len(), checkpoint.chunks_completed());
        let tracker = AdvanceTracker::new(
            Arc::clone(&self.checkpoints),
            checkpoint.last_completed_chunk_index,
        );

        let mut executed = 0;
        let mut failed = Vec::new();
        let mut interrupted = false;

        let mut outcomes = stream::iter(pending)
            .map(|chunk| self.process_chunk(chunk, &checkpoint, &tracker))
            .buffer_unordered(self.chunk_concurrency);

        while let Some(outcome) = outcomes.next().await {
            // Storage failures abort the run; dropping the stream drops in-flight work.
            let outcome = outcome?;
            executed += outcome.executed;
            interrupted |= outcome.cancelled;
            if outcome.failures.is_empty() && !outcome.cancelled {
                pb.inc(1);
            }
            failed.extend(outcome.failures);
            pb.set_message(format!("failed pairs: {}", failed.len()));
        }
        drop(outcomes);

        let interrupted = interrupted || self.cancel.is_cancelled();
        failed.sort_by(|a: &StageFailure, b: &StageFailure| {
            (a.chunk_index, &a.stage_name).cmp(&(b.chunk_index, &b.stage_name))
        });

        let mut report = self.summarize(&chunks, &self.checkpoints.load().await?);
        report.executed = executed;
        report.failed = failed;
        report.interrupted = interrupted;
        report.runtime_secs = start.elapsed().as_secs_f64();

        pb.finish_with_message(format!(
            "{} / {} chunks complete",
            report.chunks_completed, report.chunks_total
        ));

        let stats = self.governor.stats();
        info!(
            run_id = %self.run_id,
            chunks_completed = report.chunks_completed,
            succeeded = report.succeeded,
            executed = report.executed,
            failed = report.failed.len(),
            interrupted = report.interrupted,
            invocations = self.pool.invocations(),
            rate_waits = stats.total_denied,
            rate_wait_secs = stats.total_wait_secs,
            "Pipeline finished"
        );

        Ok(report)
    }

    /// Report durable progress without running anything.
    pub async fn status(&self, document: &Document) -> Result<RunReport> {
        let chunks = self.chunker.split(document)?;
        let checkpoint = self.checkpoints.load().await?;
        if let Some(stored) = checkpoint.fingerprint {
            check_fingerprint(stored, fingerprint_of(document, &self.chunker, &chunks))?;
        }
        Ok(self.summarize(&chunks, &checkpoint))
    }

    /// Load the checkpoint and bind it to this document's chunking.
    async fn resume_state(&self, document: &Document, chunks: &[Chunk]) -> Result<Checkpoint> {
        let checkpoint = self.checkpoints.load().await?;
        let current = fingerprint_of(document, &self.chunker, chunks);

        match checkpoint.fingerprint {
            Some(stored) => check_fingerprint(stored, current)?,
            None => self.checkpoints.set_fingerprint(current).await?,
        }

        if checkpoint.last_completed_chunk_index >= chunks.len() as i64 {
            return Err(PipelineError::CorruptState(format!(
                "checkpoint advanced to chunk {} but the document has {} chunks",
                checkpoint.last_completed_chunk_index,
                chunks.len()
            )));
        }
        Ok(checkpoint)
    }

    /// Reject pairs whose estimate could never fit in one window.
    fn check_estimates(&self, chunks: &[Chunk]) -> Result<()> {
        let ceiling = self.governor.limits().token_ceiling;
        for chunk in chunks {
            for stage in self.graph.stages() {
                let estimate = self.pool.estimate(chunk, stage);
                if estimate > ceiling {
                    return Err(PipelineError::InvalidConfig(format!(
                        "chunk {} / stage {} needs ~{estimate} tokens, above token_ceiling {ceiling}; \
                         lower max_chunk_size or raise the ceiling",
                        chunk.index,
                        stage.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drive one chunk through every phase.
    async fn process_chunk(
        &self,
        chunk: &Chunk,
        checkpoint: &Checkpoint,
        tracker: &AdvanceTracker,
    ) -> Result<ChunkOutcome> {
        let mut outcome = ChunkOutcome::default();

        for (phase_index, phase) in self.graph.phases().iter().enumerate() {
            let todo: Vec<&Stage> = phase
                .iter()
                .filter(|s| !checkpoint.is_complete(chunk.index, s.name()))
                .collect();
            if todo.is_empty() {
                continue;
            }

            debug!(
                chunk = chunk.index,
                phase = phase_index,
                stages = todo.len(),
                "Entering phase"
            );

            // Barrier: the next phase starts only after every stage here is final.
            let results = try_join_all(
                todo.iter()
                    .map(|stage| self.pool.run_stage(chunk, stage, &self.cancel)),
            )
            .await?;

            for result in results {
                match result {
                    StageOutcome::Succeeded { reused, .. } => {
                        if !reused {
                            outcome.executed += 1;
                        }
                    }
                    StageOutcome::Failed(failure) => outcome.failures.push(failure),
                    StageOutcome::Cancelled => outcome.cancelled = true,
                }
            }

            if outcome.cancelled {
                return Ok(outcome);
            }
            if !outcome.failures.is_empty() {
                warn!(
                    chunk = chunk.index,
                    phase = phase_index,
                    failed = outcome.failures.len(),
                    "Halting chunk after failed phase"
                );
                return Ok(outcome);
            }
        }

        tracker.complete(chunk.index).await?;
        Ok(outcome)
    }

    /// Counts derived from durable state.
    fn summarize(&self, chunks: &[Chunk], checkpoint: &Checkpoint) -> RunReport {
        let stages = self.graph.stage_count();
        let chunks_completed = checkpoint.chunks_completed().min(chunks.len());
        let partial = checkpoint
            .completed
            .iter()
            .filter(|c| {
                c.chunk_index < chunks.len() && self.graph.stage(c.stage_name.as_str()).is_some()
            })
            .count();

        RunReport {
            run_id: self.run_id.clone(),
            chunks_total: chunks.len(),
            chunks_completed,
            last_completed_chunk_index: checkpoint.last_completed_chunk_index,
            pairs_total: chunks.len() * stages,
            succeeded: chunks_completed * stages + partial,
            ..Default::default()
        }
    }

    fn progress_bar(&self, total: usize, done: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} chunks ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb.set_position(done as u64);
        pb.enable_steady_tick(Duration::from_millis(250));
        pb
    }
}

fn fingerprint_of(document: &Document, chunker: &Chunker, chunks: &[Chunk]) -> Fingerprint {
    Fingerprint {
        document_len: document.len(),
        max_chunk_size: chunker.max_chunk_size(),
        chunk_count: chunks.len(),
    }
}

fn check_fingerprint(stored: Fingerprint, current: Fingerprint) -> Result<()> {
    if stored == current {
        return Ok(());
    }
    Err(PipelineError::InvalidConfig(format!(
        "checkpoint was written for a different chunking \
         (document {} bytes, max_chunk_size {}, {} chunks; now {} bytes, {}, {} chunks); \
         use a new run id",
        stored.document_len,
        stored.max_chunk_size,
        stored.chunk_count,
        current.document_len,
        current.max_chunk_size,
        current.chunk_count
    )))
}
