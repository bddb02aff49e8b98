//! Worker pool for stage invocations.
//!
//! Epistemic foundation:
//! - K_i: Every call is admitted by the rate governor first
//! - K_i: Result persistence happens-before completion recording
//! - B_i: Each call may fail → classified, retried with bounded backoff
//! - I^R: Pool size, retry bound and backoff are configurable

use crate::checkpoint::{CheckpointStore, ResultStore};
use crate::client::{Clock, InvokeError, RateGovernor, StageInvoker, estimate_tokens};
use crate::graph::Stage;
use crate::models::{Chunk, PipelineError, Result, RetryConfig, StageFailure, TaskResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded retry over classified invocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Pause between attempts when the provider gives no hint
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_secs(config.backoff_secs),
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn should_retry(&self, error: &InvokeError, attempts: u32) -> bool {
        error.is_retryable() && attempts < self.max_attempts()
    }

    /// Pause before the next attempt.
    pub fn delay_for(&self, error: &InvokeError) -> Duration {
        error.retry_after().unwrap_or(self.backoff)
    }
}

/// Final state of one (chunk, stage) pair in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Output persisted and completion recorded.
    ///
    /// `reused` means an earlier run had persisted the output but not
    /// recorded its completion; no call was made.
    Succeeded { attempts: u32, reused: bool },
    /// Permanent failure or retries exhausted.
    Failed(StageFailure),
    /// The run was stopped before the pair finished.
    Cancelled,
}

/// Bounded pool executing stage invocations for every chunk in flight.
pub struct StagePool {
    /// External call (shared)
    invoker: Arc<dyn StageInvoker>,
    /// Admission control (shared)
    governor: Arc<RateGovernor>,
    /// Backoff sleeps
    clock: Arc<dyn Clock>,
    checkpoints: Arc<dyn CheckpointStore>,
    results: Arc<dyn ResultStore>,
    /// Semaphore for concurrency control
    semaphore: Arc<Semaphore>,
    /// Pool size (max concurrent invocations)
    pool_size: usize,
    retry: RetryPolicy,
    chars_per_token: usize,
    // Stats
    invocations: AtomicU64,
}

impl StagePool {
    /// Create a new stage pool.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoker: Arc<dyn StageInvoker>,
        governor: Arc<RateGovernor>,
        clock: Arc<dyn Clock>,
        checkpoints: Arc<dyn CheckpointStore>,
        results: Arc<dyn ResultStore>,
        pool_size: usize,
        retry: RetryPolicy,
        chars_per_token: usize,
    ) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            invoker,
            governor,
            clock,
            checkpoints,
            results,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            retry,
            chars_per_token,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// External calls made so far, retries included.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Estimated token cost of running `stage` on `chunk`.
    pub fn estimate(&self, chunk: &Chunk, stage: &Stage) -> u64 {
        estimate_tokens(&chunk.text, self.chars_per_token)
            + estimate_tokens(stage.template(), self.chars_per_token)
    }

    /// Run one stage on one chunk to a final outcome.
    ///
    /// Only storage failures are returned as errors; they abort the run.
    pub async fn run_stage(
        &self,
        chunk: &Chunk,
        stage: &Stage,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let name = stage.name();

        if self.results.contains(chunk.index, name).await? {
            self.checkpoints.record_completion(chunk.index, name).await?;
            debug!(chunk = chunk.index, stage = %name, "Reusing persisted result");
            return Ok(StageOutcome::Succeeded {
                attempts: 0,
                reused: true,
            });
        }

        let estimated_tokens = self.estimate(chunk, stage);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let outcome = {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(StageOutcome::Cancelled),
                    permit = self.semaphore.acquire() => permit
                        .map_err(|_| PipelineError::Internal("Semaphore closed".to_string()))?,
                };

                if self.governor.acquire(estimated_tokens, cancel).await.is_none() {
                    return Ok(StageOutcome::Cancelled);
                }

                self.invocations.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(StageOutcome::Cancelled),
                    outcome = self.invoker.invoke(stage.template(), &chunk.text) => outcome,
                }
            };

            let error = match outcome {
                Ok(output) => {
                    let result = TaskResult::new(chunk.index, name.clone(), output);
                    self.results.persist(&result).await?;
                    self.checkpoints.record_completion(chunk.index, name).await?;
                    debug!(chunk = chunk.index, stage = %name, attempts, "Stage completed");
                    return Ok(StageOutcome::Succeeded {
                        attempts,
                        reused: false,
                    });
                }
                Err(e) => e,
            };

            if !self.retry.should_retry(&error, attempts) {
                warn!(
                    chunk = chunk.index,
                    stage = %name,
                    attempts,
                    error = %error,
                    "Stage failed permanently"
                );
                return Ok(StageOutcome::Failed(StageFailure {
                    chunk_index: chunk.index,
                    stage_name: name.clone(),
                    attempts,
                    last_error: error.to_string(),
                }));
            }

            let delay = self.retry.delay_for(&error);
            warn!(
                chunk = chunk.index,
                stage = %name,
                attempt = attempts,
                wait_ms = delay.as_millis() as u64,
                error = %error,
                "Stage call failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StageOutcome::Cancelled),
                _ = self.clock.sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{MemoryCheckpointStore, MemoryResultStore};
    use crate::client::{ManualClock, RateLimits};
    use crate::graph::StageName;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Plays back queued responses, then succeeds.
    struct Scripted {
        responses: Mutex<VecDeque<std::result::Result<String, InvokeError>>>,
    }

    impl Scripted {
        fn new(responses: Vec<std::result::Result<String, InvokeError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl StageInvoker for Scripted {
        async fn invoke(
            &self,
            _stage_prompt: &str,
            chunk_text: &str,
        ) -> std::result::Result<String, InvokeError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("out:{chunk_text}")))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        checkpoints: Arc<MemoryCheckpointStore>,
        results: Arc<MemoryResultStore>,
        pool: StagePool,
    }

    fn fixture(invoker: Scripted, max_retries: u32) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let results = Arc::new(MemoryResultStore::new());
        let governor = Arc::new(RateGovernor::new(RateLimits::default(), clock.clone()));
        let pool = StagePool::new(
            Arc::new(invoker),
            governor,
            clock.clone(),
            checkpoints.clone(),
            results.clone(),
            2,
            RetryPolicy {
                max_retries,
                backoff: Duration::from_secs(60),
            },
            4,
        );
        Fixture {
            clock,
            checkpoints,
            results,
            pool,
        }
    }

    fn chunk() -> Chunk {
        Chunk {
            index: 0,
            offset: 0,
            length: 5,
            text: "hello".to_string(),
        }
    }

    fn stage() -> Stage {
        Stage::new("A", "prompt").unwrap()
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_secs(60),
        };
        let timeout = InvokeError::Timeout(Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.should_retry(&timeout, 2));
        assert!(!policy.should_retry(&timeout, 3));
        assert!(!policy.should_retry(&InvokeError::permanent("bad"), 1));

        let throttled = InvokeError::Throttled {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(policy.delay_for(&throttled), Duration::from_secs(5));
        assert_eq!(policy.delay_for(&timeout), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_success_persists_then_records() {
        let f = fixture(Scripted::new(vec![]), 3);
        let cancel = CancellationToken::new();

        let outcome = f.pool.run_stage(&chunk(), &stage(), &cancel).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Succeeded {
                attempts: 1,
                reused: false
            }
        );

        let name = StageName::new("A").unwrap();
        let stored = f.results.get(0, &name).await.unwrap().unwrap();
        assert_eq!(stored.output_text, "out:hello");
        assert!(f.checkpoints.snapshot().is_complete(0, &name));
        assert_eq!(f.pool.invocations(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_with_backoff() {
        let f = fixture(
            Scripted::new(vec![
                Err(InvokeError::Timeout(Duration::from_secs(180))),
                Err(InvokeError::transient("503")),
            ]),
            3,
        );
        let cancel = CancellationToken::new();

        let outcome = f.pool.run_stage(&chunk(), &stage(), &cancel).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Succeeded {
                attempts: 3,
                reused: false
            }
        );
        assert_eq!(f.clock.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_throttle_hint_overrides_backoff() {
        let f = fixture(
            Scripted::new(vec![Err(InvokeError::Throttled {
                retry_after: Some(Duration::from_secs(7)),
            })]),
            3,
        );
        let cancel = CancellationToken::new();

        f.pool.run_stage(&chunk(), &stage(), &cancel).await.unwrap();
        assert_eq!(f.clock.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_not_retried() {
        let f = fixture(Scripted::new(vec![Err(InvokeError::permanent("bad input"))]), 3);
        let cancel = CancellationToken::new();

        let outcome = f.pool.run_stage(&chunk(), &stage(), &cancel).await.unwrap();
        let StageOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.last_error, "Rejected: bad input");
        assert!(f.results.is_empty());
        assert!(f.checkpoints.snapshot().completed.is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let timeouts = (0..5)
            .map(|_| Err(InvokeError::Timeout(Duration::from_secs(1))))
            .collect();
        let f = fixture(Scripted::new(timeouts), 2);
        let cancel = CancellationToken::new();

        let outcome = f.pool.run_stage(&chunk(), &stage(), &cancel).await.unwrap();
        let StageOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.attempts, 3);
        assert_eq!(f.pool.invocations(), 3);
    }

    #[tokio::test]
    async fn test_persisted_result_is_reused() {
        let f = fixture(Scripted::new(vec![]), 3);
        let name = StageName::new("A").unwrap();
        f.results
            .persist(&TaskResult::new(0, name.clone(), "earlier".to_string()))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let outcome = f.pool.run_stage(&chunk(), &stage(), &cancel).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Succeeded {
                attempts: 0,
                reused: true
            }
        );
        assert_eq!(f.pool.invocations(), 0);
        assert!(f.checkpoints.snapshot().is_complete(0, &name));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let f = fixture(Scripted::new(vec![]), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = f.pool.run_stage(&chunk(), &stage(), &cancel).await.unwrap();
        assert_eq!(outcome, StageOutcome::Cancelled);
        assert_eq!(f.pool.invocations(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_is_an_error() {
        let f = fixture(Scripted::new(vec![]), 3);
        f.checkpoints.set_failing(true);
        let cancel = CancellationToken::new();

        let err = f.pool.run_stage(&chunk(), &stage(), &cancel).await.unwrap_err();
        assert!(err.is_storage_failure());
    }
}
