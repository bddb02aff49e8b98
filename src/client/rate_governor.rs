//! Admission control over dual token/request budgets.
//!
//! Epistemic foundation:
//! - K_i: Provider budgets are expressed per time window (tokens and requests)
//! - K_i: Every external call passes `admit` first; grants are logged with
//!   their instant so the budget is enforced over any rolling window
//! - B_i: Token cost is only an estimate until the call returns
//! - I^B: Concurrent stages race for the budget → one mutex serializes grants

use crate::client::Clock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Budget ceilings for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    /// Maximum estimated tokens granted per window
    pub token_ceiling: u64,
    /// Maximum requests granted per window
    pub request_ceiling: u32,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            token_ceiling: 30_000,
            request_ceiling: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Budget consumed; the call may proceed.
    Allow,
    /// Budget exhausted; re-poll after this long.
    Wait(Duration),
}

/// Snapshot of the budget currently in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetWindow {
    /// Instant of the oldest grant still counted, if any
    pub window_start: Option<Instant>,
    pub tokens_consumed: u64,
    pub requests_consumed: u32,
}

#[derive(Debug)]
struct Grant {
    at: Instant,
    tokens: u64,
}

#[derive(Debug, Default)]
struct GovernorState {
    grants: VecDeque<Grant>,
    tokens: u64,
}

impl GovernorState {
    /// Drop grants that no longer fall inside the window ending at `now`.
    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.grants.front() {
            // A window past the end of time never expires its grants.
            match front.at.checked_add(window) {
                Some(end) if end <= now => {}
                _ => break,
            }
            self.tokens -= front.tokens;
            self.grants.pop_front();
        }
    }

    fn fits(&self, limits: &RateLimits, estimated: u64) -> bool {
        self.tokens + estimated <= limits.token_ceiling
            && self.grants.len() < limits.request_ceiling as usize
    }

    /// Time until enough of the oldest grants expire for `estimated` to fit.
    fn wait_for(&self, limits: &RateLimits, estimated: u64, now: Instant) -> Duration {
        let mut tokens = self.tokens;
        let mut requests = self.grants.len();

        for grant in &self.grants {
            tokens -= grant.tokens;
            requests -= 1;
            if tokens + estimated <= limits.token_ceiling
                && requests < limits.request_ceiling as usize
            {
                return grant
                    .at
                    .checked_add(limits.window)
                    .map_or(limits.window, |end| end.saturating_duration_since(now));
            }
        }

        // Larger than the whole ceiling: never admissible.
        limits.window
    }
}

/// Serialized admission control shared by every stage invocation.
///
/// A call is admitted only if, counting every grant made within the last
/// `window`, neither the token nor the request ceiling would be exceeded.
#[derive(Debug)]
pub struct RateGovernor {
    limits: RateLimits,
    clock: Arc<dyn Clock>,
    state: Mutex<GovernorState>,
    // Stats
    total_admitted: AtomicU64,
    total_denied: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateGovernor {
    /// Create a governor on the given clock.
    pub fn new(limits: RateLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            state: Mutex::new(GovernorState::default()),
            total_admitted: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Check the budget and consume it if the call fits.
    ///
    /// An estimate above `token_ceiling` is never admitted; callers must
    /// reject such work up front.
    pub fn admit(&self, estimated_tokens: u64) -> Decision {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.expire(now, self.limits.window);

        if state.fits(&self.limits, estimated_tokens) {
            state.grants.push_back(Grant {
                at: now,
                tokens: estimated_tokens,
            });
            state.tokens += estimated_tokens;
            self.total_admitted.fetch_add(1, Ordering::Relaxed);
            Decision::Allow
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            Decision::Wait(state.wait_for(&self.limits, estimated_tokens, now))
        }
    }

    /// Poll `admit` until allowed, sleeping on the clock between polls.
    ///
    /// Returns the total time waited, or `None` if cancelled first.
    pub async fn acquire(
        &self,
        estimated_tokens: u64,
        cancel: &CancellationToken,
    ) -> Option<Duration> {
        let mut waited = Duration::ZERO;

        loop {
            if cancel.is_cancelled() {
                return None;
            }

            match self.admit(estimated_tokens) {
                Decision::Allow => return Some(waited),
                Decision::Wait(wait) => {
                    debug!(
                        estimated_tokens,
                        wait_ms = wait.as_millis() as u64,
                        "Waiting for rate budget"
                    );
                    self.total_wait_ms
                        .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);

                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = self.clock.sleep(wait) => {}
                    }
                    waited = waited.saturating_add(wait);
                }
            }
        }
    }

    /// Budget currently counted against the ceilings.
    pub fn window(&self) -> BudgetWindow {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.expire(now, self.limits.window);

        BudgetWindow {
            window_start: state.grants.front().map(|g| g.at),
            tokens_consumed: state.tokens,
            requests_consumed: state.grants.len() as u32,
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Rate governor statistics.
#[derive(Debug, Clone)]
pub struct GovernorStats {
    pub total_admitted: u64,
    pub total_denied: u64,
    pub total_wait_secs: f64,
}

/// Estimate the token cost of a text.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> u64 {
    text.chars().count().div_ceil(chars_per_token.max(1)) as u64
}
