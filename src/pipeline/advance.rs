//! Monotonic, contiguous checkpoint advance.
//!
//! Chunks may finish out of order when several are in flight. The tracker
//! holds finished chunks until every lower index has finished too, then
//! advances the checkpoint one index at a time, in order.

use crate::checkpoint::CheckpointStore;
use crate::models::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct AdvanceState {
    /// Lowest chunk index not yet advanced
    next: usize,
    /// Finished chunks at or above `next`
    finished: BTreeSet<usize>,
}

/// Serializes `advance` calls so the checkpoint only moves forward.
pub struct AdvanceTracker {
    store: Arc<dyn CheckpointStore>,
    state: Mutex<AdvanceState>,
}

impl AdvanceTracker {
    /// Start after the checkpoint's last completed chunk.
    pub fn new(store: Arc<dyn CheckpointStore>, last_completed_chunk_index: i64) -> Self {
        Self {
            store,
            state: Mutex::new(AdvanceState {
                next: (last_completed_chunk_index + 1).max(0) as usize,
                finished: BTreeSet::new(),
            }),
        }
    }

    /// Mark a chunk fully processed and advance as far as contiguity allows.
    ///
    /// Returns the highest index advanced by this call, if any.
    pub async fn complete(&self, chunk_index: usize) -> Result<Option<usize>> {
        // Held across the store call so advance(i) happens-before advance(j > i).
        let mut state = self.state.lock().await;
        if chunk_index < state.next {
            return Ok(None);
        }
        state.finished.insert(chunk_index);

        let mut advanced = None;
        while state.finished.contains(&state.next) {
            let index = state.next;
            self.store.advance(index).await?;
            state.finished.remove(&index);
            state.next += 1;
            advanced = Some(index);
        }

        if advanced.is_none() {
            debug!(
                chunk = chunk_index,
                waiting_for = state.next,
                "Chunk finished out of order, holding advance"
            );
        }
        Ok(advanced)
    }

    /// Lowest chunk index not yet advanced.
    pub async fn next_index(&self) -> usize {
        self.state.lock().await.next
    }
}
