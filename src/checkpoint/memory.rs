//! In-memory stores for embedding and tests.
//!
//! Same contracts as the file-backed stores, with no durability. The
//! checkpoint store also records the sequence of `advance` calls and can be
//! switched into a failing mode to exercise storage-failure handling.

use crate::checkpoint::{Checkpoint, CheckpointStore, Completion, Fingerprint, ResultStore};
use crate::graph::StageName;
use crate::models::{PipelineError, Result, TaskResult};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    checkpoint: Checkpoint,
    advances: Vec<usize>,
}

/// Checkpoint store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing checkpoint (e.g. a simulated earlier run).
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                checkpoint,
                advances: Vec::new(),
            }),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Chunk indices passed to effective `advance` calls, in call order.
    pub fn advance_history(&self) -> Vec<usize> {
        self.lock().advances.clone()
    }

    /// Current checkpoint.
    pub fn snapshot(&self) -> Checkpoint {
        self.lock().checkpoint.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PipelineError::storage(
                "writing checkpoint",
                std::io::Error::other("injected storage failure"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Checkpoint> {
        Ok(self.snapshot())
    }

    async fn record_completion(&self, chunk_index: usize, stage_name: &StageName) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock();
        if !state.checkpoint.covers(chunk_index) {
            state
                .checkpoint
                .completed
                .insert(Completion::new(chunk_index, stage_name.clone()));
        }
        Ok(())
    }

    async fn advance(&self, chunk_index: usize) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock();
        if state.checkpoint.covers(chunk_index) {
            return Ok(());
        }
        state.checkpoint.last_completed_chunk_index = chunk_index as i64;
        state
            .checkpoint
            .completed
            .retain(|c| c.chunk_index > chunk_index);
        state.advances.push(chunk_index);
        Ok(())
    }

    async fn set_fingerprint(&self, fingerprint: Fingerprint) -> Result<()> {
        self.check_writable()?;
        self.lock().checkpoint.fingerprint = Some(fingerprint);
        Ok(())
    }
}

/// Result store held in a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: DashMap<(usize, StageName), TaskResult>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn persist(&self, result: &TaskResult) -> Result<bool> {
        match self
            .results
            .entry((result.chunk_index, result.stage_name.clone()))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(result.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, chunk_index: usize, stage_name: &StageName) -> Result<Option<TaskResult>> {
        Ok(self
            .results
            .get(&(chunk_index, stage_name.clone()))
            .map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<TaskResult>> {
        let mut results: Vec<TaskResult> = self.results.iter().map(|r| r.value().clone()).collect();
        results.sort_by(|a, b| {
            (a.chunk_index, &a.stage_name).cmp(&(b.chunk_index, &b.stage_name))
        });
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> StageName {
        StageName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_advance_history_skips_noops() {
        let store = MemoryCheckpointStore::new();
        store.record_completion(0, &name("A")).await.unwrap();
        store.advance(0).await.unwrap();
        store.advance(0).await.unwrap();
        store.advance(1).await.unwrap();

        assert_eq!(store.advance_history(), vec![0, 1]);
        let checkpoint = store.load().await.unwrap();
        assert_eq!(checkpoint.last_completed_chunk_index, 1);
        assert!(checkpoint.completed.is_empty());
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let store = MemoryCheckpointStore::new();
        store.set_failing(true);
        let err = store.record_completion(0, &name("A")).await.unwrap_err();
        assert!(err.is_storage_failure());

        store.set_failing(false);
        store.record_completion(0, &name("A")).await.unwrap();
    }

    #[tokio::test]
    async fn test_result_store_first_write_wins() {
        let store = MemoryResultStore::new();
        let first = TaskResult::new(1, name("A"), "first".to_string());
        let second = TaskResult::new(1, name("A"), "second".to_string());

        assert!(store.persist(&first).await.unwrap());
        assert!(!store.persist(&second).await.unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(1, &name("A")).await.unwrap().unwrap().output_text,
            "first"
        );
    }
}
