//! Checkpoint state management for resumable runs.
//!
//! Epistemic foundation:
//! - K_i: Checkpoints track which (chunk, stage) pairs have completed
//! - K_i: Compacted state is persisted atomically (write-then-rename)
//! - K_i: Completion facts are journaled and fsynced before returning
//! - B_i: Checkpoint file may not exist → empty checkpoint
//! - I^B: Crash during write → backup file and journal replay provide recovery

use crate::graph::StageName;
use crate::models::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A durable "(chunk, stage) completed" fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Completion {
    pub chunk_index: usize,
    pub stage_name: StageName,
}

impl Completion {
    pub fn new(chunk_index: usize, stage_name: StageName) -> Self {
        Self {
            chunk_index,
            stage_name,
        }
    }
}

/// Identity of the chunking a checkpoint was produced against.
///
/// K_i: Chunk indices only mean something for the same document and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Document length in bytes
    pub document_len: usize,
    pub max_chunk_size: usize,
    pub chunk_count: usize,
}

/// Durable progress of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Every chunk at or below this index is fully processed (-1 = none)
    pub last_completed_chunk_index: i64,
    /// Completed pairs above the advanced index
    #[serde(default)]
    pub completed: BTreeSet<Completion>,
    /// Chunking the indices refer to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::empty()
    }
}

impl Checkpoint {
    /// Checkpoint of a run that has not started.
    pub fn empty() -> Self {
        Self {
            last_completed_chunk_index: -1,
            completed: BTreeSet::new(),
            fingerprint: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the pair needs no further work.
    pub fn is_complete(&self, chunk_index: usize, stage_name: &StageName) -> bool {
        self.covers(chunk_index)
            || self
                .completed
                .contains(&Completion::new(chunk_index, stage_name.clone()))
    }

    /// Whether the chunk is at or below the advanced index.
    pub fn covers(&self, chunk_index: usize) -> bool {
        (chunk_index as i64) <= self.last_completed_chunk_index
    }

    /// Number of chunks covered by the advanced index.
    pub fn chunks_completed(&self) -> usize {
        (self.last_completed_chunk_index + 1).max(0) as usize
    }

    /// Record a fact in memory; returns false if it was already known.
    fn insert(&mut self, completion: Completion) -> bool {
        if self.covers(completion.chunk_index) {
            return false;
        }
        self.completed.insert(completion)
    }

    /// Move the advanced index forward and compact; returns false on a no-op.
    fn advance_to(&mut self, chunk_index: usize) -> bool {
        if self.covers(chunk_index) {
            return false;
        }
        self.last_completed_chunk_index = chunk_index as i64;
        self.completed.retain(|c| c.chunk_index > chunk_index);
        self.updated_at = Utc::now();
        true
    }
}

/// Durable store of run progress.
///
/// Every method returns only after its effect is durable (or has failed).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last durably saved checkpoint, or an empty one.
    async fn load(&self) -> Result<Checkpoint>;

    /// Durably record a completed pair. Idempotent.
    async fn record_completion(&self, chunk_index: usize, stage_name: &StageName) -> Result<()>;

    /// Durably record that this chunk and all lower ones are complete,
    /// compacting per-stage facts. Idempotent; never moves backwards.
    async fn advance(&self, chunk_index: usize) -> Result<()>;

    /// Durably bind the checkpoint to a chunking.
    async fn set_fingerprint(&self, fingerprint: Fingerprint) -> Result<()>;
}

/// File-backed checkpoint store for one run directory.
///
/// Layout: `checkpoint.json` (compacted), `checkpoint.backup.json` (previous
/// compacted state) and `completions.jsonl` (journal of facts since).
pub struct FileCheckpointStore {
    /// Path to main checkpoint file
    checkpoint_path: PathBuf,
    /// Path to backup file
    backup_path: PathBuf,
    /// Path to completion journal
    journal_path: PathBuf,
    /// Cached state, serializes all writers
    state: Mutex<Checkpoint>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) the store in `dir`.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| PipelineError::storage("creating checkpoint dir", e))?;

        Ok(Self {
            checkpoint_path: dir.join("checkpoint.json"),
            backup_path: dir.join("checkpoint.backup.json"),
            journal_path: dir.join("completions.jsonl"),
            state: Mutex::new(Checkpoint::empty()),
        })
    }

    /// Check if a checkpoint exists.
    pub fn exists(&self) -> bool {
        self.checkpoint_path.exists() || self.journal_path.exists()
    }

    /// Read the compacted checkpoint, falling back to the backup.
    fn read_compacted(&self) -> Result<Checkpoint> {
        if !self.checkpoint_path.exists() {
            return Ok(Checkpoint::empty());
        }

        match read_json(&self.checkpoint_path) {
            Ok(checkpoint) => Ok(checkpoint),
            Err(main_err) => {
                warn!(
                    path = %self.checkpoint_path.display(),
                    error = %main_err,
                    "Checkpoint unreadable, trying backup"
                );
                read_json(&self.backup_path).map_err(|_| {
                    PipelineError::CorruptState(format!(
                        "{} and its backup are unreadable: {main_err}",
                        self.checkpoint_path.display()
                    ))
                })
            }
        }
    }

    /// Replay journaled facts over a compacted checkpoint.
    ///
    /// Returns the number of facts applied and whether a torn tail was seen.
    fn replay_journal(&self, checkpoint: &mut Checkpoint) -> Result<(usize, bool)> {
        let file = match File::open(&self.journal_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, false)),
            Err(e) => return Err(PipelineError::storage("opening completion journal", e)),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()
            .map_err(|e| PipelineError::storage("reading completion journal", e))?;

        let mut replayed = 0;
        let mut torn = false;
        let last = lines.len().saturating_sub(1);
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Completion>(line) {
                Ok(fact) => {
                    if checkpoint.insert(fact) {
                        replayed += 1;
                    }
                }
                // A crash mid-append leaves at most one torn trailing line
                Err(e) if n == last => {
                    warn!(line = n + 1, error = %e, "Ignoring torn journal tail");
                    torn = true;
                }
                Err(e) => {
                    return Err(PipelineError::CorruptState(format!(
                        "{} line {}: {e}",
                        self.journal_path.display(),
                        n + 1
                    )));
                }
            }
        }
        Ok((replayed, torn))
    }

    /// Save compacted checkpoint to disk (atomic write).
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        // Backup existing checkpoint
        if self.checkpoint_path.exists() {
            fs::copy(&self.checkpoint_path, &self.backup_path)
                .map_err(|e| PipelineError::storage("backing up checkpoint", e))?;
        }

        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| PipelineError::Serialization(format!("checkpoint: {e}")))?;
        write_atomic(&self.checkpoint_path, &bytes)?;

        debug!(
            last_completed = checkpoint.last_completed_chunk_index,
            pending_facts = checkpoint.completed.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Rewrite the journal to hold exactly the surviving facts.
    fn rewrite_journal(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut bytes = Vec::new();
        for fact in &checkpoint.completed {
            serde_json::to_writer(&mut bytes, fact)
                .map_err(|e| PipelineError::Serialization(format!("journal entry: {e}")))?;
            bytes.push(b'\n');
        }
        write_atomic(&self.journal_path, &bytes)
    }

    fn append_journal(&self, fact: &Completion) -> Result<()> {
        let mut line = serde_json::to_vec(fact)
            .map_err(|e| PipelineError::Serialization(format!("journal entry: {e}")))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .map_err(|e| PipelineError::storage("opening completion journal", e))?;
        file.write_all(&line)
            .map_err(|e| PipelineError::storage("appending completion journal", e))?;
        file.sync_data()
            .map_err(|e| PipelineError::storage("syncing completion journal", e))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Checkpoint> {
        let mut state = self.state.lock().await;

        let mut checkpoint = self.read_compacted()?;
        let (replayed, torn) = self.replay_journal(&mut checkpoint)?;
        if torn {
            // Later appends must not land on the torn line
            self.rewrite_journal(&checkpoint)?;
        }

        if self.exists() {
            info!(
                last_completed = checkpoint.last_completed_chunk_index,
                replayed,
                "Loaded checkpoint"
            );
        }

        *state = checkpoint.clone();
        Ok(checkpoint)
    }

    async fn record_completion(&self, chunk_index: usize, stage_name: &StageName) -> Result<()> {
        let mut state = self.state.lock().await;
        let fact = Completion::new(chunk_index, stage_name.clone());

        if state.is_complete(chunk_index, stage_name) {
            return Ok(());
        }

        self.append_journal(&fact)?;
        state.insert(fact);
        debug!(chunk = chunk_index, stage = %stage_name, "Completion recorded");
        Ok(())
    }

    async fn advance(&self, chunk_index: usize) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut next = state.clone();
        if !next.advance_to(chunk_index) {
            return Ok(());
        }

        // Journal facts at or below the new index are ignored on replay, so
        // a crash between these two writes is harmless.
        self.save(&next)?;
        self.rewrite_journal(&next)?;

        *state = next;
        debug!(chunk = chunk_index, "Checkpoint advanced");
        Ok(())
    }

    async fn set_fingerprint(&self, fingerprint: Fingerprint) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fingerprint == Some(fingerprint) {
            return Ok(());
        }

        let mut next = state.clone();
        next.fingerprint = Some(fingerprint);
        next.updated_at = Utc::now();
        self.save(&next)?;

        *state = next;
        Ok(())
    }
}

/// Write bytes to `path` via a synced temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| PipelineError::Internal(format!("no file name in {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = File::create(&temp_path)
        .map_err(|e| PipelineError::storage(format!("creating {}", temp_path.display()), e))?;
    file.write_all(bytes)
        .map_err(|e| PipelineError::storage(format!("writing {}", temp_path.display()), e))?;
    file.sync_all()
        .map_err(|e| PipelineError::storage(format!("syncing {}", temp_path.display()), e))?;

    // Atomic rename
    fs::rename(&temp_path, path)
        .map_err(|e| PipelineError::storage(format!("renaming to {}", path.display()), e))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| PipelineError::storage(format!("opening {}", path.display()), e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| PipelineError::CorruptState(format!("{}: {e}", path.display())))
}
