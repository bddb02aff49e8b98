//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `Checkpoint`: Advanced index plus completed (chunk, stage) facts
//! - `CheckpointStore`: Durable progress log (file and in-memory)
//! - `ResultStore`: Write-once TaskResult records (file and in-memory)

mod memory;
mod results;
mod state;

pub use memory::*;
pub use results::*;
pub use state::*;
