//! Chunking module - deterministic document splitting.

mod chunker;

pub use chunker::*;
