//! Pipeline module - orchestration, checkpoint advance and report assembly.

mod advance;
mod orchestrator;
mod report;

pub use advance::*;
pub use orchestrator::*;
pub use report::*;
