//! Stage graph module - declarative phases of specialist stages.

mod stage;

pub use stage::*;
