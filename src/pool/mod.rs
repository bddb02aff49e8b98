//! Pool module - bounded stage execution with retry.

mod worker;

pub use worker::*;
