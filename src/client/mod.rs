//! Client module - external call, admission control and time.

mod clock;
mod invoker;
mod llm_client;
mod rate_governor;

pub use clock::*;
pub use invoker::*;
pub use llm_client::*;
pub use rate_governor::*;
