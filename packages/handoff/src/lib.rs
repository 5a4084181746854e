//! In-process asynchronous handoff queue: producers push values without ever
//! blocking, consumers await them through a two-phase begin/end protocol.

#[macro_use]
extern crate tracing;

mod queue;

pub use crate::queue::api::*;

/// Error types
pub mod error {
    pub use crate::queue::error::*;
}
