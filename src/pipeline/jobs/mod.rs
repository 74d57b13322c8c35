//! Async job path for LOCAL structuring.

pub mod queue;
pub mod worker;

pub use queue::*;
pub use worker::*;
