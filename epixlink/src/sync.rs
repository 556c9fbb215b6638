//! Synchronization primitives shared between callers and the link threads.

pub mod queue;

pub use queue::{DataQueue, Timeout};
pub(crate) use queue::deadline_after;
