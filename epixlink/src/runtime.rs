//! Link runtime.
//!
//! - `link`: the [`CommLink`](link::CommLink) facade with its TX and RX threads.
//! - `topology`: CPU detection and core pinning for those threads.

pub mod link;
pub mod topology;
