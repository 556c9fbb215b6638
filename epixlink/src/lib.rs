//! Register access and event readout for ePix-family detector front ends.
//!
//! A [`CommLink`] multiplexes register transactions, commands, run triggers
//! and bulk data over one or more transports (PGP card, AXI-stream DMA
//! device or UDP) and demultiplexes the replies and event data coming back.

pub mod counters;
pub mod destination;
pub mod protocol;
pub mod runtime;
pub mod sync;
pub mod transport;

pub(crate) mod trace;

pub use counters::{CounterSnapshot, LinkCounters};
pub use destination::{DestinationConfig, DestinationTable};
pub use protocol::{LaneVc, Route};
pub use runtime::link::{CommLink, ConfigError, DataFrame, LinkConfig, LinkError};
pub use runtime::topology::CpuConfig;
pub use sync::Timeout;
pub use trace::init_tracing;
pub use transport::{FrameIo, Transport, TransportKind};
