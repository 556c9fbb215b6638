//! Link runtime: the [`CommLink`] facade and the two threads behind it.
//!
//! # Architecture
//!
//! Opening a link spawns two threads:
//! - **TX thread** (`epixlink-tx`): services work queued by callers in
//!   strict priority order and performs every send.
//! - **RX thread** (`epixlink-rx`): receives from every destination,
//!   queues data frames and completes register transactions.
//!
//! Any number of caller threads share one `CommLink`. They only enqueue
//! work and wait; they never touch a transport directly.
//!
//! ```text
//!  callers ──run/reg/cmd/data queues──> TX ──send──> destinations
//!     ^                                                   │
//!     │ register slot (condvar)        RX <──recv─────────┘
//!     └──────────── data queue <────────┘
//! ```
//!
//! # Register transactions
//!
//! At most one register transaction is outstanding. A caller takes the
//! issue lock, installs the request in the slot and waits on a condition
//! variable; the RX thread matches the reply by destination key, header
//! echo and length, and wakes the caller. A reply that never comes ends in
//! [`LinkError::Timeout`] and the slot is cleared, so a reply arriving
//! later is counted as unexpected. The wire carries no sequence number: a
//! reply delayed past the timeout and past the issue of the next identical
//! request can still be taken for that request's reply.
//!
//! # Example
//!
//! ```no_run
//! use epixlink::{CommLink, DestinationConfig, LinkConfig};
//!
//! let link = CommLink::open(
//!     &[DestinationConfig::Udp {
//!         local: "0.0.0.0:8192".parse()?,
//!         remote: "192.168.2.10:8192".parse()?,
//!     }],
//!     LinkConfig::default(),
//! )?;
//! link.write_register(0x0100_0007, &[0xFFFF])?;
//! let version = link.read_register(0x0000_0000, 1)?;
//! link.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod commands;
mod config;
mod rx_thread;
mod transaction;
mod tx_thread;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::counters::{CounterSnapshot, LinkCounters};
use crate::destination::{DestinationConfig, DestinationTable};
use crate::protocol::{LaneVc, RegisterRequest, Route};
use crate::runtime::topology::pin_to_core;
use crate::sync::{DataQueue, Timeout};
use crate::trace::{debug, info, warn};
use crate::transport::{Transport, TransportKind};

pub use commands::WorkClass;
pub use config::{ConfigError, DEFAULT_MAX_RX_WORDS, LinkConfig};

use commands::{DataJob, OpcodeJob, RegisterJob, WorkSenders, work_queues};
use rx_thread::RxThread;
use transaction::{Outcome, RegisterSlot, WaitError};
use tx_thread::TxThread;

/// Errors surfaced by a [`CommLink`].
#[derive(Debug, Error)]
pub enum LinkError {
    /// A destination could not be opened.
    #[error("failed to open destination {index} ({kind}): {source}")]
    TransportOpen {
        index: usize,
        kind: TransportKind,
        #[source]
        source: io::Error,
    },
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Setting up readiness polling or spawning a link thread failed.
    #[error("failed to start link: {0}")]
    Start(io::Error),
    /// No matching reply within the register timeout.
    #[error("register {address:#010x} timed out after {timeout:?}")]
    Timeout { address: u32, timeout: Duration },
    /// The device answered with a non-zero status word.
    #[error("register {address:#010x} returned status {status:#x}")]
    RegisterStatus { address: u32, status: u32 },
    /// The route names a destination the link does not have.
    #[error("no destination {0}")]
    UnknownDestination(u8),
    /// The transport refused the frame.
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    /// The link was closed.
    #[error("link is closed")]
    Closed,
}

/// An inbound frame classified as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Destination index the frame arrived on.
    pub dest: u8,
    pub lane_vc: LaneVc,
    /// Payload with the transport header removed.
    pub words: Vec<u32>,
}

/// State shared by callers and both link threads.
#[derive(Debug)]
pub(crate) struct LinkShared {
    pub(crate) counters: LinkCounters,
    pub(crate) slot: RegisterSlot,
    pub(crate) data: DataQueue<DataFrame>,
    pub(crate) data_mask: AtomicU16,
    pub(crate) shutdown: AtomicBool,
}

impl LinkShared {
    pub(crate) fn new(config: &LinkConfig) -> Self {
        Self {
            counters: LinkCounters::new(),
            slot: RegisterSlot::new(),
            data: DataQueue::new(),
            data_mask: AtomicU16::new(config.data_mask),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Stops both threads and wakes every blocked caller.
    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.slot.close();
        self.data.close();
    }
}

/// Handle to an open link.
///
/// All methods take `&self`; share the link between threads with an `Arc`.
/// Dropping the handle signals shutdown but does not wait for the threads.
/// Use [`CommLink::close`] to join them.
pub struct CommLink {
    shared: Arc<LinkShared>,
    destinations: Arc<DestinationTable>,
    work: WorkSenders,
    config: LinkConfig,
    tx_handle: Option<JoinHandle<()>>,
    rx_handle: Option<JoinHandle<()>>,
}

impl CommLink {
    /// Opens every destination and starts the link threads.
    ///
    /// # Errors
    /// Returns [`LinkError::TransportOpen`] if any destination fails to open,
    /// [`LinkError::Config`] for invalid settings and [`LinkError::Start`]
    /// if the threads cannot be started.
    pub fn open(destinations: &[DestinationConfig], config: LinkConfig) -> Result<Self, LinkError> {
        config.validate()?;
        info!(destinations = destinations.len(), "link opening");
        let table = DestinationTable::open(destinations)?;
        Self::start(table, config)
    }

    /// Starts a link over already-open transports.
    ///
    /// # Errors
    /// Returns [`LinkError::Config`] for invalid settings or an empty list
    /// and [`LinkError::Start`] if the threads cannot be started.
    pub fn with_transports(transports: Vec<Transport>, config: LinkConfig) -> Result<Self, LinkError> {
        config.validate()?;
        let table = DestinationTable::from_transports(transports)?;
        Self::start(table, config)
    }

    fn start(table: DestinationTable, config: LinkConfig) -> Result<Self, LinkError> {
        if usize::from(config.register_route.dest) >= table.len() {
            return Err(ConfigError::RegisterRouteOutOfRange {
                dest: config.register_route.dest,
                count: table.len(),
            }
            .into());
        }
        if let Some(size) = config.udp_recv_buffer {
            table.set_udp_recv_buffer(size);
        }

        let destinations = Arc::new(table);
        let shared = Arc::new(LinkShared::new(&config));
        let (work, receivers) = work_queues();
        let placement = config.cpu.resolve();
        info!(
            strategy = %placement.strategy,
            rx_core = ?placement.rx_core,
            tx_core = ?placement.tx_core,
            data_mask = config.data_mask,
            register_route = %config.register_route,
            "link thread placement"
        );

        let mut rx = RxThread::new(Arc::clone(&destinations), Arc::clone(&shared), &config)
            .map_err(LinkError::Start)?;
        let mut tx = TxThread::new(
            Arc::clone(&destinations),
            Arc::clone(&shared),
            receivers,
            &config,
        );

        debug!("spawning RX thread");
        let rx_core = placement.rx_core;
        let rx_handle = thread::Builder::new()
            .name("epixlink-rx".into())
            .spawn(move || {
                pin_current("RX", rx_core);
                info!("RX thread started");
                rx.run();
                info!("RX thread exiting");
            })
            .map_err(LinkError::Start)?;

        debug!("spawning TX thread");
        let tx_core = placement.tx_core;
        let tx_handle = thread::Builder::new()
            .name("epixlink-tx".into())
            .spawn(move || {
                pin_current("TX", tx_core);
                info!("TX thread started");
                tx.run();
                info!("TX thread exiting");
            })
            .map_err(|e| {
                // Don't leave the RX thread running on a half-built link.
                shared.signal_shutdown();
                LinkError::Start(e)
            })?;

        info!("link started");
        Ok(Self {
            shared,
            destinations,
            work,
            config,
            tx_handle: Some(tx_handle),
            rx_handle: Some(rx_handle),
        })
    }

    /// Reads `size` words starting at `address` over the default register route.
    ///
    /// # Errors
    /// See [`CommLink::read_register_at`].
    pub fn read_register(&self, address: u32, size: u32) -> Result<Vec<u32>, LinkError> {
        self.read_register_at(self.config.register_route, address, size)
    }

    /// Writes `data` starting at `address` over the default register route.
    ///
    /// # Errors
    /// See [`CommLink::write_register_at`].
    pub fn write_register(&self, address: u32, data: &[u32]) -> Result<(), LinkError> {
        self.write_register_at(self.config.register_route, address, data)
    }

    /// Reads `size` words starting at `address` over `route`.
    ///
    /// # Errors
    /// Returns [`LinkError::Timeout`] if no matching reply arrives in time,
    /// [`LinkError::RegisterStatus`] for a non-zero status word,
    /// [`LinkError::Send`] if the request could not be sent and
    /// [`LinkError::Closed`] once the link is closed.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    pub fn read_register_at(&self, route: Route, address: u32, size: u32) -> Result<Vec<u32>, LinkError> {
        self.transact(route, RegisterRequest::read(address, size))
    }

    /// Writes `data` starting at `address` over `route`.
    ///
    /// # Errors
    /// As for [`CommLink::read_register_at`].
    ///
    /// # Panics
    /// Panics if `data` is empty.
    pub fn write_register_at(&self, route: Route, address: u32, data: &[u32]) -> Result<(), LinkError> {
        self.transact(route, RegisterRequest::write(address, data.to_vec()))?;
        Ok(())
    }

    /// Runs one register transaction and returns the reply payload.
    fn transact(&self, route: Route, request: RegisterRequest) -> Result<Vec<u32>, LinkError> {
        self.check_route(route)?;
        let address = request.address;
        let slot = &self.shared.slot;

        let issue = slot.acquire();
        let (seq, frame) = slot
            .install(&issue, route, &request)
            .ok_or(LinkError::Closed)?;
        self.work
            .register
            .send(RegisterJob { seq, route, frame })
            .map_err(|_| LinkError::Closed)?;
        LinkCounters::bump(&self.shared.counters.reg_req);

        let timeout = self.config.register_timeout;
        match slot.wait(&issue, seq, timeout) {
            Ok(Outcome::Reply(reply)) if reply.status == 0 => Ok(reply.payload),
            Ok(Outcome::Reply(reply)) => {
                debug!(address, status = reply.status, "register status error");
                Err(LinkError::RegisterStatus {
                    address,
                    status: reply.status,
                })
            }
            Ok(Outcome::SendFailed(e)) => Err(LinkError::Send(e)),
            Err(WaitError::TimedOut) => {
                warn!(address, route = %route, timeout_ms = timeout.as_millis() as u64, "register transaction timed out");
                Err(LinkError::Timeout { address, timeout })
            }
            Err(WaitError::Closed) => Err(LinkError::Closed),
        }
    }

    /// Queues a command frame. Returns once the request is accepted, not
    /// once it is sent.
    ///
    /// # Errors
    /// Returns [`LinkError::UnknownDestination`] or [`LinkError::Closed`].
    pub fn send_command(&self, opcode: u8, route: Route) -> Result<(), LinkError> {
        self.check_route(route)?;
        self.check_open()?;
        self.work
            .command
            .send(OpcodeJob { route, opcode })
            .map_err(|_| LinkError::Closed)?;
        LinkCounters::bump(&self.shared.counters.cmd_req);
        Ok(())
    }

    /// Queues a run trigger. Serviced ahead of every other class.
    ///
    /// # Errors
    /// Returns [`LinkError::UnknownDestination`] or [`LinkError::Closed`].
    pub fn send_run_trigger(&self, route: Route) -> Result<(), LinkError> {
        self.check_route(route)?;
        self.check_open()?;
        let opcode = self.config.run_trigger_opcode;
        self.work
            .run
            .send(OpcodeJob { route, opcode })
            .map_err(|_| LinkError::Closed)?;
        LinkCounters::bump(&self.shared.counters.run_req);
        Ok(())
    }

    /// Sends a data frame and waits until the TX thread has sent it.
    ///
    /// # Errors
    /// Returns [`LinkError::Send`] if the transport refused the frame,
    /// [`LinkError::UnknownDestination`] or [`LinkError::Closed`].
    pub fn send_data(&self, words: Vec<u32>, route: Route) -> Result<(), LinkError> {
        self.check_route(route)?;
        self.check_open()?;
        let (done, result) = mpsc::sync_channel(1);
        self.work
            .data
            .send(DataJob { route, words, done })
            .map_err(|_| LinkError::Closed)?;
        LinkCounters::bump(&self.shared.counters.data_req);
        match result.recv() {
            Ok(sent) => sent.map_err(LinkError::Send),
            // TX thread exited with the job still queued.
            Err(_) => Err(LinkError::Closed),
        }
    }

    /// Waits for the next data frame.
    ///
    /// Returns `None` on timeout, or once the link is closed and every
    /// queued frame has been taken.
    pub fn next_data_frame(&self, timeout: impl Into<Timeout>) -> Option<DataFrame> {
        self.shared.data.pop_blocking(timeout.into())
    }

    /// Replaces the data mask. Applies from the next received frame.
    pub fn set_data_mask(&self, mask: u16) {
        self.shared.data_mask.store(mask, Ordering::Relaxed);
    }

    #[must_use]
    pub fn data_mask(&self) -> u16 {
        self.shared.data_mask.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    #[must_use]
    pub fn destinations(&self) -> &DestinationTable {
        &self.destinations
    }

    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Stops both threads, waits for them and releases the transports.
    ///
    /// Callers blocked in a register transaction or in
    /// [`CommLink::next_data_frame`] wake with [`LinkError::Closed`] / `None`.
    pub fn close(mut self) {
        info!("link shutdown initiated");
        self.shared.signal_shutdown();

        if let Some(handle) = self.tx_handle.take() {
            debug!("waiting for TX thread to exit");
            let _ = handle.join();
        }
        if let Some(handle) = self.rx_handle.take() {
            debug!("waiting for RX thread to exit");
            let _ = handle.join();
        }
        info!(counters = %self.shared.counters.snapshot(), "link shutdown complete");
    }

    /// Returns `true` once shutdown has been signalled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    fn check_route(&self, route: Route) -> Result<(), LinkError> {
        if self.destinations.get(route.dest).is_none() {
            return Err(LinkError::UnknownDestination(route.dest));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        Ok(())
    }
}

impl Drop for CommLink {
    fn drop(&mut self) {
        // Threads notice within one poll interval; close() joins them.
        self.shared.signal_shutdown();
    }
}

fn pin_current(_name: &str, core: Option<usize>) {
    if let Some(core) = core {
        if pin_to_core(core) {
            debug!(thread = _name, core, "pinned to core");
        } else {
            warn!(thread = _name, core, "failed to pin to core");
        }
    }
}
