//! Link configuration.
//!
//! # Tuning Guidelines
//!
//! - `poll_interval` bounds how long the RX thread sleeps in its readiness
//!   wait, and so how quickly it notices shutdown. It does not add latency
//!   to frames, which wake the wait directly.
//! - `idle_sleep` is the TX thread's back-off when it finds no work. Smaller
//!   values shave request latency at the cost of a busier core.
//! - `register_timeout` must cover the slowest register on the slowest
//!   transport; a UDP round trip through a busy FPGA can take milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{REPLY_OVERHEAD_WORDS, Route};
use crate::runtime::topology::CpuConfig;

/// Largest frame the RX thread accepts by default, in words (2 MiB).
pub const DEFAULT_MAX_RX_WORDS: usize = 512 * 1024;

/// Invalid [`LinkConfig`] or destination list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("register_timeout must be non-zero")]
    ZeroRegisterTimeout,
    #[error("poll_interval must be non-zero")]
    ZeroPollInterval,
    #[error("max_rx_words must be at least {min}, got {got}")]
    RxBufferTooSmall { min: usize, got: usize },
    #[error("at least one destination is required")]
    NoDestinations,
    #[error("at most 256 destinations are supported, got {0}")]
    TooManyDestinations(usize),
    #[error("register route targets destination {dest} but only {count} are configured")]
    RegisterRouteOutOfRange { dest: u8, count: usize },
}

/// Configuration for a [`CommLink`](super::CommLink).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bit `n` set means frames tagged VC `n` are data, not replies.
    ///
    /// **Default**: `0x0002` (VC 1 carries events, VC 0 register replies)
    pub data_mask: u16,

    /// Route used by [`CommLink::read_register`](super::CommLink::read_register)
    /// and [`CommLink::write_register`](super::CommLink::write_register).
    ///
    /// **Default**: destination 0, lane 0 / VC 0
    pub register_route: Route,

    /// How long a caller waits for a register reply.
    ///
    /// **Default**: 1s
    pub register_timeout: Duration,

    /// Upper bound on one RX readiness wait.
    ///
    /// **Default**: 500µs
    pub poll_interval: Duration,

    /// TX back-off when no work is pending.
    ///
    /// **Default**: 10µs
    pub idle_sleep: Duration,

    /// How long the TX thread retries a send the device refuses with
    /// `WouldBlock` before failing it.
    ///
    /// **Default**: 10ms
    pub send_timeout: Duration,

    /// Receive buffer size in words. Larger frames are dropped.
    ///
    /// **Default**: [`DEFAULT_MAX_RX_WORDS`]
    pub max_rx_words: usize,

    /// Kernel receive buffer for UDP destinations, in bytes.
    ///
    /// **Default**: `None` (leave the OS default)
    pub udp_recv_buffer: Option<usize>,

    /// Opcode carried by [`CommLink::send_run_trigger`](super::CommLink::send_run_trigger).
    ///
    /// **Default**: 0
    pub run_trigger_opcode: u8,

    /// Placement of the RX and TX threads.
    ///
    /// **Default**: [`CpuConfig::Disabled`]
    pub cpu: CpuConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            data_mask: 0x0002,
            register_route: Route::default(),
            register_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_micros(500),
            idle_sleep: Duration::from_micros(10),
            send_timeout: Duration::from_millis(10),
            max_rx_words: DEFAULT_MAX_RX_WORDS,
            udp_recv_buffer: None,
            run_trigger_opcode: 0,
            cpu: CpuConfig::Disabled,
        }
    }
}

impl LinkConfig {
    /// Checks the invariants the link threads rely on.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.register_timeout.is_zero() {
            return Err(ConfigError::ZeroRegisterTimeout);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        // Transport header plus the smallest register reply.
        let min = REPLY_OVERHEAD_WORDS + 2;
        if self.max_rx_words < min {
            return Err(ConfigError::RxBufferTooSmall {
                min,
                got: self.max_rx_words,
            });
        }
        Ok(())
    }

    /// Builder-style setter for the data mask.
    #[must_use]
    pub const fn with_data_mask(mut self, mask: u16) -> Self {
        self.data_mask = mask;
        self
    }

    /// Builder-style setter for the default register route.
    #[must_use]
    pub const fn with_register_route(mut self, route: Route) -> Self {
        self.register_route = route;
        self
    }

    /// Builder-style setter for the register timeout.
    #[must_use]
    pub const fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_run_trigger_opcode(mut self, opcode: u8) -> Self {
        self.run_trigger_opcode = opcode;
        self
    }

    #[must_use]
    pub fn with_cpu(mut self, cpu: CpuConfig) -> Self {
        self.cpu = cpu;
        self
    }
}
