//! Link counters.
//!
//! Every counter only ever increases. The request/response pairs double as
//! the cross-thread work signal: a class has pending work while its request
//! counter is ahead of the count the TX thread has serviced.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared by callers and both link threads.
#[derive(Debug, Default)]
pub struct LinkCounters {
    pub(crate) reg_req: AtomicU64,
    pub(crate) reg_resp: AtomicU64,
    pub(crate) cmd_req: AtomicU64,
    pub(crate) cmd_resp: AtomicU64,
    pub(crate) run_req: AtomicU64,
    pub(crate) data_req: AtomicU64,
    pub(crate) data_resp: AtomicU64,
    pub(crate) error: AtomicU64,
    pub(crate) unexpected: AtomicU64,
}

impl LinkCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps `counter` and returns its new value.
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Takes a consistent-enough copy for reporting.
    ///
    /// Each field is read atomically; the set is not a single snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        CounterSnapshot {
            reg_req: load(&self.reg_req),
            reg_resp: load(&self.reg_resp),
            cmd_req: load(&self.cmd_req),
            cmd_resp: load(&self.cmd_resp),
            run_req: load(&self.run_req),
            data_req: load(&self.data_req),
            data_resp: load(&self.data_resp),
            error: load(&self.error),
            unexpected: load(&self.unexpected),
        }
    }
}

/// Point-in-time copy of [`LinkCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    /// Register transactions issued.
    pub reg_req: u64,
    /// Register transactions completed by a matching reply.
    pub reg_resp: u64,
    /// Commands accepted from callers.
    pub cmd_req: u64,
    /// Commands taken off the queue by the TX thread. A failed send still
    /// counts here and also bumps `error`.
    pub cmd_resp: u64,
    /// Run triggers accepted from callers.
    pub run_req: u64,
    /// Outbound data frames accepted from callers.
    pub data_req: u64,
    /// Outbound data frames sent on the wire.
    pub data_resp: u64,
    /// Damaged frames and transport failures.
    pub error: u64,
    /// Control frames that matched no outstanding transaction.
    pub unexpected: u64,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reg {}/{} cmd {}/{} run {} data {}/{} error {} unexpected {}",
            self.reg_req,
            self.reg_resp,
            self.cmd_req,
            self.cmd_resp,
            self.run_req,
            self.data_req,
            self.data_resp,
            self.error,
            self.unexpected
        )
    }
}
