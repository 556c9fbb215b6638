//! Core placement for the RX and TX threads.
//!
//! Both link threads spin on their queues, so when the host has two or more
//! physical cores each thread gets one to itself. A single core with SMT
//! still gets both threads pinned, to its two siblings. Anything smaller is
//! left to the scheduler.
//!
//! Core ids come from `core_affinity`; on common layouts ids `0..physical`
//! are distinct physical cores and SMT siblings are numbered after them.

use std::fmt;

use core_affinity::CoreId;
use serde::{Deserialize, Serialize};

/// What the host offers for pinning.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    pub logical: usize,
    pub physical: usize,
    /// Core ids this process may be pinned to.
    pub core_ids: Vec<usize>,
}

impl CpuTopology {
    #[must_use]
    pub fn detect() -> Self {
        let logical = num_cpus::get();
        let core_ids = match core_affinity::get_core_ids() {
            Some(ids) => ids.into_iter().map(|id| id.id).collect(),
            None => (0..logical).collect(),
        };
        Self {
            logical,
            physical: num_cpus::get_physical(),
            core_ids,
        }
    }

    #[must_use]
    pub const fn has_smt(&self) -> bool {
        self.logical > self.physical
    }

    /// Chooses cores for the two link threads.
    #[must_use]
    pub fn placement(&self) -> ThreadPlacement {
        let strategy = match (self.physical, self.has_smt()) {
            (2.., _) => PlacementStrategy::Dedicated,
            (_, true) => PlacementStrategy::SmtSiblings,
            _ => PlacementStrategy::NoPin,
        };
        if strategy == PlacementStrategy::NoPin {
            return ThreadPlacement::default();
        }
        ThreadPlacement {
            rx_core: self.core_ids.first().copied(),
            tx_core: self.core_ids.get(1).copied(),
            strategy,
        }
    }
}

/// Cores chosen for the link threads; `None` leaves a thread unpinned.
#[derive(Debug, Clone, Default)]
pub struct ThreadPlacement {
    pub rx_core: Option<usize>,
    pub tx_core: Option<usize>,
    pub strategy: PlacementStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// One physical core per thread.
    Dedicated,
    /// Both threads on the sibling hyperthreads of one core.
    SmtSiblings,
    #[default]
    NoPin,
    /// Cores given in [`CpuConfig::Manual`].
    Manual,
}

impl PlacementStrategy {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Dedicated => "dedicated",
            Self::SmtSiblings => "smt-siblings",
            Self::NoPin => "no-pin",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pinning policy for the link threads.
///
/// Defaults to [`CpuConfig::Disabled`]: readout hosts usually run
/// acquisition software with its own placement policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuConfig {
    /// Detect the topology and pin when it helps.
    Auto,
    Manual {
        rx_core: Option<usize>,
        tx_core: Option<usize>,
    },
    #[default]
    Disabled,
}

impl CpuConfig {
    #[must_use]
    pub fn resolve(&self) -> ThreadPlacement {
        match *self {
            Self::Auto => CpuTopology::detect().placement(),
            Self::Manual { rx_core, tx_core } => ThreadPlacement {
                rx_core,
                tx_core,
                strategy: PlacementStrategy::Manual,
            },
            Self::Disabled => ThreadPlacement::default(),
        }
    }
}

/// Pins the calling thread. Returns `false` if the OS refused.
pub fn pin_to_core(core: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core })
}
