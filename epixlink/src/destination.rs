//! Destination table: the transports a link talks to, by index.
//!
//! A destination index is the `dest` part of a [`Route`](crate::protocol::Route)
//! and the low byte of the key replies are matched on, so a table holds at
//! most 256 entries.

use std::net::SocketAddr;
use std::ops::Index;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runtime::link::{ConfigError, LinkError};
use crate::trace::{debug, error};
use crate::transport::{AxiStream, PgpCard, Transport, TransportKind, UdpLink};

/// Largest number of destinations one link can address.
pub const MAX_DESTINATIONS: usize = 256;

/// How to open one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum DestinationConfig {
    /// PGP card character device, e.g. `/dev/pgpcard_0`.
    Pgp { device: PathBuf },
    /// AXI-stream DMA character device, e.g. `/dev/datadev_0`.
    AxiStream { device: PathBuf },
    /// UDP socket bound to `local` talking to the FPGA at `remote`.
    Udp { local: SocketAddr, remote: SocketAddr },
}

impl DestinationConfig {
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::Pgp { .. } => TransportKind::Pgp,
            Self::AxiStream { .. } => TransportKind::AxiStream,
            Self::Udp { .. } => TransportKind::Udp,
        }
    }

    fn open(&self) -> std::io::Result<Transport> {
        Ok(match self {
            Self::Pgp { device } => PgpCard::open(device)?.into(),
            Self::AxiStream { device } => AxiStream::open(device)?.into(),
            Self::Udp { local, remote } => UdpLink::open(*local, *remote)?.into(),
        })
    }
}

/// Opened transports indexed by destination number.
#[derive(Debug)]
pub struct DestinationTable {
    transports: Vec<Transport>,
}

impl DestinationTable {
    /// Opens every destination in order.
    ///
    /// # Errors
    /// Returns [`LinkError::Config`] for an empty or oversized list and
    /// [`LinkError::TransportOpen`] for the first destination that fails to
    /// open. Destinations opened before the failure are closed again.
    pub fn open(configs: &[DestinationConfig]) -> Result<Self, LinkError> {
        check_count(configs.len())?;
        let transports = configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                let transport = config.open().map_err(|source| {
                    error!(index, config = ?config, error = %source, "failed to open destination");
                    LinkError::TransportOpen {
                        index,
                        kind: config.kind(),
                        source,
                    }
                })?;
                debug!(index, kind = %config.kind(), "destination opened");
                Ok(transport)
            })
            .collect::<Result<Vec<_>, LinkError>>()?;
        Ok(Self { transports })
    }

    /// Wraps already-open transports.
    ///
    /// # Errors
    /// Returns [`LinkError::Config`] for an empty or oversized list.
    pub fn from_transports(transports: Vec<Transport>) -> Result<Self, LinkError> {
        check_count(transports.len())?;
        Ok(Self { transports })
    }

    #[must_use]
    pub fn get(&self, index: u8) -> Option<&Transport> {
        self.transports.get(usize::from(index))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Transport> {
        self.transports.iter()
    }

    /// Applies a kernel receive buffer size to every UDP destination.
    pub(crate) fn set_udp_recv_buffer(&self, size: usize) {
        for t in &self.transports {
            if let Transport::Udp(udp) = t
                && let Err(_e) = udp.set_recv_buffer_size(size)
            {
                crate::trace::warn!(size, error = %_e, "failed to size UDP receive buffer");
            }
        }
    }
}

impl Index<usize> for DestinationTable {
    type Output = Transport;

    fn index(&self, index: usize) -> &Transport {
        &self.transports[index]
    }
}

fn check_count(count: usize) -> Result<(), ConfigError> {
    if count == 0 {
        return Err(ConfigError::NoDestinations);
    }
    if count > MAX_DESTINATIONS {
        return Err(ConfigError::TooManyDestinations(count));
    }
    Ok(())
}
