//! Transport backends: one per physical destination.
//!
//! Every backend turns a logical `(lane_vc, words)` frame into its own byte
//! layout and back:
//!
//! | Backend | Header | Byte order |
//! |---------|--------|------------|
//! | [`PgpCard`] | none, lane/VC travel out-of-band in the driver call | host |
//! | [`AxiStream`] | `lane_vc \| 0x200` prepended | host |
//! | [`UdpLink`] | `lane_vc << 24` prepended | network |
//!
//! All descriptors are non-blocking. A receive that finds nothing returns
//! `Ok(None)`; a frame that arrives damaged is reported as a
//! [`FrameIntegrityError`] and should be dropped by the caller.

pub mod axi;
pub mod pgp;
pub mod udp;

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use thiserror::Error;

use crate::protocol::LaneVc;

pub use axi::AxiStream;
pub use pgp::PgpCard;
pub use udp::UdpLink;

/// Which wire format a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Pgp,
    AxiStream,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pgp => write!(f, "pgp"),
            Self::AxiStream => write!(f, "axi-stream"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A frame received from a backend with its transport header removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub lane_vc: LaneVc,
    pub words: Vec<u32>,
}

/// Damage detected on a received frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameIntegrityError {
    /// End-of-frame error flagged by the transport.
    #[error("end-of-frame error")]
    Eofe,
    /// Receive FIFO error flagged by the driver.
    #[error("receive fifo error")]
    FifoError,
    /// Length error flagged by the transport.
    #[error("frame length error")]
    LengthError,
    /// Byte count is not a whole number of words.
    #[error("frame of {bytes} bytes is not word aligned")]
    Misaligned { bytes: usize },
    /// Frame is shorter than the transport minimum.
    #[error("frame of {bytes} bytes is too short")]
    TooShort { bytes: usize },
    /// UDP header announced a multi-datagram frame.
    #[error("fragmented datagram (header {header:08x})")]
    Fragmented { header: u32 },
}

/// Failure of a single receive.
#[derive(Debug, Error)]
pub enum RecvError {
    /// A frame arrived but failed validation.
    #[error("frame integrity: {0}")]
    Integrity(#[from] FrameIntegrityError),
    /// The descriptor itself failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Send/receive capability shared by every backend.
///
/// `scratch` buffers are owned by the calling thread and reused across
/// calls; backends only use them for the duration of one call.
pub trait FrameIo: AsFd {
    /// Wire format spoken by this backend.
    fn kind(&self) -> TransportKind;

    /// Sends one frame. Never blocks; a full device surfaces as `WouldBlock`.
    ///
    /// # Errors
    /// Returns the underlying I/O error, or `WriteZero` on a short write.
    fn send(&self, lane_vc: LaneVc, words: &[u32], scratch: &mut Vec<u8>) -> io::Result<()>;

    /// Receives at most one frame.
    ///
    /// # Errors
    /// Returns [`RecvError::Integrity`] for a damaged frame (already consumed
    /// from the descriptor) and [`RecvError::Io`] for descriptor failures.
    fn recv(&self, scratch: &mut [u8]) -> Result<Option<InboundFrame>, RecvError>;
}

/// A backend selected once when the link opens.
#[derive(Debug)]
pub enum Transport {
    Pgp(PgpCard),
    AxiStream(AxiStream),
    Udp(UdpLink),
}

impl Transport {
    /// Raw descriptor used for readiness registration.
    pub fn raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl AsFd for Transport {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Pgp(t) => t.as_fd(),
            Self::AxiStream(t) => t.as_fd(),
            Self::Udp(t) => t.as_fd(),
        }
    }
}

impl FrameIo for Transport {
    fn kind(&self) -> TransportKind {
        match self {
            Self::Pgp(t) => t.kind(),
            Self::AxiStream(t) => t.kind(),
            Self::Udp(t) => t.kind(),
        }
    }

    #[inline]
    fn send(&self, lane_vc: LaneVc, words: &[u32], scratch: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Self::Pgp(t) => t.send(lane_vc, words, scratch),
            Self::AxiStream(t) => t.send(lane_vc, words, scratch),
            Self::Udp(t) => t.send(lane_vc, words, scratch),
        }
    }

    #[inline]
    fn recv(&self, scratch: &mut [u8]) -> Result<Option<InboundFrame>, RecvError> {
        match self {
            Self::Pgp(t) => t.recv(scratch),
            Self::AxiStream(t) => t.recv(scratch),
            Self::Udp(t) => t.recv(scratch),
        }
    }
}

impl From<PgpCard> for Transport {
    fn from(t: PgpCard) -> Self {
        Self::Pgp(t)
    }
}

impl From<AxiStream> for Transport {
    fn from(t: AxiStream) -> Self {
        Self::AxiStream(t)
    }
}

impl From<UdpLink> for Transport {
    fn from(t: UdpLink) -> Self {
        Self::Udp(t)
    }
}

/// Checks that `bytes` is word aligned and at least `min_bytes` long.
pub(crate) const fn check_length(bytes: usize, min_bytes: usize) -> Result<(), FrameIntegrityError> {
    if bytes % 4 != 0 {
        return Err(FrameIntegrityError::Misaligned { bytes });
    }
    if bytes < min_bytes {
        return Err(FrameIntegrityError::TooShort { bytes });
    }
    Ok(())
}

/// Reads host-order words from a word-aligned byte slice.
pub(crate) fn words_from_ne(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Maps a short write to an error.
pub(crate) fn expect_full_write(written: usize, len: usize) -> io::Result<()> {
    if written == len {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {written} of {len} bytes"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_checks() {
        assert_eq!(check_length(8, 8), Ok(()));
        assert_eq!(
            check_length(9, 8),
            Err(FrameIntegrityError::Misaligned { bytes: 9 })
        );
        assert_eq!(
            check_length(4, 8),
            Err(FrameIntegrityError::TooShort { bytes: 4 })
        );
    }

    #[test]
    fn words_from_host_order_bytes() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x1122_3344u32.to_ne_bytes());
        bytes.extend_from_slice(&7u32.to_ne_bytes());
        assert_eq!(words_from_ne(&bytes), vec![0x1122_3344, 7]);
    }

    #[test]
    fn short_write_is_an_error() {
        assert!(expect_full_write(8, 8).is_ok());
        let err = expect_full_write(4, 8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
