//! Raw AXI-stream character device backend.
//!
//! ## Wire Format
//!
//! Each `read`/`write` on the device moves exactly one frame. Words are in
//! host byte order.
//!
//! ```text
//! outbound word0:  [31..10 zero][9 SOF][8 zero][7..0 lane_vc]
//! inbound word0:   [25 length_err][16 eofe][7..0 lane_vc]
//! word1..          payload
//! ```

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;

use super::{
    FrameIntegrityError, FrameIo, InboundFrame, RecvError, TransportKind, check_length,
    expect_full_write, words_from_ne,
};
use crate::protocol::LaneVc;

/// Start-of-frame marker set in every outbound header.
pub const SOF_MARKER: u32 = 0x0200;

const EOFE_SHIFT: u32 = 16;
const LENGTH_ERR_SHIFT: u32 = 25;

/// Header word plus at least one payload word.
pub const MIN_FRAME_BYTES: usize = 8;

/// Encodes `words` behind an AXI-stream header into `out`.
pub fn encode_axi_frame(lane_vc: LaneVc, words: &[u32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve((words.len() + 1) * 4);
    let header = u32::from(lane_vc.as_u8()) | SOF_MARKER;
    out.extend_from_slice(&header.to_ne_bytes());
    for word in words {
        out.extend_from_slice(&word.to_ne_bytes());
    }
}

/// Decodes one AXI-stream frame.
///
/// # Errors
/// Returns a [`FrameIntegrityError`] for misaligned or short frames and for
/// frames flagged with EOFE or a length error.
pub fn decode_axi_frame(bytes: &[u8]) -> Result<InboundFrame, FrameIntegrityError> {
    check_length(bytes.len(), MIN_FRAME_BYTES)?;
    let header = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if (header >> EOFE_SHIFT) & 0x1 != 0 {
        return Err(FrameIntegrityError::Eofe);
    }
    if (header >> LENGTH_ERR_SHIFT) & 0x1 != 0 {
        return Err(FrameIntegrityError::LengthError);
    }
    Ok(InboundFrame {
        lane_vc: LaneVc::from_raw((header & 0xFF) as u8),
        words: words_from_ne(&bytes[4..]),
    })
}

/// An AXI-stream DMA character device (e.g. `/dev/axi_stream_dma_0`).
#[derive(Debug)]
pub struct AxiStream {
    fd: OwnedFd,
    path: Option<PathBuf>,
}

impl AxiStream {
    /// Opens the device non-blocking for read/write.
    ///
    /// # Errors
    /// Returns the OS error if the device cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self {
            fd,
            path: Some(path.to_path_buf()),
        })
    }

    /// Wraps an already-open descriptor that preserves frame boundaries.
    ///
    /// The descriptor must be non-blocking.
    #[must_use]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd, path: None }
    }

    /// Device path, if opened by path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl AsFd for AxiStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl FrameIo for AxiStream {
    fn kind(&self) -> TransportKind {
        TransportKind::AxiStream
    }

    fn send(&self, lane_vc: LaneVc, words: &[u32], scratch: &mut Vec<u8>) -> io::Result<()> {
        encode_axi_frame(lane_vc, words, scratch);
        let written = rustix::io::write(&self.fd, scratch.as_slice())?;
        expect_full_write(written, scratch.len())
    }

    fn recv(&self, scratch: &mut [u8]) -> Result<Option<InboundFrame>, RecvError> {
        match rustix::io::read(&self.fd, &mut *scratch) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(decode_axi_frame(&scratch[..n])?)),
            Err(Errno::AGAIN) => Ok(None),
            Err(e) => Err(RecvError::Io(e.into())),
        }
    }
}
