//! PGP serial card backend.
//!
//! The card driver frames the data itself. Lane and virtual channel travel
//! as separate integers in the request structure handed to `write`/`read`,
//! and the driver reports receive damage through out-of-band flags rather
//! than in the payload.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr;

use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;

use super::{
    FrameIntegrityError, FrameIo, InboundFrame, RecvError, TransportKind, check_length,
    expect_full_write, words_from_ne,
};
use crate::protocol::LaneVc;

/// Driver command for a plain frame write.
const CMD_NORMAL_WRITE: u32 = 0;

/// One payload word.
pub const MIN_FRAME_BYTES: usize = 4;

/// Pointer width reported to the driver so it can lay out the structures.
const MODEL: u32 = size_of::<*mut u32>() as u32;

/// Transmit request understood by the card driver.
#[repr(C)]
struct PgpCardTx {
    model: u32,
    cmd: u32,
    data: *mut u32,
    pgp_lane: u32,
    pgp_vc: u32,
    /// Payload length in words.
    size: u32,
}

/// Receive request filled in by the card driver.
#[repr(C)]
struct PgpCardRx {
    model: u32,
    /// Capacity of `data` in words.
    max_size: u32,
    data: *mut u32,
    pgp_lane: u32,
    pgp_vc: u32,
    rx_size: u32,
    eofe: u32,
    fifo_err: u32,
    length_err: u32,
}

/// What the driver reported for one receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PgpRxStatus {
    /// Bytes returned by the driver.
    pub bytes: usize,
    pub lane: u32,
    pub vc: u32,
    pub eofe: bool,
    pub fifo_err: bool,
    pub length_err: bool,
}

impl PgpRxStatus {
    /// Checks the driver flags and byte count.
    ///
    /// # Errors
    /// Returns the first integrity problem found.
    pub const fn validate(&self) -> Result<LaneVc, FrameIntegrityError> {
        if let Err(e) = check_length(self.bytes, MIN_FRAME_BYTES) {
            return Err(e);
        }
        if self.eofe {
            return Err(FrameIntegrityError::Eofe);
        }
        if self.fifo_err {
            return Err(FrameIntegrityError::FifoError);
        }
        if self.length_err {
            return Err(FrameIntegrityError::LengthError);
        }
        Ok(LaneVc::from_raw((((self.lane & 0xF) << 4) | (self.vc & 0xF)) as u8))
    }
}

/// A PGP card device node (e.g. `/dev/pgpcard0`).
#[derive(Debug)]
pub struct PgpCard {
    fd: OwnedFd,
    path: PathBuf,
}

impl PgpCard {
    /// Opens the card non-blocking for read/write.
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
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for PgpCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl FrameIo for PgpCard {
    fn kind(&self) -> TransportKind {
        TransportKind::Pgp
    }

    fn send(&self, lane_vc: LaneVc, words: &[u32], _scratch: &mut Vec<u8>) -> io::Result<()> {
        let size = u32::try_from(words.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        let tx = PgpCardTx {
            model: MODEL,
            cmd: CMD_NORMAL_WRITE,
            // The driver only reads through this pointer.
            data: words.as_ptr().cast_mut(),
            pgp_lane: u32::from(lane_vc.lane()),
            pgp_vc: u32::from(lane_vc.vc()),
            size,
        };
        // SAFETY: `tx` is a fully initialized `repr(C)` value that outlives the
        // slice, and the slice covers exactly its bytes.
        let request = unsafe {
            std::slice::from_raw_parts(ptr::from_ref(&tx).cast::<u8>(), size_of::<PgpCardTx>())
        };
        let written = rustix::io::write(&self.fd, request)?;
        // The driver answers with the request size on success.
        expect_full_write(written, request.len())
    }

    fn recv(&self, scratch: &mut [u8]) -> Result<Option<InboundFrame>, RecvError> {
        let max_words = u32::try_from(scratch.len() / 4).unwrap_or(u32::MAX);
        let mut rx = PgpCardRx {
            model: MODEL,
            max_size: max_words,
            data: scratch.as_mut_ptr().cast::<u32>(),
            pgp_lane: 0,
            pgp_vc: 0,
            rx_size: 0,
            eofe: 0,
            fifo_err: 0,
            length_err: 0,
        };
        // SAFETY: `rx` is a fully initialized `repr(C)` value; the driver reads
        // the request and writes status back into the same bytes. `data`
        // points at `scratch`, which holds at least `max_size` words.
        let request = unsafe {
            std::slice::from_raw_parts_mut(ptr::from_mut(&mut rx).cast::<u8>(), size_of::<PgpCardRx>())
        };
        let bytes = match rustix::io::read(&self.fd, request) {
            Ok(0) | Err(Errno::AGAIN) => return Ok(None),
            Ok(n) => n,
            Err(e) => return Err(RecvError::Io(e.into())),
        };
        let status = PgpRxStatus {
            bytes,
            lane: rx.pgp_lane,
            vc: rx.pgp_vc,
            eofe: rx.eofe != 0,
            fifo_err: rx.fifo_err != 0,
            length_err: rx.length_err != 0,
        };
        let lane_vc = status.validate()?;
        let len = bytes.min(scratch.len());
        Ok(Some(InboundFrame {
            lane_vc,
            words: words_from_ne(&scratch[..len]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good() -> PgpRxStatus {
        PgpRxStatus {
            bytes: 16,
            lane: 1,
            vc: 3,
            ..PgpRxStatus::default()
        }
    }

    #[test]
    fn clean_frame_packs_lane_vc() {
        assert_eq!(good().validate(), Ok(LaneVc::new(1, 3)));
    }

    #[test]
    fn driver_flags_are_integrity_errors() {
        let eofe = PgpRxStatus { eofe: true, ..good() };
        let fifo = PgpRxStatus { fifo_err: true, ..good() };
        let len = PgpRxStatus { length_err: true, ..good() };
        assert_eq!(eofe.validate(), Err(FrameIntegrityError::Eofe));
        assert_eq!(fifo.validate(), Err(FrameIntegrityError::FifoError));
        assert_eq!(len.validate(), Err(FrameIntegrityError::LengthError));
    }

    #[test]
    fn misaligned_byte_count_is_rejected() {
        let status = PgpRxStatus { bytes: 10, ..good() };
        assert_eq!(
            status.validate(),
            Err(FrameIntegrityError::Misaligned { bytes: 10 })
        );
    }

    #[test]
    fn open_missing_device_fails() {
        assert!(PgpCard::open("/dev/does-not-exist-pgpcard").is_err());
    }
}
