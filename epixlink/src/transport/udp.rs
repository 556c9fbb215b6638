//! UDP backend.
//!
//! ## Wire Format
//!
//! Every word, header included, is in network byte order.
//!
//! ```text
//! word0:  [31..24 lane_vc][23..0 continuation/index, always 0]
//! word1.. payload
//! ```
//!
//! Frames spanning several datagrams are not supported: a non-zero
//! continuation/index field on receive is a protocol violation.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};

use mio::net::UdpSocket;

use super::{
    FrameIntegrityError, FrameIo, InboundFrame, RecvError, TransportKind, check_length,
    expect_full_write,
};
use crate::protocol::LaneVc;
use crate::trace::warn;

/// Continuation flag and fragment index bits of the header.
pub const CONTINUATION_MASK: u32 = 0x00FF_FFFF;

/// Header word plus at least one payload word.
pub const MIN_FRAME_BYTES: usize = 8;

/// Encodes `words` behind a UDP header into `out`.
pub fn encode_udp_frame(lane_vc: LaneVc, words: &[u32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve((words.len() + 1) * 4);
    let header = u32::from(lane_vc.as_u8()) << 24;
    out.extend_from_slice(&header.to_be_bytes());
    for word in words {
        out.extend_from_slice(&word.to_be_bytes());
    }
}

/// Decodes one datagram.
///
/// # Errors
/// Returns a [`FrameIntegrityError`] for misaligned or short datagrams and
/// [`FrameIntegrityError::Fragmented`] when continuation bits are set.
pub fn decode_udp_frame(bytes: &[u8]) -> Result<InboundFrame, FrameIntegrityError> {
    check_length(bytes.len(), MIN_FRAME_BYTES)?;
    let header = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if header & CONTINUATION_MASK != 0 {
        return Err(FrameIntegrityError::Fragmented { header });
    }
    let words = bytes[4..]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(InboundFrame {
        lane_vc: LaneVc::from_raw((header >> 24) as u8),
        words,
    })
}

/// A UDP destination: a local non-blocking socket paired with one remote peer.
///
/// Datagrams from any other source are dropped on receive.
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpLink {
    /// Binds `local` and targets `remote`.
    ///
    /// # Errors
    /// Returns the OS error if the socket cannot be bound.
    pub fn open(local: SocketAddr, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        Ok(Self { socket, remote })
    }

    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Local address the socket is bound to.
    ///
    /// # Errors
    /// Returns the OS error if the address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sets the kernel receive buffer size. Event bursts overflow the
    /// default buffer on most hosts.
    ///
    /// # Errors
    /// Returns the OS error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio doesn't expose SO_RCVBUF.
        rustix::net::sockopt::set_socket_recv_buffer_size(&self.socket, size)?;
        Ok(())
    }

    /// Current kernel receive buffer size.
    ///
    /// # Errors
    /// Returns the OS error if the option cannot be read.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_recv_buffer_size(&self.socket)?)
    }
}

impl AsFd for UdpLink {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl FrameIo for UdpLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn send(&self, lane_vc: LaneVc, words: &[u32], scratch: &mut Vec<u8>) -> io::Result<()> {
        encode_udp_frame(lane_vc, words, scratch);
        let sent = self.socket.send_to(scratch.as_slice(), self.remote)?;
        expect_full_write(sent, scratch.len())
    }

    fn recv(&self, scratch: &mut [u8]) -> Result<Option<InboundFrame>, RecvError> {
        loop {
            let (len, from) = match self.socket.recv_from(scratch) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(RecvError::Io(e)),
            };
            if from != self.remote {
                warn!(from = %from, remote = %self.remote, "UDP: datagram from unknown peer, dropping");
                continue;
            }
            // An empty datagram is a short frame, not an empty socket.
            return Ok(Some(decode_udp_frame(&scratch[..len])?));
        }
    }
}
