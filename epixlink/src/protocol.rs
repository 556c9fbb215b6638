//! Register-transaction wire protocol and traffic classification.
//!
//! The frames in this module are transport-agnostic word arrays. Each
//! backend in [`crate::transport`] wraps them in its own header.
//!
//! # Register request
//!
//! ```text
//! word0  address & 0xFF00_0000
//! word1  (write ? 0x4000_0000 : 0) | (address & 0x00FF_FFFF)
//! write: word2..2+size = data, then one reserved trailer word (0)
//! read:  word2 = size - 1, word3 = 0
//! ```
//!
//! # Register reply
//!
//! ```text
//! word0, word1  echo of the request
//! word2..       payload (read data, or the echoed write data)
//! last word     status (0 = success)
//! ```
//!
//! Commands and run triggers are four-word frames carrying only an opcode.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Direction bit in request/reply word1.
pub const WRITE_FLAG: u32 = 0x4000_0000;

/// Upper address byte carried in word0.
pub const ADDRESS_HIGH_MASK: u32 = 0xFF00_0000;

/// Register offset carried in word1.
pub const ADDRESS_LOW_MASK: u32 = 0x00FF_FFFF;

/// Words of overhead in every register reply: two echo words plus status.
pub const REPLY_OVERHEAD_WORDS: usize = 3;

/// Length of a command or run-trigger frame.
pub const COMMAND_FRAME_WORDS: usize = 4;

/// A packed lane / virtual-channel pair.
///
/// ```text
/// bit 7..4  lane
/// bit 3..0  virtual channel
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaneVc(u8);

impl LaneVc {
    /// Creates a lane/VC pair.
    ///
    /// # Panics
    /// Panics if `lane` or `vc` does not fit in four bits.
    #[must_use]
    pub fn new(lane: u8, vc: u8) -> Self {
        assert!(lane < 16 && vc < 16, "lane and vc must each be < 16");
        Self((lane << 4) | vc)
    }

    /// Wraps an already-packed byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn lane(self) -> u8 {
        self.0 >> 4
    }

    pub const fn vc(self) -> u8 {
        self.0 & 0x0F
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl From<u8> for LaneVc {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl fmt::Display for LaneVc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.lane(), self.vc())
    }
}

/// Where a request goes: destination index plus the lane/VC tag it travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Route {
    /// Index into the destination table.
    pub dest: u8,
    /// Lane/VC tag for the frame.
    pub lane_vc: LaneVc,
}

impl Route {
    #[must_use]
    pub const fn new(dest: u8, lane_vc: LaneVc) -> Self {
        Self { dest, lane_vc }
    }

    /// Combined key `dest | (lane_vc << 8)` used to match replies.
    #[must_use]
    pub const fn dest_key(self) -> u16 {
        (self.dest as u16) | ((self.lane_vc.as_u8() as u16) << 8)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dest, self.lane_vc)
    }
}

/// Traffic class of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Asynchronous event/telemetry data.
    Data,
    /// Possibly a reply to the outstanding register transaction.
    ControlCandidate,
}

/// Classifies an inbound frame from its lane/VC tag alone.
///
/// The frame is data iff bit `lane_vc & 0xF` of `data_mask` is set.
#[inline]
#[must_use]
pub const fn classify(lane_vc: LaneVc, data_mask: u16) -> FrameClass {
    let bit = 1u16 << (lane_vc.as_u8() & 0x0F);
    if data_mask & bit != 0 {
        FrameClass::Data
    } else {
        FrameClass::ControlCandidate
    }
}

/// Direction and size of a register access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOp {
    /// Read `size` consecutive words.
    Read { size: u32 },
    /// Write the given words.
    Write { data: Vec<u32> },
}

/// A single register read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub address: u32,
    pub op: RegisterOp,
}

impl RegisterRequest {
    /// Creates a read of `size` words starting at `address`.
    ///
    /// # Panics
    /// Panics if `size == 0`.
    #[must_use]
    pub fn read(address: u32, size: u32) -> Self {
        assert!(size > 0, "register read size must be > 0");
        Self {
            address,
            op: RegisterOp::Read { size },
        }
    }

    /// Creates a write of `data` starting at `address`.
    ///
    /// # Panics
    /// Panics if `data` is empty.
    #[must_use]
    pub fn write(address: u32, data: Vec<u32>) -> Self {
        assert!(!data.is_empty(), "register write needs at least one word");
        Self {
            address,
            op: RegisterOp::Write { data },
        }
    }

    pub const fn is_write(&self) -> bool {
        matches!(self.op, RegisterOp::Write { .. })
    }

    /// Number of payload words moved by this request.
    pub fn size_words(&self) -> usize {
        match &self.op {
            RegisterOp::Read { size } => *size as usize,
            RegisterOp::Write { data } => data.len(),
        }
    }

    /// Words the matching reply must contain.
    pub fn expected_reply_words(&self) -> usize {
        self.size_words() + REPLY_OVERHEAD_WORDS
    }

    /// Encodes the request frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u32> {
        let word0 = self.address & ADDRESS_HIGH_MASK;
        let low = self.address & ADDRESS_LOW_MASK;
        match &self.op {
            RegisterOp::Read { size } => vec![word0, low, size - 1, 0],
            RegisterOp::Write { data } => {
                let mut frame = Vec::with_capacity(data.len() + REPLY_OVERHEAD_WORDS);
                frame.push(word0);
                frame.push(WRITE_FLAG | low);
                frame.extend_from_slice(data);
                frame.push(0);
                frame
            }
        }
    }
}

/// Reasons a control-candidate frame does not complete the outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyMismatch {
    /// Header words do not echo the request.
    #[error("header echo mismatch: got {got:08x?}, want {want:08x?}")]
    EchoMismatch { got: [u32; 2], want: [u32; 2] },
    /// Reply length differs from what the request implies.
    #[error("reply length mismatch: expected {expected} words, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// A validated register reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReply {
    /// Words between the echo header and the status word.
    pub payload: Vec<u32>,
    /// Trailing status word; 0 is success.
    pub status: u32,
}

impl RegisterReply {
    /// Validates `reply` against the encoded `request` frame.
    ///
    /// # Errors
    /// Returns a [`ReplyMismatch`] if the reply does not echo the request
    /// header or has the wrong length.
    pub fn parse(
        request: &[u32],
        expected_words: usize,
        reply: &[u32],
    ) -> Result<Self, ReplyMismatch> {
        if reply.len() < 2 || request.len() < 2 || reply[..2] != request[..2] {
            let got = [
                reply.first().copied().unwrap_or(0),
                reply.get(1).copied().unwrap_or(0),
            ];
            let want = [
                request.first().copied().unwrap_or(0),
                request.get(1).copied().unwrap_or(0),
            ];
            return Err(ReplyMismatch::EchoMismatch { got, want });
        }
        if reply.len() != expected_words {
            return Err(ReplyMismatch::LengthMismatch {
                expected: expected_words,
                actual: reply.len(),
            });
        }
        let status = reply[reply.len() - 1];
        Ok(Self {
            payload: reply[2..reply.len() - 1].to_vec(),
            status,
        })
    }
}

/// Encodes a command or run-trigger frame.
#[inline]
#[must_use]
pub const fn command_frame(opcode: u8) -> [u32; COMMAND_FRAME_WORDS] {
    [0, opcode as u32, 0, 0]
}
