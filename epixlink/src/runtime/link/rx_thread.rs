//! RX thread: demultiplexes every inbound frame.
//!
//! Responsibilities:
//! - Wait (bounded by `poll_interval`) for any destination to become readable.
//! - Perform one receive per readable destination per iteration, so a busy
//!   data stream cannot starve register replies on another destination.
//! - Classify by lane/VC: data goes to the data queue, everything else is
//!   offered to the outstanding register transaction.
//! - Count damaged frames as errors and unmatched control frames as
//!   unexpected. Nothing received ever stops the thread.
//!
//! mio readiness is edge-triggered: an event only says "something arrived".
//! Each destination keeps a readable flag that stays set until a receive
//! comes back empty, and the wait does not block while any flag is set.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::counters::LinkCounters;
use crate::destination::DestinationTable;
use crate::protocol::{FrameClass, Route, classify};
use crate::trace::{debug, trace, warn};
use crate::transport::{FrameIo, InboundFrame, RecvError};

use super::config::LinkConfig;
use super::transaction::MatchResult;
use super::{DataFrame, LinkShared};

/// Readiness events drained per wait.
const EVENT_CAPACITY: usize = 64;

/// RX thread state and event loop.
pub(crate) struct RxThread {
    destinations: Arc<DestinationTable>,
    shared: Arc<LinkShared>,
    poll: Poll,
    events: Events,
    /// Per destination: may still hold unread frames.
    readable: Vec<bool>,
    /// Reusable receive buffer, `max_rx_words` long.
    scratch: Vec<u8>,
    poll_interval: Duration,
}

impl RxThread {
    /// Registers every destination descriptor for readiness.
    ///
    /// # Errors
    /// Returns the OS error if the poll instance cannot be created or a
    /// descriptor cannot be registered.
    pub(crate) fn new(
        destinations: Arc<DestinationTable>,
        shared: Arc<LinkShared>,
        config: &LinkConfig,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        for (index, transport) in destinations.iter().enumerate() {
            let fd: RawFd = transport.raw_fd();
            poll.registry()
                .register(&mut SourceFd(&fd), Token(index), Interest::READABLE)?;
        }
        // Frames may already be waiting from before registration.
        let readable = vec![true; destinations.len()];
        Ok(Self {
            destinations,
            shared,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            readable,
            scratch: vec![0u8; config.max_rx_words * 4],
            poll_interval: config.poll_interval,
        })
    }

    /// Runs until the shutdown flag is set.
    pub(crate) fn run(&mut self) {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            self.poll_once();
        }
    }

    /// One wait plus at most one receive per readable destination.
    pub(crate) fn poll_once(&mut self) {
        let timeout = if self.readable.contains(&true) {
            Duration::ZERO
        } else {
            self.poll_interval
        };
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!(error = %e, "RX: poll failed");
                LinkCounters::bump(&self.shared.counters.error);
                std::thread::sleep(self.poll_interval);
            }
            return;
        }
        for event in &self.events {
            if let Some(flag) = self.readable.get_mut(event.token().0) {
                *flag = true;
            }
        }
        for index in 0..self.readable.len() {
            if self.readable[index] {
                self.receive_one(index);
            }
        }
    }

    fn receive_one(&mut self, index: usize) {
        let received = self.destinations[index].recv(&mut self.scratch);
        match received {
            Ok(Some(frame)) => self.dispatch(index, frame),
            Ok(None) => self.readable[index] = false,
            Err(RecvError::Integrity(_e)) => {
                // The damaged frame is consumed; more may follow.
                LinkCounters::bump(&self.shared.counters.error);
                debug!(dest = index, error = %_e, "RX: dropping damaged frame");
            }
            Err(RecvError::Io(_e)) => {
                LinkCounters::bump(&self.shared.counters.error);
                self.readable[index] = false;
                warn!(dest = index, error = %_e, "RX: receive failed");
            }
        }
    }

    fn dispatch(&mut self, index: usize, frame: InboundFrame) {
        // Tables never exceed 256 entries.
        let route = Route::new(index as u8, frame.lane_vc);
        let mask = self.shared.data_mask.load(Ordering::Relaxed);
        match classify(frame.lane_vc, mask) {
            FrameClass::Data => {
                trace!(route = %route, words = frame.words.len(), "RX: data frame");
                let data = DataFrame {
                    dest: route.dest,
                    lane_vc: frame.lane_vc,
                    words: frame.words,
                };
                if self.shared.data.push(data).is_err() {
                    debug!(route = %route, "RX: data queue closed, dropping frame");
                }
            }
            FrameClass::ControlCandidate => {
                let counters = &self.shared.counters;
                match self
                    .shared
                    .slot
                    .try_complete(route, &frame.words, &counters.reg_resp)
                {
                    MatchResult::Completed => {
                        trace!(route = %route, "RX: register reply matched");
                    }
                    _reason => {
                        LinkCounters::bump(&counters.unexpected);
                        debug!(route = %route, reason = ?_reason, words = frame.words.len(), "RX: unexpected control frame");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LaneVc, RegisterRequest};
    use crate::transport::{AxiStream, Transport, UdpLink};
    use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};
    use std::os::fd::OwnedFd;

    struct Harness {
        rx: RxThread,
        shared: Arc<LinkShared>,
        device: OwnedFd,
    }

    fn harness() -> Harness {
        let (near, far) = socketpair(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )
        .unwrap();
        let table = DestinationTable::from_transports(vec![Transport::from(AxiStream::from_fd(near))])
            .unwrap();
        let config = LinkConfig {
            max_rx_words: 64,
            ..LinkConfig::default()
        };
        let shared = Arc::new(LinkShared::new(&config));
        let rx = RxThread::new(Arc::new(table), Arc::clone(&shared), &config).unwrap();
        Harness {
            rx,
            shared,
            device: far,
        }
    }

    /// Writes an AXI frame with an explicit header word.
    fn device_send(device: &OwnedFd, header: u32, words: &[u32]) {
        let mut bytes = header.to_ne_bytes().to_vec();
        for w in words {
            bytes.extend_from_slice(&w.to_ne_bytes());
        }
        rustix::io::write(device, &bytes).unwrap();
    }

    fn pump_until(rx: &mut RxThread, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            rx.poll_once();
            if done() {
                return true;
            }
        }
        false
    }

    #[test]
    fn data_frame_is_queued() {
        let mut h = harness();
        device_send(&h.device, 0x0201, &[1, 2, 3]);
        let shared = Arc::clone(&h.shared);
        assert!(pump_until(&mut h.rx, || !shared.data.is_empty()));
        let frame = h.shared.data.pop().unwrap();
        assert_eq!(frame.dest, 0);
        assert_eq!(frame.lane_vc, LaneVc::from_raw(0x01));
        assert_eq!(frame.words, vec![1, 2, 3]);
    }

    #[test]
    fn reply_completes_outstanding_transaction() {
        let mut h = harness();
        let issue = h.shared.slot.acquire();
        let (seq, frame) = h
            .shared
            .slot
            .install(
                &issue,
                Route::new(0, LaneVc::from_raw(0)),
                &RegisterRequest::read(0x0100_0005, 1),
            )
            .unwrap();
        device_send(&h.device, 0x0200, &[frame[0], frame[1], 0x2A, 0]);
        let shared = Arc::clone(&h.shared);
        assert!(pump_until(&mut h.rx, || !shared.slot.is_live(seq)));
        assert_eq!(h.shared.counters.snapshot().reg_resp, 1);
        assert_eq!(h.shared.counters.snapshot().unexpected, 0);
    }

    #[test]
    fn damaged_frames_count_errors_and_never_complete() {
        let mut h = harness();
        let issue = h.shared.slot.acquire();
        let (seq, frame) = h
            .shared
            .slot
            .install(
                &issue,
                Route::new(0, LaneVc::from_raw(0)),
                &RegisterRequest::read(0x10, 1),
            )
            .unwrap();
        let reply = [frame[0], frame[1], 0, 0];
        // EOFE, then length error, then a header-only frame.
        device_send(&h.device, 0x0200 | (1 << 16), &reply);
        device_send(&h.device, 0x0200 | (1 << 25), &reply);
        device_send(&h.device, 0x0200, &[]);

        let shared = Arc::clone(&h.shared);
        assert!(pump_until(&mut h.rx, || shared.counters.snapshot().error == 3));
        assert!(h.shared.slot.is_live(seq));
        assert_eq!(h.shared.counters.snapshot().reg_resp, 0);
    }

    #[test]
    fn stray_and_mismatched_replies_are_unexpected() {
        let mut h = harness();
        // Nothing outstanding.
        device_send(&h.device, 0x0200, &[0, 0x10, 0, 0]);
        let shared = Arc::clone(&h.shared);
        assert!(pump_until(&mut h.rx, || shared.counters.snapshot().unexpected == 1));

        let issue = h.shared.slot.acquire();
        let (seq, frame) = h
            .shared
            .slot
            .install(
                &issue,
                Route::new(0, LaneVc::from_raw(0)),
                &RegisterRequest::read(0x10, 1),
            )
            .unwrap();
        // Wrong echo, then wrong length.
        device_send(&h.device, 0x0200, &[frame[0], frame[1] + 1, 0, 0]);
        device_send(&h.device, 0x0200, &[frame[0], frame[1], 0, 0, 0]);
        assert!(pump_until(&mut h.rx, || shared.counters.snapshot().unexpected == 3));
        assert!(h.shared.slot.is_live(seq));
    }

    #[test]
    fn data_mask_change_applies_to_next_frame() {
        let mut h = harness();
        h.shared.data_mask.store(0x0001, Ordering::Relaxed);
        device_send(&h.device, 0x0200, &[9]);
        let shared = Arc::clone(&h.shared);
        assert!(pump_until(&mut h.rx, || shared.data.len() == 1));
        assert_eq!(h.shared.counters.snapshot().unexpected, 0);
    }

    #[test]
    fn fragmented_udp_datagrams_are_rejected() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let link = UdpLink::open("127.0.0.1:0".parse().unwrap(), peer.local_addr().unwrap())
            .unwrap();
        let link_addr = link.local_addr().unwrap();
        let table = DestinationTable::from_transports(vec![link.into()]).unwrap();
        let config = LinkConfig::default().with_data_mask(0xFFFF);
        let shared = Arc::new(LinkShared::new(&config));
        let mut rx = RxThread::new(Arc::new(table), Arc::clone(&shared), &config).unwrap();

        let datagram: Vec<u8> = [0x0100_0001u32, 5]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        peer.send_to(&datagram, link_addr).unwrap();

        assert!(pump_until(&mut rx, || shared.counters.snapshot().error == 1));
        assert!(shared.data.is_empty());
    }
}
