//! Simulated front-end board for integration tests.
//!
//! The board sits on the far end of a `SOCK_SEQPACKET` socketpair, which
//! preserves frame boundaries the way the AXI-stream DMA device does. It
//! keeps a register file, answers register requests and records every frame
//! it receives with its transport header intact.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use epixlink::protocol::{LaneVc, WRITE_FLAG};
use epixlink::transport::axi::decode_axi_frame;
use epixlink::transport::{AxiStream, FrameIo, Transport};
use epixlink::{CommLink, LinkConfig};
use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        epixlink::init_tracing();
    });
}

/// How the board answers register requests.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Answer requests at all.
    pub respond: bool,
    /// Status word put in every reply.
    pub status: u32,
    /// Pause between receiving a request and replying.
    pub reply_delay: Duration,
    /// Only requests on this lane/VC are answered.
    pub register_lane_vc: LaneVc,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            respond: true,
            status: 0,
            reply_delay: Duration::ZERO,
            register_lane_vc: LaneVc::from_raw(0),
        }
    }
}

impl Behavior {
    pub fn silent() -> Self {
        Self {
            respond: false,
            ..Self::default()
        }
    }
}

/// A simulated board on the far end of a socketpair.
pub struct SimBoard {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    /// Raw host-order words of every frame received, header included.
    seen: Arc<Mutex<Vec<Vec<u32>>>>,
    registers: Arc<Mutex<HashMap<u32, u32>>>,
    /// Requests that arrived while another was still unanswered.
    overlaps: Arc<AtomicU64>,
    /// Second handle on the board's descriptor for injecting frames.
    inject: AxiStream,
}

impl SimBoard {
    /// Creates a link over one AXI-stream destination with a board behind it.
    pub fn with_link(config: LinkConfig, behavior: Behavior) -> (CommLink, Self) {
        init_test_tracing();
        let (near, far) = socketpair(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )
        .expect("socketpair");
        let board = Self::spawn(far, behavior);
        let link = CommLink::with_transports(vec![Transport::from(AxiStream::from_fd(near))], config)
            .expect("link opens");
        (link, board)
    }

    /// Creates a link whose board end has already been closed, so every
    /// send fails with a broken pipe.
    pub fn unplugged(config: LinkConfig) -> CommLink {
        init_test_tracing();
        let (near, far) = socketpair(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )
        .expect("socketpair");
        drop(far);
        CommLink::with_transports(vec![Transport::from(AxiStream::from_fd(near))], config)
            .expect("link opens")
    }

    fn spawn(fd: OwnedFd, behavior: Behavior) -> Self {
        let inject = AxiStream::from_fd(fd.try_clone().expect("dup"));
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registers = Arc::new(Mutex::new(HashMap::new()));
        let overlaps = Arc::new(AtomicU64::new(0));

        let handle = {
            let stop = Arc::clone(&stop);
            let seen = Arc::clone(&seen);
            let registers = Arc::clone(&registers);
            let overlaps = Arc::clone(&overlaps);
            thread::Builder::new()
                .name("sim-board".into())
                .spawn(move || {
                    board_loop(&fd, &behavior, &stop, &seen, &registers, &overlaps);
                })
                .expect("spawn board")
        };

        Self {
            stop,
            handle: Some(handle),
            seen,
            registers,
            overlaps,
            inject,
        }
    }

    pub fn set_register(&self, address: u32, value: u32) {
        self.registers.lock().unwrap().insert(address, value);
    }

    pub fn register(&self, address: u32) -> Option<u32> {
        self.registers.lock().unwrap().get(&address).copied()
    }

    pub fn seen(&self) -> Vec<Vec<u32>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn overlaps(&self) -> u64 {
        self.overlaps.load(Ordering::Relaxed)
    }

    /// Waits until the board has received at least `count` frames.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.seen.lock().unwrap().len() >= count)
    }

    /// Sends a well-formed frame toward the link.
    pub fn inject(&self, lane_vc: LaneVc, words: &[u32]) {
        let mut scratch = Vec::new();
        self.inject
            .send(lane_vc, words, &mut scratch)
            .expect("inject frame");
    }

    /// Sends raw words, header included, toward the link.
    pub fn inject_raw(&self, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        rustix::io::write(&self.inject, &bytes).expect("inject raw");
    }
}

impl Drop for SimBoard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Polls `done` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

fn read_raw(fd: &OwnedFd, buf: &mut [u8]) -> Option<Vec<u32>> {
    match rustix::io::read(fd, &mut *buf) {
        Ok(n) if n > 0 => Some(
            buf[..n]
                .chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        _ => None,
    }
}

fn board_loop(
    fd: &OwnedFd,
    behavior: &Behavior,
    stop: &AtomicBool,
    seen: &Mutex<Vec<Vec<u32>>>,
    registers: &Mutex<HashMap<u32, u32>>,
    overlaps: &AtomicU64,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut backlog: VecDeque<Vec<u32>> = VecDeque::new();
    let responder = AxiStream::from_fd(fd.try_clone().expect("dup"));
    let mut scratch = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        let Some(raw) = backlog.pop_front().or_else(|| read_raw(fd, &mut buf)) else {
            thread::sleep(Duration::from_micros(100));
            continue;
        };
        seen.lock().unwrap().push(raw.clone());

        let bytes: Vec<u8> = raw.iter().flat_map(|w| w.to_ne_bytes()).collect();
        let Ok(frame) = decode_axi_frame(&bytes) else {
            continue;
        };
        if !behavior.respond || frame.lane_vc != behavior.register_lane_vc || frame.words.len() < 4 {
            continue;
        }

        if !behavior.reply_delay.is_zero() {
            thread::sleep(behavior.reply_delay);
            while let Some(next) = read_raw(fd, &mut buf) {
                overlaps.fetch_add(1, Ordering::Relaxed);
                backlog.push_back(next);
            }
        }

        let reply = answer(&frame.words, behavior.status, registers);
        let _ = responder.send(frame.lane_vc, &reply, &mut scratch);
    }
}

/// Builds the reply to one register request.
fn answer(request: &[u32], status: u32, registers: &Mutex<HashMap<u32, u32>>) -> Vec<u32> {
    let address = request[0] | (request[1] & 0x00FF_FFFF);
    let mut reply = vec![request[0], request[1]];
    let mut regs = registers.lock().unwrap();
    if request[1] & WRITE_FLAG != 0 {
        let data = &request[2..request.len() - 1];
        for (offset, value) in (0u32..).zip(data) {
            regs.insert(address.wrapping_add(offset), *value);
        }
        reply.extend_from_slice(data);
    } else {
        let size = request[2] + 1;
        reply.extend((0..size).map(|offset| {
            regs.get(&address.wrapping_add(offset)).copied().unwrap_or(0)
        }));
    }
    reply.push(status);
    reply
}
