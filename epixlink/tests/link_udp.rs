//! End-to-end link tests over UDP loopback.

mod common;

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::{init_test_tracing, wait_until};
use epixlink::protocol::WRITE_FLAG;
use epixlink::transport::udp::{decode_udp_frame, encode_udp_frame};
use epixlink::{CommLink, DestinationConfig, LaneVc, LinkConfig, Transport};

const SETTLE: Duration = Duration::from_secs(2);

/// A board answering register requests over UDP.
struct UdpBoard {
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpBoard {
    fn spawn() -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let socket = Arc::clone(&socket);
            let stop = Arc::clone(&stop);
            thread::spawn(move || serve(&socket, &stop))
        };
        Self {
            socket,
            stop,
            handle: Some(handle),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn send(&self, to: SocketAddr, lane_vc: LaneVc, words: &[u32]) {
        let mut bytes = Vec::new();
        encode_udp_frame(lane_vc, words, &mut bytes);
        self.socket.send_to(&bytes, to).unwrap();
    }
}

impl Drop for UdpBoard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(socket: &UdpSocket, stop: &AtomicBool) {
    let mut registers: HashMap<u32, u32> = HashMap::new();
    let mut buf = [0u8; 2048];
    let mut out = Vec::new();
    while !stop.load(Ordering::Relaxed) {
        let Ok((len, from)) = socket.recv_from(&mut buf) else {
            continue;
        };
        let Ok(frame) = decode_udp_frame(&buf[..len]) else {
            continue;
        };
        let request = frame.words;
        if frame.lane_vc != LaneVc::from_raw(0) || request.len() < 4 {
            continue;
        }
        let address = request[0] | (request[1] & 0x00FF_FFFF);
        let mut reply = vec![request[0], request[1]];
        if request[1] & WRITE_FLAG != 0 {
            let data = &request[2..request.len() - 1];
            for (offset, value) in (0u32..).zip(data) {
                registers.insert(address.wrapping_add(offset), *value);
            }
            reply.extend_from_slice(data);
        } else {
            reply.extend((0..=request[2]).map(|offset| {
                registers.get(&address.wrapping_add(offset)).copied().unwrap_or(0)
            }));
        }
        reply.push(0);
        encode_udp_frame(frame.lane_vc, &reply, &mut out);
        let _ = socket.send_to(&out, from);
    }
}

fn open_link(board: &UdpBoard) -> (CommLink, SocketAddr) {
    init_test_tracing();
    let destination = DestinationConfig::Udp {
        local: "127.0.0.1:0".parse().unwrap(),
        remote: board.addr(),
    };
    let config = LinkConfig::default().with_register_timeout(Duration::from_millis(500));
    let link = CommLink::open(&[destination], config).unwrap();
    let Transport::Udp(udp) = &link.destinations()[0] else {
        panic!("expected a UDP destination");
    };
    let local = udp.local_addr().unwrap();
    (link, local)
}

#[test]
fn register_round_trip_over_udp() {
    let board = UdpBoard::spawn();
    let (link, _) = open_link(&board);

    link.write_register(0x0100_0007, &[0xFFFF, 0x1234]).unwrap();
    assert_eq!(link.read_register(0x0100_0007, 2).unwrap(), vec![0xFFFF, 0x1234]);
    assert_eq!(link.read_register(0x0100_0009, 1).unwrap(), vec![0]);

    let snap = link.counters();
    assert_eq!(snap.reg_req, 3);
    assert_eq!(snap.reg_resp, 3);
    assert_eq!(snap.error, 0);
    link.close();
}

#[test]
fn data_frames_arrive_over_udp() {
    let board = UdpBoard::spawn();
    let (link, local) = open_link(&board);

    board.send(local, LaneVc::new(0, 1), &[10, 20, 30]);
    let frame = link.next_data_frame(SETTLE).expect("data frame");
    assert_eq!(frame.lane_vc, LaneVc::new(0, 1));
    assert_eq!(frame.words, vec![10, 20, 30]);
    link.close();
}

#[test]
fn fragmented_and_foreign_datagrams_are_dropped() {
    let board = UdpBoard::spawn();
    let (link, local) = open_link(&board);

    // Continuation bits set on a data lane.
    let fragmented: Vec<u8> = [0x0100_0001u32, 5]
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .collect();
    board.socket.send_to(&fragmented, local).unwrap();
    assert!(wait_until(SETTLE, || link.counters().error == 1));

    // A well-formed frame from a socket that is not the configured peer.
    let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut bytes = Vec::new();
    encode_udp_frame(LaneVc::new(0, 1), &[0xBAD], &mut bytes);
    stranger.send_to(&bytes, local).unwrap();

    board.send(local, LaneVc::new(0, 1), &[0x600D]);
    let frame = link.next_data_frame(SETTLE).expect("data frame");
    assert_eq!(frame.words, vec![0x600D]);
    assert!(link.next_data_frame(Duration::from_millis(20)).is_none());
    link.close();
}

#[test]
fn empty_datagram_does_not_strand_the_frames_behind_it() {
    const ROUNDS: u32 = 20;

    let board = UdpBoard::spawn();
    let (link, local) = open_link(&board);

    for round in 0..ROUNDS {
        board.socket.send_to(&[], local).unwrap();
        board.send(local, LaneVc::new(0, 1), &[round]);
        let frame = link
            .next_data_frame(SETTLE)
            .unwrap_or_else(|| panic!("frame {round} stranded behind an empty datagram"));
        assert_eq!(frame.words, vec![round]);
    }

    assert!(wait_until(SETTLE, || link.counters().error == u64::from(ROUNDS)));
    link.close();
}
