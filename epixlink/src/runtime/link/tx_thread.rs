//! TX thread: the arbiter that puts every outbound frame on the wire.
//!
//! Responsibilities:
//! - Compare each class's request counter against the count serviced so far,
//!   in strict priority order: run trigger, register, command, data.
//! - Service the first class with new work exactly once, then start over from
//!   the top. Lower classes can starve while higher ones stay busy.
//! - Sleep briefly when no class has work. The thread never waits for a
//!   register reply; completion happens on the RX thread.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::counters::LinkCounters;
use crate::destination::DestinationTable;
use crate::protocol::{Route, command_frame};
use crate::sync::deadline_after;
use crate::trace::{debug, trace, warn};
use crate::transport::FrameIo;

use super::LinkShared;
use super::commands::{DataJob, OpcodeJob, RegisterJob, WorkClass, WorkReceivers};
use super::config::LinkConfig;

/// Items taken off each queue so far.
#[derive(Debug, Default)]
struct Serviced {
    run: u64,
    register: u64,
    command: u64,
    data: u64,
}

/// TX thread state and service loop.
pub(crate) struct TxThread {
    destinations: Arc<DestinationTable>,
    shared: Arc<LinkShared>,
    work: WorkReceivers,
    serviced: Serviced,
    /// Reusable encode buffer.
    scratch: Vec<u8>,
    idle_sleep: Duration,
    send_timeout: Duration,
}

impl TxThread {
    pub(crate) fn new(
        destinations: Arc<DestinationTable>,
        shared: Arc<LinkShared>,
        work: WorkReceivers,
        config: &LinkConfig,
    ) -> Self {
        Self {
            destinations,
            shared,
            work,
            serviced: Serviced::default(),
            scratch: Vec::with_capacity(4096),
            idle_sleep: config.idle_sleep,
            send_timeout: config.send_timeout,
        }
    }

    /// Runs until the shutdown flag is set, then flushes whatever callers
    /// queued before it.
    pub(crate) fn run(&mut self) {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            if self.service_once().is_none() {
                thread::sleep(self.idle_sleep);
            }
        }
        let mut _flushed = 0usize;
        while self.service_once().is_some() {
            _flushed += 1;
        }
        debug!(flushed = _flushed, "TX: queues flushed");
    }

    /// Services at most one item, from the highest-priority class with work.
    pub(crate) fn service_once(&mut self) -> Option<WorkClass> {
        WorkClass::PRIORITY
            .into_iter()
            .find(|&class| self.has_work(class) && self.service(class))
    }

    fn has_work(&self, class: WorkClass) -> bool {
        let counters = &self.shared.counters;
        let (requested, serviced): (&AtomicU64, u64) = match class {
            WorkClass::RunTrigger => (&counters.run_req, self.serviced.run),
            WorkClass::Register => (&counters.reg_req, self.serviced.register),
            WorkClass::Command => (&counters.cmd_req, self.serviced.command),
            WorkClass::Data => (&counters.data_req, self.serviced.data),
        };
        requested.load(Ordering::Acquire) > serviced
    }

    /// Returns `false` if the class's queue turned out to be empty.
    fn service(&mut self, class: WorkClass) -> bool {
        match class {
            WorkClass::RunTrigger => {
                let Ok(job) = self.work.run.try_recv() else {
                    return false;
                };
                self.serviced.run += 1;
                self.send_opcode(job, "run trigger");
            }
            WorkClass::Register => {
                let Ok(job) = self.work.register.try_recv() else {
                    return false;
                };
                self.serviced.register += 1;
                self.send_register(job);
            }
            WorkClass::Command => {
                let Ok(job) = self.work.command.try_recv() else {
                    return false;
                };
                self.serviced.command += 1;
                self.send_opcode(job, "command");
                LinkCounters::bump(&self.shared.counters.cmd_resp);
            }
            WorkClass::Data => {
                let Ok(job) = self.work.data.try_recv() else {
                    return false;
                };
                self.serviced.data += 1;
                self.send_data(job);
            }
        }
        true
    }

    fn send_opcode(&mut self, job: OpcodeJob, _what: &str) {
        let frame = command_frame(job.opcode);
        trace!(route = %job.route, opcode = job.opcode, kind = _what, "TX: opcode frame");
        if let Err(_e) = self.send_frame(job.route, &frame) {
            warn!(route = %job.route, opcode = job.opcode, kind = _what, error = %_e, "TX: opcode send failed");
        }
    }

    fn send_register(&mut self, job: RegisterJob) {
        // The caller may have timed out while the job sat in the queue.
        if !self.shared.slot.is_live(job.seq) {
            debug!(seq = job.seq, "TX: skipping abandoned register request");
            return;
        }
        trace!(route = %job.route, seq = job.seq, words = job.frame.len(), "TX: register request");
        if let Err(e) = self.send_frame(job.route, &job.frame) {
            warn!(route = %job.route, seq = job.seq, error = %e, "TX: register send failed");
            self.shared.slot.fail(job.seq, e);
        }
    }

    fn send_data(&mut self, job: DataJob) {
        trace!(route = %job.route, words = job.words.len(), "TX: data");
        let result = self.send_frame(job.route, &job.words);
        match &result {
            Ok(()) => {
                LinkCounters::bump(&self.shared.counters.data_resp);
            }
            Err(_e) => {
                warn!(route = %job.route, error = %_e, "TX: data send failed");
            }
        }
        // The caller may have given up waiting; nothing to do then.
        let _ = job.done.send(result);
    }

    /// Sends one frame, retrying while the device reports `WouldBlock`.
    ///
    /// Every failure bumps the error counter.
    fn send_frame(&mut self, route: Route, words: &[u32]) -> io::Result<()> {
        let result = match self.destinations.get(route.dest) {
            Some(dest) => {
                let deadline = deadline_after(self.send_timeout);
                loop {
                    match dest.send(route.lane_vc, words, &mut self.scratch) {
                        Err(e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                && deadline.is_none_or(|dl| Instant::now() < dl) =>
                        {
                            std::hint::spin_loop();
                        }
                        other => break other,
                    }
                }
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no destination {}", route.dest),
            )),
        };
        if result.is_err() {
            LinkCounters::bump(&self.shared.counters.error);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LaneVc, RegisterRequest};
    use crate::runtime::link::commands::{WorkSenders, work_queues};
    use crate::transport::{AxiStream, InboundFrame, Transport};
    use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};
    use std::sync::mpsc;

    struct Harness {
        tx: TxThread,
        senders: WorkSenders,
        shared: Arc<LinkShared>,
        device: AxiStream,
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
        let config = LinkConfig::default();
        let shared = Arc::new(LinkShared::new(&config));
        let (senders, receivers) = work_queues();
        let tx = TxThread::new(Arc::new(table), Arc::clone(&shared), receivers, &config);
        Harness {
            tx,
            senders,
            shared,
            device: AxiStream::from_fd(far),
        }
    }

    fn route() -> Route {
        Route::new(0, LaneVc::from_raw(0))
    }

    fn device_frames(device: &AxiStream) -> Vec<InboundFrame> {
        let mut buf = vec![0u8; 1024];
        std::iter::from_fn(|| device.recv(&mut buf).unwrap()).collect()
    }

    #[test]
    fn idle_arbiter_services_nothing() {
        let mut h = harness();
        assert_eq!(h.tx.service_once(), None);
    }

    #[test]
    fn priority_order_run_register_then_data() {
        let mut h = harness();
        let counters = &h.shared.counters;

        let mut completions = Vec::new();
        for i in 0..10u32 {
            let (done, wait) = mpsc::sync_channel(1);
            h.senders
                .data
                .send(DataJob {
                    route: route(),
                    words: vec![0xD000 + i],
                    done,
                })
                .unwrap();
            LinkCounters::bump(&counters.data_req);
            completions.push(wait);
        }

        let issue = h.shared.slot.acquire();
        let (seq, frame) = h
            .shared
            .slot
            .install(&issue, route(), &RegisterRequest::read(0x0100_0005, 1))
            .unwrap();
        h.senders
            .register
            .send(RegisterJob {
                seq,
                route: route(),
                frame: frame.clone(),
            })
            .unwrap();
        LinkCounters::bump(&counters.reg_req);

        h.senders
            .run
            .send(OpcodeJob {
                route: route(),
                opcode: 7,
            })
            .unwrap();
        LinkCounters::bump(&counters.run_req);

        let order: Vec<_> = std::iter::from_fn(|| h.tx.service_once()).collect();
        let mut expected = vec![WorkClass::RunTrigger, WorkClass::Register];
        expected.extend([WorkClass::Data; 10]);
        assert_eq!(order, expected);

        let frames = device_frames(&h.device);
        assert_eq!(frames.len(), 12);
        assert_eq!(frames[0].words, command_frame(7).to_vec());
        assert_eq!(frames[1].words, frame);
        for (i, f) in frames[2..].iter().enumerate() {
            assert_eq!(f.words, vec![0xD000 + i as u32]);
        }
        for wait in completions {
            assert!(wait.recv().unwrap().is_ok());
        }
        assert_eq!(h.shared.counters.snapshot().data_resp, 10);
    }

    #[test]
    fn abandoned_register_request_is_not_sent() {
        let mut h = harness();
        let issue = h.shared.slot.acquire();
        let (seq, frame) = h
            .shared
            .slot
            .install(&issue, route(), &RegisterRequest::read(0x10, 1))
            .unwrap();
        // Caller gives up before the arbiter runs.
        let _ = h.shared.slot.wait(&issue, seq, Duration::from_millis(1));

        h.senders
            .register
            .send(RegisterJob {
                seq,
                route: route(),
                frame,
            })
            .unwrap();
        LinkCounters::bump(&h.shared.counters.reg_req);

        assert_eq!(h.tx.service_once(), Some(WorkClass::Register));
        assert!(device_frames(&h.device).is_empty());
    }

    #[test]
    fn command_to_unknown_destination_counts_error() {
        let mut h = harness();
        h.senders
            .command
            .send(OpcodeJob {
                route: Route::new(3, LaneVc::from_raw(0)),
                opcode: 1,
            })
            .unwrap();
        LinkCounters::bump(&h.shared.counters.cmd_req);

        assert_eq!(h.tx.service_once(), Some(WorkClass::Command));
        let snap = h.shared.counters.snapshot();
        assert_eq!(snap.cmd_resp, 1);
        assert_eq!(snap.error, 1);
    }
}
