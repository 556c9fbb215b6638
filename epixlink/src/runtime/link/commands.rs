//! Work items passed from callers to the TX thread.
//!
//! Each traffic class has its own queue. Callers push the item first and
//! bump the class's request counter second, so whenever the TX thread sees
//! a counter ahead of its serviced count the item is already queued.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};

use crate::protocol::Route;

/// Traffic classes in the order the TX thread services them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkClass {
    RunTrigger,
    Register,
    Command,
    Data,
}

impl WorkClass {
    /// Service order, highest priority first.
    pub const PRIORITY: [Self; 4] = [Self::RunTrigger, Self::Register, Self::Command, Self::Data];
}

/// A four-word opcode frame (command or run trigger).
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpcodeJob {
    pub route: Route,
    pub opcode: u8,
}

/// Request frame of the installed register transaction.
#[derive(Debug)]
pub(crate) struct RegisterJob {
    /// Sequence number in the register slot; stale jobs are skipped.
    pub seq: u64,
    pub route: Route,
    pub frame: Vec<u32>,
}

/// An outbound data frame whose caller waits for the send result.
#[derive(Debug)]
pub(crate) struct DataJob {
    pub route: Route,
    pub words: Vec<u32>,
    pub done: SyncSender<io::Result<()>>,
}

/// Caller-side ends of the work queues.
#[derive(Debug, Clone)]
pub(crate) struct WorkSenders {
    pub run: Sender<OpcodeJob>,
    pub register: Sender<RegisterJob>,
    pub command: Sender<OpcodeJob>,
    pub data: Sender<DataJob>,
}

/// TX-side ends of the work queues.
#[derive(Debug)]
pub(crate) struct WorkReceivers {
    pub run: Receiver<OpcodeJob>,
    pub register: Receiver<RegisterJob>,
    pub command: Receiver<OpcodeJob>,
    pub data: Receiver<DataJob>,
}

/// Creates the four work queues.
pub(crate) fn work_queues() -> (WorkSenders, WorkReceivers) {
    let (run_tx, run_rx) = mpsc::channel();
    let (register_tx, register_rx) = mpsc::channel();
    let (command_tx, command_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel();
    (
        WorkSenders {
            run: run_tx,
            register: register_tx,
            command: command_tx,
            data: data_tx,
        },
        WorkReceivers {
            run: run_rx,
            register: register_rx,
            command: command_rx,
            data: data_rx,
        },
    )
}
