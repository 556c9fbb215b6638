//! The single outstanding register transaction.
//!
//! Three actors touch the slot:
//! - the caller installs a transaction and waits for its outcome,
//! - the TX thread sends the request frame (and fails it if the send fails),
//! - the RX thread completes it when a matching reply arrives.
//!
//! Callers hold the issue lock for the whole transaction, so at most one is
//! ever installed. A caller that times out clears the slot; any reply that
//! arrives afterwards finds nothing to match and is counted as unexpected.

use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;

use crate::counters::LinkCounters;
use crate::protocol::{RegisterReply, RegisterRequest, ReplyMismatch, Route};
use crate::sync::deadline_after;

/// How an installed transaction ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// A matching reply arrived.
    Reply(RegisterReply),
    /// The TX thread could not put the request on the wire.
    SendFailed(io::Error),
}

/// Why waiting for an outcome stopped without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    TimedOut,
    Closed,
}

/// Result of offering a control frame to the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MatchResult {
    Completed,
    /// Nothing is outstanding (or it already completed).
    NoTransaction,
    /// Reply came from a different destination or lane/VC.
    WrongDestination { expected: u16, actual: u16 },
    /// Reply failed the echo or length check.
    Mismatch(ReplyMismatch),
}

/// One installed transaction.
#[derive(Debug)]
struct Pending {
    seq: u64,
    route: Route,
    frame: Vec<u32>,
    expected_words: usize,
    outcome: Option<Outcome>,
}

#[derive(Debug, Default)]
struct SlotState {
    pending: Option<Pending>,
    next_seq: u64,
    closed: bool,
}

/// Single-slot register transaction shared by callers and the link threads.
#[derive(Debug, Default)]
pub(crate) struct RegisterSlot {
    /// Held by a caller from install until its outcome is taken.
    issue: Mutex<()>,
    state: Mutex<SlotState>,
    done: Condvar,
}

/// Proof that the caller owns the issue lock.
pub(crate) struct IssueGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl RegisterSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for exclusive use of the slot.
    pub(crate) fn acquire(&self) -> IssueGuard<'_> {
        IssueGuard {
            _guard: self.issue.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Installs `request` and returns its sequence number and encoded frame.
    ///
    /// Returns `None` if the link is closed.
    pub(crate) fn install(
        &self,
        _issue: &IssueGuard<'_>,
        route: Route,
        request: &RegisterRequest,
    ) -> Option<(u64, Vec<u32>)> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        debug_assert!(state.pending.is_none(), "register slot already in use");
        state.next_seq += 1;
        let seq = state.next_seq;
        let frame = request.encode();
        state.pending = Some(Pending {
            seq,
            route,
            frame: frame.clone(),
            expected_words: request.expected_reply_words(),
            outcome: None,
        });
        Some((seq, frame))
    }

    /// Whether transaction `seq` is still waiting for its outcome.
    pub(crate) fn is_live(&self, seq: u64) -> bool {
        self.state()
            .pending
            .as_ref()
            .is_some_and(|p| p.seq == seq && p.outcome.is_none())
    }

    /// Completes transaction `seq` with a send failure.
    pub(crate) fn fail(&self, seq: u64, error: io::Error) {
        let mut state = self.state();
        if let Some(p) = state.pending.as_mut()
            && p.seq == seq
            && p.outcome.is_none()
        {
            p.outcome = Some(Outcome::SendFailed(error));
            drop(state);
            self.done.notify_all();
        }
    }

    /// Offers a control-candidate frame received on `route`.
    ///
    /// On a match the outcome is recorded, `resp` is bumped and the waiting
    /// caller is woken.
    pub(crate) fn try_complete(&self, route: Route, words: &[u32], resp: &AtomicU64) -> MatchResult {
        let mut state = self.state();
        let Some(pending) = state.pending.as_mut().filter(|p| p.outcome.is_none()) else {
            return MatchResult::NoTransaction;
        };
        if pending.route.dest_key() != route.dest_key() {
            return MatchResult::WrongDestination {
                expected: pending.route.dest_key(),
                actual: route.dest_key(),
            };
        }
        match RegisterReply::parse(&pending.frame, pending.expected_words, words) {
            Ok(reply) => {
                pending.outcome = Some(Outcome::Reply(reply));
                LinkCounters::bump(resp);
                drop(state);
                self.done.notify_all();
                MatchResult::Completed
            }
            Err(e) => MatchResult::Mismatch(e),
        }
    }

    /// Waits for the outcome of `seq` and empties the slot.
    ///
    /// The slot is emptied on timeout too, so a late reply cannot complete
    /// a later transaction through this one. A timeout too large to form a
    /// deadline waits until the outcome arrives or the link closes.
    pub(crate) fn wait(
        &self,
        _issue: &IssueGuard<'_>,
        seq: u64,
        timeout: Duration,
    ) -> Result<Outcome, WaitError> {
        let deadline = deadline_after(timeout);
        let mut state = self.state();
        loop {
            let ready = state
                .pending
                .as_ref()
                .is_some_and(|p| p.seq == seq && p.outcome.is_some());
            if ready {
                let outcome = state.pending.take().and_then(|p| p.outcome);
                return outcome.ok_or(WaitError::Closed);
            }
            if state.closed {
                state.pending = None;
                return Err(WaitError::Closed);
            }
            state = match deadline {
                None => self.done.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        state.pending = None;
                        return Err(WaitError::TimedOut);
                    }
                    self.done
                        .wait_timeout(state, dl - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Marks the link closed and wakes any waiting caller.
    pub(crate) fn close(&self) {
        self.state().closed = true;
        self.done.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn has_pending(&self) -> bool {
        self.state().pending.is_some()
    }
}
