use crate::server::handoff::{Handoff, Outcome};
use bytes::Bytes;
use keyserve_core::{Error, Result};
use mio::Token;
use parking_lot::Mutex;

/// Completion state of a subject.
#[derive(Clone, Debug)]
pub enum Status {
    /// A generation job is scheduled or running.
    Pending,
    /// Generation succeeded; holds the encoded response frame.
    Completed(Bytes),
    /// Generation failed. Terminal: the name is never retried.
    Failed(Error),
}

/// Result of joining a subject's computation.
#[derive(Debug)]
pub enum Join {
    /// The connection is registered and will receive a [`PendingDelivery`]
    /// when the subject settles.
    ///
    /// [`PendingDelivery`]: crate::server::handoff::PendingDelivery
    Waiting,
    /// Already completed; serve this frame now.
    Ready(Bytes),
    /// Already failed; close the connection.
    Failed(Error),
}

#[derive(Debug)]
struct State {
    status: Status,
    waiters: Vec<Token>,
}

/// The single in-flight-or-completed computation for one subject name.
///
/// Joining and settling take the same lock, so a connection either lands in
/// the waiter list before the subject settles (and is included in the
/// fan-out) or observes the settled status itself. No join can fall between
/// the two.
#[derive(Debug)]
pub struct PendingComputation {
    name: String,
    state: Mutex<State>,
}

impl PendingComputation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                status: Status::Pending,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `waiter`, or reports the settled outcome if there is one.
    ///
    /// Joining twice with the same token registers it once.
    pub fn join(&self, waiter: Token) -> Join {
        let mut state = self.state.lock();
        match &state.status {
            Status::Pending => {
                if !state.waiters.contains(&waiter) {
                    state.waiters.push(waiter);
                }
                Join::Waiting
            }
            Status::Completed(frame) => Join::Ready(frame.clone()),
            Status::Failed(e) => Join::Failed(e.clone()),
        }
    }

    /// Records the outcome and fans it out to every current waiter through
    /// `handoff`.
    ///
    /// Only the first call has any effect; the waiter list is cleared as it
    /// is handed off.
    pub fn settle(&self, result: Result<Bytes>, handoff: &Handoff) {
        let (waiters, outcome) = {
            let mut state = self.state.lock();
            if !matches!(state.status, Status::Pending) {
                tracing::warn!(name = %self.name, "Ignoring second settlement");
                return;
            }

            let outcome = match result {
                Ok(frame) => {
                    state.status = Status::Completed(frame.clone());
                    Outcome::Respond(frame)
                }
                Err(e) => {
                    state.status = Status::Failed(e);
                    Outcome::Close
                }
            };
            (core::mem::take(&mut state.waiters), outcome)
        };

        tracing::debug!(name = %self.name, waiters = waiters.len(), "Fanning out outcome");
        handoff.deliver(waiters, &outcome);
    }

    pub fn status(&self) -> Status {
        self.state.lock().status.clone()
    }

    /// Number of connections currently waiting.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Waker};
    use std::sync::Arc;

    fn handoff() -> (Poll, Handoff) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(1)).unwrap());
        (poll, Handoff::new(waker))
    }

    #[test]
    fn duplicate_join_registers_once() {
        let entry = PendingComputation::new("alice");
        assert!(matches!(entry.join(Token(4)), Join::Waiting));
        assert!(matches!(entry.join(Token(4)), Join::Waiting));
        assert_eq!(entry.waiting(), 1);
    }

    #[test]
    fn settle_fans_out_then_serves_late_joiners() {
        let (_poll, handoff) = handoff();
        let entry = PendingComputation::new("alice");
        entry.join(Token(4));
        entry.join(Token(5));

        let frame = Bytes::from_static(b"frame");
        entry.settle(Ok(frame.clone()), &handoff);

        assert_eq!(handoff.drain().len(), 2);
        assert_eq!(entry.waiting(), 0);
        assert!(matches!(entry.join(Token(6)), Join::Ready(ref f) if *f == frame));
        assert!(handoff.is_empty());
    }

    #[test]
    fn only_the_first_settlement_counts() {
        let (_poll, handoff) = handoff();
        let entry = PendingComputation::new("bob");
        entry.join(Token(4));

        entry.settle(Err(Error::ServiceShutdown), &handoff);
        entry.settle(Ok(Bytes::from_static(b"late")), &handoff);

        let deliveries = handoff.drain();
        assert_eq!(deliveries.len(), 1);
        assert!(matches!(deliveries[0].outcome, Outcome::Close));
        assert!(matches!(entry.status(), Status::Failed(Error::ServiceShutdown)));
    }
}
