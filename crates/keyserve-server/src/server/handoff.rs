//! Delivery handoff from worker threads back to the reactor.
//!
//! Workers never touch sockets. When a subject settles they push one
//! [`PendingDelivery`] per waiting connection into the [`Handoff`] queue and
//! wake the reactor's blocked `poll`. The reactor drains the whole queue at the
//! top of every iteration.
//!
//! The wakeup is issued after the push, so a delivery enqueued while the
//! reactor is between draining and polling still leaves the waker armed and
//! the next `poll` returns immediately.

use bytes::Bytes;
use mio::{Token, Waker};
use parking_lot::Mutex;
use std::sync::Arc;

/// What the reactor should do with a connection once its subject settles.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Attach this framed response and start writing it.
    Respond(Bytes),
    /// Close the connection without writing anything.
    Close,
}

/// A settled outcome bound to one connection.
#[derive(Clone, Debug)]
pub struct PendingDelivery {
    pub token: Token,
    pub outcome: Outcome,
}

/// Mutex-guarded list appended by workers and drained by the reactor, paired
/// with the reactor's [`Waker`].
pub struct Handoff {
    queue: Mutex<Vec<PendingDelivery>>,
    waker: Arc<Waker>,
}

impl Handoff {
    pub fn new(waker: Arc<Waker>) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            waker,
        }
    }

    /// Enqueues `outcome` for every waiter, in order, then wakes the reactor
    /// once.
    ///
    /// Each [`Outcome::Respond`] clone shares the same frame allocation but
    /// carries its own read cursor.
    pub fn deliver(&self, waiters: Vec<Token>, outcome: &Outcome) {
        if waiters.is_empty() {
            return;
        }

        {
            let mut queue = self.queue.lock();
            queue.extend(waiters.into_iter().map(|token| PendingDelivery {
                token,
                outcome: outcome.clone(),
            }));
        }

        self.wake();
    }

    /// Wakes the reactor's `poll` without enqueueing anything.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::error!("Failed to wake reactor: {e}");
        }
    }

    /// Takes every queued delivery, oldest first.
    pub fn drain(&self) -> Vec<PendingDelivery> {
        core::mem::take(&mut *self.queue.lock())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use mio::{Events, Poll};

    const WAKE: Token = Token(7);

    fn handoff() -> (Poll, Handoff) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKE).unwrap());
        (poll, Handoff::new(waker))
    }

    #[test]
    fn deliver_wakes_poll_and_drains_in_order() {
        let (mut poll, handoff) = handoff();
        let frame = Bytes::from_static(b"frame");

        handoff.deliver(vec![Token(3), Token(5)], &Outcome::Respond(frame.clone()));

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKE));

        let drained = handoff.drain();
        let tokens: Vec<_> = drained.iter().map(|d| d.token).collect();
        assert_eq!(tokens, vec![Token(3), Token(5)]);
        for delivery in drained {
            assert!(matches!(delivery.outcome, Outcome::Respond(ref b) if *b == frame));
        }
        assert!(handoff.is_empty());
    }

    #[test]
    fn empty_delivery_is_a_no_op() {
        let (mut poll, handoff) = handoff();
        handoff.deliver(Vec::new(), &Outcome::Close);
        assert!(handoff.is_empty());

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn deliveries_from_many_threads_are_all_kept() {
        let (_poll, handoff) = handoff();
        let handoff = Arc::new(handoff);

        std::thread::scope(|s| {
            for t in 0..8 {
                let handoff = Arc::clone(&handoff);
                s.spawn(move || {
                    let waiters = (0..100).map(|i| Token(t * 1000 + i)).collect();
                    handoff.deliver(waiters, &Outcome::Close);
                });
            }
        });

        assert_eq!(handoff.drain().len(), 800);
    }
}
