//! Single-threaded readiness loop owning every socket.
//!
//! The [`Reactor`] accepts clients, reads subject names, asks the
//! [`Registry`] to join or start a computation, and writes response frames.
//! It never blocks on anything but `poll`, and it is the only thread that
//! touches a socket.
//!
//! Every iteration first drains the [`Handoff`] queue, then handles readiness
//! events. Tokens are handed out from a monotonically increasing counter and
//! never reused, so a delivery for a connection that has gone away can never
//! land on a newer one.
//!
//! - [`connection`] - Per-client state and the non-blocking read/write passes.

pub mod connection;

use crate::server::{
    handoff::{Handoff, Outcome, PendingDelivery},
    registry::{Join, Registry},
    telemetry::{
        decrement_connections_open, increment_connections_accepted, increment_connections_open,
        increment_deliveries_discarded, increment_deliveries_written,
        increment_protocol_violations,
    },
};
use connection::{Connection, ReadOutcome, WriteProgress};
use keyserve_core::{Error, Result};
use mio::{Events, Interest, Poll, Token, event::Event, net::TcpListener};
use core::time::Duration;
use std::{collections::HashMap, io::ErrorKind, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Token of the listening socket.
pub const LISTENER: Token = Token(0);
/// Token of the cross-thread [`mio::Waker`].
pub const WAKER: Token = Token(1);

const FIRST_CONNECTION: usize = 2;

/// How long to wait before accepting again after a listener error such as
/// running out of file descriptors.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// What `accept_all` does after a failed `accept`.
#[derive(Debug, PartialEq, Eq)]
enum AcceptStep {
    /// The backlog is empty.
    Done,
    /// Only the pending connection was affected; keep accepting.
    Continue,
    /// The listener itself is failing; retry after [`ACCEPT_RETRY`].
    Backoff,
}

fn accept_step(kind: ErrorKind) -> AcceptStep {
    match kind {
        ErrorKind::WouldBlock => AcceptStep::Done,
        ErrorKind::Interrupted | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
            AcceptStep::Continue
        }
        _ => AcceptStep::Backoff,
    }
}

pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    registry: Arc<Registry>,
    handoff: Arc<Handoff>,
    shutdown: CancellationToken,
    max_name_len: usize,
    events_capacity: usize,
    accept_retry: bool,
}

impl Reactor {
    /// Registers `listener` with `poll` and builds the reactor.
    ///
    /// The waker feeding `handoff` must already be registered on `poll` under
    /// [`WAKER`].
    pub fn new(
        poll: Poll,
        mut listener: TcpListener,
        registry: Arc<Registry>,
        handoff: Arc<Handoff>,
        shutdown: CancellationToken,
        max_name_len: usize,
        events_capacity: usize,
    ) -> Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
            registry,
            handoff,
            shutdown,
            max_name_len,
            events_capacity,
            accept_retry: false,
        })
    }

    /// Runs until the shutdown token is cancelled and the waker fires.
    ///
    /// # Errors
    ///
    /// Only a failing `poll` ends the loop with an error. Anything that goes
    /// wrong on a single connection closes that connection and nothing else.
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);
        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            "Reactor running"
        );

        loop {
            // The listener is edge-triggered, so a backlog left behind by a
            // failed accept produces no new event and has to be retried here.
            let timeout = self.accept_retry.then_some(ACCEPT_RETRY);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("Poll failed: {e}");
                return Err(e.into());
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            self.drain_handoff();

            if core::mem::take(&mut self.accept_retry) {
                self.accept_all();
            }

            for event in &events {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {}
                    token => self.dispatch(token, event),
                }
            }
        }

        tracing::info!(open = self.connections.len(), "Reactor stopping");
        let tokens: Vec<_> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, "shutdown");
        }
        Ok(())
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.on_readable(token);
        }
        if event.is_writable() {
            self.on_writable(token);
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!(%peer, "Failed to register connection: {e}");
                        continue;
                    }

                    increment_connections_accepted();
                    increment_connections_open();
                    tracing::debug!(token = token.0, %peer, "Accepted connection");
                    self.connections
                        .insert(token, Connection::new(stream, peer, self.max_name_len));
                }
                Err(e) => match accept_step(e.kind()) {
                    AcceptStep::Done => break,
                    AcceptStep::Continue => {
                        tracing::debug!("Transient accept error: {e}");
                    }
                    AcceptStep::Backoff => {
                        tracing::error!("Accept failed, retrying in {ACCEPT_RETRY:?}: {e}");
                        self.accept_retry = true;
                        break;
                    }
                },
            }
        }
    }

    fn on_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        match conn.read() {
            Ok(ReadOutcome { name, eof }) => {
                if let Some(name) = name {
                    self.request(token, &name);
                }
                if eof {
                    // A peer that closes before its response is written has
                    // abandoned the request; any later delivery is dropped.
                    self.close(token, "peer closed");
                }
            }
            Err(e @ (Error::NameTooLong { .. } | Error::InvalidName { .. })) => {
                increment_protocol_violations();
                tracing::warn!(token = token.0, peer = %conn.peer(), "Protocol violation: {e}");
                self.close(token, "protocol violation");
            }
            Err(e) => {
                tracing::debug!(token = token.0, "Read failed: {e}");
                self.close(token, "read error");
            }
        }
    }

    fn request(&mut self, token: Token, name: &str) {
        let join = self.registry.request_or_join(name, token);
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        match join {
            Join::Waiting => conn.await_response(),
            Join::Ready(frame) => {
                conn.attach(frame);
                self.on_writable(token);
            }
            Join::Failed(e) => {
                tracing::debug!(token = token.0, name, "Subject already failed: {e}");
                self.close(token, "subject failed");
            }
        }
    }

    fn on_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        match conn.write() {
            Ok(WriteProgress::Done) => {
                increment_deliveries_written();
                self.close(token, "delivered");
            }
            Ok(WriteProgress::Blocked) => {
                let interest = Interest::READABLE | Interest::WRITABLE;
                if let Err(e) = conn.set_interest(self.poll.registry(), token, interest) {
                    tracing::warn!(token = token.0, "Failed to reregister: {e}");
                    self.close(token, "reregister failed");
                }
            }
            Ok(WriteProgress::Idle) => {
                if let Err(e) = conn.set_interest(self.poll.registry(), token, Interest::READABLE) {
                    tracing::warn!(token = token.0, "Failed to reregister: {e}");
                    self.close(token, "reregister failed");
                }
            }
            Err(e) => {
                tracing::debug!(token = token.0, "Write failed: {e}");
                self.close(token, "write error");
            }
        }
    }

    /// Applies every queued outcome to its connection.
    ///
    /// A delivery is only applied to a live connection that is still waiting
    /// for it; anything else is dropped.
    fn drain_handoff(&mut self) {
        for PendingDelivery { token, outcome } in self.handoff.drain() {
            let Some(conn) = self
                .connections
                .get_mut(&token)
                .filter(|conn| conn.is_awaiting())
            else {
                increment_deliveries_discarded();
                tracing::trace!(token = token.0, "Discarding delivery for departed connection");
                continue;
            };

            match outcome {
                Outcome::Respond(frame) => {
                    conn.attach(frame);
                    self.on_writable(token);
                }
                Outcome::Close => self.close(token, "generation failed"),
            }
        }
    }

    fn close(&mut self, token: Token, reason: &'static str) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            tracing::trace!(token = token.0, "Deregister failed: {e}");
        }
        decrement_connections_open();
        tracing::debug!(
            token = token.0,
            peer = %conn.peer(),
            name = conn.name(),
            reason,
            "Closed connection"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_backlog_ends_the_accept_pass() {
        assert_eq!(accept_step(ErrorKind::WouldBlock), AcceptStep::Done);
    }

    #[test]
    fn per_connection_errors_keep_accepting() {
        for kind in [
            ErrorKind::Interrupted,
            ErrorKind::ConnectionAborted,
            ErrorKind::ConnectionReset,
        ] {
            assert_eq!(accept_step(kind), AcceptStep::Continue, "{kind:?}");
        }
    }

    #[test]
    fn listener_errors_schedule_a_retry() {
        // EMFILE and ENFILE surface as uncategorised OS errors.
        let emfile = std::io::Error::from_raw_os_error(24);
        assert_eq!(accept_step(emfile.kind()), AcceptStep::Backoff);
        assert_eq!(accept_step(ErrorKind::OutOfMemory), AcceptStep::Backoff);
    }
}
