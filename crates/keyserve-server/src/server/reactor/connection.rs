use bytes::{Buf, Bytes};
use keyserve_core::{NameDecoder, Result};
use mio::{Interest, Registry, Token, net::TcpStream};
use std::{
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
};

const READ_CHUNK: usize = 4096;

/// Where a connection is in its single request/response exchange.
#[derive(Debug)]
pub enum Phase {
    /// Accumulating the subject name.
    Reading,
    /// Name received; waiting for the subject to settle.
    Awaiting,
    /// Writing the response frame. The buffer holds only the unsent tail.
    Writing(Bytes),
}

/// What a read pass produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// The subject name, the one time the terminator is seen.
    pub name: Option<String>,
    /// The peer closed its side.
    pub eof: bool,
}

/// What a write pass achieved.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteProgress {
    /// The whole response has been written.
    Done,
    /// The socket is full; wait for writability.
    Blocked,
    /// Nothing to write.
    Idle,
}

/// Per-client state owned by the reactor.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: NameDecoder,
    name: Option<String>,
    phase: Phase,
    interest: Interest,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_name_len: usize) -> Self {
        Self {
            stream,
            peer,
            decoder: NameDecoder::new(max_name_len),
            name: None,
            phase: Phase::Reading,
            interest: Interest::READABLE,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.phase, Phase::Awaiting)
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Reads until the socket would block or the peer closes.
    ///
    /// Bytes are fed to the name decoder while the connection is still
    /// [`Phase::Reading`]; anything after the terminator, or arriving in a
    /// later phase, is read and dropped.
    ///
    /// # Errors
    ///
    /// Propagates protocol violations from the decoder and any socket error
    /// other than `WouldBlock`/`Interrupted`.
    pub fn read(&mut self) -> Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        let mut chunk = [0_u8; READ_CHUNK];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    if matches!(self.phase, Phase::Reading) && !self.decoder.is_complete() {
                        if let Some(name) = self.decoder.feed(&chunk[..n])? {
                            self.name = Some(name.clone());
                            outcome.name = Some(name);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(outcome)
    }

    /// Marks the connection as waiting for its subject to settle.
    pub fn await_response(&mut self) {
        self.phase = Phase::Awaiting;
    }

    /// Attaches the framed response. The frame is shared; only this
    /// connection's cursor advances as it is written.
    pub fn attach(&mut self, frame: Bytes) {
        self.phase = Phase::Writing(frame);
    }

    /// Writes as much of the attached response as the socket accepts.
    ///
    /// # Errors
    ///
    /// Returns any socket error other than `WouldBlock`/`Interrupted`. A
    /// zero-length write is reported as `WriteZero`.
    pub fn write(&mut self) -> Result<WriteProgress> {
        let Phase::Writing(frame) = &mut self.phase else {
            return Ok(WriteProgress::Idle);
        };

        while frame.has_remaining() {
            match self.stream.write(frame.chunk()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "peer accepted no response bytes",
                    )
                    .into());
                }
                Ok(n) => frame.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(WriteProgress::Blocked),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(WriteProgress::Done)
    }

    /// Re-registers with `interest` if it differs from the current one.
    pub fn set_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        if self.interest != interest {
            registry.reregister(&mut self.stream, token, interest)?;
            self.interest = interest;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use keyserve_core::Error;
    use std::{net, time::Instant};

    fn pair(max_name_len: usize) -> (Connection, net::TcpStream) {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (
            Connection::new(TcpStream::from_std(server), peer, max_name_len),
            client,
        )
    }

    /// Reads until `done` holds for the outcome, since bytes land
    /// asynchronously on the non-blocking side.
    fn read_until(
        conn: &mut Connection,
        mut done: impl FnMut(&Result<ReadOutcome>) -> bool,
    ) -> Result<ReadOutcome> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let outcome = conn.read();
            if done(&outcome) || Instant::now() > deadline {
                return outcome;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn assembles_a_name_split_across_writes() {
        let (mut conn, mut client) = pair(64);

        client.write_all(b"ali").unwrap();
        let first = read_until(&mut conn, |_| true).unwrap();
        assert_eq!(first.name, None);

        client.write_all(b"ce\0trailing").unwrap();
        let outcome = read_until(&mut conn, |o| matches!(o, Ok(o) if o.name.is_some())).unwrap();
        assert_eq!(outcome.name.as_deref(), Some("alice"));
        assert_eq!(conn.name(), Some("alice"));
        assert!(matches!(conn.phase(), Phase::Reading));
    }

    #[test]
    fn reports_peer_close() {
        let (mut conn, client) = pair(64);
        drop(client);

        let outcome = read_until(&mut conn, |o| matches!(o, Ok(o) if o.eof)).unwrap();
        assert!(outcome.eof);
        assert_eq!(outcome.name, None);
    }

    #[test]
    fn over_long_name_is_a_protocol_error() {
        let (mut conn, mut client) = pair(8);
        client.write_all(b"this-name-is-too-long").unwrap();

        let outcome = read_until(&mut conn, Result::is_err);
        assert!(matches!(outcome, Err(Error::NameTooLong { max: 8, .. })));
    }

    #[test]
    fn writes_the_attached_frame() {
        let (mut conn, mut client) = pair(64);
        assert_eq!(conn.write().unwrap(), WriteProgress::Idle);

        let frame = Bytes::from_static(b"\0\0\0\x01K\0\0\0\x01C");
        conn.attach(frame.clone());
        assert_eq!(conn.write().unwrap(), WriteProgress::Done);

        let mut received = vec![0_u8; frame.len()];
        client.read_exact(&mut received).unwrap();
        assert_eq!(received, frame);
    }

    #[test]
    fn stalled_peer_blocks_the_write_and_resumes_at_the_cursor() {
        let (mut conn, mut client) = pair(64);

        // Larger than the loopback send and receive buffers combined.
        let frame: Bytes = (0..32 * 1024 * 1024_usize)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<_>>()
            .into();
        conn.attach(frame.clone());
        assert_eq!(conn.write().unwrap(), WriteProgress::Blocked);
        assert!(matches!(conn.phase(), Phase::Writing(rest) if rest.len() < frame.len()));

        let len = frame.len();
        let reader = std::thread::spawn(move || {
            let mut received = vec![0_u8; len];
            client.read_exact(&mut received).unwrap();
            received
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while conn.write().unwrap() != WriteProgress::Done {
            assert!(Instant::now() < deadline, "write never completed");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(reader.join().unwrap(), frame);
    }

    #[test]
    fn awaiting_connection_ignores_further_bytes() {
        let (mut conn, mut client) = pair(64);
        client.write_all(b"bob\0").unwrap();
        read_until(&mut conn, |o| matches!(o, Ok(o) if o.name.is_some())).unwrap();
        conn.await_response();
        assert!(conn.is_awaiting());

        client.write_all(b"carol\0").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let outcome = conn.read().unwrap();
        assert_eq!(outcome.name, None);
        assert_eq!(conn.name(), Some("bob"));
    }
}
