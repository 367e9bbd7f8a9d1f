use std::io::{self, Read, Write};

use rustls::{ClientConnection, Connection, ServerConnection};
use tracing::{debug, trace};

use super::tls::{peer_identity, TlsContext};
use super::TransportError;
use crate::keys::{IdentityDigest, IdentityKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Established,
    /// We sent close_notify and are waiting for the peer's.
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// close_notify is queued or sent; call again to wait for the peer.
    Sent,
    Complete,
}

/// One TLS connection over a non-blocking stream `S`. Every operation either
/// makes progress or returns [`TransportError::WantRead`] /
/// [`TransportError::WantWrite`]; retry the same call once the stream is ready.
pub struct TransportSession<S> {
    conn: Connection,
    stream: S,
    role: Role,
    state: SessionState,
    expected: Option<IdentityDigest>,
    peer: Option<IdentityKey>,
    peer_closed: bool,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S> std::fmt::Debug for TransportSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl<S: Read + Write> TransportSession<S> {
    pub fn accept(ctx: &TlsContext, stream: S) -> Result<Self, TransportError> {
        let conn = ServerConnection::new(ctx.server.clone())?;
        Ok(Self::new(Connection::Server(conn), stream, Role::Acceptor, None))
    }

    /// Starts a handshake with a peer that must prove it holds `expected`.
    pub fn connect(
        ctx: &TlsContext,
        stream: S,
        expected: IdentityDigest,
    ) -> Result<Self, TransportError> {
        let conn = ClientConnection::new(ctx.client.clone(), TlsContext::server_name()?)?;
        Ok(Self::new(
            Connection::Client(conn),
            stream,
            Role::Initiator,
            Some(expected),
        ))
    }

    fn new(conn: Connection, stream: S, role: Role, expected: Option<IdentityDigest>) -> Self {
        Self {
            conn,
            stream,
            role,
            state: SessionState::Handshaking,
            expected,
            peer: None,
            peer_closed: false,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Verified peer identity. Always set for an initiator once established;
    /// set for an acceptor only if the initiator presented a chain.
    pub fn peer_identity(&self) -> Option<&IdentityKey> {
        self.peer.as_ref()
    }

    pub fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        self.conn.negotiated_cipher_suite()
    }

    /// Raw bytes moved over the stream, TLS framing included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bounds how much unsent data the session buffers; `write` accepts no
    /// more than fits.
    pub fn set_send_limit(&mut self, limit: Option<usize>) {
        self.conn.set_buffer_limit(limit);
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        debug!(role = ?self.role, error = %err, "transport session failed");
        self.state = SessionState::Failed;
        err
    }

    fn write_tls(&mut self) -> Result<(), TransportError> {
        match self.conn.write_tls(&mut self.stream) {
            Ok(0) => Err(self.fail(io::Error::from(io::ErrorKind::WriteZero).into())),
            Ok(n) => {
                self.bytes_written += n as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportError::WantWrite),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    fn flush_tls(&mut self) -> Result<(), TransportError> {
        while self.conn.wants_write() {
            self.write_tls()?;
        }
        Ok(())
    }

    /// Feeds the stream into rustls. Returns the bytes read; 0 means EOF.
    fn read_tls(&mut self) -> Result<usize, TransportError> {
        let n = match self.conn.read_tls(&mut self.stream) {
            Ok(0) => return Ok(0),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(TransportError::WantRead)
            }
            Err(e) => return Err(self.fail(e.into())),
        };
        self.bytes_read += n as u64;

        match self.conn.process_new_packets() {
            Ok(io_state) => {
                if io_state.peer_has_closed() {
                    self.peer_closed = true;
                }
                Ok(n)
            }
            Err(e) => {
                // Send the alert rustls queued, if the stream allows.
                let _ = self.flush_tls();
                let err = if self.state == SessionState::Handshaking {
                    TransportError::HandshakeFailed(e.to_string())
                } else {
                    TransportError::Tls(e)
                };
                Err(self.fail(err))
            }
        }
    }

    pub fn handshake(&mut self) -> Result<(), TransportError> {
        match self.state {
            SessionState::Handshaking => {}
            SessionState::Established => return Ok(()),
            other => return Err(TransportError::InvalidState(other)),
        }
        loop {
            self.flush_tls()?;
            if !self.conn.is_handshaking() {
                break;
            }
            if self.read_tls()? == 0 {
                return Err(self.fail(TransportError::HandshakeFailed(
                    "peer closed the connection during the handshake".to_string(),
                )));
            }
        }
        self.establish()
    }

    fn establish(&mut self) -> Result<(), TransportError> {
        self.peer = self.conn.peer_certificates().and_then(peer_identity);

        if let Some(expected) = self.expected {
            let actual = self.peer.as_ref().map(IdentityKey::digest);
            match actual {
                Some(actual) if actual.matches(&expected) => {}
                Some(actual) => {
                    self.conn.send_close_notify();
                    let _ = self.flush_tls();
                    return Err(self.fail(TransportError::IdentityMismatch { expected, actual }));
                }
                None => {
                    return Err(self.fail(TransportError::HandshakeFailed(
                        "peer presented no identity".to_string(),
                    )))
                }
            }
        }

        self.state = SessionState::Established;
        debug!(
            role = ?self.role,
            peer = ?self.peer.as_ref().map(IdentityKey::digest),
            "transport session established"
        );
        Ok(())
    }

    /// Reads decrypted data. `Ok(0)` means the peer closed cleanly with
    /// close_notify; EOF without it is [`TransportError::PeerClosed`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.state {
            SessionState::Handshaking => self.handshake()?,
            SessionState::Established | SessionState::Closing => {}
            SessionState::Closed => return Ok(0),
            SessionState::Failed => return Err(TransportError::InvalidState(self.state)),
        }
        loop {
            let plaintext = self.conn.reader().read(buf);
            match plaintext {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(self.fail(TransportError::PeerClosed))
                }
                Err(e) => return Err(self.fail(e.into())),
            }
            if self.read_tls()? == 0 && !self.peer_closed {
                return Err(self.fail(TransportError::PeerClosed));
            }
        }
    }

    /// Encrypts as much of `buf` as the send limit allows and returns how
    /// much was taken. Returns `WantWrite` only if nothing was taken.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        match self.state {
            SessionState::Handshaking => self.handshake()?,
            SessionState::Established => {}
            other => return Err(TransportError::InvalidState(other)),
        }
        match self.flush_tls() {
            Ok(()) | Err(TransportError::WantWrite) => {}
            Err(e) => return Err(e),
        }
        let written = self.conn.writer().write(buf);
        let accepted = written.map_err(|e| self.fail(e.into()))?;
        match self.flush_tls() {
            Ok(()) | Err(TransportError::WantWrite) => {}
            Err(e) => return Err(e),
        }
        if accepted == 0 && !buf.is_empty() {
            return Err(TransportError::WantWrite);
        }
        trace!(accepted, requested = buf.len(), "session write");
        Ok(accepted)
    }

    /// Pushes every buffered record to the stream.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.flush_tls()?;
        match self.stream.flush() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportError::WantWrite),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Two-phase close. The first call queues close_notify and returns
    /// `Sent`; later calls return `Complete` once the peer's close_notify or
    /// EOF arrives.
    pub fn shutdown(&mut self) -> Result<ShutdownStatus, TransportError> {
        match self.state {
            SessionState::Established => {
                self.conn.send_close_notify();
                self.state = SessionState::Closing;
                match self.flush_tls() {
                    Ok(()) | Err(TransportError::WantWrite) => Ok(ShutdownStatus::Sent),
                    Err(e) => Err(e),
                }
            }
            SessionState::Closing => {
                self.flush_tls()?;
                let mut scratch = [0u8; 4096];
                loop {
                    // Anything still in flight from the peer is discarded.
                    while let Ok(n) = self.conn.reader().read(&mut scratch) {
                        if n == 0 {
                            break;
                        }
                    }
                    if self.peer_closed {
                        self.state = SessionState::Closed;
                        return Ok(ShutdownStatus::Complete);
                    }
                    if self.read_tls()? == 0 {
                        self.state = SessionState::Closed;
                        return Ok(ShutdownStatus::Complete);
                    }
                }
            }
            SessionState::Closed => Ok(ShutdownStatus::Complete),
            other => Err(TransportError::InvalidState(other)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::{KeyEpoch, NodeIdentity};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    #[derive(Default)]
    struct Buffer {
        data: VecDeque<u8>,
        closed: bool,
    }

    /// One end of an in-memory non-blocking byte pipe.
    pub(crate) struct PipeEnd {
        incoming: Arc<Mutex<Buffer>>,
        outgoing: Arc<Mutex<Buffer>>,
        capacity: usize,
    }

    impl PipeEnd {
        /// Peer sees EOF once it has drained what was sent.
        pub(crate) fn close(&self) {
            self.outgoing.lock().unwrap().closed = true;
        }
    }

    pub(crate) fn pipe(capacity: usize) -> (PipeEnd, PipeEnd) {
        let a = Arc::new(Mutex::new(Buffer::default()));
        let b = Arc::new(Mutex::new(Buffer::default()));
        (
            PipeEnd {
                incoming: a.clone(),
                outgoing: b.clone(),
                capacity,
            },
            PipeEnd {
                incoming: b,
                outgoing: a,
                capacity,
            },
        )
    }

    impl Read for PipeEnd {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut incoming = self.incoming.lock().unwrap();
            if incoming.data.is_empty() {
                return if incoming.closed {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(incoming.data.len());
            for (slot, byte) in buf.iter_mut().zip(incoming.data.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for PipeEnd {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut outgoing = self.outgoing.lock().unwrap();
            let room = self.capacity.saturating_sub(outgoing.data.len());
            if room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = room.min(buf.len());
            outgoing.data.extend(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn context(identity: &NodeIdentity) -> TlsContext {
        let now = SystemTime::now();
        let epoch = KeyEpoch::generate(
            crate::keys::EpochId(1),
            now - Duration::from_secs(60),
            now + Duration::from_secs(3600),
            identity,
        )
        .unwrap();
        TlsContext::new(epoch.transport()).unwrap()
    }

    /// Alternates both handshakes until neither side is blocked.
    fn drive_handshake(
        client: &mut TransportSession<PipeEnd>,
        server: &mut TransportSession<PipeEnd>,
    ) -> (Result<(), TransportError>, Result<(), TransportError>) {
        for _ in 0..64 {
            let c = client.handshake();
            let s = server.handshake();
            let blocked = |r: &Result<(), TransportError>| {
                matches!(r, Err(e) if e.would_block())
            };
            if !blocked(&c) && !blocked(&s) {
                return (c, s);
            }
            if !blocked(&c) && c.is_err() || !blocked(&s) && s.is_err() {
                return (c, s);
            }
        }
        panic!("handshake did not converge");
    }

    fn established_pair(
        capacity: usize,
    ) -> (
        TransportSession<PipeEnd>,
        TransportSession<PipeEnd>,
        NodeIdentity,
        NodeIdentity,
    ) {
        let client_identity = NodeIdentity::generate().unwrap();
        let server_identity = NodeIdentity::generate().unwrap();
        let (a, b) = pipe(capacity);
        let mut client =
            TransportSession::connect(&context(&client_identity), a, server_identity.digest())
                .unwrap();
        let mut server = TransportSession::accept(&context(&server_identity), b).unwrap();
        let (c, s) = drive_handshake(&mut client, &mut server);
        c.unwrap();
        s.unwrap();
        (client, server, client_identity, server_identity)
    }

    #[test]
    fn handshake_exposes_both_identities() {
        let (client, server, client_identity, server_identity) = established_pair(1 << 20);
        assert_eq!(client.state(), SessionState::Established);
        assert_eq!(
            client.peer_identity().unwrap().digest(),
            server_identity.digest()
        );
        assert_eq!(
            server.peer_identity().unwrap().digest(),
            client_identity.digest()
        );
        let suite = client.negotiated_cipher_suite().unwrap();
        assert_eq!(
            suite.suite(),
            rustls::CipherSuite::TLS13_AES_256_GCM_SHA384
        );
        assert!(client.bytes_written() > 0 && server.bytes_read() > 0);
    }

    #[test]
    fn wrong_identity_is_refused() {
        let client_identity = NodeIdentity::generate().unwrap();
        let server_identity = NodeIdentity::generate().unwrap();
        let someone_else = NodeIdentity::generate().unwrap();
        let (a, b) = pipe(1 << 20);
        let mut client =
            TransportSession::connect(&context(&client_identity), a, someone_else.digest())
                .unwrap();
        let mut server = TransportSession::accept(&context(&server_identity), b).unwrap();
        let (c, _) = drive_handshake(&mut client, &mut server);
        assert!(matches!(c, Err(TransportError::IdentityMismatch { .. })));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[test]
    fn handshake_blocks_with_want_read_before_peer_answers() {
        let identity = NodeIdentity::generate().unwrap();
        let (a, _b) = pipe(1 << 20);
        let mut client =
            TransportSession::connect(&context(&identity), a, identity.digest()).unwrap();
        assert!(matches!(client.handshake(), Err(TransportError::WantRead)));
        assert_eq!(client.state(), SessionState::Handshaking);
    }

    #[test]
    fn partial_writes_deliver_everything_in_order() {
        let (mut client, mut server, _, _) = established_pair(8 * 1024);
        client.set_send_limit(Some(16 * 1024));
        let message: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut sent = 0;
        let mut received = Vec::new();
        let mut saw_short_write = false;
        let mut buf = vec![0u8; 32 * 1024];
        while received.len() < message.len() {
            if sent < message.len() {
                match client.write(&message[sent..]) {
                    Ok(n) => {
                        if n < message.len() - sent {
                            saw_short_write = true;
                        }
                        sent += n;
                    }
                    Err(TransportError::WantWrite) => saw_short_write = true,
                    Err(e) => panic!("write failed: {e}"),
                }
            }
            match client.flush() {
                Ok(()) | Err(TransportError::WantWrite) => {}
                Err(e) => panic!("flush failed: {e}"),
            }
            match server.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(TransportError::WantRead) => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert!(saw_short_write);
        assert_eq!(received, message);
    }

    #[test]
    fn clean_close_reads_zero_and_completes_shutdown() {
        let (mut client, mut server, _, _) = established_pair(1 << 20);
        assert_eq!(client.shutdown().unwrap(), ShutdownStatus::Sent);
        assert!(matches!(client.shutdown(), Err(TransportError::WantRead)));

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), 0);
        assert_eq!(server.shutdown().unwrap(), ShutdownStatus::Sent);
        assert_eq!(client.shutdown().unwrap(), ShutdownStatus::Complete);
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[test]
    fn eof_without_close_notify_is_peer_closed() {
        let (mut client, mut server, _, _) = established_pair(1 << 20);
        client.get_ref().close();
        let mut buf = [0u8; 16];
        assert!(matches!(
            server.read(&mut buf),
            Err(TransportError::PeerClosed)
        ));
        assert_eq!(server.state(), SessionState::Failed);
    }
}
