//! Runs a [`TransportSession`] over a tokio `TcpStream`, parking on socket
//! readiness whenever the session reports `WantRead` or `WantWrite`.

use std::io::{self, Read, Write};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{ShutdownStatus, TlsContext, TransportError, TransportSession};
use crate::keys::IdentityDigest;

/// Non-blocking `Read + Write` view of a tokio socket.
#[derive(Debug)]
pub struct NonBlockingStream(TcpStream);

impl NonBlockingStream {
    pub fn new(stream: TcpStream) -> Self {
        Self(stream)
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.0
    }
}

impl Read for NonBlockingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for NonBlockingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    /// Longest wait for any single read or write to make progress.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            idle: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
pub struct AsyncSession {
    session: TransportSession<NonBlockingStream>,
    timeouts: Timeouts,
}

impl AsyncSession {
    pub async fn accept(
        ctx: &TlsContext,
        stream: TcpStream,
        timeouts: Timeouts,
    ) -> Result<Self, TransportError> {
        let session = TransportSession::accept(ctx, NonBlockingStream::new(stream))?;
        let mut this = Self { session, timeouts };
        this.handshake().await?;
        Ok(this)
    }

    pub async fn connect(
        ctx: &TlsContext,
        stream: TcpStream,
        expected: IdentityDigest,
        timeouts: Timeouts,
    ) -> Result<Self, TransportError> {
        let session = TransportSession::connect(ctx, NonBlockingStream::new(stream), expected)?;
        let mut this = Self { session, timeouts };
        this.handshake().await?;
        Ok(this)
    }

    pub fn session(&self) -> &TransportSession<NonBlockingStream> {
        &self.session
    }

    /// Repeats `op` until it stops asking for readiness, or `limit` passes.
    async fn drive<T>(
        &mut self,
        limit: Duration,
        mut op: impl FnMut(&mut TransportSession<NonBlockingStream>) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let session = &mut self.session;
        let run = async move {
            loop {
                match op(session) {
                    Err(TransportError::WantRead) => session.get_ref().get_ref().readable().await?,
                    Err(TransportError::WantWrite) => {
                        session.get_ref().get_ref().writable().await?
                    }
                    other => return other,
                }
            }
        };
        timeout(limit, run)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn handshake(&mut self) -> Result<(), TransportError> {
        let limit = self.timeouts.handshake;
        self.drive(limit, |s| s.handshake()).await
    }

    /// Fills `buf` completely. Returns `false` if the peer closed cleanly
    /// before sending anything; a close part-way through is an error.
    pub async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, TransportError> {
        let limit = self.timeouts.idle;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.drive(limit, |s| s.read(&mut buf[filled..])).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(TransportError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }
        Ok(true)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if self.read_exact_or_eof(buf).await? {
            Ok(())
        } else {
            Err(TransportError::Io(io::ErrorKind::UnexpectedEof.into()))
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let limit = self.timeouts.idle;
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.drive(limit, |s| s.write(&buf[sent..])).await?;
        }
        self.drive(limit, |s| s.flush()).await
    }

    /// Sends close_notify and waits, up to the idle timeout, for the peer's.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        let limit = self.timeouts.idle;
        loop {
            if self.drive(limit, |s| s.shutdown()).await? == ShutdownStatus::Complete {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NodeIdentity;
    use crate::transport::session::tests::context;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn loopback_session_moves_large_payload() {
        let server_identity = NodeIdentity::generate().unwrap();
        let client_identity = NodeIdentity::generate().unwrap();
        let server_ctx = context(&server_identity);
        let client_ctx = context(&client_identity);
        let expected = server_identity.digest();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        let sent = payload.clone();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut session = AsyncSession::accept(&server_ctx, stream, Timeouts::default())
                .await
                .unwrap();
            let mut buf = vec![0u8; sent.len()];
            session.read_exact(&mut buf).await.unwrap();
            let mut eof = [0u8; 1];
            assert!(!session.read_exact_or_eof(&mut eof).await.unwrap());
            session.shutdown().await.unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = AsyncSession::connect(&client_ctx, stream, expected, Timeouts::default())
            .await
            .unwrap();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(server.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let identity = NodeIdentity::generate().unwrap();
        let ctx = context(&identity);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let timeouts = Timeouts {
            handshake: Duration::from_millis(200),
            idle: Duration::from_millis(200),
        };
        let err = AsyncSession::connect(&ctx, stream, identity.digest(), timeouts)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }
}
