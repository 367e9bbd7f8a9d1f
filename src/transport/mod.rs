//! Authenticated link encryption between nodes.
//!
//! [`TransportSession`] is a sans-io TLS state machine over any non-blocking
//! byte stream; [`driver`] resumes it on tokio socket readiness.

pub mod driver;
pub(crate) mod session;
mod tls;

use thiserror::Error;

use crate::keys::IdentityDigest;

pub use session::{Role, SessionState, ShutdownStatus, TransportSession};
pub use tls::{cipher_suite_name, TlsContext};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The session cannot progress until the stream is readable.
    #[error("operation would block until the peer sends data")]
    WantRead,
    /// The session cannot progress until the stream is writable.
    #[error("operation would block until the stream accepts data")]
    WantWrite,
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("peer identity {actual} does not match expected {expected}")]
    IdentityMismatch {
        expected: IdentityDigest,
        actual: IdentityDigest,
    },
    #[error("peer closed the connection without close_notify")]
    PeerClosed,
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation not allowed in session state {0:?}")]
    InvalidState(SessionState),
    #[error("TLS configuration error: {0}")]
    Config(String),
    #[error("timed out waiting for the peer")]
    Timeout,
}

impl TransportError {
    pub fn would_block(&self) -> bool {
        matches!(self, TransportError::WantRead | TransportError::WantWrite)
    }
}
