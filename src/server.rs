//! Inbound side: accepts MMTP connections and hands their packets to the
//! node, one task per connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::mmtp::{Ack, Inbound, MmtpConnection};
use crate::node::NodeState;
use crate::transport::driver::AsyncSession;

const LISTEN_BACKLOG: i32 = 128;

pub struct Server {
    listener: TcpListener,
    state: Arc<NodeState>,
}

/// A non-blocking listening socket with `SO_REUSEADDR` set.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

impl Server {
    pub fn bind(addr: SocketAddr, state: Arc<NodeState>) -> io::Result<Self> {
        Ok(Self {
            listener: bind_listener(addr)?,
            state,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `stop` turns true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = self.state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(state, stream, peer).await {
                                debug!(%peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("listener stopped");
    }
}

async fn handle_connection(
    state: Arc<NodeState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), NodeError> {
    let stats = state.stats().clone();
    stats.connection_opened();
    let _open = scopeguard::guard(stats, |stats| stats.connection_closed());

    let Some(tls) = state.tls() else {
        return Err(NodeError::NoCurrentEpoch);
    };
    stream.set_nodelay(true)?;
    let session = AsyncSession::accept(&tls, stream, state.timeouts()).await?;
    debug!(%peer, "inbound session established");
    let mut conn = MmtpConnection::accept(session).await?;

    let mut packets = 0u64;
    while let Some(inbound) = conn.receive().await? {
        if let Inbound::Packet(packet) = inbound {
            // Ingesting fsyncs the replay log and the pool.
            let ingest = {
                let state = state.clone();
                let packet = packet.clone();
                tokio::task::spawn_blocking(move || state.ingest(&packet))
            };
            let ack = ingest.await.unwrap_or(Ack::Rejected);
            conn.acknowledge(&packet, ack).await?;
            packets += 1;
        }
    }
    conn.close().await?;
    debug!(%peer, packets, "inbound connection closed");
    Ok(())
}
