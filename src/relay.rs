//! Pushes outgoing-pool packets to their next hops.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::NextHop;
use crate::directory::Directory;
use crate::keys::IdentityDigest;
use crate::mix::RelayMeta;
use crate::mmtp::{Ack, MmtpConnection, MmtpError};
use crate::packet::Packet;
use crate::pool::{Pool, PoolEntry, PoolError};
use crate::stats::{Event, Stats};
use crate::transport::driver::{AsyncSession, Timeouts};
use crate::transport::{TlsContext, TransportError};

/// Opens the TCP connection a relay batch runs over.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub relayed: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct Shared {
    outgoing: Pool<RelayMeta>,
    dialer: Arc<dyn Dialer>,
    directory: Arc<dyn Directory>,
    stats: Arc<Stats>,
    timeouts: Timeouts,
}

/// One relay pass groups queued packets by next hop and starts one
/// connection per hop, at most `max_connections` at a time. A hop whose
/// connection is still running is skipped until it finishes.
pub struct Relay {
    shared: Shared,
    max_connections: usize,
    max_age: Duration,
    in_flight: Arc<Mutex<HashSet<IdentityDigest>>>,
}

impl Relay {
    pub fn new(
        outgoing: Pool<RelayMeta>,
        dialer: Arc<dyn Dialer>,
        directory: Arc<dyn Directory>,
        stats: Arc<Stats>,
        timeouts: Timeouts,
        max_connections: usize,
        max_age: Duration,
    ) -> Self {
        Self {
            shared: Shared {
                outgoing,
                dialer,
                directory,
                stats,
                timeouts,
            },
            max_connections,
            max_age,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn pass(&self, tls: &TlsContext) -> Result<Vec<JoinHandle<BatchReport>>, PoolError> {
        self.pass_at(tls, SystemTime::now())
    }

    pub fn pass_at(
        &self,
        tls: &TlsContext,
        now: SystemTime,
    ) -> Result<Vec<JoinHandle<BatchReport>>, PoolError> {
        let outgoing = &self.shared.outgoing;
        let mut batches: HashMap<IdentityDigest, (NextHop, Vec<PoolEntry<RelayMeta>>)> =
            HashMap::new();
        for entry in outgoing.entries()? {
            let entry = entry?;
            if entry.age(now) >= self.max_age {
                warn!(
                    entry = %entry.id,
                    hop = %entry.metadata.next_hop.identity,
                    attempts = entry.metadata.attempts,
                    "dropping unretriable packet"
                );
                outgoing.remove(&entry.id)?;
                self.shared.stats.record(Event::UnretriableRelay);
                continue;
            }
            let hop = entry.metadata.next_hop.clone();
            batches
                .entry(hop.identity)
                .or_insert_with(|| (hop, Vec::new()))
                .1
                .push(entry);
        }

        let mut started = Vec::new();
        for (identity, (hop, entries)) in batches {
            {
                let mut in_flight = self.in_flight.lock();
                if in_flight.contains(&identity) {
                    debug!(hop = %identity, "connection already in flight");
                    continue;
                }
                if in_flight.len() >= self.max_connections {
                    break;
                }
                in_flight.insert(identity);
            }
            let release = scopeguard::guard(
                (self.in_flight.clone(), identity),
                |(in_flight, identity)| {
                    in_flight.lock().remove(&identity);
                },
            );
            let shared = self.shared.clone();
            let tls = tls.clone();
            started.push(tokio::spawn(async move {
                let _release = release;
                send_batch(&shared, &tls, &hop, entries).await
            }));
        }
        Ok(started)
    }
}

async fn connect(
    shared: &Shared,
    tls: &TlsContext,
    hop: &NextHop,
) -> Result<MmtpConnection, MmtpError> {
    let (host, port) = match shared.directory.lookup(&hop.identity) {
        Some(node) => (node.host, node.port),
        None => (hop.host.clone(), hop.port),
    };
    let stream = timeout(shared.timeouts.handshake, shared.dialer.dial(&host, port))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Io)?;
    let session = AsyncSession::connect(tls, stream, hop.identity, shared.timeouts).await?;
    MmtpConnection::initiate(session).await
}

fn record_failure(outgoing: &Pool<RelayMeta>, mut entry: PoolEntry<RelayMeta>) {
    entry.metadata.attempts += 1;
    match outgoing.update(&entry) {
        Ok(()) | Err(PoolError::Missing(_)) => {}
        Err(e) => warn!(entry = %entry.id, error = %e, "could not record relay attempt"),
    }
}

async fn send_batch(
    shared: &Shared,
    tls: &TlsContext,
    hop: &NextHop,
    entries: Vec<PoolEntry<RelayMeta>>,
) -> BatchReport {
    let stats = &shared.stats;
    let outgoing = &shared.outgoing;
    let mut report = BatchReport::default();

    stats.record(Event::AttemptedConnect);
    let mut conn = match connect(shared, tls, hop).await {
        Ok(conn) => {
            stats.record(Event::SuccessfulConnect);
            conn
        }
        Err(e) => {
            stats.record(Event::FailedConnect);
            warn!(hop = %hop.identity, host = %hop.host, port = hop.port, error = %e, "connect failed");
            report.failed = entries.len();
            for entry in entries {
                stats.record(Event::FailedRelay);
                record_failure(outgoing, entry);
            }
            return report;
        }
    };

    let mut entries = entries.into_iter();
    while let Some(entry) = entries.next() {
        let packet = match outgoing.get(&entry.id).map(Packet::from_bytes) {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => {
                warn!(entry = %entry.id, error = %e, "outgoing entry is not a packet");
                if let Err(e) = outgoing.mark_corrupt(&entry.id) {
                    warn!(entry = %entry.id, error = %e, "could not quarantine outgoing entry");
                }
                continue;
            }
            Err(PoolError::Missing(_)) => continue,
            Err(e) => {
                warn!(entry = %entry.id, error = %e, "could not read outgoing entry");
                continue;
            }
        };

        stats.record(Event::AttemptedRelay);
        match conn.send_packet(&packet).await {
            Ok(Ack::Received) => {
                if let Err(e) = outgoing.remove(&entry.id) {
                    warn!(entry = %entry.id, error = %e, "relayed entry not removed");
                }
                stats.record(Event::SuccessfulRelay);
                report.relayed += 1;
            }
            Ok(Ack::Rejected) => {
                debug!(entry = %entry.id, hop = %hop.identity, "packet rejected");
                stats.record(Event::FailedRelay);
                report.failed += 1;
                record_failure(outgoing, entry);
            }
            Err(e) => {
                warn!(hop = %hop.identity, error = %e, "relay connection failed");
                stats.record(Event::FailedRelay);
                report.failed += 1;
                record_failure(outgoing, entry);
                for rest in entries {
                    report.failed += 1;
                    record_failure(outgoing, rest);
                }
                return report;
            }
        }
    }

    if let Err(e) = conn.close().await {
        debug!(hop = %hop.identity, error = %e, "unclean relay close");
    }
    info!(hop = %hop.identity, relayed = report.relayed, failed = report.failed, "relay batch done");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::keys::NodeIdentity;
    use crate::mmtp::Inbound;
    use crate::packet::PACKET_LEN;
    use crate::transport::session::tests::context;
    use tokio::net::TcpListener;

    fn hop(identity: IdentityDigest, port: u16) -> NextHop {
        NextHop {
            identity,
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    fn relay(outgoing: Pool<RelayMeta>, stats: Arc<Stats>, max_age: Duration) -> Relay {
        Relay::new(
            outgoing,
            Arc::new(DirectDialer),
            Arc::new(StaticDirectory::default()),
            stats,
            Timeouts {
                handshake: Duration::from_secs(5),
                idle: Duration::from_secs(5),
            },
            4,
            max_age,
        )
    }

    #[tokio::test]
    async fn relays_queued_packets_and_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let outgoing: Pool<RelayMeta> = Pool::open(dir.path().join("outgoing")).unwrap();
        let peer = NodeIdentity::generate().unwrap();
        let me = NodeIdentity::generate().unwrap();
        let peer_ctx = context(&peer);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let session = AsyncSession::accept(&peer_ctx, stream, Timeouts::default())
                .await
                .unwrap();
            let mut conn = MmtpConnection::accept(session).await.unwrap();
            let mut received = 0;
            while let Some(Inbound::Packet(packet)) = conn.receive().await.unwrap() {
                conn.acknowledge(&packet, Ack::Received).await.unwrap();
                received += 1;
            }
            let _ = conn.close().await;
            received
        });

        let meta = RelayMeta {
            next_hop: hop(peer.digest(), port),
            attempts: 0,
        };
        for seed in 0..3u8 {
            outgoing.enqueue(&vec![seed; PACKET_LEN], &meta).unwrap();
        }

        let stats = Stats::new();
        let relay = relay(outgoing.clone(), stats.clone(), Duration::from_secs(3600));
        let batches = relay.pass(&context(&me)).unwrap();
        assert_eq!(batches.len(), 1);
        let mut reports = Vec::new();
        for batch in batches {
            reports.push(batch.await.unwrap());
        }

        assert_eq!(reports, vec![BatchReport { relayed: 3, failed: 0 }]);
        assert_eq!(server.await.unwrap(), 3);
        assert!(outgoing.is_empty().unwrap());
        assert_eq!(relay.in_flight(), 0);
        assert_eq!(stats.snapshot().successful_relays, 3);
    }

    #[tokio::test]
    async fn entries_that_are_not_packets_are_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let pool_dir = dir.path().join("outgoing");
        let outgoing: Pool<RelayMeta> = Pool::open(&pool_dir).unwrap();
        let peer = NodeIdentity::generate().unwrap();
        let me = NodeIdentity::generate().unwrap();
        let peer_ctx = context(&peer);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let session = AsyncSession::accept(&peer_ctx, stream, Timeouts::default())
                .await
                .unwrap();
            let mut conn = MmtpConnection::accept(session).await.unwrap();
            let mut received = 0;
            while let Some(Inbound::Packet(packet)) = conn.receive().await.unwrap() {
                conn.acknowledge(&packet, Ack::Received).await.unwrap();
                received += 1;
            }
            let _ = conn.close().await;
            received
        });

        let meta = RelayMeta {
            next_hop: hop(peer.digest(), port),
            attempts: 0,
        };
        outgoing.enqueue(b"truncated", &meta).unwrap();
        outgoing.enqueue(&vec![7u8; PACKET_LEN], &meta).unwrap();

        let relay = relay(outgoing.clone(), Stats::new(), Duration::from_secs(3600));
        for batch in relay.pass(&context(&me)).unwrap() {
            assert_eq!(batch.await.unwrap(), BatchReport { relayed: 1, failed: 0 });
        }

        assert_eq!(server.await.unwrap(), 1);
        assert!(outgoing.is_empty().unwrap());
        let quarantined: Vec<String> = std::fs::read_dir(&pool_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("crp_"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[tokio::test]
    async fn failed_connect_keeps_packets_and_counts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let outgoing: Pool<RelayMeta> = Pool::open(dir.path().join("outgoing")).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let meta = RelayMeta {
            next_hop: hop(IdentityDigest([3u8; 32]), port),
            attempts: 0,
        };
        let id = outgoing.enqueue(&vec![1u8; PACKET_LEN], &meta).unwrap();

        let stats = Stats::new();
        let relay = relay(outgoing.clone(), stats.clone(), Duration::from_secs(3600));
        let me = NodeIdentity::generate().unwrap();
        for batch in relay.pass(&context(&me)).unwrap() {
            assert_eq!(batch.await.unwrap(), BatchReport { relayed: 0, failed: 1 });
        }

        assert_eq!(outgoing.load(&id).unwrap().metadata.attempts, 1);
        assert_eq!(stats.snapshot().failed_connects, 1);
    }

    #[tokio::test]
    async fn stale_packets_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let outgoing: Pool<RelayMeta> = Pool::open(dir.path().join("outgoing")).unwrap();
        let meta = RelayMeta {
            next_hop: hop(IdentityDigest([3u8; 32]), 1),
            attempts: 4,
        };
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        outgoing.enqueue_at(&vec![1u8; PACKET_LEN], &meta, t0).unwrap();

        let stats = Stats::new();
        let relay = relay(outgoing.clone(), stats.clone(), Duration::from_secs(60));
        let me = NodeIdentity::generate().unwrap();
        let batches = relay
            .pass_at(&context(&me), t0 + Duration::from_secs(61))
            .unwrap();

        assert!(batches.is_empty());
        assert!(outgoing.is_empty().unwrap());
        assert_eq!(stats.snapshot().unretriable_relays, 1);
    }
}
