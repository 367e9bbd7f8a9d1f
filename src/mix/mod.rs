//! Batching and re-ordering of peeled packets before they leave the node.

mod strategy;

use std::path::Path;
use std::time::{Duration, SystemTime};

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::codec::NextHop;
use crate::packet::ExitInfo;
use crate::pool::{EntryId, Pool, PoolEntry, PoolError};

pub use strategy::MixStrategy;

/// Metadata of an incoming-pool entry: what to do with the peeled payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Routed {
    /// Payload is the next packet.
    Forward { next_hop: NextHop },
    /// Payload is an encoded fragment body.
    Deliver { exit: ExitInfo },
}

/// Metadata of an outgoing-pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMeta {
    pub next_hop: NextHop,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub pooled: usize,
    pub eligible: usize,
    pub forwarded: usize,
    pub delivered: usize,
}

/// The incoming, outgoing, and deliver pools a mix tick moves entries
/// between.
#[derive(Debug, Clone)]
pub struct MixPools {
    pub incoming: Pool<Routed>,
    pub outgoing: Pool<RelayMeta>,
    pub deliver: Pool<ExitInfo>,
}

impl MixPools {
    /// Opens `incoming/`, `outgoing/`, and `deliver/` under `root`.
    pub fn open(root: &Path) -> Result<Self, PoolError> {
        Ok(Self {
            incoming: Pool::open(root.join("incoming"))?,
            outgoing: Pool::open(root.join("outgoing"))?,
            deliver: Pool::open(root.join("deliver"))?,
        })
    }

    /// Admits a freshly peeled payload to the incoming pool.
    pub fn admit(&self, payload: &[u8], routed: &Routed) -> Result<EntryId, PoolError> {
        self.incoming.enqueue(payload, routed)
    }
}

pub struct MixQueue<R: RngCore + CryptoRng = OsRng> {
    strategy: MixStrategy,
    min_residency: Duration,
    pools: MixPools,
    rng: R,
}

impl MixQueue<OsRng> {
    pub fn new(strategy: MixStrategy, min_residency: Duration, pools: MixPools) -> Self {
        Self::with_rng(strategy, min_residency, pools, OsRng)
    }
}

impl<R: RngCore + CryptoRng> MixQueue<R> {
    pub fn with_rng(
        strategy: MixStrategy,
        min_residency: Duration,
        pools: MixPools,
        rng: R,
    ) -> Self {
        Self {
            strategy,
            min_residency,
            pools,
            rng,
        }
    }

    pub fn pools(&self) -> &MixPools {
        &self.pools
    }

    pub fn set_strategy(&mut self, strategy: MixStrategy, min_residency: Duration) {
        self.strategy = strategy;
        self.min_residency = min_residency;
    }

    pub fn tick(&mut self) -> Result<TickReport, PoolError> {
        self.tick_at(SystemTime::now())
    }

    pub fn tick_at(&mut self, now: SystemTime) -> Result<TickReport, PoolError> {
        let mut report = TickReport::default();
        let mut eligible: Vec<PoolEntry<Routed>> = Vec::new();
        for entry in self.pools.incoming.entries()? {
            let entry = entry?;
            report.pooled += 1;
            if entry.age(now) >= self.min_residency {
                eligible.push(entry);
            }
        }
        report.eligible = eligible.len();

        let selected = self.strategy.select(report.pooled, eligible, &mut self.rng);
        for entry in selected {
            let incoming = &self.pools.incoming;
            let moved = match &entry.metadata {
                Routed::Forward { next_hop } => {
                    let meta = RelayMeta {
                        next_hop: next_hop.clone(),
                        attempts: 0,
                    };
                    incoming.move_to(&entry.id, &self.pools.outgoing, &meta)
                }
                Routed::Deliver { exit } => {
                    incoming.move_to(&entry.id, &self.pools.deliver, exit)
                }
            };
            match (moved, &entry.metadata) {
                (Ok(_), Routed::Forward { .. }) => report.forwarded += 1,
                (Ok(_), Routed::Deliver { .. }) => report.delivered += 1,
                (Err(PoolError::Missing(id)), _) => {
                    trace!(entry = %id, "entry vanished during tick")
                }
                (Err(e), _) => return Err(e),
            }
        }

        if report.forwarded + report.delivered > 0 {
            debug!(
                pooled = report.pooled,
                eligible = report.eligible,
                forwarded = report.forwarded,
                delivered = report.delivered,
                "mix tick released entries"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::IdentityDigest;

    fn pools(root: &Path) -> MixPools {
        MixPools::open(root).unwrap()
    }

    fn forward() -> Routed {
        Routed::Forward {
            next_hop: NextHop {
                identity: IdentityDigest([1u8; 32]),
                host: "127.0.0.1".to_string(),
                port: 48099,
            },
        }
    }

    fn deliver() -> Routed {
        Routed::Deliver {
            exit: ExitInfo {
                exit_type: 0x100,
                address: "bob@example.org".to_string(),
            },
        }
    }

    #[test]
    fn nothing_leaves_before_minimum_residency() {
        let dir = tempfile::tempdir().unwrap();
        let pools = pools(dir.path());
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        for _ in 0..3 {
            pools.incoming.enqueue_at(b"pkt", &forward(), t0).unwrap();
        }
        let residency = Duration::from_secs(30);
        let mut queue = MixQueue::new(MixStrategy::Flush, residency, pools.clone());

        let report = queue.tick_at(t0 + residency - Duration::from_secs(1)).unwrap();
        assert_eq!(report.eligible, 0);
        assert_eq!(pools.incoming.len().unwrap(), 3);

        let report = queue.tick_at(t0 + residency).unwrap();
        assert_eq!(report.forwarded, 3);
        assert!(pools.incoming.is_empty().unwrap());
        assert_eq!(pools.outgoing.len().unwrap(), 3);
    }

    #[test]
    fn entries_are_routed_by_their_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let pools = pools(dir.path());
        let mut queue = MixQueue::new(MixStrategy::Flush, Duration::ZERO, pools.clone());
        pools.admit(b"forward me", &forward()).unwrap();
        pools.admit(b"deliver me", &deliver()).unwrap();

        let report = queue.tick().unwrap();
        assert_eq!((report.forwarded, report.delivered), (1, 1));

        let relay: Vec<_> = pools.outgoing.entries().unwrap().map(Result::unwrap).collect();
        assert_eq!(relay[0].metadata.attempts, 0);
        assert_eq!(pools.outgoing.get(&relay[0].id).unwrap(), b"forward me");
        let exits: Vec<_> = pools.deliver.entries().unwrap().map(Result::unwrap).collect();
        assert_eq!(exits[0].metadata.address, "bob@example.org");
    }

    #[test]
    fn dynamic_pool_holds_back_its_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let pools = pools(dir.path());
        for _ in 0..6 {
            pools.incoming.enqueue(b"pkt", &forward()).unwrap();
        }
        let strategy = MixStrategy::Dynamic {
            min_pool: 4,
            send_fraction: 1.0,
        };
        let mut queue = MixQueue::new(strategy, Duration::ZERO, pools.clone());
        let report = queue.tick().unwrap();
        assert_eq!(report.forwarded, 2);
        assert_eq!(pools.incoming.len().unwrap(), 4);
    }
}
