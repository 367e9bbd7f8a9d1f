use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Countable node events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ReceivedPacket,
    ReceivedConnection,
    AttemptedConnect,
    SuccessfulConnect,
    FailedConnect,
    AttemptedRelay,
    SuccessfulRelay,
    FailedRelay,
    UnretriableRelay,
    AttemptedDelivery,
    SuccessfulDelivery,
    FailedDelivery,
    UnretriableDelivery,
    DecodeDrop,
    ReplayDrop,
    WrongEpochDrop,
}

#[derive(Debug, Default)]
pub struct Stats {
    active_connections: AtomicU32,
    received_packets: AtomicU64,
    received_connections: AtomicU64,
    attempted_connects: AtomicU64,
    successful_connects: AtomicU64,
    failed_connects: AtomicU64,
    attempted_relays: AtomicU64,
    successful_relays: AtomicU64,
    failed_relays: AtomicU64,
    unretriable_relays: AtomicU64,
    attempted_deliveries: AtomicU64,
    successful_deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
    unretriable_deliveries: AtomicU64,
    decode_drops: AtomicU64,
    replay_drops: AtomicU64,
    wrong_epoch_drops: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub active_connections: u32,
    pub received_packets: u64,
    pub received_connections: u64,
    pub attempted_connects: u64,
    pub successful_connects: u64,
    pub failed_connects: u64,
    pub attempted_relays: u64,
    pub successful_relays: u64,
    pub failed_relays: u64,
    pub unretriable_relays: u64,
    pub attempted_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub unretriable_deliveries: u64,
    pub decode_drops: u64,
    pub replay_drops: u64,
    pub wrong_epoch_drops: u64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, event: Event) {
        let counter = match event {
            Event::ReceivedPacket => &self.received_packets,
            Event::ReceivedConnection => &self.received_connections,
            Event::AttemptedConnect => &self.attempted_connects,
            Event::SuccessfulConnect => &self.successful_connects,
            Event::FailedConnect => &self.failed_connects,
            Event::AttemptedRelay => &self.attempted_relays,
            Event::SuccessfulRelay => &self.successful_relays,
            Event::FailedRelay => &self.failed_relays,
            Event::UnretriableRelay => &self.unretriable_relays,
            Event::AttemptedDelivery => &self.attempted_deliveries,
            Event::SuccessfulDelivery => &self.successful_deliveries,
            Event::FailedDelivery => &self.failed_deliveries,
            Event::UnretriableDelivery => &self.unretriable_deliveries,
            Event::DecodeDrop => &self.decode_drops,
            Event::ReplayDrop => &self.replay_drops,
            Event::WrongEpochDrop => &self.wrong_epoch_drops,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.record(Event::ReceivedConnection);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            received_packets: load(&self.received_packets),
            received_connections: load(&self.received_connections),
            attempted_connects: load(&self.attempted_connects),
            successful_connects: load(&self.successful_connects),
            failed_connects: load(&self.failed_connects),
            attempted_relays: load(&self.attempted_relays),
            successful_relays: load(&self.successful_relays),
            failed_relays: load(&self.failed_relays),
            unretriable_relays: load(&self.unretriable_relays),
            attempted_deliveries: load(&self.attempted_deliveries),
            successful_deliveries: load(&self.successful_deliveries),
            failed_deliveries: load(&self.failed_deliveries),
            unretriable_deliveries: load(&self.unretriable_deliveries),
            decode_drops: load(&self.decode_drops),
            replay_drops: load(&self.replay_drops),
            wrong_epoch_drops: load(&self.wrong_epoch_drops),
        }
    }

    /// Writes the current counters to `path` via a temporary file and rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let encoded = serde_json::to_vec_pretty(&self.snapshot()).map_err(io::Error::other)?;
        let staged = path.with_extension("json.tmp");
        let mut file = fs::File::create(&staged)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&staged, path)
    }
}

impl StatsSnapshot {
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "connections: active={} received={}",
            self.active_connections, self.received_connections
        )?;
        writeln!(
            f,
            "packets: received={} decode_drops={} replay_drops={} wrong_epoch_drops={}",
            self.received_packets, self.decode_drops, self.replay_drops, self.wrong_epoch_drops
        )?;
        writeln!(
            f,
            "connects: attempted={} successful={} failed={}",
            self.attempted_connects, self.successful_connects, self.failed_connects
        )?;
        writeln!(
            f,
            "relay: attempted={} successful={} failed={} unretriable={}",
            self.attempted_relays, self.successful_relays, self.failed_relays, self.unretriable_relays
        )?;
        write!(
            f,
            "delivery: attempted={} successful={} failed={} unretriable={}",
            self.attempted_deliveries,
            self.successful_deliveries,
            self.failed_deliveries,
            self.unretriable_deliveries
        )
    }
}
