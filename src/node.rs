//! Wires the pipeline together: inbound packets are peeled and pooled by
//! [`NodeState::ingest`]; the [`MixNode`] scheduler moves them onward.

use std::collections::HashSet;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Action, CodecError};
use crate::config::NodeConfig;
use crate::delivery::{DeliveryHandler, DeliveryOutcome, ExitMeta, MaildirDelivery};
use crate::directory::{Directory, NodeDescriptor, StaticDirectory};
use crate::error::NodeError;
use crate::keys::{
    EpochEvent, EpochId, EpochSource, KeyRing, KeyStore, NodeIdentity, RollingEpochs,
};
use crate::mix::{MixPools, MixQueue, Routed, TickReport};
use crate::mmtp::Ack;
use crate::packet::{Fragment, Packet};
use crate::pool::{EntryId, Pool, PoolError};
use crate::reassembly::{AddOutcome, FragmentReassembler, ReassemblyError};
use crate::relay::{BatchReport, Dialer, DirectDialer, Relay};
use crate::replay::{ReplayCaches, ReplayOutcome};
use crate::server::Server;
use crate::stats::{Event, Stats};
use crate::transport::driver::Timeouts;
use crate::transport::TlsContext;

#[derive(Debug)]
pub enum Control {
    /// Apply a re-read configuration.
    Reload(Box<NodeConfig>),
    Shutdown,
}

/// State shared between the scheduler and connection tasks.
pub struct NodeState {
    ring: RwLock<Arc<KeyRing>>,
    tls: RwLock<Option<(EpochId, TlsContext)>>,
    replay: ReplayCaches,
    pools: MixPools,
    stats: Arc<Stats>,
    timeouts: Timeouts,
}

impl NodeState {
    /// Snapshot of the key ring; later rotations do not affect it.
    pub fn ring(&self) -> Arc<KeyRing> {
        self.ring.read().clone()
    }

    /// TLS configuration of the current epoch, if any epoch is current.
    pub fn tls(&self) -> Option<TlsContext> {
        self.tls.read().as_ref().map(|(_, ctx)| ctx.clone())
    }

    /// Epoch whose certificate inbound and outbound handshakes present.
    pub fn transport_epoch(&self) -> Option<EpochId> {
        self.tls.read().as_ref().map(|(id, _)| *id)
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn pools(&self) -> &MixPools {
        &self.pools
    }

    pub fn ingest(&self, packet: &Packet) -> Ack {
        self.ingest_at(packet, SystemTime::now())
    }

    /// Peels one packet and queues the result. Undecodable, replayed, and
    /// wrong-epoch packets are dropped but still acknowledged as received;
    /// only a failure to record or store the packet is reported as rejected.
    pub fn ingest_at(&self, packet: &Packet, now: SystemTime) -> Ack {
        self.stats.record(Event::ReceivedPacket);
        let digest = packet.digest();
        let ring = self.ring();
        let peeled = match codec::decrypt(packet, &ring, now) {
            Ok(peeled) => peeled,
            Err(CodecError::WrongEpoch) => {
                warn!(packet = ?digest, "packet for an unknown key epoch dropped");
                self.stats.record(Event::WrongEpochDrop);
                return Ack::Received;
            }
            Err(e) => {
                debug!(packet = ?digest, error = %e, "undecodable packet dropped");
                self.stats.record(Event::DecodeDrop);
                return Ack::Received;
            }
        };

        match self.replay.test_and_insert(peeled.epoch, &digest) {
            Ok(ReplayOutcome::Fresh) => {}
            Ok(ReplayOutcome::Duplicate) => {
                info!(packet = ?digest, epoch = %peeled.epoch, "replayed packet dropped");
                self.stats.record(Event::ReplayDrop);
                return Ack::Received;
            }
            Err(e) => {
                error!(packet = ?digest, error = %e, "replay check failed");
                return Ack::Rejected;
            }
        }

        let (payload, routed) = match peeled.action {
            Action::Forward { next_hop, packet } => {
                (packet.into_bytes(), Routed::Forward { next_hop })
            }
            Action::Deliver { exit, fragment } => match fragment.encode() {
                Ok(body) => (body, Routed::Deliver { exit }),
                Err(e) => {
                    debug!(packet = ?digest, error = %e, "unencodable fragment dropped");
                    self.stats.record(Event::DecodeDrop);
                    return Ack::Received;
                }
            },
            Action::Drop => {
                debug!(packet = ?digest, "padding packet dropped");
                return Ack::Received;
            }
        };

        match self.pools.admit(&payload, &routed) {
            Ok(id) => {
                debug!(packet = ?digest, entry = %id, "packet queued");
                Ack::Received
            }
            Err(e) => {
                error!(packet = ?digest, error = %e, "could not queue packet");
                Ack::Rejected
            }
        }
    }
}

/// What one scheduler tick did.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub mix: TickReport,
    /// Relay connections started by this tick.
    pub relay_batches: Vec<JoinHandle<BatchReport>>,
    pub reassembled: usize,
    pub delivered: usize,
}

/// Replaceable collaborators; [`Collaborators::from_config`] gives the
/// defaults.
pub struct Collaborators {
    pub delivery: Arc<dyn DeliveryHandler>,
    pub directory: Arc<dyn Directory>,
    pub dialer: Arc<dyn Dialer>,
}

impl Collaborators {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            delivery: Arc::new(MaildirDelivery::new(config.maildir())),
            directory: Arc::new(StaticDirectory::new(config.peers.iter().cloned())),
            dialer: Arc::new(DirectDialer),
        }
    }
}

pub struct MixNode {
    config: NodeConfig,
    identity: Arc<NodeIdentity>,
    state: Arc<NodeState>,
    keys: KeyStore,
    epochs: Box<dyn EpochSource>,
    queue: MixQueue,
    relay: Relay,
    reassembler: FragmentReassembler<EntryId>,
    /// Deliver-pool entries already handed to the reassembler.
    fed: HashSet<EntryId>,
    exit: Pool<ExitMeta>,
    delivery: Arc<dyn DeliveryHandler>,
}

impl MixNode {
    pub fn open(config: NodeConfig) -> Result<Self, NodeError> {
        let collaborators = Collaborators::from_config(&config);
        Self::open_with(config, collaborators)
    }

    pub fn open_with(config: NodeConfig, collaborators: Collaborators) -> Result<Self, NodeError> {
        config.validate()?;
        let home = config.node.home.clone();
        DirBuilder::new().recursive(true).mode(0o700).create(&home)?;

        let keys = KeyStore::open(home.join("keys"))?;
        let identity = Arc::new(keys.load_or_create_identity()?);
        let epochs = RollingEpochs::resume(
            keys.clone(),
            identity.clone(),
            config.epoch_lifetime(),
            config.epoch_grace(),
        )?
        .with_lead(2 * config.tick_interval());
        let replay = ReplayCaches::open(home.join("replay"))?;
        let pools = MixPools::open(&home.join("pools"))?;
        let exit = Pool::open(home.join("pools").join("exit"))?;
        let stats = Stats::new();

        let state = Arc::new(NodeState {
            ring: RwLock::new(Arc::new(KeyRing::new(config.epoch_grace()))),
            tls: RwLock::new(None),
            replay,
            pools: pools.clone(),
            stats: stats.clone(),
            timeouts: config.timeouts(),
        });
        let queue = MixQueue::new(config.mix.strategy.clone(), config.min_residency(), pools.clone());
        let relay = Relay::new(
            pools.outgoing.clone(),
            collaborators.dialer,
            collaborators.directory,
            stats,
            config.timeouts(),
            config.transport.max_outgoing_connections,
            config.max_relay_age(),
        );

        info!(identity = %identity.digest(), home = %home.display(), "node opened");
        let mut node = Self {
            reassembler: FragmentReassembler::new(config.reassembly_limits()),
            config,
            identity,
            state,
            keys,
            epochs: Box::new(epochs),
            queue,
            relay,
            fed: HashSet::new(),
            exit,
            delivery: collaborators.delivery,
        };
        node.apply_epoch_events(SystemTime::now())?;
        Ok(node)
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// How peers should list this node: reachable at the configured
    /// hostname on the listen port.
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            nickname: self.config.node.hostname.clone(),
            identity: self.identity.digest(),
            host: self.config.node.hostname.clone(),
            port: self.config.node.listen.port(),
        }
    }

    pub fn exit_pool(&self) -> &Pool<ExitMeta> {
        &self.exit
    }

    /// Applies new epochs and retirements, then makes sure the TLS context
    /// belongs to the current epoch. A retired epoch leaves the ring, then
    /// its key is destroyed, and only then is its replay log deleted.
    fn apply_epoch_events(&mut self, now: SystemTime) -> Result<(), NodeError> {
        for event in self.epochs.poll(now)? {
            match event {
                EpochEvent::Activated(epoch) => {
                    self.state.replay.open_epoch(epoch.id())?;
                    info!(epoch = %epoch.id(), "key epoch activated");
                    let mut ring = self.state.ring.write();
                    *ring = Arc::new(ring.with_epoch(epoch));
                }
                EpochEvent::Retire(id) => {
                    {
                        let mut ring = self.state.ring.write();
                        *ring = Arc::new(ring.without(id));
                    }
                    let retired = self.keys.destroy_epoch(id)?;
                    self.state.replay.retire(retired)?;
                    info!(epoch = %id, "key epoch retired");
                }
            }
        }

        let ring = self.state.ring();
        let Some(current) = ring.current(now) else {
            warn!("no key epoch is current; inbound connections will be refused");
            *self.state.tls.write() = None;
            return Ok(());
        };
        let stale = self
            .state
            .tls
            .read()
            .as_ref()
            .map_or(true, |(id, _)| *id != current.id());
        if stale {
            let ctx = TlsContext::new(current.transport())?;
            *self.state.tls.write() = Some((current.id(), ctx));
            debug!(epoch = %current.id(), "transport context rebuilt");
        }
        Ok(())
    }

    /// Feeds unseen deliver-pool fragments to the reassembler. Completed
    /// messages move to the exit pool; their fragments, and those of expired
    /// or invalid messages, leave the deliver pool.
    fn reassembly_pass(&mut self, now: SystemTime) -> Result<usize, NodeError> {
        let deliver = self.state.pools.deliver.clone();
        let mut completed = 0;
        let pending: Vec<_> = deliver
            .entries()?
            .filter(|entry| match entry {
                Ok(entry) => !self.fed.contains(&entry.id),
                Err(_) => true,
            })
            .collect();

        for entry in pending {
            let entry = entry?;
            let fragment = match deliver.get(&entry.id).map(|body| Fragment::decode(&body)) {
                Ok(Ok(fragment)) => fragment,
                Ok(Err(e)) => {
                    warn!(entry = %entry.id, error = %e, "undecodable fragment quarantined");
                    deliver.mark_corrupt(&entry.id)?;
                    continue;
                }
                Err(PoolError::Missing(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let id = entry.id.clone();
            match self
                .reassembler
                .add(fragment, entry.metadata, id.clone(), entry.queued_at)
            {
                Ok(AddOutcome::Pending { received, count }) => {
                    debug!(entry = %id, received, count, "fragment buffered");
                    self.fed.insert(id);
                }
                Ok(AddOutcome::Complete(message)) => {
                    let meta = ExitMeta {
                        message_id: message.message_id,
                        exit: message.exit,
                    };
                    self.exit.enqueue(&message.data, &meta)?;
                    for tag in &message.tags {
                        self.fed.remove(tag);
                        deliver.remove(tag)?;
                    }
                    debug!(message = %meta.message_id, fragments = message.tags.len(), "message reassembled");
                    completed += 1;
                }
                Err(ReassemblyError::Full) => {
                    debug!(entry = %id, "reassembly full; fragment waits");
                }
                Err(e) => {
                    debug!(entry = %id, error = %e, "fragment discarded");
                    deliver.remove(&id)?;
                }
            }
        }

        for tag in self.reassembler.expire(now) {
            debug!(entry = %tag, "expired fragment discarded");
            self.fed.remove(&tag);
            deliver.remove(&tag)?;
        }
        Ok(completed)
    }

    async fn exit_pass(&mut self, now: SystemTime) -> Result<usize, NodeError> {
        let stats = &self.state.stats;
        let max_age = self.config.max_retry_age();
        let mut delivered = 0;
        let entries: Vec<_> = self.exit.entries()?.collect();
        for entry in entries {
            let entry = entry?;
            if entry.age(now) >= max_age {
                warn!(message = %entry.metadata.message_id, "undeliverable message expired");
                self.exit.remove(&entry.id)?;
                stats.record(Event::UnretriableDelivery);
                continue;
            }
            let body = match self.exit.get(&entry.id) {
                Ok(body) => body,
                Err(PoolError::Missing(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            stats.record(Event::AttemptedDelivery);
            match self.delivery.deliver(&entry.metadata, &body).await {
                DeliveryOutcome::Delivered => {
                    self.exit.remove(&entry.id)?;
                    stats.record(Event::SuccessfulDelivery);
                    delivered += 1;
                }
                DeliveryOutcome::Retry(reason) => {
                    debug!(message = %entry.metadata.message_id, %reason, "delivery will be retried");
                    stats.record(Event::FailedDelivery);
                }
                DeliveryOutcome::Failed(reason) => {
                    warn!(message = %entry.metadata.message_id, %reason, "delivery failed");
                    self.exit.remove(&entry.id)?;
                    stats.record(Event::UnretriableDelivery);
                }
            }
        }
        Ok(delivered)
    }

    pub async fn tick(&mut self) -> Result<TickSummary, NodeError> {
        self.tick_at(SystemTime::now()).await
    }

    pub async fn tick_at(&mut self, now: SystemTime) -> Result<TickSummary, NodeError> {
        self.apply_epoch_events(now)?;
        let mix = self.queue.tick_at(now)?;
        let relay_batches = match self.state.tls() {
            Some(tls) => self.relay.pass_at(&tls, now)?,
            None => Vec::new(),
        };
        let reassembled = self.reassembly_pass(now)?;
        let delivered = self.exit_pass(now).await?;
        if let Err(e) = self.state.stats.save(&self.config.stats_file()) {
            warn!(error = %e, "could not save statistics");
        }
        Ok(TickSummary {
            mix,
            relay_batches,
            reassembled,
            delivered,
        })
    }

    fn reload(&mut self, config: NodeConfig) {
        if let Err(e) = config.validate() {
            warn!(error = %e, "reloaded configuration ignored");
            return;
        }
        self.queue
            .set_strategy(config.mix.strategy.clone(), config.min_residency());
        self.config.mix = config.mix;
        self.config.delivery.max_retry_age_secs = config.delivery.max_retry_age_secs;
        info!("configuration reloaded");
    }

    /// Listens on the configured address and runs the scheduler until a
    /// [`Control::Shutdown`] arrives or the channel closes.
    pub async fn run(mut self, mut control: mpsc::Receiver<Control>) -> Result<(), NodeError> {
        let server = Server::bind(self.config.node.listen, self.state.clone())?;
        let descriptor = self.descriptor();
        info!(
            listen = %server.local_addr()?,
            host = %descriptor.host,
            port = descriptor.port,
            "accepting connections"
        );
        let (stop, stopped) = watch::channel(false);
        let listener = tokio::spawn(server.run(stopped));

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                message = control.recv() => match message {
                    Some(Control::Reload(config)) => self.reload(*config),
                    Some(Control::Shutdown) | None => break,
                },
            }
        }

        info!("shutting down");
        let _ = stop.send(true);
        if let Err(e) = listener.await {
            warn!(error = %e, "listener task ended abnormally");
        }
        self.state.stats.save(&self.config.stats_file())?;
        Ok(())
    }
}
