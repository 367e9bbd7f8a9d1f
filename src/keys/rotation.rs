use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::info;

use super::{EpochId, KeyEpoch, KeyError, KeyStore, NodeIdentity};

#[derive(Debug)]
pub enum EpochEvent {
    Activated(Arc<KeyEpoch>),
    /// The epoch's grace window is over; its key and replay log must go.
    Retire(EpochId),
}

/// Decides when key epochs begin and end.
pub trait EpochSource: Send {
    fn poll(&mut self, now: SystemTime) -> Result<Vec<EpochEvent>, KeyError>;
}

#[derive(Debug, Clone, Copy)]
struct LiveEpoch {
    id: EpochId,
    valid_until: SystemTime,
}

/// Generates back-to-back epochs of a fixed lifetime and persists them in a
/// [`KeyStore`]. Epochs found on disk are announced on the first poll.
///
/// With a non-zero lead the successor is generated that long before the
/// current epoch ends, so a caller polling at most once per lead never
/// serves an epoch (or its transport certificate) past `valid_until`.
pub struct RollingEpochs {
    store: KeyStore,
    identity: Arc<NodeIdentity>,
    lifetime: Duration,
    grace: Duration,
    lead: Duration,
    live: Vec<LiveEpoch>,
    pending: Vec<EpochEvent>,
    next_rotation: Option<SystemTime>,
    next_id: u64,
}

impl RollingEpochs {
    pub fn resume(
        store: KeyStore,
        identity: Arc<NodeIdentity>,
        lifetime: Duration,
        grace: Duration,
    ) -> Result<Self, KeyError> {
        if lifetime.is_zero() {
            return Err(KeyError::InvalidEpoch("epoch lifetime must be > 0"));
        }
        let stored = store.load_epochs(&identity)?;
        let next_id = stored.iter().map(|e| e.id().0 + 1).max().unwrap_or(1);
        let next_rotation = stored.iter().map(|e| e.valid_until()).max();
        let live = stored
            .iter()
            .map(|e| LiveEpoch {
                id: e.id(),
                valid_until: e.valid_until(),
            })
            .collect();
        let pending = stored
            .into_iter()
            .map(|e| EpochEvent::Activated(Arc::new(e)))
            .collect();
        Ok(Self {
            store,
            identity,
            lifetime,
            grace,
            lead: Duration::ZERO,
            live,
            pending,
            next_rotation,
            next_id,
        })
    }

    /// Rotates `lead` ahead of each epoch's end. Capped at half the
    /// lifetime so consecutive epochs still overlap only at their tails.
    pub fn with_lead(mut self, lead: Duration) -> Self {
        self.lead = lead.min(self.lifetime / 2);
        self
    }

    pub fn is_due(&self, now: SystemTime) -> bool {
        self.next_rotation.map_or(true, |at| now + self.lead >= at)
    }

    fn rotate(&mut self, now: SystemTime) -> Result<Arc<KeyEpoch>, KeyError> {
        let id = EpochId(self.next_id);
        let epoch = KeyEpoch::generate(id, now, now + self.lifetime, &self.identity)?;
        self.store.save_epoch(&epoch)?;
        self.next_id += 1;
        self.next_rotation = Some(epoch.valid_until());
        self.live.push(LiveEpoch {
            id,
            valid_until: epoch.valid_until(),
        });
        info!(epoch = %id, lifetime_secs = self.lifetime.as_secs(), "activated new key epoch");
        Ok(Arc::new(epoch))
    }
}

impl EpochSource for RollingEpochs {
    fn poll(&mut self, now: SystemTime) -> Result<Vec<EpochEvent>, KeyError> {
        let mut events = std::mem::take(&mut self.pending);

        if self.is_due(now) {
            events.push(EpochEvent::Activated(self.rotate(now)?));
        }

        let grace = self.grace;
        self.live.retain(|epoch| {
            if now >= epoch.valid_until + grace {
                events.push(EpochEvent::Retire(epoch.id));
                false
            } else {
                true
            }
        });

        Ok(events)
    }
}
