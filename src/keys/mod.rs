//! Long-lived identity, per-epoch packet keys, and the snapshot the codec
//! decrypts against.

mod identity;
mod rotation;
mod store;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

pub use identity::{IdentityDigest, IdentityKey, NodeIdentity, TransportCredentials};
pub use rotation::{EpochEvent, EpochSource, RollingEpochs};
pub use store::KeyStore;

pub const KEY_TAG_LEN: usize = 8;

/// Transport certificates are back-dated by this much to absorb clock skew.
const CERT_BACKDATE: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key generation failed: {0}")]
    Generation(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("invalid identity digest")]
    InvalidIdentity,
    #[error("invalid epoch parameters: {0}")]
    InvalidEpoch(&'static str),
    #[error("stored key {path} is unreadable: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpochId(pub u64);

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names the epoch a packet layer was sealed to. Sent in the clear.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyTag(pub [u8; KEY_TAG_LEN]);

impl KeyTag {
    pub fn of(public: &PublicKey) -> Self {
        let digest = Sha256::digest(public.as_bytes());
        let mut tag = [0u8; KEY_TAG_LEN];
        tag.copy_from_slice(&digest[..KEY_TAG_LEN]);
        Self(tag)
    }
}

/// Proof that an epoch's decryption key has been destroyed. Only
/// [`KeyStore::destroy_epoch`] hands these out, and retiring a replay cache
/// consumes one.
#[derive(Debug)]
pub struct RetiredEpoch {
    id: EpochId,
}

impl RetiredEpoch {
    pub fn id(&self) -> EpochId {
        self.id
    }
}

/// One key period: its packet decryption key and the TLS credentials
/// presented while it is current.
pub struct KeyEpoch {
    id: EpochId,
    valid_after: SystemTime,
    valid_until: SystemTime,
    secret: StaticSecret,
    public: PublicKey,
    tag: KeyTag,
    transport: TransportCredentials,
}

impl KeyEpoch {
    pub fn generate(
        id: EpochId,
        valid_after: SystemTime,
        valid_until: SystemTime,
        identity: &NodeIdentity,
    ) -> Result<Self, KeyError> {
        Self::from_secret(
            id,
            valid_after,
            valid_until,
            StaticSecret::random_from_rng(OsRng),
            identity,
        )
    }

    pub(crate) fn from_secret(
        id: EpochId,
        valid_after: SystemTime,
        valid_until: SystemTime,
        secret: StaticSecret,
        identity: &NodeIdentity,
    ) -> Result<Self, KeyError> {
        if valid_until <= valid_after {
            return Err(KeyError::InvalidEpoch("epoch ends before it starts"));
        }
        let public = PublicKey::from(&secret);
        let transport = identity.issue_transport_credentials(
            valid_after.checked_sub(CERT_BACKDATE).unwrap_or(valid_after),
            valid_until,
        )?;
        Ok(Self {
            id,
            valid_after,
            valid_until,
            tag: KeyTag::of(&public),
            secret,
            public,
            transport,
        })
    }

    pub fn id(&self) -> EpochId {
        self.id
    }

    pub fn valid_after(&self) -> SystemTime {
        self.valid_after
    }

    pub fn valid_until(&self) -> SystemTime {
        self.valid_until
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn key_tag(&self) -> KeyTag {
        self.tag
    }

    pub fn transport(&self) -> &TransportCredentials {
        &self.transport
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    fn is_current(&self, now: SystemTime) -> bool {
        self.valid_after <= now && now < self.valid_until
    }

    fn accepts_packets(&self, now: SystemTime, grace: Duration) -> bool {
        self.valid_after <= now && now < self.valid_until + grace
    }
}

impl fmt::Debug for KeyEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEpoch")
            .field("id", &self.id)
            .field("valid_after", &self.valid_after)
            .field("valid_until", &self.valid_until)
            .finish_non_exhaustive()
    }
}

/// Immutable view of the epochs the node holds keys for. Updates build a new
/// ring; readers keep whatever snapshot they started with.
#[derive(Clone, Debug, Default)]
pub struct KeyRing {
    epochs: Vec<Arc<KeyEpoch>>,
    grace: Duration,
}

impl KeyRing {
    pub fn new(grace: Duration) -> Self {
        Self {
            epochs: Vec::new(),
            grace,
        }
    }

    pub fn with_epoch(&self, epoch: Arc<KeyEpoch>) -> Self {
        let mut next = self.without(epoch.id());
        next.epochs.push(epoch);
        next.epochs.sort_by_key(|e| e.valid_after());
        next
    }

    pub fn without(&self, id: EpochId) -> Self {
        Self {
            epochs: self
                .epochs
                .iter()
                .filter(|e| e.id() != id)
                .cloned()
                .collect(),
            grace: self.grace,
        }
    }

    /// The latest-starting epoch whose validity covers `now`.
    pub fn current(&self, now: SystemTime) -> Option<&Arc<KeyEpoch>> {
        self.epochs.iter().rev().find(|e| e.is_current(now))
    }

    /// Epoch whose key a packet tagged `tag` must be opened with, provided
    /// it is current or still inside its grace window.
    pub fn for_packet(&self, tag: &KeyTag, now: SystemTime) -> Option<&Arc<KeyEpoch>> {
        self.epochs
            .iter()
            .find(|e| e.key_tag() == *tag && e.accepts_packets(now, self.grace))
    }

    pub fn get(&self, id: EpochId) -> Option<&Arc<KeyEpoch>> {
        self.epochs.iter().find(|e| e.id() == id)
    }

    pub fn epochs(&self) -> impl Iterator<Item = &Arc<KeyEpoch>> {
        self.epochs.iter()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// An identity plus one epoch starting at `start` and lasting an hour.
    pub fn epoch_at(id: u64, start: SystemTime) -> (NodeIdentity, Arc<KeyEpoch>) {
        let identity = NodeIdentity::generate().unwrap();
        let epoch = KeyEpoch::generate(
            EpochId(id),
            start,
            start + Duration::from_secs(3600),
            &identity,
        )
        .unwrap();
        (identity, Arc::new(epoch))
    }
}
