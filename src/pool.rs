//! Crash-safe on-disk queues.
//!
//! Each entry is a payload file plus a JSON metadata file. The file-name
//! prefix is the entry's state, and every state change is a single rename:
//!
//! | payload | metadata | state                              |
//! |---------|----------|------------------------------------|
//! | `inp_`  | `inpm_`  | being written, discarded on open   |
//! | `msg_`  | `meta_`  | queued                             |
//! | `rmv_`  | `rmvm_`  | being removed, deleted on open     |
//! | `crp_`  | `crpm_`  | quarantined, never touched again   |

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const INCOMING: &str = "inp_";
const INCOMING_META: &str = "inpm_";
const QUEUED: &str = "msg_";
const QUEUED_META: &str = "meta_";
const REMOVING: &str = "rmv_";
const REMOVING_META: &str = "rmvm_";
const CORRUPT: &str = "crp_";
const CORRUPT_META: &str = "crpm_";

const ID_BYTES: usize = 16;

/// Set to `1` to skip the directory permission check.
pub const NO_PERMISSION_CHECKS_ENV: &str = "MIXNODE_NO_PERMISSION_CHECKS";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not durably store entry: {0}")]
    Durability(std::io::Error),
    #[error("pool entry {0} is corrupt and was quarantined")]
    Corrupt(EntryId),
    #[error("pool entry {0} does not exist")]
    Missing(EntryId),
    #[error("pool I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pool metadata could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("pool directory {path} has mode {mode:o}; it must not be group or world writable")]
    InsecureDirectory { path: PathBuf, mode: u32 },
    #[error("invalid pool entry id {0:?}")]
    InvalidId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(String);

impl EntryId {
    fn random() -> Self {
        let mut raw = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut raw);
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn parse(text: &str) -> Result<Self, PoolError> {
        let valid = !text.is_empty()
            && text
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(text.to_string()))
        } else {
            Err(PoolError::InvalidId(text.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<M> {
    queued_at_ms: u64,
    metadata: M,
}

#[derive(Debug, Clone)]
pub struct PoolEntry<M> {
    pub id: EntryId,
    pub queued_at: SystemTime,
    pub metadata: M,
}

impl<M> PoolEntry<M> {
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.queued_at).unwrap_or(Duration::ZERO)
    }
}

/// A directory of queued entries carrying metadata of type `M`.
#[derive(Debug)]
pub struct Pool<M> {
    dir: PathBuf,
    _metadata: PhantomData<fn() -> M>,
}

impl<M> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            _metadata: PhantomData,
        }
    }
}

impl<M: Serialize + DeserializeOwned> Pool<M> {
    /// Opens (creating if needed) and recovers the pool: half-written entries
    /// are discarded and half-removed ones finished off.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PoolError> {
        let dir = dir.into();
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;
        check_permissions(&dir)?;
        let pool = Self {
            dir,
            _metadata: PhantomData,
        };
        pool.recover()?;
        Ok(pool)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, prefix: &str, id: &EntryId) -> PathBuf {
        self.dir.join(format!("{prefix}{}", id.0))
    }

    fn recover(&self) -> Result<(), PoolError> {
        let mut discarded = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let stale = [INCOMING, INCOMING_META, REMOVING, REMOVING_META]
                .iter()
                .any(|prefix| name.starts_with(prefix));
            let orphan_meta = name
                .strip_prefix(QUEUED_META)
                .map(|id| !self.dir.join(format!("{QUEUED}{id}")).exists())
                .unwrap_or(false);
            if stale || orphan_meta {
                remove_if_present(&entry.path())?;
                discarded += 1;
            }
        }
        if discarded > 0 {
            sync_dir(&self.dir)?;
            debug!(pool = %self.dir.display(), discarded, "recovered pool");
        }
        Ok(())
    }

    pub fn enqueue(&self, payload: &[u8], metadata: &M) -> Result<EntryId, PoolError> {
        self.enqueue_at(payload, metadata, SystemTime::now())
    }

    /// Returns only after payload, metadata, and both renames are on disk.
    pub fn enqueue_at(
        &self,
        payload: &[u8],
        metadata: &M,
        queued_at: SystemTime,
    ) -> Result<EntryId, PoolError> {
        let encoded = encode_envelope(metadata, queued_at)?;
        let id = EntryId::random();

        let result = (|| {
            write_synced(&self.path(INCOMING, &id), payload)?;
            write_synced(&self.path(INCOMING_META, &id), &encoded)?;
            fs::rename(self.path(INCOMING_META, &id), self.path(QUEUED_META, &id))?;
            fs::rename(self.path(INCOMING, &id), self.path(QUEUED, &id))?;
            sync_dir(&self.dir)
        })();

        if let Err(e) = result {
            self.discard_partial(&id);
            return Err(PoolError::Durability(e));
        }
        Ok(id)
    }

    /// Best-effort cleanup of every file an interrupted enqueue may have
    /// created, the payload first so no `msg_` outlives its metadata.
    fn discard_partial(&self, id: &EntryId) {
        for prefix in [QUEUED, INCOMING, QUEUED_META, INCOMING_META] {
            if let Err(e) = remove_if_present(&self.path(prefix, id)) {
                warn!(entry = %id, prefix, error = %e, "could not clean up failed enqueue");
            }
        }
    }

    /// Lazily lists queued entry ids. Entries added or removed during the
    /// scan may or may not appear.
    pub fn scan(&self) -> Result<Scan, PoolError> {
        Ok(Scan {
            entries: fs::read_dir(&self.dir)?,
        })
    }

    /// Every queued entry with its metadata. Corrupt entries are quarantined
    /// and skipped, as are entries removed while scanning.
    pub fn entries(
        &self,
    ) -> Result<impl Iterator<Item = Result<PoolEntry<M>, PoolError>> + '_, PoolError> {
        Ok(self.scan()?.filter_map(move |id| {
            let id = match id {
                Ok(id) => id,
                Err(e) => return Some(Err(e)),
            };
            match self.load(&id) {
                Ok(entry) => Some(Ok(entry)),
                Err(PoolError::Missing(_)) => None,
                Err(PoolError::Corrupt(id)) => {
                    warn!(pool = %self.dir.display(), entry = %id, "quarantined corrupt entry");
                    None
                }
                Err(e) => Some(Err(e)),
            }
        }))
    }

    pub fn load(&self, id: &EntryId) -> Result<PoolEntry<M>, PoolError> {
        let raw = match fs::read(self.path(QUEUED_META, id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.path(QUEUED, id).exists() {
                    self.mark_corrupt(id)?;
                    return Err(PoolError::Corrupt(id.clone()));
                }
                return Err(PoolError::Missing(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Envelope<M>>(&raw) {
            Ok(envelope) => Ok(PoolEntry {
                id: id.clone(),
                queued_at: UNIX_EPOCH + Duration::from_millis(envelope.queued_at_ms),
                metadata: envelope.metadata,
            }),
            Err(e) => {
                debug!(entry = %id, error = %e, "unparseable pool metadata");
                self.mark_corrupt(id)?;
                Err(PoolError::Corrupt(id.clone()))
            }
        }
    }

    /// Replaces an entry's metadata in one rename; its queue time is kept.
    pub fn update(&self, entry: &PoolEntry<M>) -> Result<(), PoolError> {
        let id = &entry.id;
        if !self.path(QUEUED, id).exists() {
            return Err(PoolError::Missing(id.clone()));
        }
        let encoded = encode_envelope(&entry.metadata, entry.queued_at)?;
        let staged = self.path(INCOMING_META, id);
        let result = write_synced(&staged, &encoded)
            .and_then(|()| fs::rename(&staged, self.path(QUEUED_META, id)))
            .and_then(|()| sync_dir(&self.dir));
        if let Err(e) = result {
            let _ = remove_if_present(&staged);
            return Err(PoolError::Durability(e));
        }
        Ok(())
    }

    pub fn get(&self, id: &EntryId) -> Result<Vec<u8>, PoolError> {
        fs::read(self.path(QUEUED, id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PoolError::Missing(id.clone()),
            _ => PoolError::Io(e),
        })
    }

    /// Removing an entry that is already gone succeeds.
    pub fn remove(&self, id: &EntryId) -> Result<(), PoolError> {
        rename_if_present(&self.path(QUEUED, id), &self.path(REMOVING, id))?;
        rename_if_present(&self.path(QUEUED_META, id), &self.path(REMOVING_META, id))?;
        remove_if_present(&self.path(REMOVING, id))?;
        remove_if_present(&self.path(REMOVING_META, id))?;
        sync_dir(&self.dir)?;
        Ok(())
    }

    pub fn mark_corrupt(&self, id: &EntryId) -> Result<(), PoolError> {
        rename_if_present(&self.path(QUEUED, id), &self.path(CORRUPT, id))?;
        rename_if_present(&self.path(QUEUED_META, id), &self.path(CORRUPT_META, id))?;
        sync_dir(&self.dir)?;
        Ok(())
    }

    /// Enqueues the payload into `dest` and then removes it here. A crash in
    /// between leaves a copy in both pools, never in neither.
    pub fn move_to<N: Serialize + DeserializeOwned>(
        &self,
        id: &EntryId,
        dest: &Pool<N>,
        metadata: &N,
    ) -> Result<EntryId, PoolError> {
        let payload = self.get(id)?;
        let moved = dest.enqueue(&payload, metadata)?;
        self.remove(id)?;
        Ok(moved)
    }

    pub fn len(&self) -> Result<usize, PoolError> {
        let mut count = 0;
        for id in self.scan()? {
            id?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, PoolError> {
        Ok(self.len()? == 0)
    }
}

pub struct Scan {
    entries: fs::ReadDir,
}

impl Iterator for Scan {
    type Item = Result<EntryId, PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_prefix(QUEUED)) {
                return Some(Ok(EntryId(id.to_string())));
            }
        }
    }
}

fn encode_envelope<M: Serialize>(metadata: &M, queued_at: SystemTime) -> Result<Vec<u8>, PoolError> {
    let envelope = Envelope {
        queued_at_ms: queued_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        metadata,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn check_permissions(dir: &Path) -> Result<(), PoolError> {
    if std::env::var(NO_PERMISSION_CHECKS_ENV).as_deref() == Ok("1") {
        return Ok(());
    }
    let mode = fs::metadata(dir)?.permissions().mode() & 0o777;
    if mode & 0o022 != 0 {
        return Err(PoolError::InsecureDirectory {
            path: dir.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

fn write_synced(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

fn rename_if_present(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
