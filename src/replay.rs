//! Per-epoch replay detection.
//!
//! Each epoch owns an append-only log of hex digests, one per line. A digest
//! is fsynced to the log before the packet carrying it is reported fresh, so
//! a crash can never let a packet through twice. The log is locked with
//! `flock` for the lifetime of the cache.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::keys::{EpochId, RetiredEpoch};
use crate::packet::{PacketDigest, DIGEST_LEN};

const LOG_PREFIX: &str = "hashlog-";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("replay log {path} is locked by another process")]
    Locked { path: PathBuf },
    #[error("corrupt replay log entry at line {line}: {reason}")]
    CorruptLog { line: usize, reason: String },
    #[error("no replay cache is open for epoch {0}")]
    UnknownEpoch(EpochId),
    #[error("replay log {path} could not be rolled back after a failed write")]
    Poisoned { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Fresh,
    Duplicate,
}

struct Log {
    seen: HashSet<PacketDigest>,
    file: File,
    /// Length of the log up to its last complete, synced line.
    committed: u64,
    poisoned: bool,
}

/// Digests seen under one key epoch.
pub struct ReplayCache {
    epoch: EpochId,
    path: PathBuf,
    log: Mutex<Log>,
}

impl std::fmt::Debug for ReplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCache")
            .field("epoch", &self.epoch)
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

impl ReplayCache {
    pub fn open(path: impl AsRef<Path>, epoch: EpochId) -> Result<Self, ReplayError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| ReplayError::Locked { path: path.clone() })?;

        let file_len = file.metadata()?.len();
        let mut seen = HashSet::new();
        let mut truncate_to = None;
        {
            let mut replay = file.try_clone()?;
            replay.seek(SeekFrom::Start(0))?;
            let lines: Vec<String> = BufReader::new(replay)
                .lines()
                .collect::<Result<Vec<_>, _>>()?;
            let last = lines.len().saturating_sub(1);
            let mut offset = 0u64;
            for (index, line) in lines.iter().enumerate() {
                let line_len = (line.len() + 1) as u64;
                let unterminated = offset + line_len > file_len;
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    match parse_digest(trimmed) {
                        Ok(_) if unterminated => {
                            // A write cut short before its newline; the
                            // digest was never reported fresh.
                            warn!(
                                line = index + 1,
                                path = %path.display(),
                                "truncating unterminated tail of replay log"
                            );
                            truncate_to = Some(offset);
                        }
                        Ok(digest) => {
                            seen.insert(digest);
                        }
                        Err(reason) if index == last => {
                            // Torn write: never fsynced, so never reported fresh.
                            warn!(
                                line = index + 1,
                                %reason,
                                path = %path.display(),
                                "truncating torn tail of replay log"
                            );
                            truncate_to = Some(offset);
                        }
                        Err(reason) => {
                            return Err(ReplayError::CorruptLog {
                                line: index + 1,
                                reason,
                            })
                        }
                    }
                }
                offset += line_len;
            }
        }

        let committed = match truncate_to {
            Some(len) => {
                file.set_len(len)?;
                file.sync_all()?;
                len
            }
            None => file_len,
        };

        debug!(epoch = %epoch, entries = seen.len(), "opened replay log");
        Ok(Self {
            epoch,
            path,
            log: Mutex::new(Log {
                seen,
                file,
                committed,
                poisoned: false,
            }),
        })
    }

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    /// Records `digest` and reports whether it had been seen before. `Fresh`
    /// is returned only once the digest is durable.
    ///
    /// A failed append is cut back off the log so the next line starts
    /// clean. If even that fails the cache refuses all further inserts.
    pub fn test_and_insert(&self, digest: &PacketDigest) -> Result<ReplayOutcome, ReplayError> {
        let mut log = self.log.lock();
        if log.poisoned {
            return Err(ReplayError::Poisoned {
                path: self.path.clone(),
            });
        }
        if log.seen.contains(digest) {
            return Ok(ReplayOutcome::Duplicate);
        }

        let line = format!("{}\n", digest.to_hex());
        if let Err(e) = append_line(&mut log, line.as_bytes()) {
            let committed = log.committed;
            if let Err(rollback) = log
                .file
                .set_len(committed)
                .and_then(|()| log.file.sync_data())
            {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "replay log rollback failed; refusing further inserts"
                );
                log.poisoned = true;
            }
            return Err(e.into());
        }
        log.committed += line.len() as u64;
        log.seen.insert(*digest);
        Ok(ReplayOutcome::Fresh)
    }

    pub fn contains(&self, digest: &PacketDigest) -> bool {
        self.log.lock().seen.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.log.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Appends one line after the committed end, dropping anything a failed
/// earlier append left beyond it.
fn append_line(log: &mut Log, line: &[u8]) -> std::io::Result<()> {
    if log.file.metadata()?.len() != log.committed {
        log.file.set_len(log.committed)?;
    }
    log.file.write_all(line)?;
    log.file.sync_data()
}

fn parse_digest(text: &str) -> Result<PacketDigest, String> {
    let raw = hex::decode(text).map_err(|e| e.to_string())?;
    let raw: [u8; DIGEST_LEN] = raw
        .try_into()
        .map_err(|raw: Vec<u8>| format!("expected {DIGEST_LEN} bytes, got {}", raw.len()))?;
    Ok(PacketDigest(raw))
}

/// One [`ReplayCache`] per live epoch, all under the node's `replay/`
/// directory.
#[derive(Debug)]
pub struct ReplayCaches {
    dir: PathBuf,
    caches: RwLock<HashMap<EpochId, Arc<ReplayCache>>>,
}

impl ReplayCaches {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ReplayError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            caches: RwLock::new(HashMap::new()),
        })
    }

    fn log_path(&self, epoch: EpochId) -> PathBuf {
        self.dir.join(format!("{LOG_PREFIX}{}", epoch.0))
    }

    /// Opens the epoch's log if it is not open already.
    pub fn open_epoch(&self, epoch: EpochId) -> Result<Arc<ReplayCache>, ReplayError> {
        if let Some(cache) = self.caches.read().get(&epoch) {
            return Ok(cache.clone());
        }
        let mut caches = self.caches.write();
        if let Some(cache) = caches.get(&epoch) {
            return Ok(cache.clone());
        }
        let cache = Arc::new(ReplayCache::open(self.log_path(epoch), epoch)?);
        caches.insert(epoch, cache.clone());
        Ok(cache)
    }

    pub fn get(&self, epoch: EpochId) -> Option<Arc<ReplayCache>> {
        self.caches.read().get(&epoch).cloned()
    }

    pub fn test_and_insert(
        &self,
        epoch: EpochId,
        digest: &PacketDigest,
    ) -> Result<ReplayOutcome, ReplayError> {
        self.get(epoch)
            .ok_or(ReplayError::UnknownEpoch(epoch))?
            .test_and_insert(digest)
    }

    /// Drops the epoch's cache and deletes its log. Requires proof that the
    /// epoch's decryption key is already gone.
    pub fn retire(&self, retired: RetiredEpoch) -> Result<(), ReplayError> {
        let epoch = retired.id();
        self.caches.write().remove(&epoch);
        match fs::remove_file(self.log_path(epoch)) {
            Ok(()) => info!(epoch = %epoch, "retired replay log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn epochs(&self) -> Vec<EpochId> {
        let mut epochs: Vec<EpochId> = self.caches.read().keys().copied().collect();
        epochs.sort();
        epochs
    }
}
