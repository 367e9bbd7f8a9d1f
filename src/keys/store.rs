use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use super::{EpochId, KeyEpoch, KeyError, NodeIdentity, RetiredEpoch};

const IDENTITY_FILE: &str = "identity.pem";
const EPOCH_PREFIX: &str = "epoch-";
const EPOCH_SUFFIX: &str = ".json";

#[derive(Serialize, Deserialize)]
struct StoredEpoch {
    id: u64,
    valid_after: u64,
    valid_until: u64,
    decryption_key: String,
}

/// Private keys on disk, one file per epoch plus the identity key.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        set_private_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_or_create_identity(&self) -> Result<NodeIdentity, KeyError> {
        let path = self.dir.join(IDENTITY_FILE);
        match fs::read_to_string(&path) {
            Ok(pem) => NodeIdentity::from_pem(&pem).map_err(|e| KeyError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = NodeIdentity::generate()?;
                write_private(&path, identity.to_pem().as_bytes())?;
                info!(identity = %identity.digest(), "generated new identity key");
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_epoch(&self, epoch: &KeyEpoch) -> Result<(), KeyError> {
        let mut stored = StoredEpoch {
            id: epoch.id().0,
            valid_after: unix_seconds(epoch.valid_after()),
            valid_until: unix_seconds(epoch.valid_until()),
            decryption_key: hex::encode(epoch.secret().to_bytes()),
        };
        let encoded = serde_json::to_vec(&stored);
        stored.decryption_key.zeroize();
        let mut encoded = encoded.map_err(|e| KeyError::Generation(e.to_string()))?;
        let result = write_private(&self.epoch_path(epoch.id()), &encoded);
        encoded.zeroize();
        result
    }

    /// Every stored epoch, oldest first.
    pub fn load_epochs(&self, identity: &NodeIdentity) -> Result<Vec<KeyEpoch>, KeyError> {
        let mut epochs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with(EPOCH_PREFIX) && name.ends_with(EPOCH_SUFFIX)) {
                continue;
            }
            epochs.push(self.load_epoch(&entry.path(), identity)?);
        }
        epochs.sort_by_key(|e| e.valid_after());
        Ok(epochs)
    }

    fn load_epoch(&self, path: &Path, identity: &NodeIdentity) -> Result<KeyEpoch, KeyError> {
        let corrupt = |reason: String| KeyError::Corrupt {
            path: path.display().to_string(),
            reason,
        };
        let mut raw = fs::read(path)?;
        let parsed: Result<StoredEpoch, _> = serde_json::from_slice(&raw);
        raw.zeroize();
        let mut stored = parsed.map_err(|e| corrupt(e.to_string()))?;

        let decoded = hex::decode(&stored.decryption_key);
        stored.decryption_key.zeroize();
        let mut decoded = decoded.map_err(|e| corrupt(e.to_string()))?;
        let mut secret = [0u8; 32];
        if decoded.len() != secret.len() {
            decoded.zeroize();
            return Err(corrupt("decryption key has the wrong length".to_string()));
        }
        secret.copy_from_slice(&decoded);
        decoded.zeroize();

        KeyEpoch::from_secret(
            EpochId(stored.id),
            UNIX_EPOCH + Duration::from_secs(stored.valid_after),
            UNIX_EPOCH + Duration::from_secs(stored.valid_until),
            StaticSecret::from(secret),
            identity,
        )
    }

    /// Overwrites and unlinks the epoch's key file. Succeeds when the file is
    /// already gone.
    pub fn destroy_epoch(&self, id: EpochId) -> Result<RetiredEpoch, KeyError> {
        let path = self.epoch_path(id);
        match OpenOptions::new().write(true).open(&path) {
            Ok(mut file) => {
                let len = file.metadata()?.len() as usize;
                file.write_all(&vec![0u8; len])?;
                file.sync_all()?;
                drop(file);
                fs::remove_file(&path)?;
                File::open(&self.dir)?.sync_all()?;
                info!(epoch = %id, "destroyed epoch decryption key");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(epoch = %id, "epoch key already destroyed");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(RetiredEpoch { id })
    }

    fn epoch_path(&self, id: EpochId) -> PathBuf {
        self.dir
            .join(format!("{EPOCH_PREFIX}{:016}{EPOCH_SUFFIX}", id.0))
    }
}

fn unix_seconds(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn set_private_dir(dir: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Write-to-temp, fsync, rename, fsync directory. Mode 0600.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), KeyError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
