//! Handing reassembled messages to whatever carries them off the network.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::packet::{ExitInfo, MessageId};

/// Metadata of an exit-pool entry; the payload is the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitMeta {
    pub message_id: MessageId,
    pub exit: ExitInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure; try again on a later pass.
    Retry(String),
    /// Permanent failure; drop the message.
    Failed(String),
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, meta: &ExitMeta, body: &[u8]) -> DeliveryOutcome;
}

/// Writes each message as a file in a maildir-style directory: staged in
/// `tmp/`, renamed into `new/`. The file holds the exit address, a newline,
/// and the body.
#[derive(Debug, Clone)]
pub struct MaildirDelivery {
    root: PathBuf,
}

impl MaildirDelivery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn store(&self, meta: &ExitMeta, body: &[u8]) -> std::io::Result<PathBuf> {
        let tmp = self.root.join("tmp");
        let new = self.root.join("new");
        tokio::fs::create_dir_all(&tmp).await?;
        tokio::fs::create_dir_all(&new).await?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let name = format!("{stamp}.{}.mixnode", meta.message_id);

        let staged = tmp.join(&name);
        let mut file = tokio::fs::File::create(&staged).await?;
        file.write_all(meta.exit.address.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.write_all(body).await?;
        file.sync_all().await?;

        let delivered = new.join(&name);
        tokio::fs::rename(&staged, &delivered).await?;
        Ok(delivered)
    }
}

#[async_trait]
impl DeliveryHandler for MaildirDelivery {
    async fn deliver(&self, meta: &ExitMeta, body: &[u8]) -> DeliveryOutcome {
        match self.store(meta, body).await {
            Ok(path) => {
                debug!(message = %meta.message_id, path = %path.display(), "message stored");
                DeliveryOutcome::Delivered
            }
            Err(e) => DeliveryOutcome::Retry(e.to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Maildir delivery that treats the address `fail` as a transient
    /// failure and `FAIL!` as a permanent one.
    #[derive(Debug, Clone)]
    pub(crate) struct ScriptedDelivery {
        inner: MaildirDelivery,
    }

    impl ScriptedDelivery {
        pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                inner: MaildirDelivery::new(root),
            }
        }
    }

    #[async_trait]
    impl DeliveryHandler for ScriptedDelivery {
        async fn deliver(&self, meta: &ExitMeta, body: &[u8]) -> DeliveryOutcome {
            match meta.exit.address.as_str() {
                "fail" => DeliveryOutcome::Retry("address requested a retry".to_string()),
                "FAIL!" => DeliveryOutcome::Failed("address refused delivery".to_string()),
                _ => self.inner.deliver(meta, body).await,
            }
        }
    }
}
