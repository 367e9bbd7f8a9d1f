use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::keys::KeyError;
use crate::mmtp::MmtpError;
use crate::pool::PoolError;
use crate::reassembly::ReassemblyError;
use crate::replay::ReplayError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Mmtp(#[from] MmtpError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("node I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no key epoch is current")]
    NoCurrentEpoch,
}
