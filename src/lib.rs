//! A Type III anonymous remailer mix node.
//!
//! Packets arrive over an authenticated TLS link ([`transport`], framed by
//! [`mmtp`]), lose one onion layer ([`codec`]), pass the per-epoch replay
//! check ([`replay`]), and wait in durable pools ([`pool`], [`mix`]) until
//! they are relayed to the next hop ([`relay`]) or reassembled
//! ([`reassembly`]) and delivered ([`delivery`]). [`node`] runs it all.

pub mod codec;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod keys;
pub mod logging;
pub mod mix;
pub mod mmtp;
pub mod node;
pub mod packet;
pub mod pool;
pub mod reassembly;
pub mod relay;
pub mod replay;
pub mod server;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod pipeline_tests;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::{Control, MixNode};
