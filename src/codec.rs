//! Peels one onion layer off a packet, and seals packets for a path of hops.
//!
//! Each header begins with a 200-byte subheader addressed to this node:
//!
//! ```text
//! key tag (8) | ephemeral X25519 key (32) | HMAC-SHA256 (32) | routing (128)
//! ```
//!
//! The X25519 shared secret is expanded with HKDF into five hop keys. The
//! routing block is AES-256-CTR encrypted; the MAC covers the routing
//! ciphertext and the remaining 1848 header bytes. The next header is the
//! decrypted remainder followed by 200 bytes of padding keystream, so header
//! length never changes along a path.

use std::time::SystemTime;

use aes::Aes256;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::{EpochId, IdentityDigest, KeyRing, KeyTag, KEY_TAG_LEN};
use crate::packet::{ExitInfo, Fragment, Packet, BODY_LEN, HEADER_LEN};

pub const SUBHEADER_LEN: usize = 200;
pub const MAX_HOPS: usize = HEADER_LEN / SUBHEADER_LEN;

const EPHEMERAL_AT: usize = KEY_TAG_LEN;
const MAC_AT: usize = EPHEMERAL_AT + 32;
const ROUTING_AT: usize = MAC_AT + 32;
const ROUTING_LEN: usize = SUBHEADER_LEN - ROUTING_AT;
const REST_LEN: usize = HEADER_LEN - SUBHEADER_LEN;

/// type (1) + data length (2)
const ROUTING_PREFIX_LEN: usize = 3;
const ROUTING_DATA_MAX: usize = ROUTING_LEN - ROUTING_PREFIX_LEN;

const ROUTE_DROP: u8 = 0;
const ROUTE_FORWARD: u8 = 1;
const ROUTE_DELIVER: u8 = 2;

const HOP_KEY_INFO: &[u8] = b"mixnode hop keys v1";

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet failed to decode: {0}")]
    Decode(&'static str),
    #[error("packet is sealed to a key epoch this node does not hold")]
    WrongEpoch,
    #[error("cannot build packet: {0}")]
    Build(&'static str),
}

/// Where a forwarded packet goes next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHop {
    pub identity: IdentityDigest,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    Forward(NextHop),
    Deliver(ExitInfo),
    Drop,
}

#[derive(Debug)]
pub enum Action {
    Forward { next_hop: NextHop, packet: Packet },
    Deliver { exit: ExitInfo, fragment: Fragment },
    Drop,
}

/// Result of removing this node's layer.
#[derive(Debug)]
pub struct Peeled {
    /// Epoch whose key opened the layer; replay detection is scoped to it.
    pub epoch: EpochId,
    pub action: Action,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct HopKeys {
    routing: [u8; 32],
    mac: [u8; 32],
    header: [u8; 32],
    padding: [u8; 32],
    body: [u8; 32],
}

impl HopKeys {
    fn derive(shared: &[u8; 32], tag: &KeyTag) -> Result<Self, CodecError> {
        let hkdf = Hkdf::<Sha256>::new(Some(&tag.0), shared);
        let mut okm = [0u8; 32 * 5];
        hkdf.expand(HOP_KEY_INFO, &mut okm)
            .map_err(|_| CodecError::Decode("key expansion failed"))?;
        let mut keys = HopKeys {
            routing: [0u8; 32],
            mac: [0u8; 32],
            header: [0u8; 32],
            padding: [0u8; 32],
            body: [0u8; 32],
        };
        for (slot, chunk) in [
            &mut keys.routing,
            &mut keys.mac,
            &mut keys.header,
            &mut keys.padding,
            &mut keys.body,
        ]
        .into_iter()
        .zip(okm.chunks_exact(32))
        {
            slot.copy_from_slice(chunk);
        }
        okm.zeroize();
        Ok(keys)
    }

    fn mac(&self, routing_ct: &[u8], rest: &[u8]) -> Result<[u8; 32], CodecError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac)
            .map_err(|_| CodecError::Decode("bad mac key"))?;
        mac.update(routing_ct);
        mac.update(rest);
        Ok(mac.finalize().into_bytes().into())
    }
}

fn apply_keystream(key: &[u8; 32], data: &mut [u8]) {
    let iv = [0u8; 16];
    let mut cipher = Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    cipher.apply_keystream(data);
}

fn keystream(key: &[u8; 32], len: usize) -> Vec<u8> {
    let mut stream = vec![0u8; len];
    apply_keystream(key, &mut stream);
    stream
}

/// Zero padding after the declared routing data, and a length that fits.
fn padding_is_clean(routing: &[u8]) -> Choice {
    let len = u16::from_be_bytes([routing[1], routing[2]]) as usize;
    let end = ROUTING_PREFIX_LEN + len;
    let mut clean = Choice::from(u8::from(end <= ROUTING_LEN));
    for (i, byte) in routing.iter().enumerate().skip(ROUTING_PREFIX_LEN) {
        let in_padding = Choice::from(u8::from(i >= end));
        clean &= !in_padding | byte.ct_eq(&0);
    }
    clean
}

fn parse_routing(routing: &[u8]) -> Result<Routing, CodecError> {
    let len = u16::from_be_bytes([routing[1], routing[2]]) as usize;
    let data = &routing[ROUTING_PREFIX_LEN..ROUTING_PREFIX_LEN + len];
    match routing[0] {
        ROUTE_DROP => Ok(Routing::Drop),
        ROUTE_FORWARD => {
            if data.len() < 34 {
                return Err(CodecError::Decode("forward routing too short"));
            }
            let mut identity = [0u8; 32];
            identity.copy_from_slice(&data[..32]);
            let port = u16::from_be_bytes([data[32], data[33]]);
            let host = std::str::from_utf8(&data[34..])
                .map_err(|_| CodecError::Decode("next hop host is not utf-8"))?;
            if host.is_empty() {
                return Err(CodecError::Decode("next hop host is empty"));
            }
            Ok(Routing::Forward(NextHop {
                identity: IdentityDigest(identity),
                host: host.to_string(),
                port,
            }))
        }
        ROUTE_DELIVER => {
            if data.len() < 2 {
                return Err(CodecError::Decode("deliver routing too short"));
            }
            let exit_type = u16::from_be_bytes([data[0], data[1]]);
            let address = std::str::from_utf8(&data[2..])
                .map_err(|_| CodecError::Decode("exit address is not utf-8"))?;
            Ok(Routing::Deliver(ExitInfo {
                exit_type,
                address: address.to_string(),
            }))
        }
        _ => Err(CodecError::Decode("unknown routing type")),
    }
}

fn encode_routing(routing: &Routing) -> Result<[u8; ROUTING_LEN], CodecError> {
    let (kind, data) = match routing {
        Routing::Drop => (ROUTE_DROP, Vec::new()),
        Routing::Forward(next) => {
            let mut data = next.identity.0.to_vec();
            data.extend_from_slice(&next.port.to_be_bytes());
            data.extend_from_slice(next.host.as_bytes());
            (ROUTE_FORWARD, data)
        }
        Routing::Deliver(exit) => {
            let mut data = exit.exit_type.to_be_bytes().to_vec();
            data.extend_from_slice(exit.address.as_bytes());
            (ROUTE_DELIVER, data)
        }
    };
    if data.len() > ROUTING_DATA_MAX {
        return Err(CodecError::Build("routing information too long"));
    }
    let mut block = [0u8; ROUTING_LEN];
    block[0] = kind;
    block[1..3].copy_from_slice(&(data.len() as u16).to_be_bytes());
    block[ROUTING_PREFIX_LEN..ROUTING_PREFIX_LEN + data.len()].copy_from_slice(&data);
    Ok(block)
}

/// Removes this node's layer. Pure: no replay check, no I/O.
pub fn decrypt(packet: &Packet, ring: &KeyRing, now: SystemTime) -> Result<Peeled, CodecError> {
    let (sub, rest) = packet.header().split_at(SUBHEADER_LEN);

    let mut tag = [0u8; KEY_TAG_LEN];
    tag.copy_from_slice(&sub[..EPHEMERAL_AT]);
    let tag = KeyTag(tag);
    let epoch = ring.for_packet(&tag, now).ok_or(CodecError::WrongEpoch)?;

    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&sub[EPHEMERAL_AT..MAC_AT]);
    let shared = epoch.secret().diffie_hellman(&PublicKey::from(ephemeral));
    let keys = HopKeys::derive(shared.as_bytes(), &tag)?;

    let received_mac = &sub[MAC_AT..ROUTING_AT];
    let routing_ct = &sub[ROUTING_AT..];

    // Everything is derived before any check is looked at.
    let expected_mac = keys.mac(routing_ct, rest)?;
    let mut routing = routing_ct.to_vec();
    apply_keystream(&keys.routing, &mut routing);
    let mut next = Vec::with_capacity(crate::packet::PACKET_LEN);
    next.extend_from_slice(rest);
    apply_keystream(&keys.header, &mut next);
    next.extend_from_slice(&keystream(&keys.padding, SUBHEADER_LEN));
    let mut body = packet.body().to_vec();
    apply_keystream(&keys.body, &mut body);

    let valid = expected_mac[..].ct_eq(received_mac)
        & padding_is_clean(&routing)
        & Choice::from(u8::from(shared.was_contributory()));
    if !bool::from(valid) {
        return Err(CodecError::Decode("header authentication failed"));
    }

    let action = match parse_routing(&routing)? {
        Routing::Forward(next_hop) => {
            next.extend_from_slice(&body);
            let packet = Packet::received_at(next, packet.arrival())
                .map_err(|_| CodecError::Decode("next packet has the wrong length"))?;
            Action::Forward { next_hop, packet }
        }
        Routing::Deliver(exit) => {
            let fragment = Fragment::decode(&body)
                .map_err(|_| CodecError::Decode("fragment is malformed"))?;
            Action::Deliver { exit, fragment }
        }
        Routing::Drop => Action::Drop,
    };

    Ok(Peeled {
        epoch: epoch.id(),
        action,
    })
}

struct SealedHop {
    tag: KeyTag,
    ephemeral: PublicKey,
    keys: HopKeys,
    routing: [u8; ROUTING_LEN],
}

impl SealedHop {
    fn subheader(&self, rest: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut routing_ct = self.routing;
        apply_keystream(&self.keys.routing, &mut routing_ct);
        let mac = self.keys.mac(&routing_ct, rest)?;
        let mut sub = Vec::with_capacity(SUBHEADER_LEN);
        sub.extend_from_slice(&self.tag.0);
        sub.extend_from_slice(self.ephemeral.as_bytes());
        sub.extend_from_slice(&mac);
        sub.extend_from_slice(&routing_ct);
        Ok(sub)
    }
}

/// Seals a payload to a path of hops. Every hop but the last must forward.
#[derive(Debug, Default, Clone)]
pub struct OnionBuilder {
    hops: Vec<(PublicKey, Routing)>,
}

impl OnionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `public_key` is the hop's current epoch key; `routing` is what that
    /// hop will learn.
    pub fn hop(mut self, public_key: PublicKey, routing: Routing) -> Self {
        self.hops.push((public_key, routing));
        self
    }

    pub fn build(&self, payload: &[u8]) -> Result<Packet, CodecError> {
        let count = self.hops.len();
        if count == 0 || count > MAX_HOPS {
            return Err(CodecError::Build("path must have between 1 and 10 hops"));
        }
        if payload.len() != BODY_LEN {
            return Err(CodecError::Build("payload must fill the body exactly"));
        }
        let intermediate_ok = self.hops[..count - 1]
            .iter()
            .all(|(_, routing)| matches!(routing, Routing::Forward(_)));
        if !intermediate_ok {
            return Err(CodecError::Build("only the final hop may deliver or drop"));
        }

        let mut sealed = Vec::with_capacity(count);
        for (public_key, routing) in &self.hops {
            let secret = StaticSecret::random_from_rng(OsRng);
            let shared = secret.diffie_hellman(public_key);
            let tag = KeyTag::of(public_key);
            sealed.push(SealedHop {
                tag,
                ephemeral: PublicKey::from(&secret),
                keys: HopKeys::derive(shared.as_bytes(), &tag)?,
                routing: encode_routing(routing)?,
            });
        }

        // Bytes each intermediate hop appends, as later hops will see them.
        let mut filler: Vec<u8> = Vec::with_capacity((count - 1) * SUBHEADER_LEN);
        for hop in &sealed[..count - 1] {
            let stream = keystream(&hop.keys.header, REST_LEN);
            let start = REST_LEN - filler.len();
            for (byte, key) in filler.iter_mut().zip(&stream[start..]) {
                *byte ^= key;
            }
            filler.extend_from_slice(&keystream(&hop.keys.padding, SUBHEADER_LEN));
        }

        let mut rest = vec![0u8; REST_LEN - filler.len()];
        OsRng.fill_bytes(&mut rest);
        rest.extend_from_slice(&filler);
        let mut header = sealed[count - 1].subheader(&rest)?;
        header.extend_from_slice(&rest);

        for hop in sealed[..count - 1].iter().rev() {
            let mut rest = header[..REST_LEN].to_vec();
            apply_keystream(&hop.keys.header, &mut rest);
            header = hop.subheader(&rest)?;
            header.extend_from_slice(&rest);
        }

        let mut body = payload.to_vec();
        for hop in &sealed {
            apply_keystream(&hop.keys.body, &mut body);
        }

        header.extend_from_slice(&body);
        Packet::from_bytes(header).map_err(|_| CodecError::Build("packet length mismatch"))
    }
}

/// Convenience for a single fragment sealed to `hops`.
pub fn build_packet(
    hops: &[(PublicKey, Routing)],
    fragment: &Fragment,
) -> Result<Packet, CodecError> {
    let body = fragment
        .encode()
        .map_err(|_| CodecError::Build("fragment does not fit in a body"))?;
    hops.iter()
        .cloned()
        .fold(OnionBuilder::new(), |builder, (key, routing)| {
            builder.hop(key, routing)
        })
        .build(&body)
}
