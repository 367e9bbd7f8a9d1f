//! Fixed-size packets and the payload structures carried inside them.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Every packet on the wire is exactly this long.
pub const PACKET_LEN: usize = 1 << 15;
pub const HEADER_LEN: usize = 2048;
pub const BODY_LEN: usize = PACKET_LEN - HEADER_LEN;

pub const DIGEST_LEN: usize = 32;
pub const MESSAGE_ID_LEN: usize = 20;

/// message id + index + count + data length
pub const FRAGMENT_HEADER_LEN: usize = MESSAGE_ID_LEN + 4 + 4 + 4;
pub const FRAGMENT_DATA_LEN: usize = BODY_LEN - FRAGMENT_HEADER_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet has length {0}, expected {PACKET_LEN}")]
    WrongLength(usize),
    #[error("fragment payload is malformed: {0}")]
    MalformedFragment(&'static str),
}

/// Content hash used for replay detection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketDigest(pub [u8; DIGEST_LEN]);

impl PacketDigest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PacketDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketDigest({})", &self.to_hex()[..16])
    }
}

/// One onion-encrypted packet as it arrived from the network.
#[derive(Clone)]
pub struct Packet {
    bytes: Box<[u8]>,
    digest: PacketDigest,
    received_at: SystemTime,
}

impl Packet {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PacketError> {
        Self::received_at(bytes, SystemTime::now())
    }

    pub fn received_at(bytes: Vec<u8>, received_at: SystemTime) -> Result<Self, PacketError> {
        if bytes.len() != PACKET_LEN {
            return Err(PacketError::WrongLength(bytes.len()));
        }
        let digest = PacketDigest::of(&bytes);
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
            digest,
            received_at,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header(&self) -> &[u8] {
        &self.bytes[..HEADER_LEN]
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// Digest of the raw bytes as received, before any layer is removed.
    pub fn digest(&self) -> PacketDigest {
        self.digest
    }

    pub fn arrival(&self) -> SystemTime {
        self.received_at
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.into_vec()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// Identifies the message a fragment belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "hex_array")] pub [u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut id = [0u8; MESSAGE_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Self(id)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Where a fully reassembled message leaves the mix network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_type: u16,
    pub address: String,
}

/// One piece of a message, as carried in the body of a deliver-bound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: MessageId,
    pub index: u32,
    pub count: u32,
    pub data: Vec<u8>,
}

impl Fragment {
    /// Encodes into a full body, padding with zeros.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.data.len() > FRAGMENT_DATA_LEN {
            return Err(PacketError::MalformedFragment("fragment data too long"));
        }
        let mut body = Vec::with_capacity(BODY_LEN);
        body.extend_from_slice(&self.message_id.0);
        body.extend_from_slice(&self.index.to_be_bytes());
        body.extend_from_slice(&self.count.to_be_bytes());
        body.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.data);
        body.resize(BODY_LEN, 0);
        Ok(body)
    }

    pub fn decode(body: &[u8]) -> Result<Self, PacketError> {
        if body.len() != BODY_LEN {
            return Err(PacketError::MalformedFragment("body has wrong length"));
        }
        let mut message_id = [0u8; MESSAGE_ID_LEN];
        message_id.copy_from_slice(&body[..MESSAGE_ID_LEN]);
        let field = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&body[at..at + 4]);
            u32::from_be_bytes(word)
        };
        let index = field(MESSAGE_ID_LEN);
        let count = field(MESSAGE_ID_LEN + 4);
        let len = field(MESSAGE_ID_LEN + 8) as usize;
        if count == 0 || index >= count {
            return Err(PacketError::MalformedFragment("index out of range"));
        }
        if len > FRAGMENT_DATA_LEN {
            return Err(PacketError::MalformedFragment("declared length too long"));
        }
        Ok(Self {
            message_id: MessageId(message_id),
            index,
            count,
            data: body[FRAGMENT_HEADER_LEN..FRAGMENT_HEADER_LEN + len].to_vec(),
        })
    }

    /// Splits `message` into as many fragments as it needs.
    pub fn split(message_id: MessageId, message: &[u8]) -> Vec<Fragment> {
        let chunks: Vec<&[u8]> = if message.is_empty() {
            vec![&[][..]]
        } else {
            message.chunks(FRAGMENT_DATA_LEN).collect()
        };
        let count = chunks.len() as u32;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| Fragment {
                message_id,
                index: index as u32,
                count,
                data: chunk.to_vec(),
            })
            .collect()
    }
}

pub(crate) mod hex_array {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(text).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom("hex value has the wrong length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_packets() {
        assert_eq!(
            Packet::from_bytes(vec![0u8; 100]).unwrap_err(),
            PacketError::WrongLength(100)
        );
    }

    #[test]
    fn digest_covers_raw_bytes() {
        let mut raw = vec![7u8; PACKET_LEN];
        let a = Packet::from_bytes(raw.clone()).unwrap();
        raw[PACKET_LEN - 1] = 8;
        let b = Packet::from_bytes(raw).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn fragment_body_decodes_back() {
        let fragment = Fragment {
            message_id: MessageId([3u8; MESSAGE_ID_LEN]),
            index: 1,
            count: 3,
            data: b"middle piece".to_vec(),
        };
        let body = fragment.encode().unwrap();
        assert_eq!(body.len(), BODY_LEN);
        assert_eq!(Fragment::decode(&body).unwrap(), fragment);
    }

    #[test]
    fn fragment_with_index_past_count_is_rejected() {
        let mut body = Fragment {
            message_id: MessageId([1u8; MESSAGE_ID_LEN]),
            index: 0,
            count: 1,
            data: vec![],
        }
        .encode()
        .unwrap();
        body[MESSAGE_ID_LEN..MESSAGE_ID_LEN + 4].copy_from_slice(&5u32.to_be_bytes());
        assert!(Fragment::decode(&body).is_err());
    }

    #[test]
    fn split_produces_ordered_fragments() {
        let message = vec![9u8; FRAGMENT_DATA_LEN * 2 + 10];
        let fragments = Fragment::split(MessageId([0u8; MESSAGE_ID_LEN]), &message);
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f.count == 3));
        assert_eq!(fragments[2].data.len(), 10);
    }
}
