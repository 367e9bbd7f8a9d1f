//! MMTP: fixed-size packet framing over an established transport session.
//!
//! ```text
//! initiator: "MMTP 0.3\r\n"             acceptor: "MMTP 0.3\r\n"
//! initiator: "SEND\r\n" | "JUNK\r\n" || packet || H(packet || "SEND" | "JUNK")
//! acceptor:  "RECEIVED\r\n" | "REJECTED\r\n" || H(packet || label)
//! ```
//!
//! Junk is acknowledged as RECEIVED with the label "RECEIVED JUNK".

use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::packet::{Packet, DIGEST_LEN, PACKET_LEN};
use crate::transport::driver::AsyncSession;
use crate::transport::TransportError;

pub const PROTOCOL_VERSION: &str = "0.3";
const MAX_PROTOCOL_LINE: usize = 4096;

const SEND: &[u8; 6] = b"SEND\r\n";
const JUNK: &[u8; 6] = b"JUNK\r\n";
const RECEIVED: &[u8; 10] = b"RECEIVED\r\n";
const REJECTED: &[u8; 10] = b"REJECTED\r\n";

const COMMAND_LEN: usize = 6;
const ACK_LEN: usize = 10;
pub const FRAME_LEN: usize = COMMAND_LEN + PACKET_LEN + DIGEST_LEN;

#[derive(Debug, Error)]
pub enum MmtpError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed protocol line")]
    MalformedProtocol,
    #[error("no common MMTP version in {0:?}")]
    UnsupportedVersion(String),
    #[error("unrecognized command {0:?}")]
    UnknownCommand(Vec<u8>),
    #[error("invalid frame checksum")]
    BadChecksum,
    #[error("acknowledgement does not match the packet sent")]
    BadAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Received,
    Rejected,
}

#[derive(Debug)]
pub enum Inbound {
    Packet(Packet),
    /// Link padding; already acknowledged.
    Junk,
}

fn checksum(packet: &[u8], label: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(packet);
    hasher.update(label);
    hasher.finalize().into()
}

/// Reads one `\r\n`-terminated line, returning it without the terminator.
async fn read_line(session: &mut AsyncSession) -> Result<Option<Vec<u8>>, MmtpError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if !session.read_exact_or_eof(&mut byte).await? {
            return if line.is_empty() {
                Ok(None)
            } else {
                Err(MmtpError::MalformedProtocol)
            };
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return Ok(Some(line));
        }
        if line.len() > MAX_PROTOCOL_LINE {
            return Err(MmtpError::MalformedProtocol);
        }
    }
}

fn parse_versions(line: &[u8]) -> Result<Vec<&str>, MmtpError> {
    let text = std::str::from_utf8(line).map_err(|_| MmtpError::MalformedProtocol)?;
    let list = text.strip_prefix("MMTP ").ok_or(MmtpError::MalformedProtocol)?;
    if list.is_empty() || list.contains(char::is_whitespace) {
        return Err(MmtpError::MalformedProtocol);
    }
    Ok(list.split(',').collect())
}

/// A session that has completed MMTP version negotiation.
#[derive(Debug)]
pub struct MmtpConnection {
    session: AsyncSession,
}

impl MmtpConnection {
    pub async fn initiate(mut session: AsyncSession) -> Result<Self, MmtpError> {
        let offer = format!("MMTP {PROTOCOL_VERSION}\r\n");
        session.write_all(offer.as_bytes()).await?;
        let line = read_line(&mut session)
            .await?
            .ok_or(TransportError::PeerClosed)?;
        let versions = parse_versions(&line)?;
        if versions != [PROTOCOL_VERSION] {
            return Err(MmtpError::UnsupportedVersion(
                String::from_utf8_lossy(&line).into_owned(),
            ));
        }
        Ok(Self { session })
    }

    pub async fn accept(mut session: AsyncSession) -> Result<Self, MmtpError> {
        let line = read_line(&mut session)
            .await?
            .ok_or(TransportError::PeerClosed)?;
        let versions = parse_versions(&line)?;
        if !versions.contains(&PROTOCOL_VERSION) {
            warn!(offered = %String::from_utf8_lossy(&line), "no common MMTP version");
            return Err(MmtpError::UnsupportedVersion(
                String::from_utf8_lossy(&line).into_owned(),
            ));
        }
        let answer = format!("MMTP {PROTOCOL_VERSION}\r\n");
        session.write_all(answer.as_bytes()).await?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &AsyncSession {
        &self.session
    }

    async fn send_frame(&mut self, command: &[u8; 6], packet: &[u8]) -> Result<Ack, MmtpError> {
        let label = &command[..4];
        let mut frame = Vec::with_capacity(FRAME_LEN);
        frame.extend_from_slice(command);
        frame.extend_from_slice(packet);
        frame.extend_from_slice(&checksum(packet, label));
        self.session.write_all(&frame).await?;

        let mut reply = [0u8; ACK_LEN + DIGEST_LEN];
        self.session.read_exact(&mut reply).await?;
        let (control, digest) = reply.split_at(ACK_LEN);
        let (ack, label): (Ack, &[u8]) = match (control, command == JUNK) {
            (c, false) if c == RECEIVED => (Ack::Received, &b"RECEIVED"[..]),
            (c, false) if c == REJECTED => (Ack::Rejected, &b"REJECTED"[..]),
            (c, true) if c == RECEIVED => (Ack::Received, &b"RECEIVED JUNK"[..]),
            _ => return Err(MmtpError::BadAck),
        };
        if !bool::from(checksum(packet, label)[..].ct_eq(digest)) {
            return Err(MmtpError::BadAck);
        }
        Ok(ack)
    }

    /// Sends one packet and waits for the peer's acknowledgement.
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<Ack, MmtpError> {
        self.send_frame(SEND, packet.as_bytes()).await
    }

    /// Sends one packet of random link padding.
    pub async fn send_junk(&mut self) -> Result<(), MmtpError> {
        let mut padding = vec![0u8; PACKET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        self.send_frame(JUNK, &padding).await.map(|_| ())
    }

    /// Reads the next frame. `None` means the initiator closed cleanly
    /// between frames. A real packet must be answered with [`Self::acknowledge`]
    /// before the next call.
    pub async fn receive(&mut self) -> Result<Option<Inbound>, MmtpError> {
        let mut frame = vec![0u8; FRAME_LEN];
        if !self.session.read_exact_or_eof(&mut frame).await? {
            return Ok(None);
        }
        let digest = frame.split_off(COMMAND_LEN + PACKET_LEN);
        let packet_bytes = frame.split_off(COMMAND_LEN);
        let command = frame;

        let label: &[u8] = if command == SEND {
            &b"SEND"[..]
        } else if command == JUNK {
            &b"JUNK"[..]
        } else {
            return Err(MmtpError::UnknownCommand(command));
        };
        if !bool::from(checksum(&packet_bytes, label)[..].ct_eq(&digest[..])) {
            return Err(MmtpError::BadChecksum);
        }

        if command == JUNK {
            debug!("link padding received");
            let mut reply = Vec::with_capacity(ACK_LEN + DIGEST_LEN);
            reply.extend_from_slice(RECEIVED);
            reply.extend_from_slice(&checksum(&packet_bytes, b"RECEIVED JUNK"));
            self.session.write_all(&reply).await?;
            return Ok(Some(Inbound::Junk));
        }

        let packet = Packet::from_bytes(packet_bytes).map_err(|_| MmtpError::BadChecksum)?;
        Ok(Some(Inbound::Packet(packet)))
    }

    pub async fn acknowledge(&mut self, packet: &Packet, ack: Ack) -> Result<(), MmtpError> {
        let (control, label): (&[u8], &[u8]) = match ack {
            Ack::Received => (&RECEIVED[..], &b"RECEIVED"[..]),
            Ack::Rejected => (&REJECTED[..], &b"REJECTED"[..]),
        };
        let mut reply = Vec::with_capacity(ACK_LEN + DIGEST_LEN);
        reply.extend_from_slice(control);
        reply.extend_from_slice(&checksum(packet.as_bytes(), label));
        self.session.write_all(&reply).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), MmtpError> {
        self.session.shutdown().await?;
        Ok(())
    }
}
