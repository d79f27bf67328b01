//! Overlay wire messages
//!
//! Every datagram on the overlay socket (other than STUN traffic) starts
//! with a 1-byte kind tag. Formats are fixed-layout big-endian:
//!
//! ```text
//! Heartbeat:     [0x02][sender: 4][ack: 1]
//! Forward:       [0x03][final dst: 4][ciphertext: N]
//! DelayProbe:    [0x04][sender: 4][timestamp ms: 8]
//! DelayResponse: [0x05][sender: 4][echoed timestamp ms: 8]
//! RouteUpdate:   [0x06][sender: 4][dest: 4][cost: 4]
//! PeerEndpoint:  [0x07][addr: 4][ip: 4][port: 2]
//! ```
//!
//! `Forward` ciphertext is opaque here; sealing and opening live in
//! `meshknit-crypto`. Decoding happens on attacker-reachable input, so each
//! variant checks its exact length before touching the buffer.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::addr::Ip4;
use crate::error::{NetworkError, NetworkResult};

/// Message kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Heartbeat = 0x02,
    Forward = 0x03,
    DelayProbe = 0x04,
    DelayResponse = 0x05,
    RouteUpdate = 0x06,
    PeerEndpoint = 0x07,
}

impl TryFrom<u8> for MessageKind {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, NetworkError> {
        match value {
            0x02 => Ok(Self::Heartbeat),
            0x03 => Ok(Self::Forward),
            0x04 => Ok(Self::DelayProbe),
            0x05 => Ok(Self::DelayResponse),
            0x06 => Ok(Self::RouteUpdate),
            0x07 => Ok(Self::PeerEndpoint),
            _ => Err(NetworkError::InvalidDatagram(format!(
                "unknown message kind: 0x{:02x}",
                value
            ))),
        }
    }
}

/// A decoded overlay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness probe; `ack` is set once the sender has heard the receiver
    Heartbeat { sender: Ip4, ack: u8 },
    /// Sealed payload for `dst`, carried direct or through the relay
    Forward { dst: Ip4, ciphertext: Bytes },
    /// Round-trip measurement request
    DelayProbe { sender: Ip4, timestamp_ms: u64 },
    /// Echo of a delay probe
    DelayResponse { sender: Ip4, timestamp_ms: u64 },
    /// Distance-vector announcement: sender reaches `dest` at `cost`
    RouteUpdate { sender: Ip4, dest: Ip4, cost: u32 },
    /// A node's resolved public endpoint
    PeerEndpoint { addr: Ip4, endpoint: SocketAddrV4 },
}

impl Message {
    /// Kind tag of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::Forward { .. } => MessageKind::Forward,
            Message::DelayProbe { .. } => MessageKind::DelayProbe,
            Message::DelayResponse { .. } => MessageKind::DelayResponse,
            Message::RouteUpdate { .. } => MessageKind::RouteUpdate,
            Message::PeerEndpoint { .. } => MessageKind::PeerEndpoint,
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.kind() as u8);
        match self {
            Message::Heartbeat { sender, ack } => {
                buf.put_u32(sender.raw());
                buf.put_u8(*ack);
            }
            Message::Forward { dst, ciphertext } => {
                buf.put_u32(dst.raw());
                buf.put_slice(ciphertext);
            }
            Message::DelayProbe {
                sender,
                timestamp_ms,
            }
            | Message::DelayResponse {
                sender,
                timestamp_ms,
            } => {
                buf.put_u32(sender.raw());
                buf.put_u64(*timestamp_ms);
            }
            Message::RouteUpdate { sender, dest, cost } => {
                buf.put_u32(sender.raw());
                buf.put_u32(dest.raw());
                buf.put_u32(*cost);
            }
            Message::PeerEndpoint { addr, endpoint } => {
                buf.put_u32(addr.raw());
                buf.put_slice(&endpoint.ip().octets());
                buf.put_u16(endpoint.port());
            }
        }
        buf.freeze()
    }

    /// Parse a datagram into a message
    pub fn decode(data: &[u8]) -> NetworkResult<Message> {
        if data.is_empty() {
            return Err(NetworkError::InvalidDatagram("empty datagram".into()));
        }
        let kind = MessageKind::try_from(data[0])?;
        let mut body = &data[1..];

        let need = |body: &[u8], len: usize| -> NetworkResult<()> {
            if body.len() < len {
                Err(NetworkError::InvalidDatagram(format!(
                    "undersized {:?} message: {} bytes",
                    kind,
                    body.len() + 1
                )))
            } else {
                Ok(())
            }
        };

        match kind {
            MessageKind::Heartbeat => {
                need(body, 5)?;
                let sender = Ip4::from_raw(body.get_u32());
                let ack = body.get_u8();
                Ok(Message::Heartbeat { sender, ack })
            }
            MessageKind::Forward => {
                need(body, 4)?;
                let dst = Ip4::from_raw(body.get_u32());
                Ok(Message::Forward {
                    dst,
                    ciphertext: Bytes::copy_from_slice(body),
                })
            }
            MessageKind::DelayProbe => {
                need(body, 12)?;
                let sender = Ip4::from_raw(body.get_u32());
                let timestamp_ms = body.get_u64();
                Ok(Message::DelayProbe {
                    sender,
                    timestamp_ms,
                })
            }
            MessageKind::DelayResponse => {
                need(body, 12)?;
                let sender = Ip4::from_raw(body.get_u32());
                let timestamp_ms = body.get_u64();
                Ok(Message::DelayResponse {
                    sender,
                    timestamp_ms,
                })
            }
            MessageKind::RouteUpdate => {
                need(body, 12)?;
                let sender = Ip4::from_raw(body.get_u32());
                let dest = Ip4::from_raw(body.get_u32());
                let cost = body.get_u32();
                Ok(Message::RouteUpdate { sender, dest, cost })
            }
            MessageKind::PeerEndpoint => {
                need(body, 10)?;
                let addr = Ip4::from_raw(body.get_u32());
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                body.advance(4);
                let port = body.get_u16();
                Ok(Message::PeerEndpoint {
                    addr,
                    endpoint: SocketAddrV4::new(ip, port),
                })
            }
        }
    }
}

/// Extract an IPv4 `SocketAddrV4` from a peer's socket address, if any
pub fn as_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}
