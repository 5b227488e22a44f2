//! Game server (datagram) protocol frames.
//!
//! A datagram is a frame; there is no partial decoding. The 21-byte header
//! is, in order: magic `0x4254` (2), version (1), flags (1), sender
//! sequence (4), ackbase (4), ackbits (1), channel (1), total size (2),
//! client id (4), command (1). The size field must equal the datagram
//! length or the packet is dropped.
//!
//! Payloads larger than [`MAX_FRAGMENT_BODY`] never fit a single datagram;
//! the sender splits the inner frame (command byte followed by its body)
//! into FRAGMENT frames and the receiver reassembles them before dispatch.

use bytes::{BufMut, BytesMut};

use crate::{FrameError, GS_MAGIC, VERSION};

/// Fixed header length of every datagram frame.
pub const HEADER_LEN: usize = 21;
/// Largest datagram the protocol ever emits.
pub const MAX_DATAGRAM: usize = 1200;
/// Fragment frames carry base seq, total and offset before the body.
pub const FRAGMENT_OVERHEAD: usize = 12;
/// Largest body a single FRAGMENT frame can carry; messages longer than
/// this are split at this boundary.
pub const MAX_FRAGMENT_BODY: usize = MAX_DATAGRAM - HEADER_LEN - FRAGMENT_OVERHEAD;

/// Header flag bits.
pub mod flags {
    pub const CONN: u8 = 0x01;
    pub const RELIABLE: u8 = 0x02;
    pub const FRAGMENT: u8 = 0x04;
    pub const PING: u8 = 0x08;
    pub const CLOSE: u8 = 0x10;
    /// Declared by the protocol, never set or interpreted by handlers.
    pub const ENCRYPTED: u8 = 0x20;
    /// Declared by the protocol, never set or interpreted by handlers.
    pub const COMPRESSED: u8 = 0x40;
}

/// Command identifiers of the datagram protocol.
pub mod cmd {
    pub const INPUT: u8 = 1;
    pub const SNAPSHOT: u8 = 2;
    pub const CHAT: u8 = 3;
    pub const PING: u8 = 4;
    pub const PONG: u8 = 5;
    pub const ACK: u8 = 6;
    pub const JOIN: u8 = 7;
    pub const KICK: u8 = 8;
    pub const CHALLENGE: u8 = 9;
    pub const AUTH: u8 = 10;
    pub const AUTH_OK: u8 = 11;
    pub const RESYNC: u8 = 12;
    pub const FRAGMENT: u8 = 13;
}

/// Delivery channel: (un)reliable crossed with (un)ordered.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    UnreliableUnordered = 0,
    UnreliableOrdered = 1,
    ReliableUnordered = 2,
    ReliableOrdered = 3,
}

impl Channel {
    pub fn is_reliable(self) -> bool {
        matches!(self, Channel::ReliableUnordered | Channel::ReliableOrdered)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Channel::UnreliableOrdered | Channel::ReliableOrdered)
    }
}

impl TryFrom<u8> for Channel {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Channel::UnreliableUnordered),
            1 => Ok(Channel::UnreliableOrdered),
            2 => Ok(Channel::ReliableUnordered),
            3 => Ok(Channel::ReliableOrdered),
            other => Err(FrameError::UnknownChannel(other)),
        }
    }
}

/// One decoded `(type, value)` pair of an INPUT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u8,
    pub value: u8,
}

/// Command plus payload of a datagram frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Input(Vec<InputEvent>),
    Snapshot { snapshot_seq: u32, state: Vec<u8> },
    Chat { text: String },
    Ping,
    Pong,
    Ack { seqs: Vec<u32> },
    Join { client_id: u32, nonce: u8, version: u8 },
    Kick { reason: String },
    Challenge { timestamp: u64, cookie: [u8; 32] },
    Auth { nonce: u8, cookie: [u8; 32] },
    AuthOk { client_id: u32, key_prefix: [u8; 8] },
    Resync,
    Fragment { base_seq: u32, total: u32, offset: u32, data: Vec<u8> },
}

impl Frame {
    pub fn command(&self) -> u8 {
        match self {
            Frame::Input(_) => cmd::INPUT,
            Frame::Snapshot { .. } => cmd::SNAPSHOT,
            Frame::Chat { .. } => cmd::CHAT,
            Frame::Ping => cmd::PING,
            Frame::Pong => cmd::PONG,
            Frame::Ack { .. } => cmd::ACK,
            Frame::Join { .. } => cmd::JOIN,
            Frame::Kick { .. } => cmd::KICK,
            Frame::Challenge { .. } => cmd::CHALLENGE,
            Frame::Auth { .. } => cmd::AUTH,
            Frame::AuthOk { .. } => cmd::AUTH_OK,
            Frame::Resync => cmd::RESYNC,
            Frame::Fragment { .. } => cmd::FRAGMENT,
        }
    }

    /// Serializes only the payload bytes that follow the command byte.
    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Frame::Input(events) => {
                for event in events {
                    buf.put_u8(event.kind);
                    buf.put_u8(event.value);
                }
            }
            Frame::Snapshot { snapshot_seq, state } => {
                buf.put_u32(*snapshot_seq);
                buf.put_slice(state);
            }
            Frame::Chat { text } => {
                buf.put_u16(text.len() as u16);
                buf.put_slice(text.as_bytes());
            }
            Frame::Ping | Frame::Pong | Frame::Resync => {}
            Frame::Ack { seqs } => {
                for seq in seqs {
                    buf.put_u32(*seq);
                }
            }
            Frame::Join { client_id, nonce, version } => {
                buf.put_u32(*client_id);
                buf.put_u8(*nonce);
                buf.put_u8(*version);
            }
            Frame::Kick { reason } => buf.put_slice(reason.as_bytes()),
            Frame::Challenge { timestamp, cookie } => {
                buf.put_u64(*timestamp);
                buf.put_slice(cookie);
            }
            Frame::Auth { nonce, cookie } => {
                buf.put_u8(*nonce);
                buf.put_slice(cookie);
            }
            Frame::AuthOk { client_id, key_prefix } => {
                buf.put_u32(*client_id);
                buf.put_slice(key_prefix);
            }
            Frame::Fragment { base_seq, total, offset, data } => {
                buf.put_u32(*base_seq);
                buf.put_u32(*total);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
        }
    }

    /// Parses a payload for the given command byte.
    pub fn decode_body(command: u8, body: &[u8]) -> Result<Frame, FrameError> {
        match command {
            cmd::INPUT => {
                if body.len() % 2 != 0 {
                    return Err(FrameError::MalformedPayload("INPUT"));
                }
                let events = body
                    .chunks_exact(2)
                    .map(|pair| InputEvent { kind: pair[0], value: pair[1] })
                    .collect();
                Ok(Frame::Input(events))
            }
            cmd::SNAPSHOT => {
                if body.len() < 4 {
                    return Err(FrameError::MalformedPayload("SNAPSHOT"));
                }
                Ok(Frame::Snapshot {
                    snapshot_seq: read_u32(&body[0..4]),
                    state: body[4..].to_vec(),
                })
            }
            cmd::CHAT => {
                if body.len() < 2 {
                    return Err(FrameError::MalformedPayload("CHAT"));
                }
                let len = u16::from_be_bytes([body[0], body[1]]) as usize;
                if body.len() != 2 + len {
                    return Err(FrameError::MalformedPayload("CHAT"));
                }
                let text = std::str::from_utf8(&body[2..])
                    .map_err(|_| FrameError::MalformedString)?;
                Ok(Frame::Chat { text: text.to_owned() })
            }
            cmd::PING => Ok(Frame::Ping),
            cmd::PONG => Ok(Frame::Pong),
            cmd::ACK => {
                if body.len() % 4 != 0 {
                    return Err(FrameError::MalformedPayload("ACK"));
                }
                let seqs = body.chunks_exact(4).map(read_u32).collect();
                Ok(Frame::Ack { seqs })
            }
            cmd::JOIN => {
                if body.len() != 6 {
                    return Err(FrameError::MalformedPayload("JOIN"));
                }
                Ok(Frame::Join {
                    client_id: read_u32(&body[0..4]),
                    nonce: body[4],
                    version: body[5],
                })
            }
            cmd::KICK => {
                let reason = std::str::from_utf8(body)
                    .map_err(|_| FrameError::MalformedString)?;
                Ok(Frame::Kick { reason: reason.to_owned() })
            }
            cmd::CHALLENGE => {
                if body.len() != 40 {
                    return Err(FrameError::MalformedPayload("CHALLENGE"));
                }
                let mut cookie = [0u8; 32];
                cookie.copy_from_slice(&body[8..40]);
                Ok(Frame::Challenge {
                    timestamp: u64::from_be_bytes(body[0..8].try_into().unwrap()),
                    cookie,
                })
            }
            cmd::AUTH => {
                if body.len() != 33 {
                    return Err(FrameError::MalformedPayload("AUTH"));
                }
                let mut cookie = [0u8; 32];
                cookie.copy_from_slice(&body[1..33]);
                Ok(Frame::Auth { nonce: body[0], cookie })
            }
            cmd::AUTH_OK => {
                if body.len() != 12 {
                    return Err(FrameError::MalformedPayload("AUTH_OK"));
                }
                let mut key_prefix = [0u8; 8];
                key_prefix.copy_from_slice(&body[4..12]);
                Ok(Frame::AuthOk {
                    client_id: read_u32(&body[0..4]),
                    key_prefix,
                })
            }
            cmd::RESYNC => Ok(Frame::Resync),
            cmd::FRAGMENT => {
                if body.len() < FRAGMENT_OVERHEAD {
                    return Err(FrameError::MalformedPayload("FRAGMENT"));
                }
                Ok(Frame::Fragment {
                    base_seq: read_u32(&body[0..4]),
                    total: read_u32(&body[4..8]),
                    offset: read_u32(&body[8..12]),
                    data: body[FRAGMENT_OVERHEAD..].to_vec(),
                })
            }
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// A full datagram: header fields plus the decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: u8,
    pub seq: u32,
    pub ack_base: u32,
    pub ack_bits: u8,
    pub channel: Channel,
    pub client_id: u32,
    pub frame: Frame,
}

impl Packet {
    /// Serializes the packet; the size field is filled with the final
    /// datagram length.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        self.frame.encode_body(&mut body);

        let total = HEADER_LEN + body.len();
        debug_assert!(total <= u16::MAX as usize);

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(GS_MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.flags);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack_base);
        buf.put_u8(self.ack_bits);
        buf.put_u8(self.channel as u8);
        buf.put_u16(total as u16);
        buf.put_u32(self.client_id);
        buf.put_u8(self.frame.command());
        buf.put_slice(&body);
        buf.to_vec()
    }

    /// Decodes a whole datagram. Any error means the packet is dropped; the
    /// transport is lossy by design and a lying peer only wastes its own
    /// packets.
    pub fn decode(datagram: &[u8]) -> Result<Packet, FrameError> {
        if datagram.len() < HEADER_LEN {
            return Err(FrameError::Incomplete(HEADER_LEN - datagram.len()));
        }
        let magic = u16::from_be_bytes([datagram[0], datagram[1]]);
        if magic != GS_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        if datagram[2] != VERSION {
            return Err(FrameError::BadVersion(datagram[2]));
        }
        let declared = u16::from_be_bytes([datagram[14], datagram[15]]) as usize;
        if declared != datagram.len() {
            return Err(FrameError::SizeMismatch {
                declared,
                actual: datagram.len(),
            });
        }

        let frame = Frame::decode_body(datagram[20], &datagram[HEADER_LEN..])?;
        Ok(Packet {
            flags: datagram[3],
            seq: read_u32(&datagram[4..8]),
            ack_base: read_u32(&datagram[8..12]),
            ack_bits: datagram[12],
            channel: Channel::try_from(datagram[13])?,
            client_id: read_u32(&datagram[16..20]),
            frame,
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
