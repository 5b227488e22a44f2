//! Gateway (stream) protocol frames.
//!
//! Every frame starts with the 5-byte header
//! `[MAGIC:2][VERSION:1][FLAGS:1][CMD:1]`; the body layout is fixed per
//! command. Framing is length-implicit: the command determines how many
//! body bytes follow, so the decoder reports how many more bytes it needs
//! when a frame is still incomplete and the caller keeps them buffered.
//!
//! The JOIN command is the one context-sensitive spot: clients send a 4-byte
//! game id request, while a registered game server answers a forwarded
//! CREATE with a 22-byte game id + endpoint body. The caller states which
//! shape it expects via [`JoinShape`].

use bytes::{Buf, BufMut, BytesMut};

use crate::{FrameError, WireAddr, GW_MAGIC, VERSION};

/// Header length of every gateway frame.
pub const HEADER_LEN: usize = 5;

/// Command identifiers of the gateway protocol.
pub mod cmd {
    pub const JOIN: u8 = 1;
    pub const JOIN_KO: u8 = 2;
    pub const CREATE: u8 = 3;
    pub const CREATE_KO: u8 = 4;
    pub const GAME_END: u8 = 5;
    pub const GS: u8 = 20;
    pub const GS_OK: u8 = 21;
    pub const GS_KO: u8 = 22;
    pub const OCCUPANCY: u8 = 23;
    pub const GID: u8 = 24;
}

/// Which JOIN body layout the decoding side expects from this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinShape {
    /// 4-byte game id (clients asking to join).
    Request,
    /// 4-byte game id, 16-byte IP, 2-byte port (game servers answering a
    /// forwarded CREATE, and the gateway's replies to clients).
    Reply,
}

/// A decoded gateway frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GwFrame {
    /// JOIN request: a client wants to enter an existing game.
    JoinRequest { game_id: u32 },
    /// JOIN reply: game id plus the datagram endpoint hosting it.
    JoinReply { game_id: u32, addr: WireAddr },
    JoinKo,
    /// CREATE: spawn a game of the given type.
    Create { game_type: u8 },
    CreateKo,
    /// GAME_END: the sending game server no longer hosts this game.
    GameEnd { game_id: u32 },
    /// GS: a game server registers the datagram endpoint it advertises.
    Register { addr: WireAddr },
    RegisterOk,
    RegisterKo,
    /// OCCUPANCY: number of games currently hosted by the sender.
    Occupancy { count: u8 },
    /// GID: bulk announcement of game ids hosted by the sender.
    GameIds { ids: Vec<u32> },
}

impl GwFrame {
    pub fn command(&self) -> u8 {
        match self {
            GwFrame::JoinRequest { .. } | GwFrame::JoinReply { .. } => cmd::JOIN,
            GwFrame::JoinKo => cmd::JOIN_KO,
            GwFrame::Create { .. } => cmd::CREATE,
            GwFrame::CreateKo => cmd::CREATE_KO,
            GwFrame::GameEnd { .. } => cmd::GAME_END,
            GwFrame::Register { .. } => cmd::GS,
            GwFrame::RegisterOk => cmd::GS_OK,
            GwFrame::RegisterKo => cmd::GS_KO,
            GwFrame::Occupancy { .. } => cmd::OCCUPANCY,
            GwFrame::GameIds { .. } => cmd::GID,
        }
    }

    /// Serializes the frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 22);
        buf.put_u16(GW_MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(0); // flags, unused
        buf.put_u8(self.command());

        match self {
            GwFrame::JoinRequest { game_id } | GwFrame::GameEnd { game_id } => {
                buf.put_u32(*game_id);
            }
            GwFrame::JoinReply { game_id, addr } => {
                buf.put_u32(*game_id);
                buf.put_slice(&addr.ip);
                buf.put_u16(addr.port);
            }
            GwFrame::Create { game_type } => buf.put_u8(*game_type),
            GwFrame::Register { addr } => {
                buf.put_slice(&addr.ip);
                buf.put_u16(addr.port);
            }
            GwFrame::Occupancy { count } => buf.put_u8(*count),
            GwFrame::GameIds { ids } => {
                debug_assert!(ids.len() <= u8::MAX as usize);
                buf.put_u8(ids.len() as u8);
                for id in ids {
                    buf.put_u32(*id);
                }
            }
            GwFrame::JoinKo | GwFrame::CreateKo | GwFrame::RegisterOk | GwFrame::RegisterKo => {}
        }

        buf.to_vec()
    }
}

/// Decodes one frame from the front of `buf`, consuming its bytes.
///
/// Returns [`FrameError::Incomplete`] without consuming anything when the
/// buffer holds a valid prefix of a frame; any other error means the bytes
/// are malformed and the caller should apply its parse-error policy.
pub fn decode(buf: &mut BytesMut, join_shape: JoinShape) -> Result<GwFrame, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Incomplete(HEADER_LEN - buf.len()));
    }

    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != GW_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    if buf[2] != VERSION {
        return Err(FrameError::BadVersion(buf[2]));
    }
    let command = buf[4];

    let body_len = match command {
        cmd::JOIN => match join_shape {
            JoinShape::Request => 4,
            JoinShape::Reply => 22,
        },
        cmd::JOIN_KO | cmd::CREATE_KO | cmd::GS_OK | cmd::GS_KO => 0,
        cmd::CREATE | cmd::OCCUPANCY => 1,
        cmd::GAME_END => 4,
        cmd::GS => 18,
        cmd::GID => {
            if buf.len() < HEADER_LEN + 1 {
                return Err(FrameError::Incomplete(1));
            }
            1 + buf[HEADER_LEN] as usize * 4
        }
        other => return Err(FrameError::UnknownCommand(other)),
    };

    let frame_len = HEADER_LEN + body_len;
    if buf.len() < frame_len {
        return Err(FrameError::Incomplete(frame_len - buf.len()));
    }

    let body = &buf[HEADER_LEN..frame_len];
    let frame = match command {
        cmd::JOIN => match join_shape {
            JoinShape::Request => GwFrame::JoinRequest {
                game_id: read_u32(&body[0..4]),
            },
            JoinShape::Reply => GwFrame::JoinReply {
                game_id: read_u32(&body[0..4]),
                addr: read_addr(&body[4..22]),
            },
        },
        cmd::JOIN_KO => GwFrame::JoinKo,
        cmd::CREATE => GwFrame::Create { game_type: body[0] },
        cmd::CREATE_KO => GwFrame::CreateKo,
        cmd::GAME_END => GwFrame::GameEnd {
            game_id: read_u32(&body[0..4]),
        },
        cmd::GS => GwFrame::Register {
            addr: read_addr(&body[0..18]),
        },
        cmd::GS_OK => GwFrame::RegisterOk,
        cmd::GS_KO => GwFrame::RegisterKo,
        cmd::OCCUPANCY => GwFrame::Occupancy { count: body[0] },
        cmd::GID => {
            let count = body[0] as usize;
            let mut ids = Vec::with_capacity(count);
            for i in 0..count {
                ids.push(read_u32(&body[1 + i * 4..5 + i * 4]));
            }
            GwFrame::GameIds { ids }
        }
        _ => unreachable!("command validated above"),
    };

    buf.advance(frame_len);
    Ok(frame)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_addr(bytes: &[u8]) -> WireAddr {
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&bytes[0..16]);
    WireAddr::new(ip, u16::from_be_bytes([bytes[16], bytes[17]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8], shape: JoinShape) -> Result<GwFrame, FrameError> {
        let mut buf = BytesMut::from(bytes);
        decode(&mut buf, shape)
    }

    #[test]
    fn registration_frame_matches_wire_bytes() {
        // CMD=20, IP=::ffff:127.0.0.1, port 8080
        let bytes = [
            0x42, 0x57, 0x01, 0x00, 0x14, // header
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x7f, 0x00,
            0x00, 0x01, // ip
            0x1f, 0x90, // port
        ];
        let frame = decode_one(&bytes, JoinShape::Request).unwrap();

        let addr = WireAddr::from_socket_addr("127.0.0.1:8080".parse().unwrap());
        assert_eq!(frame, GwFrame::Register { addr });
        assert_eq!(frame.encode(), bytes.to_vec());
    }

    #[test]
    fn simple_responses_are_five_bytes() {
        assert_eq!(GwFrame::RegisterOk.encode(), vec![0x42, 0x57, 0x01, 0x00, 0x15]);
        assert_eq!(GwFrame::RegisterKo.encode(), vec![0x42, 0x57, 0x01, 0x00, 0x16]);
        assert_eq!(GwFrame::JoinKo.encode(), vec![0x42, 0x57, 0x01, 0x00, 0x02]);
        assert_eq!(GwFrame::CreateKo.encode(), vec![0x42, 0x57, 0x01, 0x00, 0x04]);
    }

    #[test]
    fn create_frame_is_six_bytes() {
        let frame = GwFrame::Create { game_type: 1 };
        assert_eq!(frame.encode(), vec![0x42, 0x57, 0x01, 0x00, 0x03, 0x01]);
        assert_eq!(
            decode_one(&frame.encode(), JoinShape::Request).unwrap(),
            frame
        );
    }

    #[test]
    fn join_reply_is_twenty_seven_bytes() {
        let addr = WireAddr::from_socket_addr("127.0.0.1:8080".parse().unwrap());
        let frame = GwFrame::JoinReply {
            game_id: 0x42,
            addr,
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), 27);
        assert_eq!(decode_one(&bytes, JoinShape::Reply).unwrap(), frame);
    }

    #[test]
    fn join_shape_selects_body_length() {
        let request = GwFrame::JoinRequest { game_id: 7 };
        let bytes = request.encode();
        assert_eq!(bytes.len(), 9);
        assert_eq!(decode_one(&bytes, JoinShape::Request).unwrap(), request);

        // The same 9 bytes read as a reply are just an incomplete frame.
        assert_eq!(
            decode_one(&bytes, JoinShape::Reply),
            Err(FrameError::Incomplete(18))
        );
    }

    #[test]
    fn partial_header_is_not_an_error() {
        let mut buf = BytesMut::from(&[0x42u8, 0x57][..]);
        assert_eq!(
            decode(&mut buf, JoinShape::Request),
            Err(FrameError::Incomplete(3))
        );
        // Nothing consumed.
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn bad_magic_and_version_are_errors() {
        assert_eq!(
            decode_one(&[0xde, 0xad, 0x01, 0x00, 0x01, 0, 0, 0, 0], JoinShape::Request),
            Err(FrameError::BadMagic(0xdead))
        );
        assert_eq!(
            decode_one(&[0x42, 0x57, 0x02, 0x00, 0x01, 0, 0, 0, 0], JoinShape::Request),
            Err(FrameError::BadVersion(2))
        );
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert_eq!(
            decode_one(&[0x42, 0x57, 0x01, 0x00, 0x63], JoinShape::Request),
            Err(FrameError::UnknownCommand(0x63))
        );
    }

    #[test]
    fn gid_roundtrip_and_incremental_decode() {
        let frame = GwFrame::GameIds {
            ids: vec![1, 2, 0xdead_beef],
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 1 + 3 * 4);

        // Feed the frame one byte at a time; the decoder asks for more until
        // the whole frame is buffered.
        let mut buf = BytesMut::new();
        for (i, byte) in bytes.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = decode(&mut buf, JoinShape::Request);
            if i + 1 == bytes.len() {
                assert_eq!(result.unwrap(), frame);
            } else {
                assert!(matches!(result, Err(FrameError::Incomplete(_))));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&GwFrame::Occupancy { count: 3 }.encode());
        buf.extend_from_slice(&GwFrame::GameEnd { game_id: 42 }.encode());

        assert_eq!(
            decode(&mut buf, JoinShape::Request).unwrap(),
            GwFrame::Occupancy { count: 3 }
        );
        assert_eq!(
            decode(&mut buf, JoinShape::Request).unwrap(),
            GwFrame::GameEnd { game_id: 42 }
        );
        assert!(buf.is_empty());
    }
}
