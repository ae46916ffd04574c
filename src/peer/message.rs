use super::error::PeerError;
use crate::metainfo::InfoHash;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::peer_id::PeerId;

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Extended message id reserved for the BEP-10 handshake itself.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            13 => MessageId::Suggest,
            14 => MessageId::HaveAll,
            15 => MessageId::HaveNone,
            16 => MessageId::Reject,
            17 => MessageId::AllowedFast,
            20 => MessageId::Extended,
            other => return Err(PeerError::InvalidMessageId(other)),
        })
    }
}

/// The 68-byte opening exchange of every peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Our handshake: advertises the extension protocol and the fast extension.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        reserved[7] |= 0x04;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[7] & 0x04 != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN || data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let info_hash =
            InfoHash::from_bytes(&data[28..48]).map_err(|_| PeerError::InvalidHandshake)?;
        let peer_id = PeerId::from_bytes(&data[48..68]).ok_or(PeerError::InvalidHandshake)?;

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A block of a piece as addressed by request, cancel and reject messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRef {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.piece);
        buf.put_u32(self.begin);
        buf.put_u32(self.length);
    }

    fn take(data: &mut Bytes) -> Result<Self, PeerError> {
        if data.remaining() < 12 {
            return Err(PeerError::InvalidMessage("block reference too short".into()));
        }
        Ok(Self {
            piece: data.get_u32(),
            begin: data.get_u32(),
            length: data.get_u32(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockRef),
    Piece { piece: u32, begin: u32, data: Bytes },
    Cancel(BlockRef),
    /// DHT port announcement; decoded so it is not a protocol error, then ignored.
    Port(u16),
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(BlockRef),
    AllowedFast(u32),
    Extended { id: u8, payload: Bytes },
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have(_) => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request(_) => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel(_) => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::Suggest(_) => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject(_) => MessageId::Reject,
            Message::AllowedFast(_) => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
        })
    }

    /// Encodes the message with its 4-byte length prefix.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        if let Some(id) = self.id() {
            body.put_u8(id as u8);
        }

        match self {
            Message::Have(piece) | Message::Suggest(piece) | Message::AllowedFast(piece) => {
                body.put_u32(*piece)
            }
            Message::Bitfield(bits) => body.put_slice(bits),
            Message::Request(block) | Message::Cancel(block) | Message::Reject(block) => {
                block.put(&mut body)
            }
            Message::Piece { piece, begin, data } => {
                body.put_u32(*piece);
                body.put_u32(*begin);
                body.put_slice(data);
            }
            Message::Port(port) => body.put_u16(*port),
            Message::Extended { id, payload } => {
                body.put_u8(*id);
                body.put_slice(payload);
            }
            _ => {}
        }

        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.put(body);
        frame.freeze()
    }

    /// Decodes one frame body, the bytes after the length prefix. An empty
    /// body is a keep-alive.
    pub fn decode(mut body: Bytes) -> Result<Self, PeerError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(body.get_u8())?;
        let piece_index = |body: &mut Bytes| {
            if body.remaining() < 4 {
                return Err(PeerError::InvalidMessage(format!("{:?} too short", id)));
            }
            Ok(body.get_u32())
        };

        Ok(match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have(piece_index(&mut body)?),
            MessageId::Bitfield => Message::Bitfield(body),
            MessageId::Request => Message::Request(BlockRef::take(&mut body)?),
            MessageId::Piece => {
                if body.remaining() < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let piece = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    piece,
                    begin,
                    data: body,
                }
            }
            MessageId::Cancel => Message::Cancel(BlockRef::take(&mut body)?),
            MessageId::Port => {
                if body.remaining() < 2 {
                    return Err(PeerError::InvalidMessage("port too short".into()));
                }
                Message::Port(body.get_u16())
            }
            MessageId::Suggest => Message::Suggest(piece_index(&mut body)?),
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Reject => Message::Reject(BlockRef::take(&mut body)?),
            MessageId::AllowedFast => Message::AllowedFast(piece_index(&mut body)?),
            MessageId::Extended => {
                if body.is_empty() {
                    return Err(PeerError::InvalidMessage("extended too short".into()));
                }
                let id = body.get_u8();
                Message::Extended { id, payload: body }
            }
        })
    }
}
