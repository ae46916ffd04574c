//! ut_metadata messages ([BEP-9]).
//!
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html

use bytes::{Bytes, BytesMut};

use super::error::PeerError;
use crate::bencode::{decode_prefix, encode, Value};

pub const METADATA_PIECE_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    pub total_size: Option<usize>,
    /// Raw piece bytes that follow the dictionary in data messages.
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: usize, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut entries = vec![
            ("msg_type", Value::Integer(self.msg_type as i64)),
            ("piece", Value::Integer(self.piece as i64)),
        ];
        if let Some(total_size) = self.total_size {
            entries.push(("total_size", Value::Integer(total_size as i64)));
        }

        let mut buf = BytesMut::from(encode(&Value::dict(entries)).as_slice());
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
        }
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, PeerError> {
        let (value, dict_len) = decode_prefix(payload)?;

        let msg_type = match value.get_integer(b"msg_type") {
            Some(0) => MetadataMessageType::Request,
            Some(1) => MetadataMessageType::Data,
            Some(2) => MetadataMessageType::Reject,
            _ => return Err(PeerError::Extension("invalid msg_type".into())),
        };
        let piece = value
            .get_integer(b"piece")
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| PeerError::Extension("missing piece".into()))?;

        let data = (msg_type == MetadataMessageType::Data).then(|| payload.slice(dict_len..));

        Ok(Self {
            msg_type,
            piece,
            total_size: value
                .get_integer(b"total_size")
                .and_then(|v| usize::try_from(v).ok()),
            data,
        })
    }
}

pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}
