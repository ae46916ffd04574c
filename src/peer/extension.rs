use super::error::PeerError;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::collections::BTreeMap;

pub const UT_METADATA: &str = "ut_metadata";

/// The id we ask peers to use when sending us ut_metadata messages.
pub const UT_METADATA_LOCAL_ID: u8 = 1;

/// The BEP-10 handshake dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the message id the sender wants to receive it on.
    pub extensions: BTreeMap<String, u8>,
    pub client: Option<String>,
    /// Number of outstanding requests the sender will queue.
    pub reqq: Option<u32>,
    pub metadata_size: Option<usize>,
}

impl ExtensionHandshake {
    /// Our handshake: ut_metadata, plus the metadata size once we know it.
    pub fn ours(client: &str, reqq: u32, metadata_size: Option<usize>) -> Self {
        Self {
            extensions: BTreeMap::from([(UT_METADATA.to_string(), UT_METADATA_LOCAL_ID)]),
            client: Some(client.to_string()),
            reqq: Some(reqq),
            metadata_size,
        }
    }

    pub fn encode(&self) -> Bytes {
        let m = self
            .extensions
            .iter()
            .map(|(name, id)| (Bytes::copy_from_slice(name.as_bytes()), Value::Integer(*id as i64)))
            .collect();

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
        if let Some(client) = &self.client {
            dict.insert(Bytes::from_static(b"v"), Value::string(client));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::Integer(reqq as i64));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Integer(size as i64));
        }
        Bytes::from(encode(&Value::Dict(dict)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        if value.as_dict().is_none() {
            return Err(PeerError::Extension("handshake is not a dictionary".into()));
        }

        let mut extensions = BTreeMap::new();
        if let Some(m) = value.get(b"m").and_then(Value::as_dict) {
            for (key, id) in m {
                // An id of zero disables the extension.
                match (std::str::from_utf8(key), id.as_integer()) {
                    (Ok(name), Some(id)) if (1..=255).contains(&id) => {
                        extensions.insert(name.to_string(), id as u8);
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            extensions,
            client: value.get_str(b"v").map(String::from),
            reqq: value
                .get_integer(b"reqq")
                .and_then(|v| u32::try_from(v).ok()),
            metadata_size: value
                .get_integer(b"metadata_size")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|&v| v > 0),
        })
    }

    /// The id the remote wants `name` messages sent on.
    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }
}
