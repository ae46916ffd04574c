use std::fmt;

use rand::Rng as _;

/// A 20-byte peer identifier in the Azureus style of [BEP-20]:
/// `-XX0000-` followed by twelve random bytes.
///
/// ```
/// use torrent_stream::peer::PeerId;
///
/// let id = PeerId::generate("-TS0001-");
/// assert_eq!(id.client_id(), Some("TS0001"));
/// ```
///
/// [BEP-20]: http://bittorrent.org/beps/bep_0020.html
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a random id behind `prefix`. Prefixes longer than eight bytes
    /// are truncated.
    pub fn generate(prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = &prefix.as_bytes()[..prefix.len().min(8)];
        id[..prefix.len()].copy_from_slice(prefix);
        rand::rng().fill(&mut id[prefix.len()..]);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The six-character client tag, when the id follows the `-XX0000-` form.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({})", client),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}
