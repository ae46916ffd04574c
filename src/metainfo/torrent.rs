use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};

/// A parsed and validated torrent.
///
/// ```no_run
/// use torrent_stream::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let data = std::fs::read("example.torrent")?;
/// let metainfo = Metainfo::from_bytes(&data)?;
/// println!("{} ({} pieces)", metainfo.info.name, metainfo.info.piece_count());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: TorrentInfo,
    pub info_hash: InfoHash,
    /// Tracker URLs from `announce` and every `announce-list` tier, deduplicated.
    pub trackers: Vec<String>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    raw_info: Bytes,
}

/// The info dictionary: what the info hash covers.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
    pub private: bool,
}

/// One file in the torrent, positioned in the concatenated piece space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub index: usize,
    /// Relative to the storage root. Single-file torrents use the torrent name.
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl FileEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        if root.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("root"));
        }

        let info_value = root.get(b"info").ok_or(MetainfoError::MissingField("info"))?;
        let raw_info = Bytes::from(encode(info_value));
        let info = TorrentInfo::parse(info_value)?;

        let mut trackers: Vec<String> = root.get_str(b"announce").map(String::from).into_iter().collect();
        for tier in root.get(b"announce-list").and_then(Value::as_list).unwrap_or_default() {
            for url in tier.as_list().unwrap_or_default().iter().filter_map(Value::as_str) {
                if !trackers.iter().any(|t| t == url) {
                    trackers.push(url.to_string());
                }
            }
        }

        Ok(Self {
            info,
            info_hash: InfoHash::of_info(&raw_info),
            trackers,
            creation_date: root.get_integer(b"creation date"),
            comment: root.get_str(b"comment").map(String::from),
            created_by: root.get_str(b"created by").map(String::from),
            raw_info,
        })
    }

    /// Builds metainfo from an info dictionary fetched from peers, checking it
    /// against the info hash the magnet link promised.
    pub fn from_info_bytes(
        raw_info: Bytes,
        expected: InfoHash,
        trackers: Vec<String>,
    ) -> Result<Self, MetainfoError> {
        if InfoHash::of_info(&raw_info) != expected {
            return Err(MetainfoError::InfoHashMismatch);
        }
        let info = TorrentInfo::parse(&decode(&raw_info)?)?;

        Ok(Self {
            info,
            info_hash: expected,
            trackers,
            creation_date: None,
            comment: None,
            created_by: None,
            raw_info,
        })
    }

    /// The bencoded info dictionary, as served to peers over ut_metadata.
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }
}

impl TorrentInfo {
    fn parse(value: &Value) -> Result<Self, MetainfoError> {
        if value.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("info"));
        }

        let name = value
            .get_str(b"name")
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();
        check_component(&name)?;

        let piece_length = value
            .get_integer(b"piece length")
            .ok_or(MetainfoError::MissingField("piece length"))?;
        if piece_length <= 0 {
            return Err(MetainfoError::InvalidField("piece length"));
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = value
            .get_bytes(b"pieces")
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }
        let pieces: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = match (value.get_integer(b"length"), value.get(b"files")) {
            (Some(length), _) => {
                if length < 0 {
                    return Err(MetainfoError::InvalidField("length"));
                }
                vec![FileEntry {
                    index: 0,
                    path: PathBuf::from(&name),
                    length: length as u64,
                    offset: 0,
                }]
            }
            (None, Some(list)) => parse_files(&name, list)?,
            (None, None) => return Err(MetainfoError::MissingField("length or files")),
        };

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        if total_length == 0 {
            return Err(MetainfoError::InvalidField("length"));
        }

        let expected = total_length.div_ceil(piece_length) as usize;
        if pieces.len() != expected {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                actual: pieces.len(),
            });
        }

        Ok(Self {
            name,
            piece_length,
            pieces,
            files,
            total_length,
            private: value.get_integer(b"private") == Some(1),
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Length of `piece`; only the final piece may be short.
    pub fn piece_size(&self, piece: u32) -> u64 {
        let start = self.piece_offset(piece);
        self.piece_length.min(self.total_length.saturating_sub(start))
    }

    pub fn piece_offset(&self, piece: u32) -> u64 {
        piece as u64 * self.piece_length
    }

    pub fn piece_hash(&self, piece: u32) -> Option<&[u8; 20]> {
        self.pieces.get(piece as usize)
    }

    /// Pieces touched by the torrent-global byte span `[offset, offset + length)`.
    pub fn pieces_for_span(&self, offset: u64, length: u64) -> Range<u32> {
        if length == 0 || offset >= self.total_length {
            return 0..0;
        }
        let end = (offset + length).min(self.total_length);
        let first = (offset / self.piece_length) as u32;
        let last = ((end - 1) / self.piece_length) as u32;
        first..last + 1
    }

    pub fn file_pieces(&self, file: &FileEntry) -> Range<u32> {
        self.pieces_for_span(file.offset, file.length)
    }

    /// The largest file, which for media torrents is the one worth streaming.
    pub fn largest_file(&self) -> Option<&FileEntry> {
        self.files.iter().max_by_key(|f| f.length)
    }
}

fn parse_files(name: &str, list: &Value) -> Result<Vec<FileEntry>, MetainfoError> {
    let list = list.as_list().ok_or(MetainfoError::InvalidField("files"))?;
    if list.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }

    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;
    for (index, entry) in list.iter().enumerate() {
        let length = entry
            .get_integer(b"length")
            .ok_or(MetainfoError::MissingField("file length"))?;
        if length < 0 {
            return Err(MetainfoError::InvalidField("file length"));
        }

        let components = entry
            .get(b"path")
            .and_then(Value::as_list)
            .ok_or(MetainfoError::MissingField("file path"))?;
        if components.is_empty() {
            return Err(MetainfoError::InvalidField("file path"));
        }

        let mut path = PathBuf::from(name);
        for component in components {
            let component = component
                .as_str()
                .ok_or(MetainfoError::InvalidField("file path"))?;
            check_component(component)?;
            path.push(component);
        }

        files.push(FileEntry {
            index,
            path,
            length: length as u64,
            offset,
        });
        offset += length as u64;
    }
    Ok(files)
}

/// Rejects path components that could escape the storage root.
fn check_component(component: &str) -> Result<(), MetainfoError> {
    let mut parts = Path::new(component).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) if !component.contains(['/', '\\']) => Ok(()),
        _ => Err(MetainfoError::UnsafePath(component.to_string())),
    }
}
