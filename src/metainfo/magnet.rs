use super::error::MetainfoError;
use super::info_hash::InfoHash;
use std::net::SocketAddr;
use url::Url;

/// A parsed `magnet:` URI.
///
/// ```
/// use torrent_stream::metainfo::MagnetLink;
///
/// let magnet = MagnetLink::parse(
///     "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Big%20Buck%20Bunny",
/// )
/// .unwrap();
/// assert_eq!(magnet.display_name.as_deref(), Some("Big Buck Bunny"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    /// Peers given directly through `x.pe`; malformed entries are skipped.
    pub peers: Vec<SocketAddr>,
    /// File indices from the BEP-53 `so` parameter, in ascending order.
    pub selected_files: Vec<usize>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, MetainfoError> {
        let url = Url::parse(uri).map_err(|e| MetainfoError::InvalidMagnetLink(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(MetainfoError::InvalidMagnetLink(format!(
                "unexpected scheme {}",
                url.scheme()
            )));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();
        let mut selected_files = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(match hash.len() {
                            40 => InfoHash::from_hex(hash)?,
                            32 => InfoHash::from_base32(hash)?,
                            _ => {
                                return Err(MetainfoError::InvalidMagnetLink(
                                    "info hash must be 40 hex or 32 base32 characters".into(),
                                ))
                            }
                        });
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => {
                    if !trackers.iter().any(|t| t == value.as_ref()) {
                        trackers.push(value.into_owned());
                    }
                }
                "x.pe" => {
                    if let Ok(addr) = value.parse() {
                        peers.push(addr);
                    }
                }
                "so" => selected_files = parse_selection(&value)?,
                _ => {}
            }
        }

        let info_hash = info_hash
            .ok_or_else(|| MetainfoError::InvalidMagnetLink("missing urn:btih xt parameter".into()))?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
            peers,
            selected_files,
        })
    }

    pub fn to_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("xt", &format!("urn:btih:{}", self.info_hash.to_hex()));
        if let Some(name) = &self.display_name {
            query.append_pair("dn", name);
        }
        for tracker in &self.trackers {
            query.append_pair("tr", tracker);
        }
        for peer in &self.peers {
            query.append_pair("x.pe", &peer.to_string());
        }
        format!("magnet:?{}", query.finish())
    }
}

/// Parses a BEP-53 selection such as `0,2,4-6`.
fn parse_selection(value: &str) -> Result<Vec<usize>, MetainfoError> {
    let invalid = || MetainfoError::InvalidMagnetLink(format!("invalid file selection {value}"));
    let mut selected = Vec::new();

    for part in value.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.parse().map_err(|_| invalid())?;
                let end: usize = end.parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                selected.extend(start..=end);
            }
            None => selected.push(part.parse().map_err(|_| invalid())?),
        }
    }

    selected.sort_unstable();
    selected.dedup();
    Ok(selected)
}
