//! Runtime configuration.
//!
//! Every struct has public fields and a [`Default`] built from
//! [`crate::constants`]; override the fields you care about:
//!
//! ```
//! use torrent_stream::config::SessionConfig;
//!
//! let config = SessionConfig {
//!     listen_port: Some(0),
//!     ..SessionConfig::default()
//! };
//! assert!(config.auto_start);
//! ```

use crate::constants::*;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port for inbound peers. `None` disables the listener, `Some(0)` binds
    /// an ephemeral port.
    pub listen_port: Option<u16>,
    pub max_peers_per_torrent: usize,
    /// Blocks in flight per peer.
    pub pipeline_depth: usize,
    pub pieces_per_peer: usize,
    pub endgame_threshold: u32,
    /// Most peers one piece may be requested from during endgame.
    pub endgame_duplicates: usize,
    pub peer_retry_attempts: u32,
    pub tracker_retry_attempts: u32,
    pub piece_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub peer_read_timeout: Duration,
    pub upload_slots: usize,
    /// Start torrents as soon as they are `Ready`.
    pub auto_start: bool,
    pub peer_id_prefix: String,
    pub stream: StreamConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_port: None,
            max_peers_per_torrent: MAX_PEERS_PER_TORRENT,
            pipeline_depth: PIPELINE_DEPTH,
            pieces_per_peer: PIECES_PER_PEER,
            endgame_threshold: ENDGAME_PIECES_THRESHOLD,
            endgame_duplicates: ENDGAME_DUPLICATES,
            peer_retry_attempts: MAX_PEER_RETRY_ATTEMPTS,
            tracker_retry_attempts: MAX_TRACKER_FAILURES,
            piece_timeout: PIECE_REQUEST_TIMEOUT,
            connect_timeout: CONNECTION_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            peer_read_timeout: PEER_READ_TIMEOUT,
            upload_slots: DEFAULT_UPLOAD_SLOTS,
            auto_start: true,
            peer_id_prefix: CLIENT_PREFIX.to_string(),
            stream: StreamConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub min_prepare_pieces: u32,
    /// Share of the file's pieces to prepare, when larger than the minimum.
    pub prepare_fraction: f64,
    pub tail_pieces: u32,
    pub read_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_prepare_pieces: MIN_PREPARE_PIECES,
            prepare_fraction: PREPARE_FRACTION,
            tail_pieces: TAIL_PIECES,
            read_timeout: STREAM_READ_TIMEOUT,
            chunk_size: STREAM_CHUNK_SIZE,
        }
    }
}

impl StreamConfig {
    /// Number of pieces prepared ahead of the read position for a file of
    /// `file_pieces` pieces.
    pub fn prepare_pieces(&self, file_pieces: u32) -> u32 {
        let fraction = (file_pieces as f64 * self.prepare_fraction).ceil() as u32;
        self.min_prepare_pieces.max(fraction).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// `User-Agent` substrings of clients that want `200 OK` for ranged
    /// responses.
    pub full_status_agents: Vec<String>,
    pub read_timeout: Duration,
    /// Send `transferMode.dlna.org: Streaming`.
    pub dlna_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            full_status_agents: FULL_STATUS_AGENTS.iter().map(|s| s.to_string()).collect(),
            read_timeout: STREAM_READ_TIMEOUT,
            dlna_headers: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_pieces() {
        let config = StreamConfig::default();
        assert_eq!(config.prepare_pieces(10), 8);
        assert_eq!(config.prepare_pieces(1000), 80);
        assert_eq!(config.prepare_pieces(1001), 81);
    }
}
