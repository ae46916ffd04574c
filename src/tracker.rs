//! Tracker announces (BEP-3, BEP-15, BEP-23).
//!
//! The torrent task only sees the [`Announcer`] trait; [`TrackerClient`]
//! picks the HTTP or UDP protocol from the URL scheme.

mod error;
mod http;
mod response;
mod udp;

pub use error::TrackerError;
pub use http::HttpTracker;
pub use response::{parse_compact_peers, AnnounceResponse, TrackerEvent};
pub use udp::UdpTracker;

use crate::metainfo::InfoHash;
use crate::peer::PeerId;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// What we tell a tracker about ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError>;
}

/// Announces over HTTP(S) or UDP depending on the tracker URL.
#[derive(Clone)]
pub struct TrackerClient {
    http: Client,
}

impl TrackerClient {
    pub fn new() -> Result<Self, TrackerError> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Announcer for TrackerClient {
    async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let scheme = url.split("://").next().unwrap_or_default();
        let response = match scheme {
            "http" | "https" => {
                HttpTracker::with_client(self.http.clone(), url)?
                    .announce(request)
                    .await?
            }
            "udp" => UdpTracker::connect(url).await?.announce(request).await?,
            _ => return Err(TrackerError::UnsupportedProtocol(url.to_string())),
        };

        debug!(
            tracker = url,
            peers = response.peers.len(),
            interval = response.interval,
            "announce ok"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests;
