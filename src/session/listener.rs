//! Inbound peer connections.
//!
//! The listener reads the remote handshake first, because the info hash in
//! it is the only thing that says which torrent the connection is for.

use crate::peer::{PeerConnection, PeerId, PeerTransport};
use crate::torrent::{Command, TorrentHandle, TorrentId};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(super) struct Listener {
    pub listener: TcpListener,
    pub torrents: Arc<DashMap<TorrentId, TorrentHandle>>,
    pub peer_id: PeerId,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
}

impl Listener {
    pub async fn run(self, cancel: CancellationToken) {
        let this = Arc::new(self);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = this.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let this = Arc::clone(&this);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = this.handle(stream, addr) => {}
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("peer listener stopped");
    }

    async fn handle(&self, stream: TcpStream, addr: SocketAddr) {
        let mut transport = PeerTransport::new(stream, self.read_timeout);
        let remote = match timeout(self.handshake_timeout, transport.receive_handshake()).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                debug!(peer = %addr, error = %e, "inbound handshake failed");
                return;
            }
            Err(_) => {
                debug!(peer = %addr, "inbound handshake timed out");
                return;
            }
        };

        let handle = self
            .torrents
            .iter()
            .find(|entry| entry.info_hash() == remote.info_hash)
            .map(|entry| entry.value().clone());
        let Some(handle) = handle else {
            debug!(peer = %addr, info_hash = %remote.info_hash, "inbound peer for unknown torrent");
            transport.shutdown().await;
            return;
        };

        match PeerConnection::accept(transport, remote, self.peer_id).await {
            Ok(conn) => {
                trace!(peer = %addr, torrent = %handle.id(), "inbound peer accepted");
                if handle.shared.send(Command::Incoming(conn)).is_err() {
                    debug!(peer = %addr, torrent = %handle.id(), "torrent gone before inbound peer");
                }
            }
            Err(e) => debug!(peer = %addr, error = %e, "inbound peer rejected"),
        }
    }
}
