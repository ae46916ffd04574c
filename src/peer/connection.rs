use super::error::PeerError;
use super::extension::ExtensionHandshake;
use super::message::{Handshake, Message, EXTENDED_HANDSHAKE_ID};
use super::peer_id::PeerId;
use super::transport::PeerTransport;
use crate::metainfo::InfoHash;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy)]
pub struct PeerTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    /// Longest silence tolerated from the peer once connected.
    pub read: Duration,
}

/// A peer session that has completed the BitTorrent handshake.
///
/// ```no_run
/// use torrent_stream::metainfo::InfoHash;
/// use torrent_stream::peer::{Message, PeerConnection, PeerId, PeerTimeouts};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let timeouts = PeerTimeouts {
///     connect: Duration::from_secs(3),
///     handshake: Duration::from_secs(10),
///     read: Duration::from_secs(120),
/// };
/// let mut conn = PeerConnection::connect(
///     "192.168.1.100:6881".parse()?,
///     InfoHash([0; 20]),
///     PeerId::generate("-TS0001-"),
///     timeouts,
/// )
/// .await?;
/// conn.send(Message::Interested).await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    pub supports_fast: bool,
    pub supports_extension: bool,
    /// The remote's BEP-10 handshake, once received.
    pub extensions: Option<ExtensionHandshake>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub last_received: Instant,
    pub last_sent: Instant,
    transport: PeerTransport,
}

impl PeerConnection {
    pub async fn connect(
        addr: SocketAddr,
        info_hash: InfoHash,
        our_id: PeerId,
        timeouts: PeerTimeouts,
    ) -> Result<Self, PeerError> {
        let stream = timeout(timeouts.connect, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let mut transport = PeerTransport::new(stream, timeouts.read);

        let remote = timeout(timeouts.handshake, async {
            transport
                .send_handshake(&Handshake::new(info_hash, our_id))
                .await?;
            transport.receive_handshake().await
        })
        .await
        .map_err(|_| PeerError::Timeout)??;

        if remote.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        if remote.peer_id == our_id {
            return Err(PeerError::SelfConnection);
        }

        Ok(Self::established(addr, remote, transport))
    }

    /// Completes an inbound session whose handshake the listener already read
    /// to find the torrent it belongs to.
    pub async fn accept(
        mut transport: PeerTransport,
        remote: Handshake,
        our_id: PeerId,
    ) -> Result<Self, PeerError> {
        let addr = transport.peer_addr()?;
        if remote.peer_id == our_id {
            return Err(PeerError::SelfConnection);
        }
        transport
            .send_handshake(&Handshake::new(remote.info_hash, our_id))
            .await?;
        Ok(Self::established(addr, remote, transport))
    }

    fn established(addr: SocketAddr, remote: Handshake, transport: PeerTransport) -> Self {
        let now = Instant::now();
        Self {
            addr,
            peer_id: remote.peer_id,
            supports_fast: remote.supports_fast_extension(),
            supports_extension: remote.supports_extension_protocol(),
            extensions: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            last_received: now,
            last_sent: now,
            transport,
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        self.transport.send_message(&message).await?;
        self.last_sent = Instant::now();

        match &message {
            Message::Choke => self.am_choking = true,
            Message::Unchoke => self.am_choking = false,
            Message::Interested => self.am_interested = true,
            Message::NotInterested => self.am_interested = false,
            Message::Piece { data, .. } => self.bytes_uploaded += data.len() as u64,
            _ => {}
        }
        Ok(())
    }

    pub async fn send_extension_handshake(
        &mut self,
        handshake: &ExtensionHandshake,
    ) -> Result<(), PeerError> {
        self.send(Message::Extended {
            id: EXTENDED_HANDSHAKE_ID,
            payload: handshake.encode(),
        })
        .await
    }

    /// Receives the next message, updating the remote's choke and interest
    /// flags and capturing its extension handshake. Cancel safe.
    pub async fn receive(&mut self) -> Result<Message, PeerError> {
        let message = self.transport.receive_message().await?;
        self.last_received = Instant::now();

        match &message {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Piece { data, .. } => self.bytes_downloaded += data.len() as u64,
            Message::Extended { id, payload } if *id == EXTENDED_HANDSHAKE_ID => {
                self.extensions = Some(ExtensionHandshake::decode(payload)?);
            }
            _ => {}
        }
        Ok(message)
    }

    pub fn read_timeout(&self) -> Duration {
        self.transport.read_timeout()
    }

    /// The id to send extension `name` on, if the peer advertised it.
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.as_ref().and_then(|ext| ext.id_of(name))
    }

    pub async fn close(mut self) {
        self.transport.shutdown().await;
    }
}
