//! One task per connected peer.
//!
//! The worker owns the [`PeerConnection`]. It turns piece assignments from
//! the torrent task into pipelined block requests, hashes completed pieces,
//! serves uploads and metadata, and reports everything else back as
//! [`PeerEvent`]s. It never touches the piece map or the scheduler.

use super::handle::{TorrentContext, TorrentShared};
use crate::constants::{BLOCK_SIZE, CLIENT_NAME, KEEPALIVE_INTERVAL, MAX_REQUEST_LENGTH};
use crate::peer::{
    Bitfield, BlockRef, ExtensionHandshake, Message, MetadataMessage, MetadataMessageType,
    PeerConnection, PeerError, PeerId, EXTENDED_HANDSHAKE_ID, METADATA_PIECE_SIZE, UT_METADATA,
    UT_METADATA_LOCAL_ID,
};
use crate::storage::hash_matches;
use bytes::{Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_QUEUED_UPLOADS: usize = 256;

pub(crate) enum PeerCommand {
    /// Metadata became available.
    Context(Arc<TorrentContext>),
    Download(Vec<u32>),
    /// Abandon a piece that is no longer wanted from this peer.
    Cancel(u32),
    Have(u32),
    Interested(bool),
    RequestMetadata(Vec<u32>),
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum PeerEvent {
    Connected {
        peer_id: PeerId,
    },
    ConnectFailed,
    Extensions {
        metadata_size: Option<usize>,
        supports_metadata: bool,
    },
    Bitfield(Bytes),
    Have(u32),
    HaveAll,
    HaveNone,
    Choked,
    Unchoked,
    PieceDone {
        piece: u32,
        data: Bytes,
    },
    PieceFailed {
        piece: u32,
    },
    MetadataPiece {
        piece: u32,
        data: Bytes,
    },
    MetadataRejected {
        piece: u32,
    },
    Disconnected,
}

pub(crate) type PeerEvents = mpsc::UnboundedSender<(SocketAddr, PeerEvent)>;

/// A piece being assembled from blocks.
#[derive(Debug)]
struct PieceDownload {
    piece: u32,
    size: u32,
    hash: [u8; 20],
    buffer: BytesMut,
    /// Block offsets not requested yet.
    pending: VecDeque<u32>,
    received: u32,
}

impl PieceDownload {
    fn new(piece: u32, size: u32, hash: [u8; 20]) -> Self {
        Self {
            piece,
            size,
            hash,
            buffer: BytesMut::zeroed(size as usize),
            pending: (0..size).step_by(BLOCK_SIZE as usize).collect(),
            received: 0,
        }
    }

    fn block(&self, begin: u32) -> BlockRef {
        BlockRef {
            piece: self.piece,
            begin,
            length: BLOCK_SIZE.min(self.size - begin),
        }
    }
}

pub(crate) struct WorkerSettings {
    pub pipeline_depth: usize,
    pub upload_slots: usize,
}

pub(crate) struct PeerWorker {
    addr: SocketAddr,
    conn: PeerConnection,
    shared: Arc<TorrentShared>,
    context: Option<Arc<TorrentContext>>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    events: PeerEvents,
    cancel: CancellationToken,
    settings: WorkerSettings,
    downloads: Vec<PieceDownload>,
    in_flight: Vec<BlockRef>,
    allowed_fast: HashSet<u32>,
    uploads: VecDeque<BlockRef>,
    holds_upload_slot: bool,
}

impl PeerWorker {
    pub fn new(
        conn: PeerConnection,
        shared: Arc<TorrentShared>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
        events: PeerEvents,
        settings: WorkerSettings,
    ) -> Self {
        let context = shared.context();
        let cancel = shared.cancel.child_token();
        Self {
            addr: conn.addr,
            conn,
            shared,
            context,
            commands,
            events,
            cancel,
            settings,
            downloads: Vec::new(),
            in_flight: Vec::new(),
            allowed_fast: HashSet::new(),
            uploads: VecDeque::new(),
            holds_upload_slot: false,
        }
    }

    pub async fn run(mut self) {
        let _ = self.events.send((
            self.addr,
            PeerEvent::Connected {
                peer_id: self.conn.peer_id,
            },
        ));

        match self.session().await {
            Ok(()) => debug!(peer = %self.addr, "peer session closed"),
            Err(e) => debug!(peer = %self.addr, error = %e, "peer session ended"),
        }

        if self.holds_upload_slot {
            self.shared.release_upload_slot();
        }
        let _ = self.events.send((self.addr, PeerEvent::Disconnected));
        self.conn.close().await;
    }

    async fn session(&mut self) -> Result<(), PeerError> {
        self.greet().await?;

        let mut keepalive = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                message = self.conn.receive() => self.on_message(message?).await?,
                command = self.commands.recv() => match command {
                    Some(PeerCommand::Shutdown) | None => return Ok(()),
                    Some(command) => self.on_command(command).await?,
                },
                _ = keepalive.tick() => self.keepalive().await?,
                _ = std::future::ready(()), if !self.uploads.is_empty() => self.serve_upload().await?,
            }
        }
    }

    async fn greet(&mut self) -> Result<(), PeerError> {
        if self.conn.supports_extension {
            let metadata_size = self.context.as_ref().map(|c| c.metainfo.raw_info().len());
            let ours = ExtensionHandshake::ours(
                CLIENT_NAME,
                self.settings.pipeline_depth as u32,
                metadata_size,
            );
            self.conn.send_extension_handshake(&ours).await?;
        }

        let have = self.context.as_ref().map(|c| c.piece_map.bitfield());
        match have {
            Some(bf) if self.conn.supports_fast && bf.is_complete() => {
                self.conn.send(Message::HaveAll).await
            }
            Some(bf) if self.conn.supports_fast && bf.is_empty() => {
                self.conn.send(Message::HaveNone).await
            }
            Some(bf) if !bf.is_empty() => self.conn.send(Message::Bitfield(bf.to_bytes())).await,
            None if self.conn.supports_fast => self.conn.send(Message::HaveNone).await,
            _ => Ok(()),
        }
    }

    async fn keepalive(&mut self) -> Result<(), PeerError> {
        if self.conn.last_received.elapsed() > self.conn.read_timeout() {
            return Err(PeerError::Timeout);
        }
        if self.conn.last_sent.elapsed() >= KEEPALIVE_INTERVAL {
            self.conn.send(Message::KeepAlive).await?;
        }
        Ok(())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send((self.addr, event));
    }

    async fn on_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::KeepAlive | Message::Port(_) | Message::Suggest(_) => {}
            Message::Choke => {
                if !self.conn.supports_fast {
                    // Without the fast extension a choke silently drops every
                    // outstanding request.
                    for block in std::mem::take(&mut self.in_flight) {
                        self.requeue(block);
                    }
                }
                self.emit(PeerEvent::Choked);
            }
            Message::Unchoke => {
                self.emit(PeerEvent::Unchoked);
                self.fill_pipeline().await?;
            }
            Message::Interested => {
                if self.conn.am_choking
                    && self.context.is_some()
                    && !self.holds_upload_slot
                    && self.shared.try_acquire_upload_slot(self.settings.upload_slots)
                {
                    self.holds_upload_slot = true;
                    self.conn.send(Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                self.uploads.clear();
                if self.holds_upload_slot {
                    self.holds_upload_slot = false;
                    self.shared.release_upload_slot();
                    self.conn.send(Message::Choke).await?;
                }
            }
            Message::Have(piece) => self.emit(PeerEvent::Have(piece)),
            Message::Bitfield(bytes) => self.emit(PeerEvent::Bitfield(bytes)),
            Message::HaveAll => self.emit(PeerEvent::HaveAll),
            Message::HaveNone => self.emit(PeerEvent::HaveNone),
            Message::Request(block) => self.on_request(block).await?,
            Message::Cancel(block) => self.uploads.retain(|b| *b != block),
            Message::Piece { piece, begin, data } => self.on_block(piece, begin, data).await?,
            Message::Reject(block) => {
                if let Some(pos) = self.in_flight.iter().position(|b| *b == block) {
                    self.in_flight.swap_remove(pos);
                    self.requeue(block);
                }
            }
            Message::AllowedFast(piece) => {
                self.allowed_fast.insert(piece);
                self.fill_pipeline().await?;
            }
            Message::Extended { id, payload } => {
                if id == EXTENDED_HANDSHAKE_ID {
                    let ext = self.conn.extensions.as_ref();
                    self.emit(PeerEvent::Extensions {
                        metadata_size: ext.and_then(|e| e.metadata_size),
                        supports_metadata: ext.and_then(|e| e.id_of(UT_METADATA)).is_some(),
                    });
                } else if id == UT_METADATA_LOCAL_ID {
                    self.on_metadata(MetadataMessage::decode(&payload)?).await?;
                }
            }
        }
        Ok(())
    }

    fn requeue(&mut self, block: BlockRef) {
        if let Some(download) = self.downloads.iter_mut().find(|d| d.piece == block.piece) {
            download.pending.push_front(block.begin);
        }
    }

    async fn on_request(&mut self, block: BlockRef) -> Result<(), PeerError> {
        let valid = self.context.as_ref().is_some_and(|ctx| {
            let info = &ctx.metainfo.info;
            block.piece < info.piece_count()
                && block.length > 0
                && block.length <= MAX_REQUEST_LENGTH
                && block.begin as u64 + block.length as u64 <= info.piece_size(block.piece)
                && ctx.piece_map.is_verified(block.piece)
        });

        if !self.conn.am_choking && valid && self.uploads.len() < MAX_QUEUED_UPLOADS {
            self.uploads.push_back(block);
        } else if self.conn.supports_fast {
            self.conn.send(Message::Reject(block)).await?;
        }
        Ok(())
    }

    async fn serve_upload(&mut self) -> Result<(), PeerError> {
        let (Some(block), Some(ctx)) = (self.uploads.pop_front(), self.context.clone()) else {
            return Ok(());
        };

        let offset = ctx.metainfo.info.piece_offset(block.piece) + block.begin as u64;
        match ctx.storage.read(offset, block.length as usize).await {
            Ok(data) => {
                self.shared.record_upload(data.len() as u64);
                self.conn
                    .send(Message::Piece {
                        piece: block.piece,
                        begin: block.begin,
                        data,
                    })
                    .await
            }
            Err(e) => {
                warn!(peer = %self.addr, piece = block.piece, error = %e, "upload read failed");
                if self.conn.supports_fast {
                    self.conn.send(Message::Reject(block)).await?;
                }
                Ok(())
            }
        }
    }

    async fn on_block(&mut self, piece: u32, begin: u32, data: Bytes) -> Result<(), PeerError> {
        let Some(pos) = self.in_flight.iter().position(|b| {
            b.piece == piece && b.begin == begin && b.length as usize == data.len()
        }) else {
            // Unrequested, or cancelled after it was sent.
            return Ok(());
        };
        self.in_flight.swap_remove(pos);
        self.shared.record_download(data.len() as u64);

        if let Some(idx) = self.downloads.iter().position(|d| d.piece == piece) {
            let download = &mut self.downloads[idx];
            let start = begin as usize;
            download.buffer[start..start + data.len()].copy_from_slice(&data);
            download.received += data.len() as u32;

            if download.received >= download.size && download.pending.is_empty() {
                let done = self.downloads.remove(idx);
                self.finish_piece(done).await;
            }
        }

        self.fill_pipeline().await
    }

    async fn finish_piece(&mut self, download: PieceDownload) {
        let data = download.buffer.freeze();
        match hash_matches(data.clone(), download.hash).await {
            Ok(true) => self.emit(PeerEvent::PieceDone {
                piece: download.piece,
                data,
            }),
            Ok(false) => self.emit(PeerEvent::PieceFailed {
                piece: download.piece,
            }),
            Err(e) => {
                warn!(peer = %self.addr, piece = download.piece, error = %e, "hashing failed");
                self.emit(PeerEvent::PieceFailed {
                    piece: download.piece,
                });
            }
        }
    }

    /// Keeps up to `pipeline_depth` block requests outstanding.
    async fn fill_pipeline(&mut self) -> Result<(), PeerError> {
        while self.in_flight.len() < self.settings.pipeline_depth {
            let choked = self.conn.peer_choking;
            let allowed = &self.allowed_fast;
            let Some(download) = self
                .downloads
                .iter_mut()
                .find(|d| !d.pending.is_empty() && (!choked || allowed.contains(&d.piece)))
            else {
                break;
            };
            let Some(begin) = download.pending.pop_front() else {
                break;
            };
            let block = download.block(begin);

            self.conn.send(Message::Request(block)).await?;
            self.in_flight.push(block);
        }
        Ok(())
    }

    async fn on_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::Context(ctx) => {
                for piece in ctx.piece_map.bitfield().iter() {
                    self.conn.send(Message::Have(piece as u32)).await?;
                }
                self.context = Some(ctx);
            }
            PeerCommand::Download(pieces) => {
                let Some(ctx) = self.context.clone() else {
                    return Ok(());
                };
                let info = &ctx.metainfo.info;
                for piece in pieces {
                    if self.downloads.iter().any(|d| d.piece == piece) {
                        continue;
                    }
                    if let Some(hash) = info.piece_hash(piece) {
                        let size = info.piece_size(piece) as u32;
                        self.downloads.push(PieceDownload::new(piece, size, *hash));
                    }
                }
                if !self.conn.am_interested {
                    self.conn.send(Message::Interested).await?;
                }
                self.fill_pipeline().await?;
            }
            PeerCommand::Cancel(piece) => {
                self.downloads.retain(|d| d.piece != piece);
                let (cancelled, kept): (Vec<_>, Vec<_>) =
                    self.in_flight.drain(..).partition(|b| b.piece == piece);
                self.in_flight = kept;
                for block in cancelled {
                    self.conn.send(Message::Cancel(block)).await?;
                }
                self.fill_pipeline().await?;
            }
            PeerCommand::Have(piece) => self.conn.send(Message::Have(piece)).await?,
            PeerCommand::Interested(interested) => {
                if interested != self.conn.am_interested {
                    let message = if interested {
                        Message::Interested
                    } else {
                        Message::NotInterested
                    };
                    self.conn.send(message).await?;
                }
            }
            PeerCommand::RequestMetadata(pieces) => {
                if let Some(id) = self.conn.extension_id(UT_METADATA) {
                    for piece in pieces {
                        let payload = MetadataMessage::request(piece).encode();
                        self.conn.send(Message::Extended { id, payload }).await?;
                    }
                }
            }
            PeerCommand::Shutdown => {}
        }
        Ok(())
    }

    async fn on_metadata(&mut self, message: MetadataMessage) -> Result<(), PeerError> {
        match message.msg_type {
            MetadataMessageType::Request => {
                let Some(id) = self.conn.extension_id(UT_METADATA) else {
                    return Ok(());
                };
                let raw = self.context.as_ref().map(|c| c.metainfo.raw_info().clone());
                let start = message.piece as usize * METADATA_PIECE_SIZE;
                let reply = match raw {
                    Some(raw) if start < raw.len() => {
                        let end = (start + METADATA_PIECE_SIZE).min(raw.len());
                        MetadataMessage::data(message.piece, raw.len(), raw.slice(start..end))
                    }
                    _ => MetadataMessage::reject(message.piece),
                };
                self.conn
                    .send(Message::Extended {
                        id,
                        payload: reply.encode(),
                    })
                    .await?;
            }
            MetadataMessageType::Data => {
                if let Some(data) = message.data {
                    self.emit(PeerEvent::MetadataPiece {
                        piece: message.piece,
                        data,
                    });
                }
            }
            MetadataMessageType::Reject => self.emit(PeerEvent::MetadataRejected {
                piece: message.piece,
            }),
        }
        Ok(())
    }
}

/// Whether a validated `Bitfield` includes pieces we still need.
pub(crate) fn wants_from(peer_has: &Bitfield, ours: &Bitfield) -> bool {
    peer_has.iter().any(|piece| !ours.has(piece))
}
