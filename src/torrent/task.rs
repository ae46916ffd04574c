//! The torrent actor.
//!
//! One task per torrent selects over caller commands, peer events, tracker
//! replies, stream window changes and a one second tick. Everything that
//! mutates torrent state happens here, in order.

use super::handle::{Command, TorrentContext, TorrentShared};
use super::metadata::MetadataAssembler;
use super::peer_worker::{wants_from, PeerCommand, PeerEvent, PeerWorker, WorkerSettings};
use super::peers::PeerCandidates;
use super::state::TorrentState;
use super::stats::TorrentStatus;
use crate::config::SessionConfig;
use crate::constants::{
    MAX_METADATA_SIZE, PEER_RETRY_BASE_DELAY, STOPPED_ANNOUNCE_TIMEOUT, TICK_INTERVAL,
    TRACKER_ANNOUNCE_INTERVAL, TRACKER_MIN_INTERVAL, TRACKER_RETRY_DELAY,
};
use crate::events::TorrentEvent;
use crate::metainfo::{InfoHash, MagnetLink, Metainfo};
use crate::peer::{Bitfield, PeerConnection, PeerId, PeerTimeouts};
use crate::piece_map::{PieceMap, PieceState};
use crate::scheduler::Scheduler;
use crate::storage::{verify_existing, StorageError, StorageFactory};
use crate::tracker::{AnnounceRequest, AnnounceResponse, Announcer, TrackerError, TrackerEvent};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Metadata queries kept outstanding per peer while resolving a magnet.
const METADATA_REQUESTS_PER_PEER: usize = 4;

/// What a torrent is created from.
pub(crate) enum TorrentOrigin {
    Metainfo(Metainfo),
    Magnet(MagnetLink),
}

impl TorrentOrigin {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            TorrentOrigin::Metainfo(m) => m.info_hash,
            TorrentOrigin::Magnet(link) => link.info_hash,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            TorrentOrigin::Metainfo(m) => m.info.name.clone(),
            TorrentOrigin::Magnet(link) => link
                .display_name
                .clone()
                .unwrap_or_else(|| link.info_hash.to_string()),
        }
    }
}

/// Session-wide collaborators handed to every torrent.
#[derive(Clone)]
pub(crate) struct TaskDeps {
    pub config: Arc<SessionConfig>,
    pub peer_id: PeerId,
    pub listen_port: u16,
    pub announcer: Arc<dyn Announcer>,
    pub storage_factory: StorageFactory,
    pub storage_root: PathBuf,
}

struct TrackerState {
    url: String,
    next_announce: Instant,
    failures: u32,
    in_flight: bool,
    /// A `started` announce has been accepted.
    started: bool,
    completed_pending: bool,
    last_event: TrackerEvent,
    seeds: u32,
    leechers: u32,
}

impl TrackerState {
    fn new(url: String, now: Instant) -> Self {
        Self {
            url,
            next_announce: now,
            failures: 0,
            in_flight: false,
            started: false,
            completed_pending: false,
            last_event: TrackerEvent::None,
            seeds: 0,
            leechers: 0,
        }
    }
}

struct PeerEntry {
    commands: mpsc::UnboundedSender<PeerCommand>,
    connected: bool,
    inbound: bool,
    bitfield: Option<Bitfield>,
    /// Availability received before metadata, replayed once it is known.
    early: Vec<PeerEvent>,
    choked: bool,
    interested: bool,
    supports_metadata: bool,
}

impl PeerEntry {
    fn new(commands: mpsc::UnboundedSender<PeerCommand>, inbound: bool) -> Self {
        Self {
            commands,
            connected: false,
            inbound,
            bitfield: None,
            early: Vec::new(),
            choked: true,
            interested: false,
            supports_metadata: false,
        }
    }

    fn send(&self, command: PeerCommand) {
        let _ = self.commands.send(command);
    }

    fn is_seed(&self) -> bool {
        self.bitfield.as_ref().is_some_and(Bitfield::is_complete)
    }
}

type AnnounceResult = (usize, Result<AnnounceResponse, TrackerError>);

pub(crate) struct TorrentTask {
    shared: Arc<TorrentShared>,
    deps: TaskDeps,
    commands: mpsc::UnboundedReceiver<Command>,
    peer_tx: mpsc::UnboundedSender<(SocketAddr, PeerEvent)>,
    peer_rx: mpsc::UnboundedReceiver<(SocketAddr, PeerEvent)>,
    announce_tx: mpsc::UnboundedSender<AnnounceResult>,
    announce_rx: mpsc::UnboundedReceiver<AnnounceResult>,
    trackers: Vec<TrackerState>,
    peers: HashMap<SocketAddr, PeerEntry>,
    candidates: PeerCandidates,
    context: Option<Arc<TorrentContext>>,
    scheduler: Option<Scheduler>,
    metadata: Option<MetadataAssembler>,
    /// Announcing and connecting to peers.
    active: bool,
}

impl TorrentTask {
    pub fn new(
        shared: Arc<TorrentShared>,
        commands: mpsc::UnboundedReceiver<Command>,
        deps: TaskDeps,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let candidates =
            PeerCandidates::new(PEER_RETRY_BASE_DELAY, deps.config.peer_retry_attempts);
        Self {
            shared,
            deps,
            commands,
            peer_tx,
            peer_rx,
            announce_tx,
            announce_rx,
            trackers: Vec::new(),
            peers: HashMap::new(),
            candidates,
            context: None,
            scheduler: None,
            metadata: None,
            active: false,
        }
    }

    pub async fn run(mut self, origin: TorrentOrigin) {
        match origin {
            TorrentOrigin::Metainfo(metainfo) => {
                self.add_trackers(&metainfo.trackers);
                self.prepare(metainfo).await;
            }
            TorrentOrigin::Magnet(link) => {
                self.add_trackers(&link.trackers);
                let now = Instant::now();
                for peer in &link.peers {
                    self.candidates.add(*peer, now);
                }
                self.active = true;
                info!(
                    torrent = %self.shared.id,
                    info_hash = %self.shared.info_hash,
                    trackers = self.trackers.len(),
                    "resolving metadata"
                );
            }
        }

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.on_command(command).await,
                Some((addr, event)) = self.peer_rx.recv() => self.on_peer_event(addr, event).await,
                Some((index, result)) = self.announce_rx.recv() => self.on_announce(index, result),
                _ = self.shared.schedule.notified() => self.schedule(),
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.shutdown().await;
    }

    fn add_trackers(&mut self, urls: &[String]) {
        let now = Instant::now();
        for url in urls {
            if !self.trackers.iter().any(|t| &t.url == url) {
                self.trackers.push(TrackerState::new(url.clone(), now));
            }
        }
    }

    // Lifecycle

    async fn prepare(&mut self, metainfo: Metainfo) {
        match self.open_storage(metainfo).await {
            Ok(context) => self.install(context),
            Err(e) => self.fail(&format!("storage: {e}")),
        }
    }

    async fn open_storage(&self, metainfo: Metainfo) -> Result<TorrentContext, StorageError> {
        let storage = (self.deps.storage_factory)(&self.deps.storage_root, &metainfo.info)?;
        let piece_map = if storage.allocate().await? {
            let verified = verify_existing(storage.as_ref(), &metainfo.info).await?;
            info!(
                torrent = %self.shared.id,
                verified = verified.count(),
                total = verified.len(),
                "resumed from existing data"
            );
            PieceMap::with_verified(&verified)
        } else {
            PieceMap::new(metainfo.info.piece_count())
        };

        Ok(TorrentContext {
            metainfo,
            piece_map: Arc::new(piece_map),
            storage,
        })
    }

    fn install(&mut self, context: TorrentContext) {
        let context = Arc::new(context);
        let info = &context.metainfo.info;
        let config = &self.deps.config;

        self.shared.set_name(info.name.clone());
        self.scheduler = Some(Scheduler::new(
            info.piece_count(),
            config.endgame_threshold,
            config.endgame_duplicates,
        ));
        self.shared.set_context(Arc::clone(&context));
        self.context = Some(Arc::clone(&context));
        self.metadata = None;

        for entry in self.peers.values() {
            entry.send(PeerCommand::Context(Arc::clone(&context)));
        }
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let early = self
                .peers
                .get_mut(&addr)
                .map(|entry| std::mem::take(&mut entry.early))
                .unwrap_or_default();
            for event in early {
                self.on_availability(addr, event);
            }
        }

        self.refresh_status();
        self.shared.set_state(TorrentState::Ready);
        if self.deps.config.auto_start {
            self.start();
        }
    }

    fn start(&mut self) {
        if !self.shared.set_state(TorrentState::Starting) {
            return;
        }
        self.active = true;
        let now = Instant::now();
        for tracker in &mut self.trackers {
            if !tracker.in_flight {
                tracker.next_announce = now;
            }
        }

        let complete = self
            .context
            .as_ref()
            .is_some_and(|ctx| ctx.piece_map.is_complete());
        if complete {
            self.shared.set_state(TorrentState::Downloading);
            self.finish();
            return;
        }

        if self.peers.values().any(|p| p.connected) {
            self.shared.set_state(TorrentState::Downloading);
        }
        self.update_interest_all();
        self.connect_candidates(now);
        self.schedule();
    }

    fn pause(&mut self) {
        if !self.shared.set_state(TorrentState::Paused) {
            return;
        }
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        for (addr, entry) in &mut self.peers {
            for piece in scheduler.release_peer(*addr) {
                entry.send(PeerCommand::Cancel(piece));
            }
            if entry.interested {
                entry.interested = false;
                entry.send(PeerCommand::Interested(false));
            }
        }
    }

    fn resume(&mut self) {
        if self.shared.set_state(TorrentState::Downloading) {
            self.update_interest_all();
            self.schedule();
        }
    }

    fn finish(&mut self) {
        if !self.shared.set_state(TorrentState::Completed) {
            return;
        }
        let now = Instant::now();
        for tracker in &mut self.trackers {
            if tracker.started {
                tracker.completed_pending = true;
                if !tracker.in_flight {
                    tracker.next_announce = now;
                }
            }
        }
        for entry in self.peers.values_mut() {
            if entry.interested {
                entry.interested = false;
                entry.send(PeerCommand::Interested(false));
            }
        }
        if let Some(ctx) = self.context.clone() {
            let id = self.shared.id;
            tokio::spawn(async move {
                if let Err(e) = ctx.storage.flush().await {
                    warn!(torrent = %id, error = %e, "flush after completion failed");
                }
            });
        }
        self.refresh_status();
    }

    fn fail(&mut self, reason: &str) {
        error!(torrent = %self.shared.id, reason, "torrent failed");
        if self.shared.set_state(TorrentState::Error) {
            self.active = false;
            for entry in self.peers.values() {
                entry.send(PeerCommand::Shutdown);
            }
        }
    }

    async fn shutdown(&mut self) {
        for entry in self.peers.values() {
            entry.send(PeerCommand::Shutdown);
        }

        let request = self.announce_request(TrackerEvent::Stopped);
        let announcer = Arc::clone(&self.deps.announcer);
        let urls: Vec<&str> = self
            .trackers
            .iter()
            .filter(|t| t.started)
            .map(|t| t.url.as_str())
            .collect();
        if !urls.is_empty() {
            let stops = urls.iter().map(|url| announcer.announce(url, &request));
            if tokio::time::timeout(STOPPED_ANNOUNCE_TIMEOUT, futures::future::join_all(stops))
                .await
                .is_err()
            {
                debug!(torrent = %self.shared.id, "stopped announce timed out");
            }
        }

        if let Some(ctx) = &self.context {
            if let Err(e) = ctx.storage.flush().await {
                warn!(torrent = %self.shared.id, error = %e, "final flush failed");
            }
        }
        info!(torrent = %self.shared.id, "torrent stopped");
    }

    // Commands

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                if self.shared.state() == TorrentState::Ready {
                    self.start();
                }
            }
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::AddPeer(addr) => {
                if self.candidates.add(addr, Instant::now()) {
                    debug!(torrent = %self.shared.id, peer = %addr, "peer added");
                }
                self.connect_candidates(Instant::now());
            }
            Command::Incoming(conn) => self.accept(conn),
            Command::StreamClosed(windows) => self.stream_closed(&windows),
        }
    }

    /// Cancels requests that only the closed stream's windows were keeping
    /// at the front; the pieces go back to rarest-first selection.
    fn stream_closed(&mut self, closed: &[Range<u32>]) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        let released = scheduler.release_uncovered(closed, &self.shared.windows());
        if released.is_empty() {
            return;
        }
        for (piece, peer) in &released {
            if let Some(entry) = self.peers.get(peer) {
                entry.send(PeerCommand::Cancel(*piece));
            }
        }
        debug!(torrent = %self.shared.id, released = released.len(), "cancelled requests of closed stream");
        self.schedule();
    }

    fn accept(&mut self, conn: PeerConnection) {
        let addr = conn.addr;
        let full = self.peers.len() >= self.deps.config.max_peers_per_torrent;
        if !self.active || full || self.peers.contains_key(&addr) {
            debug!(torrent = %self.shared.id, peer = %addr, "inbound peer refused");
            tokio::spawn(conn.close());
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(addr, PeerEntry::new(tx, true));
        let worker = PeerWorker::new(
            conn,
            Arc::clone(&self.shared),
            rx,
            self.peer_tx.clone(),
            self.worker_settings(),
        );
        tokio::spawn(worker.run());
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            pipeline_depth: self.deps.config.pipeline_depth,
            upload_slots: self.deps.config.upload_slots,
        }
    }

    fn connect_candidates(&mut self, now: Instant) {
        if !self.active {
            return;
        }
        let room = self
            .deps
            .config
            .max_peers_per_torrent
            .saturating_sub(self.peers.len());
        if room == 0 {
            return;
        }
        for addr in self.candidates.take_due(now, room) {
            if !self.peers.contains_key(&addr) {
                self.connect(addr);
            }
        }
    }

    fn connect(&mut self, addr: SocketAddr) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(addr, PeerEntry::new(tx, false));

        let config = &self.deps.config;
        let timeouts = PeerTimeouts {
            connect: config.connect_timeout,
            handshake: config.handshake_timeout,
            read: config.peer_read_timeout,
        };
        let info_hash = self.shared.info_hash;
        let our_id = self.deps.peer_id;
        let shared = Arc::clone(&self.shared);
        let events = self.peer_tx.clone();
        let settings = self.worker_settings();

        tokio::spawn(async move {
            match PeerConnection::connect(addr, info_hash, our_id, timeouts).await {
                Ok(conn) => PeerWorker::new(conn, shared, rx, events, settings).run().await,
                Err(e) => {
                    debug!(peer = %addr, error = %e, "connect failed");
                    let _ = events.send((addr, PeerEvent::ConnectFailed));
                }
            }
        });
    }

    // Peer events

    async fn on_peer_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        let now = Instant::now();
        match event {
            PeerEvent::Connected { peer_id } => {
                let Some(entry) = self.peers.get_mut(&addr) else {
                    return;
                };
                entry.connected = true;
                if !entry.inbound {
                    self.candidates.connected(addr, now);
                }
                info!(
                    torrent = %self.shared.id,
                    peer = %addr,
                    client = peer_id.client_id().unwrap_or("unknown"),
                    "peer connected"
                );
                if self.shared.state() == TorrentState::Starting {
                    self.shared.set_state(TorrentState::Downloading);
                }
                self.refresh_status();
            }
            PeerEvent::ConnectFailed => {
                self.peers.remove(&addr);
                if !self.candidates.failed(addr, now) {
                    debug!(torrent = %self.shared.id, peer = %addr, "peer dropped after retries");
                }
            }
            PeerEvent::Disconnected => self.peer_gone(addr, now),
            PeerEvent::Extensions {
                metadata_size,
                supports_metadata,
            } => {
                let Some(entry) = self.peers.get_mut(&addr) else {
                    return;
                };
                entry.supports_metadata = supports_metadata;
                if self.context.is_none() && self.metadata.is_none() && supports_metadata {
                    if let Some(size) = metadata_size {
                        self.metadata =
                            MetadataAssembler::new(self.shared.info_hash, size, MAX_METADATA_SIZE);
                        if self.metadata.is_none() {
                            warn!(peer = %addr, size, "peer advertised unusable metadata size");
                        }
                    }
                }
                self.request_metadata(now);
            }
            event @ (PeerEvent::Bitfield(_)
            | PeerEvent::Have(_)
            | PeerEvent::HaveAll
            | PeerEvent::HaveNone) => {
                if self.context.is_some() {
                    self.on_availability(addr, event);
                } else if let Some(entry) = self.peers.get_mut(&addr) {
                    entry.early.push(event);
                }
            }
            PeerEvent::Choked => {
                if let Some(entry) = self.peers.get_mut(&addr) {
                    entry.choked = true;
                }
            }
            PeerEvent::Unchoked => {
                if let Some(entry) = self.peers.get_mut(&addr) {
                    entry.choked = false;
                }
                self.schedule();
            }
            PeerEvent::PieceDone { piece, data } => self.on_piece_done(addr, piece, data).await,
            PeerEvent::PieceFailed { piece } => self.on_piece_failed(addr, piece),
            PeerEvent::MetadataPiece { piece, data } => self.on_metadata_piece(piece, data).await,
            PeerEvent::MetadataRejected { piece } => {
                if let Some(assembler) = self.metadata.as_mut() {
                    assembler.rejected(piece);
                }
            }
        }
    }

    fn peer_gone(&mut self, addr: SocketAddr, now: Instant) {
        let Some(entry) = self.peers.remove(&addr) else {
            return;
        };

        if let Some(scheduler) = self.scheduler.as_mut() {
            let released = match &entry.bitfield {
                Some(bf) => scheduler.peer_gone(addr, bf),
                None => scheduler.release_peer(addr),
            };
            if !released.is_empty() {
                debug!(peer = %addr, ?released, "released pieces of departed peer");
            }
        }
        if let Some(assembler) = self.metadata.as_mut() {
            assembler.peer_gone(addr);
        }
        if entry.connected {
            info!(torrent = %self.shared.id, peer = %addr, "peer disconnected");
        }
        if !entry.inbound {
            self.candidates.failed(addr, now);
        }

        self.refresh_status();
        self.schedule();
    }

    fn on_availability(&mut self, addr: SocketAddr, event: PeerEvent) {
        let (Some(ctx), Some(scheduler)) = (self.context.as_ref(), self.scheduler.as_mut()) else {
            return;
        };
        let Some(entry) = self.peers.get_mut(&addr) else {
            return;
        };
        let count = ctx.metainfo.info.piece_count() as usize;

        match event {
            PeerEvent::Bitfield(bytes) => {
                if entry.bitfield.is_some() {
                    return;
                }
                match Bitfield::from_bytes(&bytes, count) {
                    Ok(bf) => {
                        scheduler.peer_bitfield(&bf);
                        entry.bitfield = Some(bf);
                    }
                    Err(e) => {
                        warn!(peer = %addr, error = %e, "invalid bitfield");
                        entry.send(PeerCommand::Shutdown);
                        return;
                    }
                }
            }
            PeerEvent::HaveAll if entry.bitfield.is_none() => {
                let bf = Bitfield::full(count);
                scheduler.peer_bitfield(&bf);
                entry.bitfield = Some(bf);
            }
            PeerEvent::HaveNone if entry.bitfield.is_none() => {
                entry.bitfield = Some(Bitfield::new(count));
            }
            PeerEvent::Have(piece) if (piece as usize) < count => {
                let bf = entry.bitfield.get_or_insert_with(|| Bitfield::new(count));
                if !bf.has(piece as usize) {
                    bf.set(piece as usize);
                    scheduler.peer_has(piece);
                }
            }
            _ => return,
        }

        self.update_interest(addr);
        self.schedule();
    }

    fn update_interest_all(&mut self) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr);
        }
    }

    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(ctx) = self.context.as_ref() else {
            return;
        };
        let Some(entry) = self.peers.get_mut(&addr) else {
            return;
        };
        let downloading = matches!(
            self.shared.state(),
            TorrentState::Starting | TorrentState::Downloading
        );
        let wanted = downloading
            && entry
                .bitfield
                .as_ref()
                .is_some_and(|bf| wants_from(bf, &ctx.piece_map.bitfield()));
        if wanted != entry.interested {
            entry.interested = wanted;
            entry.send(PeerCommand::Interested(wanted));
        }
    }

    async fn on_piece_done(&mut self, addr: SocketAddr, piece: u32, data: Bytes) {
        let Some(ctx) = self.context.clone() else {
            return;
        };
        if ctx.piece_map.is_verified(piece) {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.release(piece, addr);
            }
            return;
        }

        let offset = ctx.metainfo.info.piece_offset(piece);
        if let Err(e) = ctx.storage.write(offset, &data).await {
            self.fail(&format!("writing piece {piece}: {e}"));
            return;
        }
        if ctx.piece_map.state(piece) == Some(PieceState::Missing) {
            // Expired or released while the last blocks were in flight.
            let _ = ctx.piece_map.mark_requested(piece);
        }
        if let Err(e) = ctx.piece_map.mark_verified(piece) {
            warn!(piece, error = %e, "could not mark piece verified");
            return;
        }
        trace!(torrent = %self.shared.id, piece, peer = %addr, "piece verified");

        let duplicates = self
            .scheduler
            .as_mut()
            .map(|s| s.complete(piece, addr))
            .unwrap_or_default();
        for other in duplicates {
            if let Some(entry) = self.peers.get(&other) {
                entry.send(PeerCommand::Cancel(piece));
            }
        }
        for entry in self.peers.values().filter(|p| p.connected) {
            entry.send(PeerCommand::Have(piece));
        }
        self.shared.events.publish(TorrentEvent::PieceCompleted {
            id: self.shared.id,
            piece,
        });

        if ctx.piece_map.is_complete() {
            info!(torrent = %self.shared.id, "download complete");
            self.finish();
        } else {
            self.update_interest_all();
            self.schedule();
        }
    }

    fn on_piece_failed(&mut self, addr: SocketAddr, piece: u32) {
        warn!(torrent = %self.shared.id, peer = %addr, piece, "piece failed hash check");
        if let Some(ctx) = &self.context {
            if ctx.piece_map.state(piece) == Some(PieceState::Requested) {
                let _ = ctx.piece_map.reset(piece);
            }
        }
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.release(piece, addr);
        }
        self.schedule();
    }

    async fn on_metadata_piece(&mut self, piece: u32, data: Bytes) {
        let now = Instant::now();
        let Some(assembler) = self.metadata.as_mut() else {
            return;
        };
        if !assembler.receive(piece, data) {
            debug!(piece, "unexpected metadata piece");
            return;
        }
        if !assembler.is_complete() {
            self.request_metadata(now);
            return;
        }

        let trackers = self.trackers.iter().map(|t| t.url.clone()).collect();
        match assembler.finish(trackers) {
            Ok(metainfo) => {
                info!(
                    torrent = %self.shared.id,
                    name = %metainfo.info.name,
                    pieces = metainfo.info.piece_count(),
                    "metadata resolved"
                );
                self.metadata = None;
                self.shared.events.publish(TorrentEvent::MetadataResolved {
                    id: self.shared.id,
                });
                self.prepare(metainfo).await;
            }
            Err(e) => {
                warn!(torrent = %self.shared.id, error = %e, "assembled metadata rejected");
                let size = assembler.size();
                self.metadata = MetadataAssembler::new(self.shared.info_hash, size, MAX_METADATA_SIZE);
                self.request_metadata(now);
            }
        }
    }

    fn request_metadata(&mut self, now: Instant) {
        let Some(assembler) = self.metadata.as_mut() else {
            return;
        };
        for (addr, entry) in &self.peers {
            if !entry.connected || !entry.supports_metadata {
                continue;
            }
            let pieces = assembler.next_requests(*addr, now, METADATA_REQUESTS_PER_PEER);
            if !pieces.is_empty() {
                entry.send(PeerCommand::RequestMetadata(pieces));
            }
        }
    }

    // Scheduling

    fn schedule(&mut self) {
        if self.shared.state() != TorrentState::Downloading {
            return;
        }
        let (Some(ctx), Some(scheduler)) = (self.context.as_ref(), self.scheduler.as_mut()) else {
            return;
        };

        let states = ctx.piece_map.snapshot();
        let windows = self.shared.windows();
        let per_peer = self.deps.config.pieces_per_peer;
        let now = Instant::now();

        for (addr, entry) in &self.peers {
            if !entry.connected || entry.choked {
                continue;
            }
            let Some(bf) = &entry.bitfield else {
                continue;
            };
            let room = per_peer.saturating_sub(scheduler.assigned_to(*addr));
            if room == 0 {
                continue;
            }

            let picked = scheduler.pick(*addr, bf, &states, &windows, room, now);
            if picked.is_empty() {
                continue;
            }
            for &piece in &picked {
                if let Err(e) = ctx.piece_map.mark_requested(piece) {
                    debug!(piece, error = %e, "piece not requestable");
                }
            }
            trace!(peer = %addr, pieces = ?picked, "assigned pieces");
            entry.send(PeerCommand::Download(picked));
        }
    }

    // Periodic work

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.announce_due(now);
        self.connect_candidates(now);

        if let Some(scheduler) = self.scheduler.as_mut() {
            for (piece, peer) in scheduler.expire(now, self.deps.config.piece_timeout) {
                debug!(piece, peer = %peer, "piece request timed out");
                if let Some(entry) = self.peers.get(&peer) {
                    entry.send(PeerCommand::Cancel(piece));
                }
            }
        }

        self.request_metadata(now);
        self.check_tracker_budget();
        self.refresh_status();

        if self.shared.state() == TorrentState::Downloading {
            self.shared.events.publish(TorrentEvent::Progress {
                id: self.shared.id,
                status: self.shared.status(),
            });
        }
        self.schedule();
    }

    fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.shared.info_hash,
            peer_id: self.deps.peer_id,
            port: self.deps.listen_port,
            uploaded: self.shared.uploaded(),
            downloaded: self.shared.downloaded(),
            left: self.left(),
            event,
        }
    }

    /// Bytes still missing. Unknown before metadata, reported as one.
    fn left(&self) -> u64 {
        let Some(ctx) = &self.context else {
            return 1;
        };
        let info = &ctx.metainfo.info;
        let verified: u64 = ctx
            .piece_map
            .snapshot()
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == PieceState::Verified)
            .map(|(i, _)| info.piece_size(i as u32))
            .sum();
        info.total_length.saturating_sub(verified)
    }

    fn announce_due(&mut self, now: Instant) {
        if !self.active {
            return;
        }
        let base = self.announce_request(TrackerEvent::None);

        for (index, tracker) in self.trackers.iter_mut().enumerate() {
            if tracker.in_flight || tracker.next_announce > now {
                continue;
            }
            let event = if !tracker.started {
                TrackerEvent::Started
            } else if tracker.completed_pending {
                TrackerEvent::Completed
            } else {
                TrackerEvent::None
            };
            tracker.in_flight = true;
            tracker.last_event = event;
            tracker.next_announce = now + TRACKER_ANNOUNCE_INTERVAL;

            let request = AnnounceRequest { event, ..base };
            let url = tracker.url.clone();
            let announcer = Arc::clone(&self.deps.announcer);
            let results = self.announce_tx.clone();
            tokio::spawn(async move {
                let result = announcer.announce(&url, &request).await;
                let _ = results.send((index, result));
            });
        }
    }

    fn on_announce(&mut self, index: usize, result: Result<AnnounceResponse, TrackerError>) {
        let now = Instant::now();
        let Some(tracker) = self.trackers.get_mut(index) else {
            return;
        };
        tracker.in_flight = false;

        match result {
            Ok(response) => {
                tracker.failures = 0;
                match tracker.last_event {
                    TrackerEvent::Started => tracker.started = true,
                    TrackerEvent::Completed => tracker.completed_pending = false,
                    _ => {}
                }
                let min = response
                    .min_interval
                    .map(|s| Duration::from_secs(s.into()))
                    .unwrap_or(TRACKER_MIN_INTERVAL)
                    .max(TRACKER_MIN_INTERVAL);
                let interval = Duration::from_secs(response.interval.into()).max(min);
                tracker.next_announce = now + interval;
                tracker.seeds = response.complete.unwrap_or(0);
                tracker.leechers = response.incomplete.unwrap_or(0);
                if let Some(warning) = &response.warning_message {
                    warn!(tracker = %tracker.url, %warning, "tracker warning");
                }

                let added = response
                    .peers
                    .iter()
                    .filter(|addr| self.candidates.add(**addr, now))
                    .count();
                debug!(
                    torrent = %self.shared.id,
                    tracker = %self.trackers[index].url,
                    peers = response.peers.len(),
                    added,
                    "announce succeeded"
                );

                self.connect_candidates(now);
                self.refresh_status();
            }
            Err(e) => {
                tracker.failures += 1;
                tracker.next_announce = now + TRACKER_RETRY_DELAY * tracker.failures.min(8);
                warn!(
                    torrent = %self.shared.id,
                    tracker = %tracker.url,
                    failures = tracker.failures,
                    error = %e,
                    "announce failed"
                );
            }
        }
    }

    /// Fails the torrent once every tracker has used up its retries and
    /// there is nobody left to talk to.
    fn check_tracker_budget(&mut self) {
        if !self.active || self.trackers.is_empty() {
            return;
        }
        if matches!(
            self.shared.state(),
            TorrentState::Completed | TorrentState::Error | TorrentState::Paused
        ) {
            return;
        }
        let budget = self.deps.config.tracker_retry_attempts;
        let exhausted = self.trackers.iter().all(|t| t.failures >= budget);
        if exhausted && self.peers.is_empty() && self.candidates.is_empty() {
            self.fail("every tracker failed and no peers are known");
        }
    }

    fn refresh_status(&self) {
        let connected: Vec<&PeerEntry> = self.peers.values().filter(|p| p.connected).collect();
        let connected_seeds = connected.iter().filter(|p| p.is_seed()).count() as u32;
        let connected_peers = connected.len() as u32 - connected_seeds;
        let tracker_seeds = self.trackers.iter().map(|t| t.seeds).max().unwrap_or(0);
        let tracker_leechers = self.trackers.iter().map(|t| t.leechers).max().unwrap_or(0);

        let (verified, total) = self
            .context
            .as_ref()
            .map(|ctx| (ctx.piece_map.verified_count(), ctx.piece_map.piece_count()))
            .unwrap_or((0, 0));
        let (download_rate, upload_rate) = self.shared.rates();

        self.shared.set_status(TorrentStatus {
            progress: if total > 0 {
                verified as f64 / total as f64
            } else {
                0.0
            },
            download_rate,
            upload_rate,
            downloaded: self.shared.downloaded(),
            uploaded: self.shared.uploaded(),
            seeds: connected_seeds.max(tracker_seeds),
            peers: connected_peers.max(tracker_leechers),
            verified_pieces: verified,
            total_pieces: total,
        });
    }
}
