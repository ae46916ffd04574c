use super::error::TorrentError;
use super::health::Health;
use super::state::TorrentState;
use super::stats::{RateMeter, TorrentStatus};
use super::TorrentId;
use crate::config::StreamConfig;
use crate::constants::RATE_CALC_WINDOW;
use crate::events::{EventBus, Subscription, TorrentEvent};
use crate::metainfo::{FileEntry, InfoHash, Metainfo};
use crate::peer::PeerConnection;
use crate::piece_map::PieceMap;
use crate::storage::Storage;
use crate::stream::{StreamError, TorrentStream};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::error::Error;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything that exists once metadata is known and storage is allocated.
pub(crate) struct TorrentContext {
    pub metainfo: Metainfo,
    pub piece_map: Arc<PieceMap>,
    pub storage: Arc<dyn Storage>,
}

pub(crate) enum Command {
    Start,
    Pause,
    Resume,
    AddPeer(SocketAddr),
    Incoming(PeerConnection),
    /// A stream went away; its former windows, unmerged.
    StreamClosed(Vec<Range<u32>>),
}

/// State shared between the torrent task, its peer workers, its streams and
/// the handles given out to callers. Only the torrent task changes `state`.
pub(crate) struct TorrentShared {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub stream_config: StreamConfig,
    pub cancel: CancellationToken,
    pub events: EventBus<TorrentEvent>,
    /// Wakes the task to run a scheduling pass.
    pub schedule: Notify,
    pub upload_slots_used: AtomicUsize,
    /// Runtime the torrent task runs on. Streams and listeners spawn here so
    /// they work from threads outside it.
    pub runtime: Handle,
    name: RwLock<String>,
    state: watch::Sender<TorrentState>,
    context: RwLock<Option<Arc<TorrentContext>>>,
    windows: Mutex<BTreeMap<u64, Vec<Range<u32>>>>,
    next_stream_id: AtomicU64,
    status: Mutex<TorrentStatus>,
    commands: mpsc::UnboundedSender<Command>,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    download_rate: RateMeter,
    upload_rate: RateMeter,
}

impl TorrentShared {
    pub fn new(
        id: TorrentId,
        info_hash: InfoHash,
        name: String,
        stream_config: StreamConfig,
        cancel: CancellationToken,
        runtime: Handle,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TorrentState::Creating);
        let shared = Arc::new(Self {
            id,
            info_hash,
            stream_config,
            cancel,
            events: EventBus::new(),
            schedule: Notify::new(),
            upload_slots_used: AtomicUsize::new(0),
            runtime,
            name: RwLock::new(name),
            state,
            context: RwLock::new(None),
            windows: Mutex::new(BTreeMap::new()),
            next_stream_id: AtomicU64::new(0),
            status: Mutex::new(TorrentStatus::default()),
            commands,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            download_rate: RateMeter::new(RATE_CALC_WINDOW),
            upload_rate: RateMeter::new(RATE_CALC_WINDOW),
        });
        (shared, rx)
    }

    pub fn state(&self) -> TorrentState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TorrentState> {
        self.state.subscribe()
    }

    /// Applies a transition if the state machine allows it and announces it.
    pub fn set_state(&self, new: TorrentState) -> bool {
        let mut old = new;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(new) {
                old = *state;
                *state = new;
                true
            } else {
                false
            }
        });

        if changed {
            info!(torrent = %self.id, %old, %new, "state changed");
            self.events.publish(TorrentEvent::StateChanged {
                id: self.id,
                old,
                new,
            });
        }
        changed
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub fn context(&self) -> Option<Arc<TorrentContext>> {
        self.context.read().clone()
    }

    pub fn set_context(&self, context: Arc<TorrentContext>) {
        *self.context.write() = Some(context);
    }

    pub fn send(&self, command: Command) -> Result<(), TorrentError> {
        self.commands.send(command).map_err(|_| TorrentError::Closed)
    }

    pub fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Replaces the priority windows of one stream and wakes the scheduler.
    pub fn set_windows(&self, stream: u64, windows: Vec<Range<u32>>) {
        self.windows.lock().insert(stream, windows);
        self.schedule.notify_one();
    }

    /// Removes the windows of one stream and returns them.
    pub fn clear_windows(&self, stream: u64) -> Option<Vec<Range<u32>>> {
        let removed = self.windows.lock().remove(&stream);
        if removed.is_some() {
            self.schedule.notify_one();
        }
        removed
    }

    /// The windows of every attached stream, unmerged.
    pub fn windows(&self) -> Vec<Range<u32>> {
        self.windows.lock().values().flatten().cloned().collect()
    }

    pub fn status(&self) -> TorrentStatus {
        self.status.lock().clone()
    }

    pub fn set_status(&self, status: TorrentStatus) {
        *self.status.lock() = status;
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.download_rate.record(bytes);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.upload_rate.record(bytes);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn rates(&self) -> (u64, u64) {
        (self.download_rate.rate(), self.upload_rate.rate())
    }

    /// Takes an upload slot if fewer than `limit` are in use.
    pub fn try_acquire_upload_slot(&self, limit: usize) -> bool {
        self.upload_slots_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < limit).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn release_upload_slot(&self) {
        let _ = self
            .upload_slots_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_sub(1)
            });
    }
}

/// A cheap, cloneable reference to a torrent owned by a [`Session`].
///
/// Lifecycle requests are checked against the current state and rejected
/// with [`TorrentError::InvalidTorrentState`] when they do not apply.
///
/// [`Session`]: crate::session::Session
#[derive(Clone)]
pub struct TorrentHandle {
    pub(crate) shared: Arc<TorrentShared>,
}

impl TorrentHandle {
    pub(crate) fn new(shared: Arc<TorrentShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> TorrentId {
        self.shared.id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.shared.info_hash
    }

    /// The torrent name, or the magnet display name until metadata arrives.
    pub fn name(&self) -> String {
        self.shared.name()
    }

    pub fn state(&self) -> TorrentState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<TorrentState> {
        self.shared.watch_state()
    }

    pub fn status(&self) -> TorrentStatus {
        self.shared.status()
    }

    pub fn health(&self) -> Health {
        self.shared.status().health()
    }

    pub fn files(&self) -> Result<Vec<FileEntry>, TorrentError> {
        self.shared
            .context()
            .map(|ctx| ctx.metainfo.info.files.clone())
            .ok_or(TorrentError::InvalidTorrentState(self.state()))
    }

    /// `Ready -> Starting`. Only needed when auto start is off.
    pub fn start(&self) -> Result<(), TorrentError> {
        self.request(TorrentState::Ready, Command::Start)
    }

    pub fn pause(&self) -> Result<(), TorrentError> {
        self.request(TorrentState::Downloading, Command::Pause)
    }

    pub fn resume(&self) -> Result<(), TorrentError> {
        self.request(TorrentState::Paused, Command::Resume)
    }

    fn request(&self, expected: TorrentState, command: Command) -> Result<(), TorrentError> {
        let state = self.state();
        if state != expected {
            return Err(TorrentError::InvalidTorrentState(state));
        }
        self.shared.send(command)
    }

    /// Adds a peer address to connect to.
    pub fn add_peer(&self, addr: SocketAddr) -> Result<(), TorrentError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(TorrentError::InvalidTorrentState(state));
        }
        self.shared.send(Command::AddPeer(addr))
    }

    pub fn subscribe(&self) -> Subscription<TorrentEvent> {
        self.shared.events.subscribe()
    }

    /// Delivers events to `listener` on its own task.
    pub fn subscribe_fn<F>(&self, listener: F)
    where
        F: Fn(TorrentEvent) -> Result<(), Box<dyn Error + Send + Sync>> + Send + 'static,
    {
        self.shared
            .events
            .subscribe_fn(&self.shared.runtime, listener);
    }

    /// Opens a stream over file `file_index`, or over the largest file.
    ///
    /// Fails with [`StreamError::InvalidTorrentState`] until metadata and
    /// storage exist, and once the torrent is in `Error`.
    pub fn stream(&self, file_index: Option<usize>) -> Result<TorrentStream, StreamError> {
        TorrentStream::new(self.shared.clone(), file_index)
    }
}

impl std::fmt::Debug for TorrentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentHandle")
            .field("id", &self.shared.id)
            .field("info_hash", &self.shared.info_hash)
            .field("state", &self.state())
            .finish()
    }
}
