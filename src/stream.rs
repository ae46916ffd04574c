//! Seekable, partially available reads over one file of a torrent.
//!
//! A [`TorrentStream`] registers priority windows with its torrent so the
//! scheduler fetches the pieces under the read position first, and blocks
//! readers on the piece map until the bytes they asked for are verified.
//! Its [`StreamState`] is independent of the torrent's: stopping a stream
//! leaves the torrent downloading in the background.

mod error;
mod reader;


pub use error::StreamError;
pub use reader::BlockingReader;

use crate::events::{EventBus, StreamEvent, Subscription};
use crate::metainfo::FileEntry;
use crate::torrent::{Command, TorrentContext, TorrentShared, TorrentState};
use bytes::Bytes;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Waiting for the pieces around the read position.
    Preparing,
    Streaming,
    /// Terminal.
    Stopped,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Preparing => "preparing",
            StreamState::Streaming => "streaming",
            StreamState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct StreamInner {
    id: u64,
    shared: Arc<TorrentShared>,
    context: Arc<TorrentContext>,
    file: FileEntry,
    /// Pieces covering the file.
    pieces: Range<u32>,
    cancel: CancellationToken,
    state: watch::Sender<StreamState>,
    events: EventBus<StreamEvent>,
    /// Pieces prepared from the read position onwards.
    head: Mutex<Range<u32>>,
    tail: Range<u32>,
    recheck: Arc<Notify>,
    opened: AtomicBool,
    ready_sent: AtomicBool,
}

impl StreamInner {
    fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    fn set_state(&self, new: StreamState) -> bool {
        let mut old = new;
        let changed = self.state.send_if_modified(|state| {
            if *state == new || *state == StreamState::Stopped {
                return false;
            }
            old = *state;
            *state = new;
            true
        });
        if changed {
            debug!(
                torrent = %self.shared.id,
                stream = self.id,
                %old,
                %new,
                "stream state changed"
            );
            self.events.publish(StreamEvent::StateChanged { old, new });
        }
        changed
    }

    fn head_from(&self, piece: u32) -> Range<u32> {
        let count = self.shared.stream_config.prepare_pieces(self.pieces.len() as u32);
        let start = piece.clamp(self.pieces.start, self.pieces.end);
        start..start.saturating_add(count).min(self.pieces.end)
    }

    /// Moves the head window to start at `piece`. Returns `false` if it
    /// already did.
    fn recentre(&self, piece: u32) -> bool {
        let head = self.head_from(piece);
        {
            let mut current = self.head.lock();
            if *current == head {
                return false;
            }
            *current = head.clone();
        }
        if self.state() != StreamState::Stopped {
            self.shared.set_windows(self.id, vec![head, self.tail.clone()]);
        }
        self.recheck.notify_one();
        true
    }

    fn prepared(&self) -> bool {
        let head = self.head.lock().clone();
        let map = &self.context.piece_map;
        map.all_verified(head) && map.all_verified(self.tail.clone())
    }

    /// Drops this stream's windows and has the torrent cancel the requests
    /// that only they were holding.
    fn detach(&self) {
        if let Some(windows) = self.shared.clear_windows(self.id) {
            let _ = self.shared.send(Command::StreamClosed(windows));
        }
    }

    /// Moves to `Stopped` and detaches from the scheduler. Idempotent.
    fn stop(&self) {
        if self.set_state(StreamState::Stopped) {
            self.detach();
            self.cancel.cancel();
            self.events.publish(StreamEvent::Stopped);
            info!(torrent = %self.shared.id, stream = self.id, "stream stopped");
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        self.detach();
        self.cancel.cancel();
    }
}

/// A read-oriented view of one file in a torrent.
///
/// Clones share the same stream. The stream detaches its windows when it is
/// stopped or when the last clone is dropped.
#[derive(Clone)]
pub struct TorrentStream {
    inner: Arc<StreamInner>,
}

impl TorrentStream {
    pub(crate) fn new(
        shared: Arc<TorrentShared>,
        file_index: Option<usize>,
    ) -> Result<Self, StreamError> {
        let state = shared.state();
        if !state.has_content() {
            return Err(StreamError::InvalidTorrentState(state));
        }
        let context = shared
            .context()
            .ok_or(StreamError::InvalidTorrentState(state))?;

        let info = &context.metainfo.info;
        let file = match file_index {
            Some(index) => info.files.get(index).cloned(),
            None => info.largest_file().cloned(),
        }
        .ok_or(StreamError::UnknownFile(file_index.unwrap_or(0)))?;

        let pieces = info.file_pieces(&file);
        let tail_start = pieces
            .end
            .saturating_sub(shared.stream_config.tail_pieces)
            .max(pieces.start);
        let (state, _) = watch::channel(StreamState::Preparing);
        let id = shared.next_stream_id();
        let cancel = shared.cancel.child_token();

        Ok(Self {
            inner: Arc::new(StreamInner {
                id,
                shared,
                context,
                file,
                head: Mutex::new(pieces.start..pieces.start),
                tail: tail_start..pieces.end,
                pieces,
                cancel,
                state,
                events: EventBus::new(),
                recheck: Arc::new(Notify::new()),
                opened: AtomicBool::new(false),
                ready_sent: AtomicBool::new(false),
            }),
        })
    }

    /// Starts preparing the beginning and the end of the file.
    ///
    /// Returns `Preparing` on the first call; later calls return the current
    /// state without side effects.
    pub fn open(&self) -> StreamState {
        let inner = &self.inner;
        if inner.opened.swap(true, Ordering::AcqRel) || inner.state() == StreamState::Stopped {
            return inner.state();
        }

        // A read before open may already have placed the head.
        let head = {
            let mut head = inner.head.lock();
            if head.is_empty() {
                *head = inner.head_from(inner.pieces.start);
            }
            head.clone()
        };
        inner
            .shared
            .set_windows(inner.id, vec![head.clone(), inner.tail.clone()]);
        info!(
            torrent = %inner.shared.id,
            stream = inner.id,
            file = %inner.file.path.display(),
            ?head,
            tail = ?inner.tail,
            "stream opened"
        );

        inner
            .shared
            .runtime
            .spawn(watch_readiness(Arc::downgrade(inner), self.watch_inputs()));
        StreamState::Preparing
    }

    fn watch_inputs(&self) -> WatchInputs {
        WatchInputs {
            changes: self.inner.context.piece_map.subscribe(),
            torrent_state: self.inner.shared.watch_state(),
            cancel: self.inner.cancel.clone(),
            recheck: Arc::clone(&self.inner.recheck),
        }
    }

    /// Reads up to `length` bytes at file offset `offset`, waiting until the
    /// covering pieces are verified.
    ///
    /// Reads are clamped to the end of the file; at or past the end the
    /// result is empty. `timeout` defaults to the configured read timeout.
    pub async fn read_at(
        &self,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<Bytes, StreamError> {
        let inner = &self.inner;
        if inner.state() == StreamState::Stopped || inner.cancel.is_cancelled() {
            return Err(StreamError::StreamStopped);
        }
        if offset >= inner.file.length || length == 0 {
            return Ok(Bytes::new());
        }

        let end = (offset + length as u64).min(inner.file.length);
        let start = inner.file.offset + offset;
        let span = end - offset;
        let pieces = inner.context.metainfo.info.pieces_for_span(start, span);

        // The head follows every read; reads inside the tail leave it alone.
        if !inner.tail.contains(&pieces.start) {
            inner.recentre(pieces.start);
        }

        let timeout = timeout.unwrap_or(inner.shared.stream_config.read_timeout);
        self.wait_for(pieces, timeout).await?;
        Ok(inner.context.storage.read(start, span as usize).await?)
    }

    async fn wait_for(&self, pieces: Range<u32>, timeout: Duration) -> Result<(), StreamError> {
        let map = &self.inner.context.piece_map;
        let mut changes = map.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            if map.all_verified(pieces.clone()) {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return Err(StreamError::StreamStopped),
                _ = &mut deadline => return Err(StreamError::StreamTimeout),
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(StreamError::StreamStopped);
                    }
                }
            }
        }
    }

    /// Moves the preparation window to `offset`. Drops back to `Preparing`
    /// until the pieces there are verified.
    pub fn seek(&self, offset: u64) -> Result<(), StreamError> {
        let inner = &self.inner;
        if inner.state() == StreamState::Stopped {
            return Err(StreamError::StreamStopped);
        }
        if offset > inner.file.length {
            return Err(StreamError::OutOfBounds {
                offset,
                length: inner.file.length,
            });
        }

        let absolute = inner.file.offset + offset.min(inner.file.length.saturating_sub(1));
        let piece = (absolute / inner.context.metainfo.info.piece_length) as u32;
        inner.recentre(piece);
        if inner.state() == StreamState::Streaming && !inner.prepared() {
            inner.set_state(StreamState::Preparing);
        }
        debug!(torrent = %inner.shared.id, stream = inner.id, offset, piece, "stream seek");
        Ok(())
    }

    /// Stops the stream for good. Pending reads fail with
    /// [`StreamError::StreamStopped`]; the torrent keeps downloading.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.inner.state.subscribe()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn file(&self) -> &FileEntry {
        &self.inner.file
    }

    /// Length of the streamed file in bytes.
    pub fn len(&self) -> u64 {
        self.inner.file.length
    }

    pub fn is_empty(&self) -> bool {
        self.inner.file.length == 0
    }

    /// The part of the file readable right now without waiting, from 0.
    pub fn available(&self) -> u64 {
        let inner = &self.inner;
        let info = &inner.context.metainfo.info;
        let map = &inner.context.piece_map;
        let verified_end = (inner.pieces.start..inner.pieces.end)
            .find(|p| !map.is_verified(*p))
            .map(|p| info.piece_offset(p))
            .unwrap_or(u64::MAX);
        verified_end
            .saturating_sub(inner.file.offset)
            .min(inner.file.length)
    }

    pub fn subscribe(&self) -> Subscription<StreamEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_fn<F>(&self, listener: F)
    where
        F: Fn(StreamEvent) -> Result<(), Box<dyn Error + Send + Sync>> + Send + 'static,
    {
        self.inner
            .events
            .subscribe_fn(&self.inner.shared.runtime, listener);
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.inner.shared.stream_config.chunk_size.max(1)
    }
}

impl fmt::Debug for TorrentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentStream")
            .field("id", &self.inner.id)
            .field("torrent", &self.inner.shared.id)
            .field("file", &self.inner.file.path)
            .field("state", &self.state())
            .finish()
    }
}

struct WatchInputs {
    changes: watch::Receiver<u64>,
    torrent_state: watch::Receiver<TorrentState>,
    cancel: CancellationToken,
    recheck: Arc<Notify>,
}

/// Flips the stream to `Streaming` whenever its windows are verified, and
/// reports torrent failure. Exits once the stream is gone or stopped.
async fn watch_readiness(stream: Weak<StreamInner>, mut inputs: WatchInputs) {
    let mut reported_error = false;
    loop {
        {
            let Some(inner) = stream.upgrade() else {
                return;
            };
            if inner.state() == StreamState::Stopped {
                return;
            }
            if inputs.cancel.is_cancelled() {
                inner.stop();
                return;
            }

            let torrent_state = *inputs.torrent_state.borrow();
            if torrent_state == TorrentState::Error && !reported_error {
                reported_error = true;
                warn!(torrent = %inner.shared.id, stream = inner.id, "torrent failed under stream");
                inner
                    .events
                    .publish(StreamEvent::Error(format!("torrent entered {torrent_state}")));
            }

            if inner.state() == StreamState::Preparing && inner.prepared() {
                inner.set_state(StreamState::Streaming);
                if !inner.ready_sent.swap(true, Ordering::AcqRel) {
                    inner.events.publish(StreamEvent::Ready);
                }
            }
        }

        tokio::select! {
            _ = inputs.cancel.cancelled() => {}
            changed = inputs.changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = inputs.torrent_state.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = inputs.recheck.notified() => {}
        }
    }
}
