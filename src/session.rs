//! The entry point: a set of torrents sharing one peer id, one tracker
//! client and one inbound listener.
//!
//! ```no_run
//! use torrent_stream::config::SessionConfig;
//! use torrent_stream::session::{Session, TorrentSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new(SessionConfig::default())?;
//! session.start().await?;
//!
//! let source = TorrentSource::Magnet("magnet:?xt=urn:btih:...".into());
//! let torrent = session.create_torrent(source, "/tmp/downloads")?;
//! let stream = torrent.stream(None)?;
//! # Ok(())
//! # }
//! ```
//!
//! Two sessions never share peers, torrents or listeners.

mod error;
mod listener;

#[cfg(test)]
mod tests;

pub use error::SessionError;

use crate::config::SessionConfig;
use crate::metainfo::{MagnetLink, Metainfo};
use crate::peer::PeerId;
use crate::storage::{file_storage_factory, StorageFactory};
use crate::torrent::{self, TaskDeps, TorrentHandle, TorrentId, TorrentOrigin};
use crate::tracker::{Announcer, TrackerClient};
use bytes::Bytes;
use dashmap::DashMap;
use listener::Listener;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Running,
    /// Final.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What a torrent is created from.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    Magnet(String),
    /// Raw bencoded `.torrent` contents.
    TorrentFile(Bytes),
}

impl TorrentSource {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let data = tokio::fs::read(path).await?;
        Ok(TorrentSource::TorrentFile(Bytes::from(data)))
    }

    fn parse(&self) -> Result<TorrentOrigin, SessionError> {
        Ok(match self {
            TorrentSource::Magnet(uri) => TorrentOrigin::Magnet(MagnetLink::parse(uri)?),
            TorrentSource::TorrentFile(data) => TorrentOrigin::Metainfo(Metainfo::from_bytes(data)?),
        })
    }
}

struct Running {
    runtime: Handle,
    listen_addr: Option<SocketAddr>,
}

struct TorrentTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Session {
    config: Arc<SessionConfig>,
    peer_id: PeerId,
    announcer: Arc<dyn Announcer>,
    storage_factory: StorageFactory,
    state: Mutex<SessionState>,
    running: Mutex<Option<Running>>,
    torrents: Arc<DashMap<TorrentId, TorrentHandle>>,
    tasks: Mutex<HashMap<TorrentId, TorrentTask>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl Session {
    /// A session announcing through the built-in HTTP/UDP tracker client and
    /// storing data in files.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let announcer = Arc::new(TrackerClient::new()?);
        Ok(Self::with_collaborators(
            config,
            announcer,
            file_storage_factory(),
        ))
    }

    pub fn with_collaborators(
        config: SessionConfig,
        announcer: Arc<dyn Announcer>,
        storage_factory: StorageFactory,
    ) -> Self {
        let peer_id = PeerId::generate(&config.peer_id_prefix);
        Self {
            config: Arc::new(config),
            peer_id,
            announcer,
            storage_factory,
            state: Mutex::new(SessionState::Idle),
            running: Mutex::new(None),
            torrents: Arc::new(DashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Address of the inbound listener, when one is configured and running.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().and_then(|r| r.listen_addr)
    }

    /// Binds the inbound listener, if configured, and moves to `Running`.
    /// Torrents are spawned on the runtime this is called from.
    pub async fn start(&self) -> Result<(), SessionError> {
        match self.session_state() {
            SessionState::Stopped => return Err(SessionError::SessionStopped),
            SessionState::Running => return Ok(()),
            SessionState::Idle => {}
        }

        let listener_cancel = self.cancel.child_token();
        let listen_addr = match self.config.listen_port {
            Some(port) => {
                let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
                let addr = listener.local_addr()?;
                let listener = Listener {
                    listener,
                    torrents: Arc::clone(&self.torrents),
                    peer_id: self.peer_id,
                    handshake_timeout: self.config.handshake_timeout,
                    read_timeout: self.config.peer_read_timeout,
                };
                tokio::spawn(listener.run(listener_cancel.clone()));
                Some(addr)
            }
            None => None,
        };

        let mut state = self.state.lock();
        match *state {
            SessionState::Idle => {}
            SessionState::Running => {
                listener_cancel.cancel();
                return Ok(());
            }
            SessionState::Stopped => {
                listener_cancel.cancel();
                return Err(SessionError::SessionStopped);
            }
        }
        *self.running.lock() = Some(Running {
            runtime: Handle::current(),
            listen_addr,
        });
        *state = SessionState::Running;
        info!(peer_id = ?self.peer_id, ?listen_addr, "session started");
        Ok(())
    }

    /// Registers a torrent and starts resolving it. Metadata sources are
    /// validated here; a magnet becomes `Ready` once its info dictionary has
    /// been fetched from peers.
    pub fn create_torrent(
        &self,
        source: TorrentSource,
        storage_path: impl AsRef<Path>,
    ) -> Result<TorrentHandle, SessionError> {
        let state = self.state.lock();
        match *state {
            SessionState::Stopped => return Err(SessionError::SessionStopped),
            SessionState::Idle => return Err(SessionError::NotRunning),
            SessionState::Running => {}
        }

        let origin = source.parse()?;
        let info_hash = origin.info_hash();
        if let Some(existing) = self.torrents.iter().find(|t| t.info_hash() == info_hash) {
            return Err(SessionError::DuplicateTorrent(existing.id()));
        }

        let (runtime, listen_port) = {
            let running = self.running.lock();
            let running = running.as_ref().ok_or(SessionError::NotRunning)?;
            let port = running.listen_addr.map_or(0, |addr| addr.port());
            (running.runtime.clone(), port)
        };

        let id = TorrentId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let deps = TaskDeps {
            config: Arc::clone(&self.config),
            peer_id: self.peer_id,
            listen_port,
            announcer: Arc::clone(&self.announcer),
            storage_factory: Arc::clone(&self.storage_factory),
            storage_root: storage_path.as_ref().to_path_buf(),
        };
        let cancel = self.cancel.child_token();

        let (handle, join) = torrent::spawn(id, origin, deps, cancel.clone(), runtime);
        self.torrents.insert(id, handle.clone());
        self.tasks.lock().insert(id, TorrentTask { cancel, join });
        drop(state);

        info!(torrent = %id, %info_hash, name = %handle.name(), "torrent added");
        Ok(handle)
    }

    pub fn torrent(&self, id: TorrentId) -> Option<TorrentHandle> {
        self.torrents.get(&id).map(|t| t.value().clone())
    }

    pub fn torrents(&self) -> Vec<TorrentHandle> {
        let mut torrents: Vec<_> = self.torrents.iter().map(|t| t.value().clone()).collect();
        torrents.sort_by_key(|t| t.id());
        torrents
    }

    /// Stops the torrent's peers and trackers, flushes its storage and
    /// releases it. Streams reading from it fail with `StreamStopped`.
    ///
    /// Removing an already removed torrent is a no-op; only ids this session
    /// never issued are rejected.
    pub async fn remove_torrent(&self, id: TorrentId) -> Result<(), SessionError> {
        if id.0 >= self.next_id.load(Ordering::SeqCst) {
            return Err(SessionError::UnknownTorrent(id));
        }

        self.torrents.remove(&id);
        let Some(task) = self.tasks.lock().remove(&id) else {
            debug!(torrent = %id, "torrent already removed");
            return Ok(());
        };
        task.cancel.cancel();
        if let Err(e) = task.join.await {
            warn!(torrent = %id, error = %e, "torrent task ended abnormally");
        }
        info!(torrent = %id, "torrent removed");
        Ok(())
    }

    /// Stops every torrent and the listener. The session cannot be
    /// restarted.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Stopped {
                return;
            }
            *state = SessionState::Stopped;
        }
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        self.torrents.clear();
        let joins = tasks.into_iter().map(|(id, task)| async move {
            if let Err(e) = task.join.await {
                warn!(torrent = %id, error = %e, "torrent task ended abnormally");
            }
        });
        futures::future::join_all(joins).await;
        info!("session stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.session_state())
            .field("torrents", &self.torrents.len())
            .field("listen_addr", &self.listen_addr())
            .finish()
    }
}
