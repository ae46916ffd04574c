//! A single torrent: its lifecycle, its peers and its piece bookkeeping.
//!
//! Each torrent runs as one task ([`task::TorrentTask`]) that owns the
//! scheduler, the tracker schedule and the peer table, and is the only
//! writer of the piece map and of storage. Callers talk to it through a
//! [`TorrentHandle`]; peer workers talk to it through events.

mod error;
mod handle;
mod health;
mod metadata;
mod peer_worker;
mod peers;
mod state;
mod stats;
mod task;

#[cfg(test)]
mod tests;

pub use error::TorrentError;
pub use handle::TorrentHandle;
pub use health::Health;
pub use state::TorrentState;
pub use stats::TorrentStatus;

pub(crate) use handle::{Command, TorrentContext, TorrentShared};
pub(crate) use task::{TaskDeps, TorrentOrigin};

use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Identifier of a torrent within its session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentId(pub u64);

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creates the shared state of a torrent and spawns its task on `runtime`.
pub(crate) fn spawn(
    id: TorrentId,
    origin: TorrentOrigin,
    deps: TaskDeps,
    cancel: CancellationToken,
    runtime: Handle,
) -> (TorrentHandle, JoinHandle<()>) {
    let (shared, commands) = TorrentShared::new(
        id,
        origin.info_hash(),
        origin.display_name(),
        deps.config.stream.clone(),
        cancel,
        runtime.clone(),
    );
    let task = task::TorrentTask::new(Arc::clone(&shared), commands, deps);
    let join = runtime.spawn(task.run(origin));
    (TorrentHandle::new(shared), join)
}
