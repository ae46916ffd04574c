use std::fmt;

/// Lifecycle of a torrent.
///
/// ```text
/// Creating -> Ready -> Starting -> Downloading -> Completed
///                                      ^  |
///                                      |  v
///                                     Paused
/// ```
///
/// Any state but `Completed` and `Error` may move to `Error`, which is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TorrentState {
    /// Waiting for metadata and storage.
    Creating,
    Ready,
    Starting,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl TorrentState {
    pub fn can_transition_to(self, next: TorrentState) -> bool {
        use TorrentState::*;
        matches!(
            (self, next),
            (Creating, Ready)
                | (Ready, Starting)
                | (Starting, Downloading)
                | (Downloading, Paused)
                | (Paused, Downloading)
                | (Downloading, Completed)
        ) || (next == Error && !matches!(self, Completed | Error))
    }

    /// Metadata and storage exist: the torrent can be streamed.
    pub fn has_content(self) -> bool {
        !matches!(self, TorrentState::Creating | TorrentState::Error)
    }

    pub fn is_terminal(self) -> bool {
        self == TorrentState::Error
    }
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TorrentState::Creating => "creating",
            TorrentState::Ready => "ready",
            TorrentState::Starting => "starting",
            TorrentState::Downloading => "downloading",
            TorrentState::Paused => "paused",
            TorrentState::Completed => "completed",
            TorrentState::Error => "error",
        };
        f.write_str(name)
    }
}
