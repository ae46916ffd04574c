use super::*;
use crate::config::SessionConfig;
use crate::events::TorrentEvent;
use crate::metainfo::{InfoHash, MagnetLink, Metainfo};
use crate::peer::{Bitfield, BlockRef, Handshake, Message, PeerId, PeerTransport};
use crate::storage::{
    file_storage_factory, memory_storage_factory, Storage, StorageError, StorageFactory,
};
use crate::stream::StreamError;
use crate::testing::{content, single_file_torrent};
use crate::tracker::{AnnounceRequest, AnnounceResponse, Announcer, TrackerError, TrackerEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;

const PIECE: usize = 16384;

struct FakeAnnouncer {
    calls: Mutex<Vec<TrackerEvent>>,
    fail: bool,
}

impl FakeAnnouncer {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail,
        })
    }

    fn events(&self) -> Vec<TrackerEvent> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Announcer for FakeAnnouncer {
    async fn announce(
        &self,
        _url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        self.calls.lock().push(request.event);
        if self.fail {
            Err(TrackerError::Timeout)
        } else {
            Ok(AnnounceResponse::new(1800))
        }
    }
}

fn deps(
    announcer: Arc<FakeAnnouncer>,
    config: SessionConfig,
    storage_factory: StorageFactory,
    root: &Path,
) -> TaskDeps {
    TaskDeps {
        config: Arc::new(config),
        peer_id: PeerId::generate("-TS0001-"),
        listen_port: 6881,
        announcer,
        storage_factory,
        storage_root: root.to_path_buf(),
    }
}

fn origin(data: &[u8]) -> TorrentOrigin {
    let raw = single_file_torrent("movie.mp4", PIECE, data);
    TorrentOrigin::Metainfo(Metainfo::from_bytes(&raw).unwrap())
}

/// What a remote peer was sent.
#[derive(Default)]
struct RemoteLog {
    requests: Vec<BlockRef>,
    cancels: Vec<BlockRef>,
    interested: Vec<bool>,
}

impl RemoteLog {
    fn requested_pieces(&self) -> Vec<u32> {
        let mut pieces: Vec<u32> = self.requests.iter().map(|b| b.piece).collect();
        pieces.sort_unstable();
        pieces
    }
}

#[derive(Clone, Copy)]
enum Serving {
    /// Record requests and never answer them.
    Hold,
    /// Answer every request; the first answer for `corrupt` is damaged.
    Answer { corrupt: Option<u32> },
}

/// A plain BEP3 seed of `data` waiting for the torrent to connect.
async fn remote_seed(
    info_hash: InfoHash,
    data: Vec<u8>,
    serving: Serving,
) -> (SocketAddr, Arc<Mutex<RemoteLog>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(Mutex::new(RemoteLog::default()));
    let record = Arc::clone(&log);

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut transport = PeerTransport::new(socket, Duration::from_secs(30));
        transport.receive_handshake().await.unwrap();
        let ours = Handshake {
            info_hash,
            peer_id: PeerId::generate("-RS0001-"),
            reserved: [0; 8],
        };
        transport.send_handshake(&ours).await.unwrap();
        let pieces = data.len().div_ceil(PIECE);
        transport
            .send_message(&Message::Bitfield(Bitfield::full(pieces).to_bytes()))
            .await
            .unwrap();
        transport.send_message(&Message::Unchoke).await.unwrap();

        let mut corrupted = false;
        while let Ok(message) = transport.receive_message().await {
            match message {
                Message::Request(block) => {
                    record.lock().requests.push(block);
                    let Serving::Answer { corrupt } = serving else {
                        continue;
                    };
                    let start = block.piece as usize * PIECE + block.begin as usize;
                    let mut bytes = data[start..start + block.length as usize].to_vec();
                    if corrupt == Some(block.piece) && !corrupted {
                        corrupted = true;
                        bytes[0] ^= 0xff;
                    }
                    let reply = Message::Piece {
                        piece: block.piece,
                        begin: block.begin,
                        data: Bytes::from(bytes),
                    };
                    if transport.send_message(&reply).await.is_err() {
                        break;
                    }
                }
                Message::Cancel(block) => record.lock().cancels.push(block),
                Message::Interested => record.lock().interested.push(true),
                Message::NotInterested => record.lock().interested.push(false),
                _ => {}
            }
        }
    });
    (addr, log)
}

async fn until(mut reached: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !reached() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Storage that refuses every write, like a full disk.
struct FullDisk;

#[async_trait]
impl Storage for FullDisk {
    async fn allocate(&self) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn read(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        Err(StorageError::OutOfBounds {
            offset,
            length: length as u64,
            total: 0,
        })
    }

    async fn write(&self, _offset: u64, _data: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::DiskFull)
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn full_disk_factory() -> StorageFactory {
    Arc::new(|_, _| Ok(Arc::new(FullDisk) as Arc<dyn Storage>))
}

async fn wait_for(handle: &TorrentHandle, state: TorrentState) {
    let mut rx = handle.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}, at {}", handle.state()))
        .unwrap();
}

#[tokio::test]
async fn test_auto_start_announces_and_publishes_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let announcer = FakeAnnouncer::new(false);
    let deps = deps(
        announcer.clone(),
        SessionConfig::default(),
        memory_storage_factory(),
        dir.path(),
    );
    let (handle, _join) = spawn(
        TorrentId(1),
        origin(&content(65536)),
        deps,
        CancellationToken::new(),
        Handle::current(),
    );
    let mut events = handle.subscribe();

    wait_for(&handle, TorrentState::Starting).await;
    assert_eq!(handle.name(), "movie.mp4");
    assert_eq!(handle.files().unwrap().len(), 1);

    let first = events.recv().await.unwrap();
    assert_eq!(
        first,
        TorrentEvent::StateChanged {
            id: TorrentId(1),
            old: TorrentState::Creating,
            new: TorrentState::Ready,
        }
    );
    let second = events.recv().await.unwrap();
    assert!(matches!(
        second,
        TorrentEvent::StateChanged {
            new: TorrentState::Starting,
            ..
        }
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(announcer.events(), vec![TrackerEvent::Started]);
}

#[tokio::test]
async fn test_manual_start_and_rejected_requests() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        auto_start: false,
        ..SessionConfig::default()
    };
    let deps = deps(FakeAnnouncer::new(false), config, memory_storage_factory(), dir.path());
    let (handle, _join) = spawn(
        TorrentId(2),
        origin(&content(32768)),
        deps,
        CancellationToken::new(),
        Handle::current(),
    );

    wait_for(&handle, TorrentState::Ready).await;
    assert!(matches!(
        handle.pause(),
        Err(TorrentError::InvalidTorrentState(TorrentState::Ready))
    ));
    assert!(matches!(
        handle.resume(),
        Err(TorrentError::InvalidTorrentState(TorrentState::Ready))
    ));

    handle.start().unwrap();
    wait_for(&handle, TorrentState::Starting).await;
    assert!(handle.start().is_err());
}

#[tokio::test]
async fn test_existing_complete_data_goes_straight_to_completed() {
    let dir = tempfile::tempdir().unwrap();
    let data = content(40000);
    std::fs::write(dir.path().join("movie.mp4"), &data).unwrap();

    let deps = deps(
        FakeAnnouncer::new(false),
        SessionConfig::default(),
        file_storage_factory(),
        dir.path(),
    );
    let (handle, _join) = spawn(
        TorrentId(3),
        origin(&data),
        deps,
        CancellationToken::new(),
        Handle::current(),
    );

    wait_for(&handle, TorrentState::Completed).await;
    let status = handle.status();
    assert_eq!(status.verified_pieces, 3);
    assert_eq!(status.total_pieces, 3);
    assert_eq!(status.progress, 1.0);
}

#[tokio::test]
async fn test_exhausted_trackers_fail_the_torrent() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        tracker_retry_attempts: 1,
        ..SessionConfig::default()
    };
    let deps = deps(FakeAnnouncer::new(true), config, memory_storage_factory(), dir.path());
    let (handle, _join) = spawn(
        TorrentId(4),
        origin(&content(16384)),
        deps,
        CancellationToken::new(),
        Handle::current(),
    );

    wait_for(&handle, TorrentState::Error).await;
    assert!(matches!(
        handle.stream(None),
        Err(StreamError::InvalidTorrentState(TorrentState::Error))
    ));
    assert!(handle.add_peer("127.0.0.1:1".parse().unwrap()).is_err());
}

#[tokio::test]
async fn test_cancel_sends_stopped_announce() {
    let dir = tempfile::tempdir().unwrap();
    let announcer = FakeAnnouncer::new(false);
    let cancel = CancellationToken::new();
    let deps = deps(
        announcer.clone(),
        SessionConfig::default(),
        memory_storage_factory(),
        dir.path(),
    );
    let (handle, join) = spawn(
        TorrentId(5),
        origin(&content(16384)),
        deps,
        cancel.clone(),
        Handle::current(),
    );

    wait_for(&handle, TorrentState::Starting).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while announcer.events().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    join.await.unwrap();
    assert_eq!(
        announcer.events(),
        vec![TrackerEvent::Started, TrackerEvent::Stopped]
    );
}

#[tokio::test]
async fn test_magnet_has_no_content_until_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let link = MagnetLink::parse(
        "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Big+Movie",
    )
    .unwrap();
    let deps = deps(
        FakeAnnouncer::new(false),
        SessionConfig::default(),
        memory_storage_factory(),
        dir.path(),
    );
    let (handle, _join) = spawn(
        TorrentId(6),
        TorrentOrigin::Magnet(link),
        deps,
        CancellationToken::new(),
        Handle::current(),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), TorrentState::Creating);
    assert_eq!(handle.name(), "Big Movie");
    assert!(matches!(
        handle.files(),
        Err(TorrentError::InvalidTorrentState(TorrentState::Creating))
    ));
    assert!(matches!(
        handle.stream(None),
        Err(StreamError::InvalidTorrentState(TorrentState::Creating))
    ));
    assert_eq!(handle.health(), Health::Unknown);
}

#[tokio::test]
async fn test_pause_cancels_requests_and_resume_reschedules() {
    let dir = tempfile::tempdir().unwrap();
    let data = content(4 * PIECE);
    let origin = origin(&data);
    let (addr, log) = remote_seed(origin.info_hash(), data.clone(), Serving::Hold).await;
    let deps = deps(
        FakeAnnouncer::new(false),
        SessionConfig::default(),
        memory_storage_factory(),
        dir.path(),
    );
    let (handle, _join) = spawn(
        TorrentId(7),
        origin,
        deps,
        CancellationToken::new(),
        Handle::current(),
    );

    wait_for(&handle, TorrentState::Starting).await;
    handle.add_peer(addr).unwrap();
    wait_for(&handle, TorrentState::Downloading).await;
    until(|| log.lock().requests.len() == 4).await;
    assert_eq!(log.lock().requested_pieces(), vec![0, 1, 2, 3]);

    handle.pause().unwrap();
    wait_for(&handle, TorrentState::Paused).await;
    until(|| log.lock().cancels.len() == 4).await;
    until(|| log.lock().interested.last() == Some(&false)).await;
    {
        let log = log.lock();
        let mut cancelled = log.cancels.clone();
        cancelled.sort_by_key(|b| b.piece);
        assert_eq!(cancelled, log.requests);
    }
    assert!(matches!(
        handle.pause(),
        Err(TorrentError::InvalidTorrentState(TorrentState::Paused))
    ));

    log.lock().requests.clear();
    handle.resume().unwrap();
    wait_for(&handle, TorrentState::Downloading).await;
    until(|| log.lock().requests.len() == 4).await;
    assert_eq!(log.lock().requested_pieces(), vec![0, 1, 2, 3]);
    assert_eq!(log.lock().interested.last(), Some(&true));
}

#[tokio::test]
async fn test_failed_write_moves_torrent_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let data = content(2 * PIECE);
    let origin = origin(&data);
    let serving = Serving::Answer { corrupt: None };
    let (addr, log) = remote_seed(origin.info_hash(), data, serving).await;
    let deps = deps(
        FakeAnnouncer::new(false),
        SessionConfig::default(),
        full_disk_factory(),
        dir.path(),
    );
    let (handle, _join) = spawn(
        TorrentId(8),
        origin,
        deps,
        CancellationToken::new(),
        Handle::current(),
    );

    wait_for(&handle, TorrentState::Starting).await;
    handle.add_peer(addr).unwrap();
    wait_for(&handle, TorrentState::Error).await;
    assert!(!log.lock().requests.is_empty());
    assert_eq!(handle.status().verified_pieces, 0);
    assert!(matches!(
        handle.stream(None),
        Err(StreamError::InvalidTorrentState(TorrentState::Error))
    ));
}

#[tokio::test]
async fn test_corrupt_piece_is_requested_again() {
    let dir = tempfile::tempdir().unwrap();
    let data = content(3 * PIECE + 100);
    let origin = origin(&data);
    let serving = Serving::Answer { corrupt: Some(1) };
    let (addr, log) = remote_seed(origin.info_hash(), data.clone(), serving).await;
    let deps = deps(
        FakeAnnouncer::new(false),
        SessionConfig::default(),
        memory_storage_factory(),
        dir.path(),
    );
    let (handle, _join) = spawn(
        TorrentId(9),
        origin,
        deps,
        CancellationToken::new(),
        Handle::current(),
    );
    let mut events = handle.subscribe();

    wait_for(&handle, TorrentState::Starting).await;
    handle.add_peer(addr).unwrap();
    wait_for(&handle, TorrentState::Completed).await;

    assert_eq!(log.lock().requested_pieces(), vec![0, 1, 1, 2, 3]);
    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TorrentEvent::PieceCompleted { piece, .. } = event {
            completed.push(piece);
        }
    }
    completed.sort_unstable();
    assert_eq!(completed, vec![0, 1, 2, 3]);

    let stream = handle.stream(None).unwrap();
    let read = stream.read_at(0, data.len(), None).await.unwrap();
    assert_eq!(&read[..], &data[..]);
}
