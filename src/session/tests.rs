use super::*;
use crate::events::TorrentEvent;
use crate::metainfo::InfoHash;
use crate::peer::{Handshake, PeerTransport};
use crate::storage::memory_storage_factory;
use crate::stream::StreamError;
use crate::testing::{content, single_file_torrent};
use crate::torrent::TorrentState;
use crate::tracker::{AnnounceRequest, AnnounceResponse, TrackerError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Accepts every announce and knows no peers.
struct QuietTracker;

#[async_trait]
impl Announcer for QuietTracker {
    async fn announce(
        &self,
        _url: &str,
        _request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        Ok(AnnounceResponse::new(1800))
    }
}

fn session(listen_port: Option<u16>, storage: StorageFactory) -> Session {
    let config = SessionConfig {
        listen_port,
        ..SessionConfig::default()
    };
    Session::with_collaborators(config, Arc::new(QuietTracker), storage)
}

async fn wait_for(handle: &TorrentHandle, state: TorrentState) {
    let mut rx = handle.watch_state();
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}, at {}", handle.state()))
        .unwrap();
}

#[tokio::test]
async fn test_lifecycle() {
    let session = session(None, memory_storage_factory());
    let torrent = Bytes::from(single_file_torrent("a.bin", 16384, &content(20000)));
    assert_eq!(session.session_state(), SessionState::Idle);
    assert!(matches!(
        session.create_torrent(TorrentSource::TorrentFile(torrent.clone()), "/tmp"),
        Err(SessionError::NotRunning)
    ));

    session.start().await.unwrap();
    session.start().await.unwrap();
    assert_eq!(session.session_state(), SessionState::Running);
    assert!(session.listen_addr().is_none());

    let handle = session
        .create_torrent(TorrentSource::TorrentFile(torrent.clone()), "/tmp")
        .unwrap();
    assert_eq!(session.torrent(handle.id()).unwrap().info_hash(), handle.info_hash());
    assert!(matches!(
        session.create_torrent(TorrentSource::TorrentFile(torrent.clone()), "/tmp"),
        Err(SessionError::DuplicateTorrent(id)) if id == handle.id()
    ));

    session.shutdown().await;
    assert_eq!(session.session_state(), SessionState::Stopped);
    assert!(session.torrents().is_empty());
    assert!(matches!(
        session.create_torrent(TorrentSource::TorrentFile(torrent), "/tmp"),
        Err(SessionError::SessionStopped)
    ));
    assert!(matches!(session.start().await, Err(SessionError::SessionStopped)));
    session.shutdown().await;
}

#[tokio::test]
async fn test_invalid_sources() {
    let session = session(None, memory_storage_factory());
    session.start().await.unwrap();

    assert!(matches!(
        session.create_torrent(TorrentSource::TorrentFile(Bytes::from_static(b"d4:infoi1ee")), "/tmp"),
        Err(SessionError::InvalidMetadata(_))
    ));
    assert!(matches!(
        session.create_torrent(TorrentSource::Magnet("magnet:?dn=nothing".into()), "/tmp"),
        Err(SessionError::InvalidMetadata(_))
    ));
    assert!(session.torrents().is_empty());
}

#[tokio::test]
async fn test_torrent_source_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let raw = single_file_torrent("a.bin", 16384, &content(1000));
    let path = dir.path().join("a.torrent");
    std::fs::write(&path, &raw).unwrap();

    match TorrentSource::from_file(&path).await.unwrap() {
        TorrentSource::TorrentFile(data) => assert_eq!(data, raw),
        other => panic!("unexpected source {other:?}"),
    }
    assert!(matches!(
        TorrentSource::from_file(dir.path().join("missing.torrent")).await,
        Err(SessionError::Io(_))
    ));
}

#[tokio::test]
async fn test_remove_torrent_is_idempotent() {
    let session = session(None, memory_storage_factory());
    session.start().await.unwrap();
    let raw = Bytes::from(single_file_torrent("a.bin", 16384, &content(50000)));
    let handle = session
        .create_torrent(TorrentSource::TorrentFile(raw), "/tmp")
        .unwrap();

    session.remove_torrent(handle.id()).await.unwrap();
    session.remove_torrent(handle.id()).await.unwrap();
    assert!(session.torrent(handle.id()).is_none());
    assert!(matches!(
        session.remove_torrent(TorrentId(99)).await,
        Err(SessionError::UnknownTorrent(TorrentId(99)))
    ));
}

#[tokio::test]
async fn test_remove_releases_pending_read() {
    let session = session(None, memory_storage_factory());
    session.start().await.unwrap();
    let raw = Bytes::from(single_file_torrent("movie.mp4", 16384, &content(100_000)));
    let handle = session
        .create_torrent(TorrentSource::TorrentFile(raw), "/tmp")
        .unwrap();
    wait_for(&handle, TorrentState::Starting).await;

    let stream = handle.stream(None).unwrap();
    stream.open();
    let reader = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.read_at(0, 1000, Some(Duration::from_secs(30))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished());

    session.remove_torrent(handle.id()).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StreamError::StreamStopped)));
}

#[tokio::test]
async fn test_unknown_info_hash_is_closed() {
    let session = session(Some(0), memory_storage_factory());
    session.start().await.unwrap();
    let port = session.listen_addr().unwrap().port();

    let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut transport = PeerTransport::new(socket, Duration::from_secs(5));
    transport
        .send_handshake(&Handshake::new(
            InfoHash([7; 20]),
            PeerId::generate("-XX0001-"),
        ))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), transport.receive_handshake())
        .await
        .unwrap();
    assert!(reply.is_err());
}

#[tokio::test]
async fn test_leecher_streams_from_seeder() {
    let data = content(100_000);
    let raw = Bytes::from(single_file_torrent("movie.mp4", 16384, &data));

    let seed_dir = tempfile::tempdir().unwrap();
    std::fs::write(seed_dir.path().join("movie.mp4"), &data).unwrap();
    let seeder = session(Some(0), file_storage_factory());
    seeder.start().await.unwrap();
    let seeded = seeder
        .create_torrent(TorrentSource::TorrentFile(raw.clone()), seed_dir.path())
        .unwrap();
    wait_for(&seeded, TorrentState::Completed).await;
    let seed_addr = SocketAddr::from(([127, 0, 0, 1], seeder.listen_addr().unwrap().port()));

    let leecher = session(None, memory_storage_factory());
    leecher.start().await.unwrap();
    let leeching = leecher
        .create_torrent(TorrentSource::TorrentFile(raw), "/unused")
        .unwrap();
    wait_for(&leeching, TorrentState::Starting).await;
    assert_ne!(leecher.peer_id(), seeder.peer_id());

    let stream = leeching.stream(None).unwrap();
    stream.open();
    leeching.add_peer(seed_addr).unwrap();

    let head = stream
        .read_at(40_000, 1000, Some(Duration::from_secs(20)))
        .await
        .unwrap();
    assert_eq!(&head[..], &data[40_000..41_000]);

    wait_for(&leeching, TorrentState::Completed).await;
    let all = stream.read_at(0, data.len(), None).await.unwrap();
    assert_eq!(&all[..], &data[..]);
    assert_eq!(leeching.status().progress, 1.0);

    leecher.shutdown().await;
    seeder.shutdown().await;
}

#[tokio::test]
async fn test_magnet_resolves_metadata_from_seeder() {
    let data = content(100_000);
    let raw = Bytes::from(single_file_torrent("movie.mp4", 16384, &data));
    let info_hash = Metainfo::from_bytes(&raw).unwrap().info_hash;

    let seed_dir = tempfile::tempdir().unwrap();
    std::fs::write(seed_dir.path().join("movie.mp4"), &data).unwrap();
    let seeder = session(Some(0), file_storage_factory());
    seeder.start().await.unwrap();
    let seeded = seeder
        .create_torrent(TorrentSource::TorrentFile(raw), seed_dir.path())
        .unwrap();
    wait_for(&seeded, TorrentState::Completed).await;
    let seed_addr = SocketAddr::from(([127, 0, 0, 1], seeder.listen_addr().unwrap().port()));

    let magnet = MagnetLink {
        info_hash,
        display_name: Some("pending".into()),
        trackers: Vec::new(),
        peers: vec![seed_addr],
        selected_files: Vec::new(),
    };
    let leecher = session(None, memory_storage_factory());
    leecher.start().await.unwrap();
    let leeching = leecher
        .create_torrent(TorrentSource::Magnet(magnet.to_uri()), "/unused")
        .unwrap();
    let mut events = leeching.subscribe();
    assert_eq!(leeching.name(), "pending");
    assert_eq!(leeching.info_hash(), info_hash);

    wait_for(&leeching, TorrentState::Completed).await;
    assert_eq!(leeching.name(), "movie.mp4");
    assert_eq!(leeching.files().unwrap()[0].length, 100_000);

    let mut resolved = false;
    while let Ok(event) = events.try_recv() {
        resolved |= event == TorrentEvent::MetadataResolved { id: leeching.id() };
    }
    assert!(resolved);

    let stream = leeching.stream(None).unwrap();
    let all = stream.read_at(0, data.len(), None).await.unwrap();
    assert_eq!(&all[..], &data[..]);

    leecher.shutdown().await;
    seeder.shutdown().await;
}
