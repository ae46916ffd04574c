//! Fixtures shared by the unit tests.

use crate::bencode::{encode, Value};
use crate::config::StreamConfig;
use crate::metainfo::Metainfo;
use crate::piece_map::PieceMap;
use crate::storage::MemoryStorage;
use crate::torrent::{Command, TorrentContext, TorrentId, TorrentShared, TorrentState};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Deterministic, non-repeating content so misplaced bytes show up in asserts.
pub fn content(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn piece_hashes(data: &[u8], piece_length: usize) -> Value {
    let hashes: Vec<u8> = data
        .chunks(piece_length)
        .flat_map(|chunk| <[u8; 20]>::from(Sha1::digest(chunk)))
        .collect();
    Value::Bytes(Bytes::from(hashes))
}

pub fn single_file_info(name: &str, piece_length: usize, data: &[u8]) -> Value {
    Value::dict([
        ("name", Value::string(name)),
        ("length", Value::Integer(data.len() as i64)),
        ("piece length", Value::Integer(piece_length as i64)),
        ("pieces", piece_hashes(data, piece_length)),
    ])
}

/// Bencoded `.torrent` for a single file holding `data`.
pub fn single_file_torrent(name: &str, piece_length: usize, data: &[u8]) -> Vec<u8> {
    encode(&Value::dict([
        ("announce", Value::string("http://tracker.invalid/announce")),
        ("info", single_file_info(name, piece_length, data)),
    ]))
}

/// Bencoded `.torrent` with one entry per `(path, contents)`.
pub fn multi_file_torrent(name: &str, piece_length: usize, files: &[(&str, &[u8])]) -> Vec<u8> {
    let joined: Vec<u8> = files.iter().flat_map(|(_, data)| data.iter().copied()).collect();
    let entries = files
        .iter()
        .map(|(path, data)| {
            Value::dict([
                ("length", Value::Integer(data.len() as i64)),
                (
                    "path",
                    Value::List(path.split('/').map(Value::string).collect()),
                ),
            ])
        })
        .collect::<Vec<_>>();

    encode(&Value::dict([(
        "info",
        Value::dict([
            ("name", Value::string(name)),
            ("files", Value::List(entries)),
            ("piece length", Value::Integer(piece_length as i64)),
            ("pieces", piece_hashes(&joined, piece_length)),
        ]),
    )]))
}

/// A torrent over `data` with metadata and memory storage in place, in
/// `Ready`, and no task running. Tests drive the piece map directly.
pub(crate) fn torrent_fixture(
    name: &str,
    piece_length: usize,
    data: &[u8],
    stream_config: StreamConfig,
) -> (Arc<TorrentShared>, Arc<TorrentContext>) {
    let (shared, context, _commands) =
        torrent_fixture_with_commands(name, piece_length, data, stream_config);
    (shared, context)
}

/// Like [`torrent_fixture`], also handing out what would reach the task.
pub(crate) fn torrent_fixture_with_commands(
    name: &str,
    piece_length: usize,
    data: &[u8],
    stream_config: StreamConfig,
) -> (
    Arc<TorrentShared>,
    Arc<TorrentContext>,
    mpsc::UnboundedReceiver<Command>,
) {
    let metainfo =
        Metainfo::from_bytes(&single_file_torrent(name, piece_length, data)).expect("metainfo");
    let (shared, commands) = TorrentShared::new(
        TorrentId(1),
        metainfo.info_hash,
        name.to_string(),
        stream_config,
        CancellationToken::new(),
        Handle::current(),
    );
    let context = Arc::new(TorrentContext {
        piece_map: Arc::new(PieceMap::new(metainfo.info.piece_count())),
        storage: Arc::new(MemoryStorage::new(metainfo.info.total_length)),
        metainfo,
    });
    shared.set_context(Arc::clone(&context));
    assert!(shared.set_state(TorrentState::Ready));
    (shared, context, commands)
}

/// Writes `piece` from `data` and marks it verified, as the torrent task would.
pub(crate) async fn complete_piece(ctx: &TorrentContext, data: &[u8], piece: u32) {
    let info = &ctx.metainfo.info;
    let start = info.piece_offset(piece) as usize;
    let end = start + info.piece_size(piece) as usize;
    ctx.storage
        .write(start as u64, &data[start..end])
        .await
        .expect("write");
    ctx.piece_map.mark_requested(piece).expect("requested");
    ctx.piece_map.mark_verified(piece).expect("verified");
}

pub(crate) async fn complete_all(ctx: &TorrentContext, data: &[u8]) {
    for piece in 0..ctx.metainfo.info.piece_count() {
        complete_piece(ctx, data, piece).await;
    }
}
