use super::*;
use crate::metainfo::Metainfo;
use crate::testing::{content, multi_file_torrent, single_file_torrent};
use tempfile::TempDir;

fn info_of(torrent: &[u8]) -> TorrentInfo {
    Metainfo::from_bytes(torrent).unwrap().info
}

#[tokio::test]
async fn test_allocate_creates_files_at_full_length() {
    let temp = TempDir::new().unwrap();
    let data = content(40_000);
    let info = info_of(&single_file_torrent("movie.mkv", 16384, &data));
    let storage = FileStorage::new(temp.path(), &info).unwrap();

    assert!(!storage.allocate().await.unwrap());
    let meta = tokio::fs::metadata(temp.path().join("movie.mkv")).await.unwrap();
    assert_eq!(meta.len(), 40_000);

    // A second allocation finds the existing file.
    let again = FileStorage::new(temp.path(), &info).unwrap();
    assert!(again.allocate().await.unwrap());
}

#[tokio::test]
async fn test_write_and_read_across_file_boundary() {
    let temp = TempDir::new().unwrap();
    let a = content(10_000);
    let b = content(7_000);
    let info = info_of(&multi_file_torrent(
        "show",
        16384,
        &[("a.bin", &a), ("sub/b.bin", &b)],
    ));
    let storage = FileStorage::new(temp.path(), &info).unwrap();
    storage.allocate().await.unwrap();

    let joined: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
    storage.write(0, &joined[..16384]).await.unwrap();
    storage.write(16384, &joined[16384..]).await.unwrap();
    storage.flush().await.unwrap();

    let span = storage.read(9_000, 2_000).await.unwrap();
    assert_eq!(span.as_ref(), &joined[9_000..11_000]);

    let on_disk = tokio::fs::read(temp.path().join("show/sub/b.bin")).await.unwrap();
    assert_eq!(on_disk, b);
}

#[tokio::test]
async fn test_out_of_bounds_is_rejected() {
    let temp = TempDir::new().unwrap();
    let info = info_of(&single_file_torrent("f.bin", 16384, &content(20_000)));
    let storage = FileStorage::new(temp.path(), &info).unwrap();
    storage.allocate().await.unwrap();

    assert!(matches!(
        storage.read(19_000, 2_000).await,
        Err(StorageError::OutOfBounds { total: 20_000, .. })
    ));
    assert!(storage.write(20_000, b"x").await.is_err());
}

#[test]
fn test_path_traversal_is_rejected() {
    let temp = TempDir::new().unwrap();
    let mut info = info_of(&single_file_torrent("f.bin", 16384, &content(100)));
    info.files[0].path = "../escape.bin".into();

    assert!(matches!(
        FileStorage::new(temp.path(), &info),
        Err(StorageError::PathTraversal(_))
    ));
}

#[tokio::test]
async fn test_memory_storage() {
    let storage = MemoryStorage::new(1000);
    assert!(!storage.allocate().await.unwrap());
    storage.write(990, b"0123456789").await.unwrap();
    assert_eq!(storage.read(995, 5).await.unwrap().as_ref(), b"56789");
    assert!(storage.write(995, b"0123456789").await.is_err());
}

#[tokio::test]
async fn test_verify_existing_finds_good_pieces() {
    let temp = TempDir::new().unwrap();
    let data = content(50_000);
    let info = info_of(&single_file_torrent("f.bin", 16384, &data));
    let storage = FileStorage::new(temp.path(), &info).unwrap();
    storage.allocate().await.unwrap();

    // Piece 0 and the short tail piece are correct, piece 1 is corrupt.
    storage.write(0, &data[..16384]).await.unwrap();
    storage.write(16384, &vec![0xAB; 16384]).await.unwrap();
    storage.write(49_152, &data[49_152..]).await.unwrap();

    let verified = verify_existing(&storage, &info).await.unwrap();
    assert_eq!(verified.iter().collect::<Vec<_>>(), vec![0, 3]);
}

#[tokio::test]
async fn test_hash_matches() {
    let data = content(1000);
    let info = info_of(&single_file_torrent("f.bin", 1000, &data));
    let expected = info.pieces[0];

    assert!(hash_matches(Bytes::from(data), expected).await.unwrap());
    assert!(!hash_matches(Bytes::from_static(b"other"), expected).await.unwrap());
}
