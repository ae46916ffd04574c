use super::error::StorageError;
use super::Storage;
use crate::metainfo::{FileEntry, TorrentInfo};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

/// A piece of a byte range that falls inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSpan {
    file_index: usize,
    file_offset: u64,
    length: u64,
}

/// Torrent content laid out as the files of the metainfo under `root`.
///
/// Handles are opened once, read-write, and cached per file; a handle's
/// mutex serialises the seek+transfer pairs issued against it.
pub struct FileStorage {
    root: PathBuf,
    files: Vec<FileEntry>,
    total_length: u64,
    handles: DashMap<usize, Arc<TokioMutex<File>>>,
}

impl FileStorage {
    pub fn new(root: &Path, info: &TorrentInfo) -> Result<Self, StorageError> {
        for file in &info.files {
            let escapes = file
                .path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if escapes {
                return Err(StorageError::PathTraversal(file.path.display().to_string()));
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            files: info.files.clone(),
            total_length: info.total_length,
            handles: DashMap::new(),
        })
    }

    fn path_of(&self, file_index: usize) -> PathBuf {
        self.root.join(&self.files[file_index].path)
    }

    fn spans(&self, offset: u64, length: u64) -> Result<Vec<FileSpan>, StorageError> {
        if offset + length > self.total_length {
            return Err(StorageError::OutOfBounds {
                offset,
                length,
                total: self.total_length,
            });
        }

        let end = offset + length;
        Ok(self
            .files
            .iter()
            .filter(|f| f.length > 0 && f.offset < end && f.end() > offset)
            .map(|f| {
                let start = offset.max(f.offset);
                FileSpan {
                    file_index: f.index,
                    file_offset: start - f.offset,
                    length: end.min(f.end()) - start,
                }
            })
            .collect())
    }

    async fn handle(&self, file_index: usize) -> Result<Arc<TokioMutex<File>>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            return Ok(handle.clone());
        }

        let path = self.path_of(file_index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(StorageError::from_io)?;

        let handle = self
            .handles
            .entry(file_index)
            .or_insert_with(|| Arc::new(TokioMutex::new(file)))
            .clone();
        Ok(handle)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn allocate(&self) -> Result<bool, StorageError> {
        let mut existing = false;
        for file in &self.files {
            let path = self.path_of(file.index);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                existing |= meta.len() > 0;
            }
            let handle = self.handle(file.index).await?;
            let f = handle.lock().await;
            if f.metadata().await?.len() != file.length {
                f.set_len(file.length).await.map_err(StorageError::from_io)?;
            }
        }
        debug!(root = %self.root.display(), existing, "storage allocated");
        Ok(existing)
    }

    async fn read(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        let mut out = BytesMut::with_capacity(length);
        for span in self.spans(offset, length as u64)? {
            let handle = self.handle(span.file_index).await?;
            let mut file = handle.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let start = out.len();
            out.resize(start + span.length as usize, 0);
            file.read_exact(&mut out[start..]).await?;
        }
        Ok(out.freeze())
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut cursor = 0usize;
        for span in self.spans(offset, data.len() as u64)? {
            let handle = self.handle(span.file_index).await?;
            let mut file = handle.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let chunk = &data[cursor..cursor + span.length as usize];
            file.write_all(chunk).await.map_err(StorageError::from_io)?;
            cursor += chunk.len();
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let handles: Vec<_> = self.handles.iter().map(|h| h.value().clone()).collect();
        for handle in handles {
            let mut file = handle.lock().await;
            file.flush().await?;
            file.sync_data().await.map_err(StorageError::from_io)?;
        }
        Ok(())
    }
}
