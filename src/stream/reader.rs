use super::{StreamError, TorrentStream};
use bytes::Bytes;
use futures::Stream;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use tokio::runtime::Handle;

impl TorrentStream {
    /// The bytes of `range`, clamped to the file, as a stream of chunks.
    ///
    /// Each chunk is one [`read_at`](TorrentStream::read_at) with the default
    /// timeout, so the stream ends early with an error if data stops
    /// arriving.
    pub fn reader(
        &self,
        range: Range<u64>,
    ) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
        let stream = self.clone();
        let end = range.end.min(self.len());
        let chunk = self.chunk_size() as u64;

        futures::stream::try_unfold(range.start, move |position| {
            let stream = stream.clone();
            async move {
                if position >= end {
                    return Ok(None);
                }
                let length = (end - position).min(chunk) as usize;
                let data = stream.read_at(position, length, None).await?;
                if data.is_empty() {
                    return Ok(None);
                }
                let next = position + data.len() as u64;
                Ok(Some((data, next)))
            }
        })
    }

    /// A synchronous `Read + Seek` view for callers outside async code.
    ///
    /// Reads are driven on the torrent's runtime, so the reader may be used
    /// from any thread that is not itself running async tasks.
    pub fn blocking_reader(&self) -> BlockingReader {
        BlockingReader {
            stream: self.clone(),
            handle: self.inner.shared.runtime.clone(),
            position: 0,
        }
    }
}

pub struct BlockingReader {
    stream: TorrentStream,
    handle: Handle,
    position: u64,
}

impl BlockingReader {
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for BlockingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.stream.len() {
            return Ok(0);
        }
        let length = buf.len().min(self.stream.chunk_size());
        let data = self
            .handle
            .block_on(self.stream.read_at(self.position, length, None))?;

        buf[..data.len()].copy_from_slice(&data);
        self.position += data.len() as u64;
        Ok(data.len())
    }
}

impl Seek for BlockingReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.stream.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;

        if target < self.stream.len() && target != self.position {
            self.stream.seek(target)?;
        }
        self.position = target;
        Ok(target)
    }
}
