/// Collaborators at the edges of the protocol: where chunks come from and
/// where they end up.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use crate::error::SinkError;

/// Pull-based producer of chunks.
pub trait ChunkSource: Send + 'static {
    /// Next chunk in sequence, or `None` once the source is exhausted.
    fn next_chunk(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Streaming write target.
pub trait ChunkSink: Send {
    /// Accept one chunk. [`SinkError::Busy`] means "not now": the caller keeps
    /// the chunk and retries later.
    fn write(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Flush and release the target. Idempotent; returns once the data is durable.
    fn close(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Reads a local file in fixed-size chunks.
pub struct FileSource {
    file: File,
    chunk_size: usize,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path.as_ref()).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1),
            len,
        })
    }

    /// File size at open time.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ChunkSource for FileSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }
}

/// Source over chunks already in memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    chunks: VecDeque<Bytes>,
}

impl MemorySource {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }
}

impl ChunkSource for MemorySource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// Buffered writer to a local file.
pub struct FileSink {
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl FileSink {
    /// Create (or truncate) the file, creating parent directories as needed.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(path).await?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl ChunkSink for FileSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            SinkError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "sink already closed"))
        })?;
        writer.write_all(&chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
        }
        Ok(())
    }
}

/// Keeps every received chunk so the data can be retrieved after the transfer.
#[derive(Debug, Default)]
pub struct MemorySink {
    chunks: Vec<Bytes>,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// All received bytes, concatenated in arrival order.
    pub fn concat(&self) -> Vec<u8> {
        let total = self.chunks.iter().map(Bytes::len).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ChunkSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sink already closed",
            )));
        }
        self.chunks.push(chunk);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.closed = true;
        Ok(())
    }
}
