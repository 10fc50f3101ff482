//! Memory-or-tempfile spool buffers.
//!
//! Payloads have to be buffered somewhere while they are hashed, compared
//! against the pool and possibly re-uploaded. Small payloads stay in
//! memory; anything past the threshold spills to an anonymous temp file so
//! memory stays bounded regardless of object size.

use crate::error::{ProxyError, ProxyResult};
use bytes::Bytes;
use futures::StreamExt;
use silo_core::SPOOL_MEMORY_LIMIT;
use silo_storage::ByteStream;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tokio::io::AsyncWriteExt;

/// Read chunk size when replaying a file-backed spool.
const REPLAY_CHUNK_SIZE: usize = 64 * 1024;

enum SpoolInner {
    Memory(Vec<u8>),
    File(std::fs::File),
}

/// A fully buffered payload, in memory or in an anonymous temp file.
pub struct Spool {
    inner: SpoolInner,
    len: u64,
}

impl Spool {
    /// Drain a byte stream into a spool.
    pub async fn from_stream(mut stream: ByteStream) -> ProxyResult<Spool> {
        let mut memory: Vec<u8> = Vec::new();
        let mut file: Option<tokio::fs::File> = None;
        let mut len = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            len += chunk.len() as u64;
            if let Some(ref mut f) = file {
                f.write_all(&chunk).await?;
            } else {
                memory.extend_from_slice(&chunk);
                if memory.len() > SPOOL_MEMORY_LIMIT {
                    let mut f = tokio::fs::File::from_std(tempfile::tempfile()?);
                    f.write_all(&memory).await?;
                    memory = Vec::new();
                    file = Some(f);
                }
            }
        }

        let inner = match file {
            Some(mut f) => {
                f.flush().await?;
                SpoolInner::File(f.into_std().await)
            }
            None => SpoolInner::Memory(memory),
        };
        Ok(Spool { inner, len })
    }

    /// Build a spool from a complete in-memory payload.
    pub fn from_bytes(data: Bytes) -> Spool {
        Spool {
            len: data.len() as u64,
            inner: SpoolInner::Memory(data.to_vec()),
        }
    }

    /// Buffered length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consume the spool as a blocking reader positioned at the start.
    pub fn into_sync_reader(self) -> io::Result<Box<dyn Read + Send>> {
        match self.inner {
            SpoolInner::Memory(data) => Ok(Box::new(io::Cursor::new(data))),
            SpoolInner::File(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                Ok(Box::new(file))
            }
        }
    }

    /// Consume the spool as a byte stream positioned at the start.
    pub fn into_stream(self) -> ProxyResult<ByteStream> {
        match self.inner {
            SpoolInner::Memory(data) => {
                let stream = futures::stream::iter(if data.is_empty() {
                    Vec::new()
                } else {
                    vec![Ok(Bytes::from(data))]
                });
                Ok(Box::pin(stream))
            }
            SpoolInner::File(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                let file = tokio::fs::File::from_std(file);
                let stream = async_stream::try_stream! {
                    use tokio::io::AsyncReadExt;
                    let mut file = file;
                    let mut buf = vec![0u8; REPLAY_CHUNK_SIZE];
                    loop {
                        let n = file.read(&mut buf).await.map_err(silo_storage::StorageError::Io)?;
                        if n == 0 {
                            break;
                        }
                        yield Bytes::copy_from_slice(&buf[..n]);
                    }
                };
                Ok(Box::pin(stream))
            }
        }
    }
}

/// Blocking [`Write`] implementation that fills a [`Spool`], spilling to a
/// temp file past the memory threshold. Used from `spawn_blocking`.
pub struct SpoolWriter {
    memory: Vec<u8>,
    file: Option<std::fs::File>,
    len: u64,
}

impl SpoolWriter {
    pub fn new() -> Self {
        Self {
            memory: Vec::new(),
            file: None,
            len: 0,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish writing and turn the accumulated bytes into a [`Spool`].
    pub fn into_spool(mut self) -> io::Result<Spool> {
        self.flush()?;
        let inner = match self.file {
            Some(file) => SpoolInner::File(file),
            None => SpoolInner::Memory(self.memory),
        };
        Ok(Spool {
            inner,
            len: self.len,
        })
    }
}

impl Default for SpoolWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for SpoolWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.len += buf.len() as u64;
        if let Some(ref mut file) = self.file {
            file.write_all(buf)?;
        } else {
            self.memory.extend_from_slice(buf);
            if self.memory.len() > SPOOL_MEMORY_LIMIT {
                let mut file = tempfile::tempfile()?;
                file.write_all(&self.memory)?;
                self.memory = Vec::new();
                self.file = Some(file);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(ref mut file) = self.file {
            file.flush()?;
        }
        Ok(())
    }
}

/// Collect a stream into contiguous bytes; only for payloads already known
/// to be small.
pub async fn collect_stream(stream: ByteStream) -> ProxyResult<Bytes> {
    let spool = Spool::from_stream(stream).await?;
    let len = spool.len() as usize;
    let mut reader = spool.into_sync_reader()?;
    let mut data = Vec::with_capacity(len);
    reader
        .read_to_end(&mut data)
        .map_err(ProxyError::Io)?;
    Ok(Bytes::from(data))
}
