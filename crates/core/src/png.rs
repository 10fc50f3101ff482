//! Chunk-level PNG surgery.
//!
//! A PNG stream after the 8-byte signature is a sequence of chunks:
//! 4-byte big-endian length, 4-byte ASCII type, payload, and a CRC-32 over
//! type + payload. [`PngSurgeon`] pairs a reader and a writer and exposes
//! just enough of that structure to drop, rewrite or copy chunks while
//! streaming with bounded memory.

use std::io::{self, Read, Write};

/// The fixed 8-byte PNG signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

/// A 4-byte PNG chunk type.
pub type ChunkType = [u8; 4];

pub const CHUNK_TIME: ChunkType = *b"tIME";
pub const CHUNK_TEXT: ChunkType = *b"tEXt";
pub const CHUNK_IEND: ChunkType = *b"IEND";

/// Scratch buffer size for streaming chunk bodies.
const COPY_BUF_LEN: usize = 8 * 1024;

/// A fully-read chunk payload together with its CRC verdict.
pub struct RawChunk {
    /// The chunk payload, excluding length/type/CRC framing.
    pub data: Vec<u8>,
    /// The CRC as stored in the stream.
    pub stored_crc: u32,
    /// Whether the stored CRC matched the computed one.
    pub crc_ok: bool,
}

/// Streaming chunk reader/writer over a PNG body.
pub struct PngSurgeon<R, W> {
    reader: R,
    writer: W,
    /// Header of the chunk whose body has not been consumed yet.
    pending: Option<(ChunkType, u32)>,
}

impl<R: Read, W: Write> PngSurgeon<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            pending: None,
        }
    }

    /// Read the next chunk header, returning its type.
    ///
    /// The previous chunk's body must have been consumed first.
    pub fn read_chunk_header(&mut self) -> io::Result<ChunkType> {
        debug_assert!(self.pending.is_none(), "current chunk not yet processed");
        let len = read_u32(&mut self.reader)?;
        let mut chunk_type = [0u8; 4];
        self.reader.read_exact(&mut chunk_type)?;
        self.pending = Some((chunk_type, len));
        Ok(chunk_type)
    }

    /// Length of the pending chunk's payload.
    pub fn chunk_len(&self) -> u32 {
        self.pending.expect("no chunk header has been read").1
    }

    /// Read the pending chunk's payload and CRC, verifying the CRC.
    pub fn read_chunk_data(&mut self) -> io::Result<RawChunk> {
        let (chunk_type, len) = self.pending.take().expect("no chunk header has been read");
        let mut data = vec![0u8; len as usize];
        self.reader.read_exact(&mut data)?;
        let stored_crc = read_u32(&mut self.reader)?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&chunk_type);
        crc.update(&data);
        let crc_ok = crc.finalize() == stored_crc;
        Ok(RawChunk {
            data,
            stored_crc,
            crc_ok,
        })
    }

    /// Discard the pending chunk's payload and CRC.
    pub fn skip_chunk_data(&mut self) -> io::Result<()> {
        let (_, len) = self.pending.take().expect("no chunk header has been read");
        discard(&mut self.reader, len as u64 + 4)
    }

    /// Copy the pending chunk through to the output byte-for-byte,
    /// without CRC validation.
    pub fn copy_chunk(&mut self) -> io::Result<()> {
        let (chunk_type, len) = self.pending.take().expect("no chunk header has been read");
        write_u32(&mut self.writer, len)?;
        self.writer.write_all(&chunk_type)?;
        let mut remaining = len as u64 + 4;
        let mut buf = [0u8; COPY_BUF_LEN];
        while remaining > 0 {
            let want = remaining.min(COPY_BUF_LEN as u64) as usize;
            self.reader.read_exact(&mut buf[..want])?;
            self.writer.write_all(&buf[..want])?;
            remaining -= want as u64;
        }
        Ok(())
    }

    /// Write a chunk with a freshly computed CRC.
    pub fn write_chunk(&mut self, chunk_type: ChunkType, data: &[u8]) -> io::Result<()> {
        write_u32(&mut self.writer, data.len() as u32)?;
        self.writer.write_all(&chunk_type)?;
        self.writer.write_all(data)?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&chunk_type);
        crc.update(data);
        write_u32(&mut self.writer, crc.finalize())
    }

    /// Re-emit a previously read chunk exactly as it appeared in the
    /// input, preserving its stored CRC even if that CRC is wrong.
    pub fn write_raw_chunk(&mut self, chunk_type: ChunkType, chunk: &RawChunk) -> io::Result<()> {
        write_u32(&mut self.writer, chunk.data.len() as u32)?;
        self.writer.write_all(&chunk_type)?;
        self.writer.write_all(&chunk.data)?;
        write_u32(&mut self.writer, chunk.stored_crc)
    }
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_be_bytes())
}

fn discard<R: Read>(reader: &mut R, mut remaining: u64) -> io::Result<()> {
    let mut buf = [0u8; COPY_BUF_LEN];
    while remaining > 0 {
        let want = remaining.min(COPY_BUF_LEN as u64) as usize;
        reader.read_exact(&mut buf[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}
