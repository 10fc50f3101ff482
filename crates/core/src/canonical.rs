//! Canonicalization of byte streams prior to hashing.
//!
//! Image producers embed volatile metadata (capture/modify timestamps) that
//! makes byte-identical pixel data hash differently and defeats
//! deduplication. [`canonicalize`] strips exactly that metadata from PNG
//! streams and passes every other stream through untouched. The function is
//! pure and streaming: memory use is bounded by one small chunk payload
//! plus a fixed scratch buffer.

use crate::png::{
    CHUNK_IEND, CHUNK_TEXT, CHUNK_TIME, PNG_SIGNATURE, PngSurgeon,
};
use std::io::{self, BufReader, BufWriter, Read, Write};

/// tEXt chunks at or above this size are passed through unmodified.
pub const TEXT_CHUNK_CEILING: u32 = 16 * 1024;

/// Longest tEXt keyword we will scan for a NUL terminator.
const MAX_TEXT_KEY_LEN: usize = 80;

/// Keys whose key/value pairs are dropped from tEXt chunks. All three are
/// injected non-deterministically by common image pipelines; imagemagick
/// fabricates `date:create` even for files that never had a timestamp.
const DENIED_TEXT_KEYS: [&[u8]; 3] = [b"date:timestamp", b"date:create", b"date:modify"];

/// Rewrite `input` into `output`, producing the canonical byte stream.
///
/// Streams that do not begin with the PNG signature are copied through
/// byte-for-byte. PNG streams are copied chunk-by-chunk with `tIME`
/// dropped and deny-listed `tEXt` pairs removed; see the module docs of
/// [`crate::png`] for the framing. Malformed chunks are never rejected:
/// the worst case is always "copy unchanged".
pub fn canonicalize<R: Read, W: Write>(input: R, output: W) -> io::Result<()> {
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);

    let mut magic = [0u8; 8];
    let count = read_up_to(&mut input, &mut magic)?;
    if count < magic.len() || magic != PNG_SIGNATURE {
        output.write_all(&magic[..count])?;
        io::copy(&mut input, &mut output)?;
        return output.flush();
    }

    output.write_all(&magic)?;
    let mut surgeon = PngSurgeon::new(&mut input, &mut output);
    loop {
        let chunk_type = surgeon.read_chunk_header()?;
        if chunk_type == CHUNK_TIME {
            surgeon.skip_chunk_data()?;
        } else if chunk_type == CHUNK_TEXT && surgeon.chunk_len() < TEXT_CHUNK_CEILING {
            let chunk = surgeon.read_chunk_data()?;
            if !chunk.crc_ok {
                // Preserved verbatim, bad CRC included.
                surgeon.write_raw_chunk(CHUNK_TEXT, &chunk)?;
                continue;
            }
            match strip_denied_pairs(&chunk.data) {
                TextScan::Malformed | TextScan::Unchanged => {
                    surgeon.write_chunk(CHUNK_TEXT, &chunk.data)?;
                }
                TextScan::Rewritten(kept) => {
                    if !kept.is_empty() {
                        surgeon.write_chunk(CHUNK_TEXT, &kept)?;
                    }
                }
            }
        } else {
            surgeon.copy_chunk()?;
            if chunk_type == CHUNK_IEND {
                break;
            }
        }
    }
    output.flush()
}

/// Outcome of scanning a tEXt payload for deny-listed pairs.
enum TextScan {
    /// NUL structure is broken; the chunk must pass through unchanged.
    Malformed,
    /// No deny-listed key present; the chunk passes through unchanged.
    Unchanged,
    /// At least one pair was dropped; the surviving pairs, in original
    /// order, re-encoded as `key NUL value NUL`.
    Rewritten(Vec<u8>),
}

fn strip_denied_pairs(data: &[u8]) -> TextScan {
    let mut kept: Vec<u8> = Vec::with_capacity(data.len());
    let mut dropped_any = false;
    let mut pos = 0;

    while pos < data.len() {
        let window_end = (pos + MAX_TEXT_KEY_LEN).min(data.len());
        let Some(key_len) = data[pos..window_end].iter().position(|&b| b == 0) else {
            return TextScan::Malformed;
        };
        if key_len == 0 {
            // Empty keyword terminates the pair list.
            break;
        }
        let key = &data[pos..pos + key_len];
        pos += key_len + 1;

        let value_end = data[pos..]
            .iter()
            .position(|&b| b == 0)
            .map(|i| pos + i)
            .unwrap_or(data.len());
        let value = &data[pos..value_end];
        pos = if value_end < data.len() {
            value_end + 1
        } else {
            data.len()
        };

        if DENIED_TEXT_KEYS.contains(&key) {
            dropped_any = true;
        } else {
            kept.extend_from_slice(key);
            kept.push(0);
            kept.extend_from_slice(value);
            kept.push(0);
        }
    }

    if dropped_any {
        TextScan::Rewritten(kept)
    } else {
        TextScan::Unchanged
    }
}

/// Read up to `buf.len()` bytes, returning how many were read before EOF.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
