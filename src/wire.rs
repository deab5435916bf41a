//! Binary framing for chunk batches.
//!
//! A batch consists of a hash list of hints followed by chunk records:
//!
//! ```text
//! hints:  u32 (big endian) count, count * 20 byte digest
//! record: 20 byte digest, u32 (big endian) length, length bytes payload
//! ```
//!
//! Records run until the input is exhausted. Every record is verified on
//! receipt: the digest is recomputed from the payload and must match the
//! transmitted one.
//!
//! The same hash-list encoding names the hashes of read requests, and read
//! responses are bare record streams.

use std::collections::BTreeSet;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chunk::Chunk;
use crate::hash::{Hash, HASH_LEN};

/// Hashes referenced by a write batch without being part of it.
pub type Hints = BTreeSet<Hash>;

const COUNT_LEN: usize = 4;
const RECORD_HEADER_LEN: usize = HASH_LEN + 4;

#[derive(Debug, Clone, PartialEq)]
pub enum WireError {
    Truncated { needed: usize, remaining: usize },
    HashMismatch { expected: Hash, actual: Hash },
    TooLarge(usize),
    TooManyHashes(usize),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, remaining } => {
                write!(f, "truncated input: needed {needed} bytes, {remaining} left")
            }
            Self::HashMismatch { expected, actual } => {
                write!(f, "chunk digest mismatch: expected {expected}, got {actual}")
            }
            Self::TooLarge(len) => write!(f, "chunk of {len} bytes does not fit a record"),
            Self::TooManyHashes(count) => write!(f, "{count} hashes do not fit a hash list"),
        }
    }
}

impl std::error::Error for WireError {}

fn ensure(remaining: usize, needed: usize) -> Result<(), WireError> {
    if remaining < needed {
        return Err(WireError::Truncated { needed, remaining });
    }
    Ok(())
}

fn get_hash(buf: &mut impl Buf) -> Hash {
    let mut raw = [0; HASH_LEN];
    buf.copy_to_slice(&mut raw);
    Hash::new(raw)
}

pub fn write_hashes<'a>(
    buf: &mut impl BufMut,
    hashes: impl ExactSizeIterator<Item = &'a Hash>,
) -> Result<(), WireError> {
    let count = u32::try_from(hashes.len()).map_err(|_| WireError::TooManyHashes(hashes.len()))?;
    buf.put_u32(count);
    for hash in hashes {
        buf.put_slice(hash.as_bytes());
    }
    Ok(())
}

pub fn read_hashes(buf: &mut impl Buf) -> Result<BTreeSet<Hash>, WireError> {
    ensure(buf.remaining(), COUNT_LEN)?;
    let count = buf.get_u32() as usize;
    ensure(buf.remaining(), count.saturating_mul(HASH_LEN))?;
    Ok((0..count).map(|_| get_hash(buf)).collect())
}

pub fn write_chunk(buf: &mut impl BufMut, chunk: &Chunk) -> Result<(), WireError> {
    let len = u32::try_from(chunk.len()).map_err(|_| WireError::TooLarge(chunk.len()))?;
    buf.put_slice(chunk.hash().as_bytes());
    buf.put_u32(len);
    buf.put_slice(chunk.data());
    Ok(())
}

/// Reads one record and verifies its digest.
///
/// The payload is sliced out of `buf` without copying.
pub fn read_chunk(buf: &mut Bytes) -> Result<Chunk, WireError> {
    ensure(buf.remaining(), RECORD_HEADER_LEN)?;
    let expected = get_hash(buf);
    let len = buf.get_u32() as usize;
    ensure(buf.remaining(), len)?;
    let data = buf.split_to(len);
    let actual = Hash::of(&data);
    if actual != expected {
        return Err(WireError::HashMismatch { expected, actual });
    }
    Ok(Chunk::with_hash(actual, data))
}

pub fn serialize_chunks<'a>(
    buf: &mut BytesMut,
    chunks: impl IntoIterator<Item = &'a Chunk>,
) -> Result<(), WireError> {
    for chunk in chunks {
        buf.reserve(RECORD_HEADER_LEN + chunk.len());
        write_chunk(buf, chunk)?;
    }
    Ok(())
}

pub fn deserialize_chunks(mut bytes: Bytes) -> Result<Vec<Chunk>, WireError> {
    let mut chunks = Vec::new();
    while bytes.has_remaining() {
        chunks.push(read_chunk(&mut bytes)?);
    }
    Ok(chunks)
}

/// Frames a write batch.
pub fn serialize<'a>(
    hints: &Hints,
    chunks: impl IntoIterator<Item = &'a Chunk>,
) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(COUNT_LEN + hints.len() * HASH_LEN);
    write_hashes(&mut buf, hints.iter())?;
    serialize_chunks(&mut buf, chunks)?;
    Ok(buf.freeze())
}

/// Parses a write batch framed by [`serialize`].
pub fn deserialize(mut bytes: Bytes) -> Result<(Hints, Vec<Chunk>), WireError> {
    let hints = read_hashes(&mut bytes)?;
    let chunks = deserialize_chunks(bytes)?;
    Ok((hints, chunks))
}
