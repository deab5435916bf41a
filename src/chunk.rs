//! Immutable, content-addressed byte payloads.

use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;
use hex_literal::hex;

use crate::hash::Hash;

/// Digest of the zero-length payload.
pub const EMPTY_CHUNK_HASH: Hash = Hash::new(hex!("da39a3ee5e6b4b0d3255bfef95601890afd80709"));

/// A chunk is an immutable sequence of bytes identified by its [`Hash`].
///
/// The hash is computed on first use and cached, so chunks that are only
/// passed around never pay for hashing. Two chunks with the same bytes are
/// the same chunk.
///
/// The zero-length chunk doubles as the "absent" sentinel returned by stores
/// when a hash is unknown, see [`Chunk::empty`].
#[derive(Clone)]
pub struct Chunk {
    data: Bytes,
    hash: OnceLock<Hash>,
}

impl Chunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Chunk {
            data: data.into(),
            hash: OnceLock::new(),
        }
    }

    /// Creates a chunk whose hash is already known.
    ///
    /// The hash is trusted as-is. Only use this when `hash` is the key the
    /// bytes were stored under or was verified against them.
    pub fn with_hash(hash: Hash, data: impl Into<Bytes>) -> Self {
        Chunk {
            data: data.into(),
            hash: OnceLock::from(hash),
        }
    }

    /// The sentinel for a chunk that could not be found.
    pub fn empty() -> Self {
        Chunk::with_hash(EMPTY_CHUNK_HASH, Bytes::new())
    }

    pub fn hash(&self) -> Hash {
        *self.hash.get_or_init(|| Hash::of(&self.data))
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Chunk {}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({}, {} bytes)", self.hash(), self.data.len())
    }
}
