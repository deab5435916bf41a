use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::store::{ChunkStore, RootStore};

/// Simple in-memory implementation of [`ChunkStore`] and [`RootStore`].
///
/// Useful for unit tests, as the backing store of a local server, or for
/// ephemeral stores where persistence is not required.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chunks: RwLock<HashMap<Hash, Chunk>>,
    root: Mutex<Hash>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct chunks stored.
    pub fn len(&self) -> usize {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks that were newly written, duplicates excluded.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl ChunkStore for MemoryStore {
    type ChunkError = Infallible;

    fn get(&self, hash: &Hash) -> Result<Chunk, Self::ChunkError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(chunks.get(hash).cloned().unwrap_or_else(Chunk::empty))
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::ChunkError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(chunks.contains_key(hash))
    }

    fn put(&self, chunk: Chunk) -> Result<(), Self::ChunkError> {
        let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        // Idempotent, an existing entry holds the same bytes.
        chunks.entry(chunk.hash()).or_insert_with(|| {
            self.writes.fetch_add(1, Ordering::Relaxed);
            chunk
        });
        Ok(())
    }
}

impl RootStore for MemoryStore {
    type RootError = Infallible;

    fn root(&self) -> Result<Hash, Self::RootError> {
        Ok(*self.root.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn update_root(&self, current: Hash, last: Hash) -> Result<bool, Self::RootError> {
        let mut root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        if *root != last {
            return Ok(false);
        }
        *root = current;
        Ok(true)
    }
}
