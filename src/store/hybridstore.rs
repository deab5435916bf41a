use std::collections::BTreeSet;

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::store::{ChunkStore, RootStore};
use crate::wire::Hints;

/// Store that delegates chunk and root operations to two independent stores.
///
/// This allows mixing different storage implementations, e.g. chunks in a
/// bucket without conditional writes and the root in a store that has them.
#[derive(Debug)]
pub struct HybridStore<C, R> {
    /// Storage for chunks.
    pub chunks: C,
    /// Storage for the root.
    pub root: R,
}

impl<C, R> HybridStore<C, R> {
    pub fn new(chunks: C, root: R) -> Self {
        Self { chunks, root }
    }
}

impl<C, R> ChunkStore for HybridStore<C, R>
where
    C: ChunkStore,
    R: Send + Sync,
{
    type ChunkError = C::ChunkError;

    fn get(&self, hash: &Hash) -> Result<Chunk, Self::ChunkError> {
        self.chunks.get(hash)
    }

    fn get_many(&self, hashes: &BTreeSet<Hash>) -> Result<Vec<Chunk>, Self::ChunkError> {
        self.chunks.get_many(hashes)
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::ChunkError> {
        self.chunks.has(hash)
    }

    fn has_many(&self, hashes: &BTreeSet<Hash>) -> Result<BTreeSet<Hash>, Self::ChunkError> {
        self.chunks.has_many(hashes)
    }

    fn put(&self, chunk: Chunk) -> Result<(), Self::ChunkError> {
        self.chunks.put(chunk)
    }

    fn put_many(&self, chunks: Vec<Chunk>, hints: &Hints) -> Result<(), Self::ChunkError> {
        self.chunks.put_many(chunks, hints)
    }
}

impl<C, R> RootStore for HybridStore<C, R>
where
    C: Send + Sync,
    R: RootStore,
{
    type RootError = R::RootError;

    fn root(&self) -> Result<Hash, Self::RootError> {
        self.root.root()
    }

    fn update_root(&self, current: Hash, last: Hash) -> Result<bool, Self::RootError> {
        self.root.update_root(current, last)
    }
}
