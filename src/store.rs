//! Storage backends for chunks and the root pointer.
//!
//! Chunk storage is a plain content-addressed map: a chunk is stored under
//! the hash of its bytes, storing it twice is a no-op, and there is no notion
//! of time or order. This makes it possible to use a wide range of storage
//! services, including those without transactions.
//!
//! The only mutable state is the root, a single [`Hash`] naming the current
//! head of whatever structure lives in the chunks. It is updated exclusively
//! through [`RootStore::update_root`], a compare-and-swap: the update only
//! happens if the stored root still equals the caller's expectation. A lost
//! race is reported as `Ok(false)`, so callers can re-read the root and
//! retry, much like a rejected `git push`.
//!
//! Chunk storage and root storage are separate traits so they can live in
//! different places, see [`hybridstore::HybridStore`].
//!
//! The traits are blocking. [`BatchStore`](crate::batch::BatchStore) moves
//! the calls onto the blocking pool and coalesces them into batches.

pub mod httpstore;
pub mod hybridstore;
pub mod memorystore;
pub mod objectstore;

use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::wire::Hints;

pub use httpstore::HttpStore;
pub use hybridstore::HybridStore;
pub use memorystore::MemoryStore;
pub use objectstore::ObjectStoreRemote;

pub trait ChunkStore: Send + Sync {
    type ChunkError: Error + Debug + Send + Sync + 'static;

    /// Retrieves the chunk stored under `hash`.
    ///
    /// An unknown hash is not an error, it yields [`Chunk::empty`].
    fn get(&self, hash: &Hash) -> Result<Chunk, Self::ChunkError>;

    /// Retrieves every chunk of `hashes` that is present.
    ///
    /// Absent hashes are simply missing from the result.
    fn get_many(&self, hashes: &BTreeSet<Hash>) -> Result<Vec<Chunk>, Self::ChunkError> {
        let mut found = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let chunk = self.get(hash)?;
            if !chunk.is_empty() {
                found.push(chunk);
            }
        }
        Ok(found)
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::ChunkError>;

    /// Returns the subset of `hashes` that is absent.
    fn has_many(&self, hashes: &BTreeSet<Hash>) -> Result<BTreeSet<Hash>, Self::ChunkError> {
        let mut absent = BTreeSet::new();
        for hash in hashes {
            if !self.has(hash)? {
                absent.insert(*hash);
            }
        }
        Ok(absent)
    }

    /// Stores a chunk. Storing a chunk that is already present succeeds.
    fn put(&self, chunk: Chunk) -> Result<(), Self::ChunkError>;

    /// Stores a batch of chunks.
    ///
    /// `hints` name chunks the batch references but does not contain.
    /// Backends that cannot make use of them ignore them.
    fn put_many(&self, chunks: Vec<Chunk>, hints: &Hints) -> Result<(), Self::ChunkError> {
        let _ = hints;
        for chunk in chunks {
            self.put(chunk)?;
        }
        Ok(())
    }
}

pub trait RootStore: Send + Sync {
    type RootError: Error + Debug + Send + Sync + 'static;

    /// The current root, [`Hash::EMPTY`] if it was never set.
    fn root(&self) -> Result<Hash, Self::RootError>;

    /// Sets the root to `current` if it still is `last`.
    ///
    /// # Returns
    /// * `Ok(true)` - the root now is `current`
    /// * `Ok(false)` - the stored root differs from `last`, nothing changed
    fn update_root(&self, current: Hash, last: Hash) -> Result<bool, Self::RootError>;
}

impl<S> ChunkStore for Arc<S>
where
    S: ChunkStore + ?Sized,
{
    type ChunkError = S::ChunkError;

    fn get(&self, hash: &Hash) -> Result<Chunk, Self::ChunkError> {
        (**self).get(hash)
    }

    fn get_many(&self, hashes: &BTreeSet<Hash>) -> Result<Vec<Chunk>, Self::ChunkError> {
        (**self).get_many(hashes)
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::ChunkError> {
        (**self).has(hash)
    }

    fn has_many(&self, hashes: &BTreeSet<Hash>) -> Result<BTreeSet<Hash>, Self::ChunkError> {
        (**self).has_many(hashes)
    }

    fn put(&self, chunk: Chunk) -> Result<(), Self::ChunkError> {
        (**self).put(chunk)
    }

    fn put_many(&self, chunks: Vec<Chunk>, hints: &Hints) -> Result<(), Self::ChunkError> {
        (**self).put_many(chunks, hints)
    }
}

impl<S> RootStore for Arc<S>
where
    S: RootStore + ?Sized,
{
    type RootError = S::RootError;

    fn root(&self) -> Result<Hash, Self::RootError> {
        (**self).root()
    }

    fn update_root(&self, current: Hash, last: Hash) -> Result<bool, Self::RootError> {
        (**self).update_root(current, last)
    }
}
