//! Commonly used types and traits, intended to be glob imported as
//! `use chunkstore::prelude::*;`.

pub use crate::batch::{BatchConfig, BatchError, BatchStats, BatchStore};
pub use crate::chunk::Chunk;
pub use crate::hash::Hash;
pub use crate::store::{
    ChunkStore, HttpStore, HybridStore, MemoryStore, ObjectStoreRemote, RootStore,
};
pub use crate::wire::Hints;
