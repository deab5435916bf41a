use std::array::TryFromSliceError;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use futures::executor::block_on;
use futures::{stream, StreamExt, TryStreamExt};
use object_store::{self, parse_url, path::Path, ObjectStore, PutMode, UpdateVersion};
use url::Url;

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::store::{ChunkStore, RootStore};
use crate::wire::Hints;

const CHUNK_INFIX: &str = "chunks";
const ROOT_NAME: &str = "root";

/// Requests issued concurrently by `get_many`, `has_many` and `put_many`.
const CONCURRENCY: usize = 16;

/// Store backed by an [`object_store`] compatible storage backend.
///
/// All data lives in an external service (e.g. S3, local filesystem, memory)
/// reached through the `object_store` crate. Chunks are objects named by
/// their hex digest below `<prefix>/chunks/`, the root is the raw digest in
/// `<prefix>/root`.
///
/// Root updates rely on conditional writes (`PutMode::Create` and
/// `PutMode::Update`). Backends that do not implement them, like the local
/// filesystem, can still hold chunks; pair them with another root store in a
/// [`HybridStore`](crate::store::HybridStore).
pub struct ObjectStoreRemote {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl fmt::Debug for ObjectStoreRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreRemote")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStoreRemote {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        ObjectStoreRemote { store, prefix }
    }

    /// Creates a store pointing at the object store described by `url`.
    pub fn with_url(url: &Url) -> Result<ObjectStoreRemote, object_store::Error> {
        let (store, path) = parse_url(url)?;
        Ok(ObjectStoreRemote {
            store: Arc::from(store),
            prefix: path,
        })
    }

    fn chunk_path(&self, hash: &Hash) -> Path {
        self.prefix.child(CHUNK_INFIX).child(hash.to_hex())
    }

    fn root_path(&self) -> Path {
        self.prefix.child(ROOT_NAME)
    }

    async fn fetch(&self, hash: Hash) -> Result<Option<Chunk>, ObjectStoreErr> {
        match self.store.get(&self.chunk_path(&hash)).await {
            Ok(object) => {
                let bytes = object.bytes().await?;
                Ok(Some(Chunk::with_hash(hash, bytes)))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, hash: Hash) -> Result<(Hash, bool), ObjectStoreErr> {
        match self.store.head(&self.chunk_path(&hash)).await {
            Ok(_) => Ok((hash, true)),
            Err(object_store::Error::NotFound { .. }) => Ok((hash, false)),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_chunk(&self, chunk: Chunk) -> Result<(), ObjectStoreErr> {
        let path = self.chunk_path(&chunk.hash());
        let result = self
            .store
            .put_opts(&path, chunk.into_data().into(), PutMode::Create.into())
            .await;
        match result {
            Ok(_) | Err(object_store::Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_root(&self) -> Result<(Hash, Option<UpdateVersion>), ObjectStoreErr> {
        match self.store.get(&self.root_path()).await {
            Ok(object) => {
                let version = UpdateVersion {
                    e_tag: object.meta.e_tag.clone(),
                    version: object.meta.version.clone(),
                };
                let bytes = object.bytes().await?;
                Ok((Hash::from_slice(&bytes)?, Some(version)))
            }
            Err(object_store::Error::NotFound { .. }) => Ok((Hash::EMPTY, None)),
            Err(e) => Err(e.into()),
        }
    }
}

impl ChunkStore for ObjectStoreRemote {
    type ChunkError = ObjectStoreErr;

    fn get(&self, hash: &Hash) -> Result<Chunk, Self::ChunkError> {
        Ok(block_on(self.fetch(*hash))?.unwrap_or_else(Chunk::empty))
    }

    fn get_many(&self, hashes: &BTreeSet<Hash>) -> Result<Vec<Chunk>, Self::ChunkError> {
        let fetches = stream::iter(hashes.iter().map(|hash| self.fetch(*hash)))
            .buffer_unordered(CONCURRENCY)
            .try_collect::<Vec<_>>();
        Ok(block_on(fetches)?.into_iter().flatten().collect())
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::ChunkError> {
        Ok(block_on(self.exists(*hash))?.1)
    }

    fn has_many(&self, hashes: &BTreeSet<Hash>) -> Result<BTreeSet<Hash>, Self::ChunkError> {
        let checks = stream::iter(hashes.iter().map(|hash| self.exists(*hash)))
            .buffer_unordered(CONCURRENCY)
            .try_collect::<Vec<_>>();
        Ok(block_on(checks)?
            .into_iter()
            .filter(|(_, present)| !present)
            .map(|(hash, _)| hash)
            .collect())
    }

    fn put(&self, chunk: Chunk) -> Result<(), Self::ChunkError> {
        block_on(self.store_chunk(chunk))
    }

    fn put_many(&self, chunks: Vec<Chunk>, _hints: &Hints) -> Result<(), Self::ChunkError> {
        let writes = stream::iter(chunks.into_iter().map(|chunk| self.store_chunk(chunk)))
            .buffer_unordered(CONCURRENCY)
            .try_collect::<Vec<()>>();
        block_on(writes)?;
        Ok(())
    }
}

impl RootStore for ObjectStoreRemote {
    type RootError = ObjectStoreErr;

    fn root(&self) -> Result<Hash, Self::RootError> {
        Ok(block_on(self.read_root())?.0)
    }

    fn update_root(&self, current: Hash, last: Hash) -> Result<bool, Self::RootError> {
        let path = self.root_path();
        let payload = bytes::Bytes::copy_from_slice(current.as_bytes());
        loop {
            let (stored, version) = block_on(self.read_root())?;
            if stored != last {
                return Ok(false);
            }
            let mode = match version {
                Some(version) => PutMode::Update(version),
                None => PutMode::Create,
            };
            let result =
                block_on(async { self.store.put_opts(&path, payload.clone().into(), mode.into()).await });
            match result {
                Ok(_) => return Ok(true),
                // Somebody else wrote in between, compare against the new value.
                Err(object_store::Error::Precondition { .. })
                | Err(object_store::Error::AlreadyExists { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[derive(Debug)]
pub enum ObjectStoreErr {
    Store(object_store::Error),
    BadRoot(TryFromSliceError),
}

impl fmt::Display for ObjectStoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "object store error: {e}"),
            Self::BadRoot(e) => write!(f, "stored root is not a digest: {e}"),
        }
    }
}

impl Error for ObjectStoreErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::BadRoot(e) => Some(e),
        }
    }
}

impl From<object_store::Error> for ObjectStoreErr {
    fn from(err: object_store::Error) -> Self {
        Self::Store(err)
    }
}

impl From<TryFromSliceError> for ObjectStoreErr {
    fn from(err: TryFromSliceError) -> Self {
        Self::BadRoot(err)
    }
}
