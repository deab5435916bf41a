#![allow(dead_code)]

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chunkstore::prelude::*;

#[derive(Debug)]
pub struct Unavailable;

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend unavailable")
    }
}

impl std::error::Error for Unavailable {}

/// Memory store that records the batches it receives.
#[derive(Debug, Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    pub read_batches: Mutex<Vec<BTreeSet<Hash>>>,
    pub write_batches: Mutex<Vec<(Vec<Hash>, Hints)>>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Milliseconds every `get_many` sleeps before answering.
    pub read_delay_ms: AtomicU64,
    reads_in_flight: AtomicUsize,
    pub max_reads_in_flight: AtomicUsize,
    /// Milliseconds every `put_many` sleeps before storing.
    pub write_delay_ms: AtomicU64,
    writes_in_flight: AtomicUsize,
    pub max_writes_in_flight: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks(chunks: &[Chunk]) -> Self {
        let store = Self::new();
        for chunk in chunks {
            store.inner.put(chunk.clone()).unwrap();
        }
        store
    }

    pub fn read_batches(&self) -> Vec<BTreeSet<Hash>> {
        self.read_batches.lock().unwrap().clone()
    }

    pub fn write_batches(&self) -> Vec<(Vec<Hash>, Hints)> {
        self.write_batches.lock().unwrap().clone()
    }
}

impl ChunkStore for CountingStore {
    type ChunkError = Unavailable;

    fn get(&self, hash: &Hash) -> Result<Chunk, Self::ChunkError> {
        Ok(self.inner.get(hash).unwrap())
    }

    fn get_many(&self, hashes: &BTreeSet<Hash>) -> Result<Vec<Chunk>, Self::ChunkError> {
        self.read_batches.lock().unwrap().push(hashes.clone());
        let now = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_reads_in_flight.fetch_max(now, Ordering::SeqCst);

        // Answers with what the backend held when the request arrived.
        let result = if self.fail_reads.load(Ordering::SeqCst) {
            Err(Unavailable)
        } else {
            Ok(self.inner.get_many(hashes).unwrap())
        };
        std::thread::sleep(Duration::from_millis(
            self.read_delay_ms.load(Ordering::SeqCst),
        ));

        self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::ChunkError> {
        Ok(self.inner.has(hash).unwrap())
    }

    fn put(&self, chunk: Chunk) -> Result<(), Self::ChunkError> {
        self.inner.put(chunk).unwrap();
        Ok(())
    }

    fn put_many(&self, chunks: Vec<Chunk>, hints: &Hints) -> Result<(), Self::ChunkError> {
        let now = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_writes_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(
            self.write_delay_ms.load(Ordering::SeqCst),
        ));

        let result = if self.fail_writes.load(Ordering::SeqCst) {
            Err(Unavailable)
        } else {
            self.write_batches
                .lock()
                .unwrap()
                .push((chunks.iter().map(Chunk::hash).collect(), hints.clone()));
            self.inner.put_many(chunks, hints).unwrap();
            Ok(())
        };

        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl RootStore for CountingStore {
    type RootError = Infallible;

    fn root(&self) -> Result<Hash, Self::RootError> {
        self.inner.root()
    }

    fn update_root(&self, current: Hash, last: Hash) -> Result<bool, Self::RootError> {
        self.inner.update_root(current, last)
    }
}

pub fn chunks(count: usize) -> Vec<Chunk> {
    (0..count).map(|i| Chunk::new(format!("chunk {i}"))).collect()
}
