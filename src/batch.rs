//! Coalescing of many small reads and writes into few backend batches.
//!
//! A [`BatchStore`] sits in front of any [`ChunkStore`] + [`RootStore`].
//! Writes are staged in memory and leave as one `put_many` once enough of
//! them accumulated or when [`BatchStore::flush`] is called. Reads are
//! queued to a single coalescing task which cuts the queue into batches and
//! issues one `get_many` per batch. Concurrent reads of the same hash share
//! one fetch.
//!
//! Chunks that were scheduled but not yet acknowledged by the backend stay
//! in an unwritten buffer, so reads observe them immediately.
//!
//! The backend traits are blocking; every backend call runs on Tokio's
//! blocking pool.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::store::{ChunkStore, RootStore};
use crate::wire::Hints;

/// Upper bound for `max_reads` and `max_writes`.
pub const MAX_IN_FLIGHT: usize = 1024;

/// Tuning knobs of a [`BatchStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Most hashes requested by a single `get_many`.
    pub read_batch_size: usize,
    /// Staged chunks that trigger a background write.
    pub write_batch_size: usize,
    /// Read batches in flight at once.
    pub max_reads: usize,
    /// Write batches in flight at once.
    pub max_writes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            read_batch_size: 100,
            write_batch_size: 25,
            max_reads: 6,
            max_writes: 2,
        }
    }
}

impl BatchConfig {
    fn normalized(self) -> Self {
        BatchConfig {
            read_batch_size: self.read_batch_size.max(1),
            write_batch_size: self.write_batch_size.max(1),
            max_reads: self.max_reads.clamp(1, MAX_IN_FLIGHT),
            max_writes: self.max_writes.clamp(1, MAX_IN_FLIGHT),
        }
    }
}

/// Counters collected over the lifetime of a [`BatchStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub read_batches: u64,
    /// Hashes sent to the backend, one per distinct hash in a batch.
    pub chunks_requested: u64,
    pub chunks_found: u64,
    pub read_time: Duration,
    pub write_batches: u64,
    pub chunks_written: u64,
    pub write_time: Duration,
    /// Read and write batches the backend rejected.
    pub failed_batches: u64,
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(count) => total / count,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reads: {} batches, {}/{} chunks found, {:?} avg; ",
            self.read_batches,
            self.chunks_found,
            self.chunks_requested,
            average(self.read_time, self.read_batches),
        )?;
        write!(
            f,
            "writes: {} batches, {} chunks, {:?} avg",
            self.write_batches,
            self.chunks_written,
            average(self.write_time, self.write_batches),
        )?;
        if self.failed_batches > 0 {
            write!(f, "; {} failed batches", self.failed_batches)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    read_batches: AtomicU64,
    chunks_requested: AtomicU64,
    chunks_found: AtomicU64,
    read_nanos: AtomicU64,
    write_batches: AtomicU64,
    chunks_written: AtomicU64,
    write_nanos: AtomicU64,
    failed_batches: AtomicU64,
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

impl Counters {
    fn record_read(&self, requested: usize, found: usize, elapsed: Duration) {
        self.read_batches.fetch_add(1, Ordering::Relaxed);
        self.chunks_requested
            .fetch_add(requested as u64, Ordering::Relaxed);
        self.chunks_found.fetch_add(found as u64, Ordering::Relaxed);
        self.read_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    fn record_write(&self, written: usize, elapsed: Duration) {
        self.write_batches.fetch_add(1, Ordering::Relaxed);
        self.chunks_written
            .fetch_add(written as u64, Ordering::Relaxed);
        self.write_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BatchStats {
        BatchStats {
            read_batches: self.read_batches.load(Ordering::Relaxed),
            chunks_requested: self.chunks_requested.load(Ordering::Relaxed),
            chunks_found: self.chunks_found.load(Ordering::Relaxed),
            read_time: Duration::from_nanos(self.read_nanos.load(Ordering::Relaxed)),
            write_batches: self.write_batches.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            write_time: Duration::from_nanos(self.write_nanos.load(Ordering::Relaxed)),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub enum BatchError<C, R> {
    Chunks(C),
    Root(R),
    /// A blocking backend call panicked or was cancelled.
    Worker(JoinError),
    Closed,
}

/// The error type of a [`BatchStore`] over `S`.
pub type BatchStoreError<S> =
    BatchError<<S as ChunkStore>::ChunkError, <S as RootStore>::RootError>;

impl<C: fmt::Display, R: fmt::Display> fmt::Display for BatchError<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunks(e) => write!(f, "chunk store error: {e}"),
            Self::Root(e) => write!(f, "root store error: {e}"),
            Self::Worker(e) => write!(f, "backend call failed: {e}"),
            Self::Closed => write!(f, "batch store is shut down"),
        }
    }
}

impl<C, R> Error for BatchError<C, R>
where
    C: Error + 'static,
    R: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Chunks(e) => Some(e),
            Self::Root(e) => Some(e),
            Self::Worker(e) => Some(e),
            Self::Closed => None,
        }
    }
}

fn chunk_result<T, C, R>(result: Result<Result<T, C>, JoinError>) -> Result<T, BatchError<C, R>> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BatchError::Chunks(e)),
        Err(e) => Err(BatchError::Worker(e)),
    }
}

fn root_result<T, C, R>(result: Result<Result<T, R>, JoinError>) -> Result<T, BatchError<C, R>> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BatchError::Root(e)),
        Err(e) => Err(BatchError::Worker(e)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Callers waiting on one fetch of a hash.
#[derive(Debug)]
struct Pending {
    fetch: u64,
    waiters: Vec<oneshot::Sender<Chunk>>,
}

#[derive(Debug, Default)]
struct Staged {
    chunks: Vec<Chunk>,
    hints: Hints,
}

struct Shared<S> {
    store: Arc<S>,
    config: BatchConfig,
    /// Staged and in-flight chunks, removed once the backend acknowledged them.
    unwritten: RwLock<HashMap<Hash, Chunk>>,
    staged: Mutex<Staged>,
    /// Callers waiting on a queued or in-flight read, per hash.
    waiting: Mutex<HashMap<Hash, Pending>>,
    next_fetch: AtomicU64,
    read_permits: Arc<Semaphore>,
    write_permits: Semaphore,
    counters: Counters,
}

impl<S> Shared<S>
where
    S: ChunkStore + RootStore + 'static,
{
    async fn blocking<T, E, F>(&self, f: F) -> Result<Result<T, E>, JoinError>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(&S) -> Result<T, E> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store)).await
    }

    fn unwritten(&self, hash: &Hash) -> Option<Chunk> {
        read(&self.unwritten).get(hash).cloned()
    }

    /// Reads `batch` and answers the waiters of each `(hash, fetch)` pair.
    ///
    /// A write may answer and retire an entry while its fetch is in flight.
    /// Entries registered after that belong to a newer fetch and are left
    /// alone.
    async fn fetch(&self, batch: BTreeMap<Hash, u64>) {
        let started = Instant::now();
        let wanted: BTreeSet<Hash> = batch.keys().copied().collect();
        let found = match self.blocking(move |store| store.get_many(&wanted)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(error = %e, hashes = batch.len(), "read batch failed");
                self.counters.record_failure();
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, hashes = batch.len(), "read batch worker failed");
                self.counters.record_failure();
                Vec::new()
            }
        };
        self.counters
            .record_read(batch.len(), found.len(), started.elapsed());
        debug!(requested = batch.len(), found = found.len(), "read batch");

        let mut found: HashMap<Hash, Chunk> =
            found.into_iter().map(|chunk| (chunk.hash(), chunk)).collect();
        let mut waiting = lock(&self.waiting);
        for (hash, fetch) in batch {
            let Entry::Occupied(entry) = waiting.entry(hash) else {
                continue;
            };
            if entry.get().fetch != fetch {
                continue;
            }
            let chunk = found.remove(&hash).unwrap_or_else(Chunk::empty);
            for waiter in entry.remove().waiters {
                let _ = waiter.send(chunk.clone());
            }
        }
    }

    /// Sends the currently staged chunks as one batch.
    ///
    /// On failure the chunks are staged again, ahead of anything staged
    /// meanwhile.
    async fn write_staged(&self) -> Result<(), BatchStoreError<S>> {
        let _permit = self
            .write_permits
            .acquire()
            .await
            .map_err(|_| BatchError::Closed)?;
        let (chunks, hints) = {
            let mut staged = lock(&self.staged);
            if staged.chunks.is_empty() {
                return Ok(());
            }
            (
                std::mem::take(&mut staged.chunks),
                std::mem::take(&mut staged.hints),
            )
        };

        let started = Instant::now();
        let batch = chunks.clone();
        let batch_hints = hints.clone();
        let result = self
            .blocking(move |store| store.put_many(batch, &batch_hints))
            .await;
        let err = match chunk_result(result) {
            Ok(()) => {
                {
                    // Pending fetches of these hashes may predate the write.
                    // Answer their waiters before the chunks leave the buffer.
                    let mut waiting = lock(&self.waiting);
                    let mut unwritten = write(&self.unwritten);
                    for chunk in &chunks {
                        let hash = chunk.hash();
                        if let Some(pending) = waiting.remove(&hash) {
                            for waiter in pending.waiters {
                                let _ = waiter.send(chunk.clone());
                            }
                        }
                        unwritten.remove(&hash);
                    }
                }
                self.counters.record_write(chunks.len(), started.elapsed());
                debug!(chunks = chunks.len(), hints = hints.len(), "write batch");
                return Ok(());
            }
            Err(err) => err,
        };

        self.counters.record_failure();
        let mut staged = lock(&self.staged);
        let newer = std::mem::replace(&mut staged.chunks, chunks);
        staged.chunks.extend(newer);
        staged.hints.extend(hints);
        Err(err)
    }
}

async fn read_loop<S>(
    shared: Arc<Shared<S>>,
    mut requests: mpsc::UnboundedReceiver<(Hash, u64)>,
) where
    S: ChunkStore + RootStore + 'static,
{
    while let Some((hash, fetch)) = requests.recv().await {
        // Let callers polled in the same tick enqueue before cutting the batch.
        tokio::task::yield_now().await;
        let mut batch = BTreeMap::from([(hash, fetch)]);
        while batch.len() < shared.config.read_batch_size {
            match requests.try_recv() {
                Ok((hash, fetch)) => {
                    // Only the newest fetch of a hash can still have waiters.
                    let newest = batch.entry(hash).or_insert(fetch);
                    *newest = (*newest).max(fetch);
                }
                Err(_) => break,
            }
        }

        let Ok(permit) = Arc::clone(&shared.read_permits).acquire_owned().await else {
            break;
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            shared.fetch(batch).await;
            drop(permit);
        });
    }
}

/// Buffering layer in front of a [`ChunkStore`] + [`RootStore`].
///
/// Cloning is not supported; share a `BatchStore` through an `Arc` or put
/// several of them in front of one `Arc`ed backend.
pub struct BatchStore<S> {
    shared: Arc<Shared<S>>,
    reads: mpsc::UnboundedSender<(Hash, u64)>,
    runtime: Handle,
}

impl<S> fmt::Debug for BatchStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchStore")
            .field("config", &self.shared.config)
            .field("staged", &lock(&self.shared.staged).chunks.len())
            .finish()
    }
}

impl<S> BatchStore<S>
where
    S: ChunkStore + RootStore + 'static,
{
    /// Wraps `store`. Must be called from within a Tokio runtime, which
    /// runs the read coalescing task and the background writes.
    pub fn new(store: S, config: BatchConfig) -> Self {
        let config = config.normalized();
        let shared = Arc::new(Shared {
            store: Arc::new(store),
            config,
            unwritten: RwLock::new(HashMap::new()),
            staged: Mutex::new(Staged::default()),
            waiting: Mutex::new(HashMap::new()),
            next_fetch: AtomicU64::new(0),
            read_permits: Arc::new(Semaphore::new(config.max_reads)),
            write_permits: Semaphore::new(config.max_writes),
            counters: Counters::default(),
        });
        let (reads, requests) = mpsc::unbounded_channel();
        let runtime = Handle::current();
        runtime.spawn(read_loop(Arc::clone(&shared), requests));
        BatchStore {
            shared,
            reads,
            runtime,
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.shared.config
    }

    /// The backend this store writes through to.
    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// Fetches a chunk, [`Chunk::empty`] if the backend does not have it or
    /// the read failed.
    pub async fn get(&self, hash: &Hash) -> Chunk {
        if let Some(chunk) = self.shared.unwritten(hash) {
            return chunk;
        }
        let (sender, receiver) = oneshot::channel();
        {
            let mut waiting = lock(&self.shared.waiting);
            match waiting.entry(*hash) {
                Entry::Occupied(mut entry) => entry.get_mut().waiters.push(sender),
                Entry::Vacant(entry) => {
                    let fetch = self.shared.next_fetch.fetch_add(1, Ordering::Relaxed);
                    entry.insert(Pending {
                        fetch,
                        waiters: vec![sender],
                    });
                    if self.reads.send((*hash, fetch)).is_err() {
                        waiting.remove(hash);
                        return Chunk::empty();
                    }
                }
            }
        }
        receiver.await.unwrap_or_else(|_| Chunk::empty())
    }

    /// Fetches the chunks of `hashes` that exist. Absent ones are skipped.
    pub async fn get_many(&self, hashes: &BTreeSet<Hash>) -> Vec<Chunk> {
        join_all(hashes.iter().map(|hash| self.get(hash)))
            .await
            .into_iter()
            .filter(|chunk| !chunk.is_empty())
            .collect()
    }

    pub async fn has(&self, hash: &Hash) -> Result<bool, BatchStoreError<S>> {
        Ok(self.has_many(&BTreeSet::from([*hash])).await?.is_empty())
    }

    /// Returns the subset of `hashes` that neither the unwritten buffer nor
    /// the backend holds.
    pub async fn has_many(
        &self,
        hashes: &BTreeSet<Hash>,
    ) -> Result<BTreeSet<Hash>, BatchStoreError<S>> {
        let remote: BTreeSet<Hash> = {
            let unwritten = read(&self.shared.unwritten);
            hashes
                .iter()
                .filter(|hash| !unwritten.contains_key(*hash))
                .copied()
                .collect()
        };
        if remote.is_empty() {
            return Ok(remote);
        }
        chunk_result(
            self.shared
                .blocking(move |store| store.has_many(&remote))
                .await,
        )
    }

    /// Stages `chunk` for writing together with `hints`, the hashes it
    /// references that are already stored.
    ///
    /// Scheduling a chunk that is still unwritten only merges the hints.
    /// Once `write_batch_size` chunks are staged a background write starts.
    pub fn schedule_put(&self, chunk: Chunk, hints: impl IntoIterator<Item = Hash>) {
        let hash = chunk.hash();
        let fresh = match write(&self.shared.unwritten).entry(hash) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(chunk.clone());
                true
            }
        };
        let full = {
            let mut staged = lock(&self.shared.staged);
            staged.hints.extend(hints);
            if fresh {
                staged.chunks.push(chunk);
            }
            staged.chunks.len() >= self.shared.config.write_batch_size
        };
        if fresh && full {
            let shared = Arc::clone(&self.shared);
            self.runtime.spawn(async move {
                if let Err(e) = shared.write_staged().await {
                    warn!(error = %e, "background write batch failed, chunks stay staged");
                }
            });
        }
    }

    /// Writes everything staged and waits until the backend acknowledged
    /// all outstanding writes.
    pub async fn flush(&self) -> Result<(), BatchStoreError<S>> {
        let permits = u32::try_from(self.shared.config.max_writes).unwrap_or(u32::MAX);
        loop {
            self.shared.write_staged().await?;
            // Holding every permit means no background write is in flight.
            let all = self
                .shared
                .write_permits
                .acquire_many(permits)
                .await
                .map_err(|_| BatchError::Closed)?;
            drop(all);
            let done = lock(&self.shared.staged).chunks.is_empty();
            if done {
                return Ok(());
            }
        }
    }

    /// Number of chunks not yet acknowledged by the backend.
    pub fn unwritten(&self) -> usize {
        read(&self.shared.unwritten).len()
    }

    pub async fn root(&self) -> Result<Hash, BatchStoreError<S>> {
        root_result(self.shared.blocking(|store| store.root()).await)
    }

    /// Flushes, then sets the root to `current` if it still is `last`.
    ///
    /// `Ok(false)` means another writer moved the root; read it again and
    /// retry.
    pub async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, BatchStoreError<S>> {
        self.flush().await?;
        let updated = root_result(
            self.shared
                .blocking(move |store| store.update_root(current, last))
                .await,
        )?;
        if updated {
            info!(%current, %last, "root updated");
        } else {
            debug!(%current, %last, "root update rejected");
        }
        Ok(updated)
    }

    pub fn stats(&self) -> BatchStats {
        self.shared.counters.snapshot()
    }

    /// Flushes and logs the collected statistics.
    pub async fn close(self) -> Result<BatchStats, BatchStoreError<S>> {
        self.flush().await?;
        let stats = self.stats();
        info!(%stats, "batch store closed");
        Ok(stats)
    }
}

impl<S> Drop for BatchStore<S> {
    fn drop(&mut self) {
        let staged = lock(&self.shared.staged).chunks.len();
        if staged > 0 {
            warn!(staged, "batch store dropped with unflushed chunks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn zero_config_is_clamped() {
        let config = BatchConfig {
            read_batch_size: 0,
            write_batch_size: 0,
            max_reads: 0,
            max_writes: usize::MAX,
        }
        .normalized();
        assert_eq!(config.read_batch_size, 1);
        assert_eq!(config.write_batch_size, 1);
        assert_eq!(config.max_reads, 1);
        assert_eq!(config.max_writes, MAX_IN_FLIGHT);
    }

    #[test]
    fn stats_summary() {
        let stats = BatchStats {
            read_batches: 2,
            chunks_requested: 10,
            chunks_found: 7,
            read_time: Duration::from_millis(4),
            write_batches: 1,
            chunks_written: 3,
            write_time: Duration::from_millis(1),
            failed_batches: 0,
        };
        assert_eq!(
            stats.to_string(),
            "reads: 2 batches, 7/10 chunks found, 2ms avg; writes: 1 batches, 3 chunks, 1ms avg"
        );
        assert_eq!(average(Duration::from_secs(1), 0), Duration::ZERO);
    }

    #[tokio::test]
    async fn staged_chunks_are_readable() {
        let store = BatchStore::new(MemoryStore::new(), BatchConfig::default());
        let chunk = Chunk::new("abc");
        store.schedule_put(chunk.clone(), []);

        assert_eq!(store.get(&chunk.hash()).await, chunk);
        assert!(store.has(&chunk.hash()).await.unwrap());
        assert!(store.store().is_empty());
        assert_eq!(store.unwritten(), 1);

        store.flush().await.unwrap();
        assert_eq!(store.store().len(), 1);
        assert_eq!(store.unwritten(), 0);
        assert_eq!(store.get(&chunk.hash()).await, chunk);
    }

    #[tokio::test]
    async fn absent_chunk_is_empty() {
        let store = BatchStore::new(MemoryStore::new(), BatchConfig::default());
        assert!(store.get(&Hash::of(b"nope")).await.is_empty());
        assert!(!store.has(&Hash::of(b"nope")).await.unwrap());
    }

    #[tokio::test]
    async fn update_root_flushes_first() {
        let store = BatchStore::new(MemoryStore::new(), BatchConfig::default());
        let chunk = Chunk::new("head");
        store.schedule_put(chunk.clone(), []);

        assert!(store.update_root(chunk.hash(), Hash::EMPTY).await.unwrap());
        assert!(store.store().has(&chunk.hash()).unwrap());
        assert_eq!(store.root().await.unwrap(), chunk.hash());

        assert!(!store.update_root(Hash::of(b"x"), Hash::EMPTY).await.unwrap());
        assert_eq!(store.root().await.unwrap(), chunk.hash());
    }

    #[tokio::test]
    async fn close_reports_stats() {
        let store = BatchStore::new(MemoryStore::new(), BatchConfig::default());
        store.schedule_put(Chunk::new("a"), []);
        store.schedule_put(Chunk::new("b"), []);
        let stats = store.close().await.unwrap();
        assert_eq!(stats.write_batches, 1);
        assert_eq!(stats.chunks_written, 2);
    }
}
