mod util;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chunkstore::prelude::*;
use futures::future::join_all;
use util::{chunks, CountingStore, Unavailable};

fn hashes(chunks: &[Chunk]) -> BTreeSet<Hash> {
    chunks.iter().map(Chunk::hash).collect()
}

#[tokio::test]
async fn concurrent_reads_of_one_hash_share_a_fetch() {
    let chunk = Chunk::new("shared");
    let batch = BatchStore::new(
        CountingStore::with_chunks(&[chunk.clone()]),
        BatchConfig::default(),
    );

    let hash = chunk.hash();
    let (a, b) = tokio::join!(batch.get(&hash), batch.get(&hash));
    assert_eq!(a, chunk);
    assert_eq!(b, chunk);

    let reads = batch.store().read_batches();
    assert_eq!(reads, vec![BTreeSet::from([chunk.hash()])]);
}

#[tokio::test]
async fn concurrent_reads_are_coalesced() {
    let all = chunks(10);
    let batch = BatchStore::new(CountingStore::with_chunks(&all), BatchConfig::default());

    let requested: Vec<Hash> = all.iter().map(Chunk::hash).collect();
    let found = join_all(requested.iter().map(|hash| batch.get(hash))).await;
    assert_eq!(found, all);

    let reads = batch.store().read_batches();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0], hashes(&all));
}

#[tokio::test]
async fn read_batches_are_capped() {
    let all = chunks(10);
    let config = BatchConfig {
        read_batch_size: 4,
        ..BatchConfig::default()
    };
    let batch = BatchStore::new(CountingStore::with_chunks(&all), config);

    let found = batch.get_many(&hashes(&all)).await;
    assert_eq!(found.len(), 10);

    let reads = batch.store().read_batches();
    let mut sizes: Vec<_> = reads.iter().map(BTreeSet::len).collect();
    sizes.sort();
    assert_eq!(sizes, vec![2, 4, 4]);
    let requested: BTreeSet<Hash> = reads.into_iter().flatten().collect();
    assert_eq!(requested, hashes(&all));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_reads_are_capped() {
    let all = chunks(5);
    let store = CountingStore::with_chunks(&all);
    store.read_delay_ms.store(20, Ordering::SeqCst);
    let config = BatchConfig {
        read_batch_size: 1,
        max_reads: 1,
        ..BatchConfig::default()
    };
    let batch = BatchStore::new(store, config);

    let found = batch.get_many(&hashes(&all)).await;
    assert_eq!(found.len(), 5);
    assert_eq!(batch.store().read_batches().len(), 5);
    assert_eq!(batch.store().max_reads_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_racing_a_write_sees_the_chunk() {
    let store = CountingStore::new();
    store.read_delay_ms.store(200, Ordering::SeqCst);
    let batch = BatchStore::new(store, BatchConfig::default());
    let chunk = Chunk::new("raced");
    let hash = chunk.hash();

    let early = batch.get(&hash);
    let late = async {
        // The first fetch has seen an empty backend by now.
        tokio::time::sleep(Duration::from_millis(50)).await;
        batch.schedule_put(chunk.clone(), []);
        batch.flush().await.unwrap();
        assert!(batch.store().inner.has(&hash).unwrap());
        batch.get(&hash).await
    };
    let (early, late) = tokio::join!(early, late);
    assert_eq!(early, chunk);
    assert_eq!(late, chunk);
    assert_eq!(batch.store().read_batches().len(), 2);
}

#[tokio::test]
async fn missing_chunks_are_empty() {
    let present = Chunk::new("present");
    let batch = BatchStore::new(
        CountingStore::with_chunks(&[present.clone()]),
        BatchConfig::default(),
    );
    let missing = Hash::of(b"missing");

    let present_hash = present.hash();
    let (found, absent) = tokio::join!(batch.get(&present_hash), batch.get(&missing));
    assert_eq!(found, present);
    assert!(absent.is_empty());

    let query = BTreeSet::from([present.hash(), missing]);
    assert_eq!(batch.get_many(&query).await, vec![present]);
}

#[tokio::test]
async fn failed_read_yields_empty_chunks() {
    let chunk = Chunk::new("unreachable");
    let store = CountingStore::with_chunks(&[chunk.clone()]);
    store.fail_reads.store(true, Ordering::SeqCst);
    let batch = BatchStore::new(store, BatchConfig::default());

    assert!(batch.get(&chunk.hash()).await.is_empty());
    assert_eq!(batch.stats().failed_batches, 1);

    // A later read issues a new fetch instead of remembering the failure.
    batch.store().fail_reads.store(false, Ordering::SeqCst);
    assert_eq!(batch.get(&chunk.hash()).await, chunk);
    assert_eq!(batch.store().read_batches().len(), 2);
}

#[tokio::test]
async fn unwritten_chunks_are_read_locally() {
    let batch = BatchStore::new(CountingStore::new(), BatchConfig::default());
    let chunk = Chunk::new("fresh");
    batch.schedule_put(chunk.clone(), []);

    assert_eq!(batch.get(&chunk.hash()).await, chunk);
    assert!(batch.has(&chunk.hash()).await.unwrap());
    assert!(batch.store().read_batches().is_empty());
    assert!(batch.store().inner.is_empty());
}

#[tokio::test]
async fn has_many_checks_buffer_then_backend() {
    let stored = Chunk::new("stored");
    let batch = BatchStore::new(
        CountingStore::with_chunks(&[stored.clone()]),
        BatchConfig::default(),
    );
    let staged = Chunk::new("staged");
    batch.schedule_put(staged.clone(), []);
    let missing = Hash::of(b"missing");

    let query = BTreeSet::from([stored.hash(), staged.hash(), missing]);
    assert_eq!(batch.has_many(&query).await.unwrap(), BTreeSet::from([missing]));
}

#[tokio::test]
async fn flush_sends_one_batch_with_all_hints() {
    let batch = BatchStore::new(CountingStore::new(), BatchConfig::default());
    let all = chunks(3);
    let hint_a = Hash::of(b"a");
    let hint_b = Hash::of(b"b");

    batch.schedule_put(all[0].clone(), [hint_a]);
    batch.schedule_put(all[1].clone(), [hint_b]);
    batch.schedule_put(all[2].clone(), []);
    // Scheduling again only merges hints.
    batch.schedule_put(all[0].clone(), [hint_b]);
    batch.flush().await.unwrap();

    let writes = batch.store().write_batches();
    assert_eq!(writes.len(), 1);
    let (written, hints) = &writes[0];
    assert_eq!(written.iter().copied().collect::<BTreeSet<_>>(), hashes(&all));
    assert_eq!(written.len(), 3);
    assert_eq!(hints, &BTreeSet::from([hint_a, hint_b]));

    assert_eq!(batch.store().inner.len(), 3);
    assert_eq!(batch.unwritten(), 0);

    // Nothing left to send.
    batch.flush().await.unwrap();
    assert_eq!(batch.store().write_batches().len(), 1);
}

#[tokio::test]
async fn full_batch_is_written_in_the_background() {
    let config = BatchConfig {
        write_batch_size: 3,
        ..BatchConfig::default()
    };
    let batch = BatchStore::new(CountingStore::new(), config);
    for chunk in chunks(3) {
        batch.schedule_put(chunk, []);
    }

    for _ in 0..200 {
        if batch.unwritten() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(batch.unwritten(), 0);
    assert_eq!(batch.store().inner.len(), 3);
    assert_eq!(batch.store().write_batches().len(), 1);
    assert_eq!(batch.stats().chunks_written, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_writes_are_capped() {
    let store = CountingStore::new();
    store.write_delay_ms.store(20, Ordering::SeqCst);
    let config = BatchConfig {
        write_batch_size: 1,
        max_writes: 1,
        ..BatchConfig::default()
    };
    let batch = BatchStore::new(store, config);
    for chunk in chunks(4) {
        batch.schedule_put(chunk, []);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    batch.flush().await.unwrap();
    assert_eq!(batch.unwritten(), 0);
    assert_eq!(batch.store().inner.len(), 4);
    assert!(batch.store().write_batches().len() >= 2);
    assert_eq!(batch.store().max_writes_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_write_keeps_chunks_staged() {
    let batch = BatchStore::new(CountingStore::new(), BatchConfig::default());
    batch.store().fail_writes.store(true, Ordering::SeqCst);
    let all = chunks(2);
    batch.schedule_put(all[0].clone(), [Hash::of(b"hint")]);
    batch.schedule_put(all[1].clone(), []);

    match batch.flush().await {
        Err(BatchError::Chunks(Unavailable)) => {}
        other => panic!("expected a chunk store error, got {other:?}"),
    }
    assert_eq!(batch.unwritten(), 2);
    assert_eq!(batch.get(&all[1].hash()).await, all[1]);
    assert!(batch.store().inner.is_empty());

    batch.store().fail_writes.store(false, Ordering::SeqCst);
    batch.flush().await.unwrap();
    assert_eq!(batch.store().inner.len(), 2);
    let writes = batch.store().write_batches();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, BTreeSet::from([Hash::of(b"hint")]));

    let stats = batch.stats();
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.write_batches, 1);
}

#[tokio::test]
async fn update_root_writes_chunks_first() {
    let batch = BatchStore::new(CountingStore::new(), BatchConfig::default());
    let head = Chunk::new("head");
    batch.schedule_put(head.clone(), []);

    assert!(batch.update_root(head.hash(), Hash::EMPTY).await.unwrap());
    assert!(batch.store().inner.has(&head.hash()).unwrap());
    assert_eq!(batch.root().await.unwrap(), head.hash());

    let other = Hash::of(b"other");
    assert!(!batch.update_root(other, Hash::EMPTY).await.unwrap());
    assert!(batch.update_root(other, head.hash()).await.unwrap());
    assert_eq!(batch.root().await.unwrap(), other);
}

#[tokio::test]
async fn batch_stores_share_a_backend() {
    let backend = Arc::new(MemoryStore::new());
    let a = BatchStore::new(Arc::clone(&backend), BatchConfig::default());
    let b = BatchStore::new(Arc::clone(&backend), BatchConfig::default());

    let chunk = Chunk::new("from a");
    a.schedule_put(chunk.clone(), []);
    assert!(b.get(&chunk.hash()).await.is_empty());
    a.flush().await.unwrap();
    assert_eq!(b.get(&chunk.hash()).await, chunk);

    let x = Hash::of(b"x");
    let y = Hash::of(b"y");
    assert!(a.update_root(x, Hash::EMPTY).await.unwrap());
    assert!(!b.update_root(y, Hash::EMPTY).await.unwrap());
    assert_eq!(b.root().await.unwrap(), x);
    assert!(b.update_root(y, x).await.unwrap());
    assert_eq!(a.root().await.unwrap(), y);
    assert_eq!(backend.len(), 1);
}
