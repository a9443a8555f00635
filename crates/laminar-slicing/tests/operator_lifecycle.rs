//! End-to-end window operator tests.
//!
//! Drives the operator from several threads and checks the cross-module
//! guarantees: one slice per interval, monotonic global watermark,
//! exactly-once emission and an empty store after termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use laminar_slicing::buffer::{FixedBufferPool, Record, RecordBuffer};
use laminar_slicing::config::{CachePolicy, SliceCacheConfig, SliceKind, WindowOperatorConfig, WindowSpec};
use laminar_slicing::operator::{CollectingProbe, TerminationType, WindowOperator};
use laminar_slicing::sequence::SequenceData;
use laminar_slicing::slice::{JoinSide, SliceAssigner, SliceStore};
use laminar_slicing::time::Watermark;
use laminar_slicing::OriginId;

fn records(timestamps: impl IntoIterator<Item = u64>) -> Vec<Record> {
    timestamps
        .into_iter()
        .map(|ts| Record::new(ts, ts % 3, 1))
        .collect()
}

// ── Slice store ──

#[test]
fn test_concurrent_get_or_create_has_one_winner() {
    let store = Arc::new(SliceStore::new(
        SliceAssigner::new(WindowSpec::tumbling(100)),
        SliceKind::Aggregation,
        4,
    ));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.get_or_create_slice(10 + t).unwrap()
            })
        })
        .collect();
    let slices: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(slices.iter().all(|s| Arc::ptr_eq(s, &slices[0])));
    assert_eq!(store.created_count(), 1);
    assert_eq!(store.len(), 1);
}

// ── Multi-threaded ingestion ──

#[test]
fn test_parallel_origins_emit_every_record_once() {
    const ORIGINS: u64 = 4;
    const BUFFERS: u64 = 50;

    let config = WindowOperatorConfig::builder()
        .tumbling(10)
        .worker_threads(ORIGINS as usize)
        .build()
        .unwrap();
    let operator = Arc::new(WindowOperator::new(config, CollectingProbe::default()));
    for t in 0..ORIGINS {
        operator.create_origin(OriginId(t));
    }

    let done = Arc::new(AtomicBool::new(false));
    let observer = {
        let operator = Arc::clone(&operator);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last = Watermark::default();
            while !done.load(Ordering::Acquire) {
                let current = operator.current_watermark();
                assert!(current >= last, "global watermark moved back: {last} -> {current}");
                last = current;
                thread::yield_now();
            }
        })
    };

    let writers: Vec<_> = (0..ORIGINS)
        .map(|t| {
            let operator = Arc::clone(&operator);
            thread::spawn(move || {
                // Submit pairs swapped: 2, 1, 4, 3, ...
                for pair in (1..=BUFFERS).step_by(2) {
                    for seq in [pair + 1, pair] {
                        let buffer = RecordBuffer::new(OriginId(t), SequenceData::single(seq), seq * 10)
                            .with_records(records([seq * 10 + t]));
                        operator.submit(t as usize, buffer).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    observer.join().unwrap();

    assert_eq!(operator.current_watermark(), Watermark::new(BUFFERS * 10));
    assert_eq!(operator.late_data_metrics().late_records_total(), 0);

    operator.terminate(TerminationType::Graceful).unwrap();
    assert!(operator.store().get_all_slices().is_empty());

    let emitted = operator.probe().emitted();
    let total: u64 = emitted.iter().map(|e| e.counts.left).sum();
    assert_eq!(total, ORIGINS * BUFFERS);

    let mut starts: Vec<_> = emitted.iter().map(|e| e.meta.slice_start).collect();
    let emitted_count = starts.len();
    starts.sort_unstable();
    starts.dedup();
    assert_eq!(starts.len(), emitted_count, "a slice was emitted twice");

    // Only the slice holding the last buffer's records needed the forced flush.
    let forced: Vec<_> = emitted.iter().filter(|e| e.meta.forced).map(|e| e.meta.slice_start).collect();
    assert_eq!(forced, vec![BUFFERS * 10]);
}

// ── Sliding join ──

#[test]
fn test_sliding_join_lifecycle() {
    let config = WindowOperatorConfig::builder()
        .sliding(20, 10)
        .slice_kind(SliceKind::Join)
        .partitions(4)
        .slice_cache(SliceCacheConfig {
            enable_slice_cache: true,
            policy: CachePolicy::SecondChance,
            number_of_entries: 2,
        })
        .build()
        .unwrap();
    let operator = WindowOperator::new(config, CollectingProbe::default());
    let (left, right) = (OriginId(1), OriginId(2));
    operator.create_origin(left);
    operator.create_origin(right);

    let buffer = |origin, seq, wm, ts: &[u64]| {
        RecordBuffer::new(origin, SequenceData::single(seq), wm).with_records(
            ts.iter()
                .map(|&t| Record::new(t, t % 2, 0).with_payload(t.to_le_bytes().to_vec()))
                .collect(),
        )
    };

    operator
        .submit_join(0, JoinSide::Left, buffer(left, 1, 15, &[1, 11, 14]))
        .unwrap();
    operator
        .submit_join(1, JoinSide::Right, buffer(right, 1, 12, &[2, 3, 12]))
        .unwrap();
    // min(15, 12): only [0, 10) closed.
    let emitted = operator.probe().drain();
    assert_eq!(emitted.len(), 1);
    assert_eq!((emitted[0].counts.left, emitted[0].counts.right), (1, 2));
    assert_eq!(emitted[0].meta.windows.len(), 1);
    assert_eq!(emitted[0].meta.completed_window, None);

    // [0, 10) is still needed by window [0, 20).
    assert_eq!(operator.store().len(), 2);

    operator
        .submit_join(1, JoinSide::Right, buffer(right, 2, 40, &[25]))
        .unwrap();
    assert!(operator.probe().emitted().is_empty());
    operator
        .submit_join(0, JoinSide::Left, buffer(left, 2, 20, &[]))
        .unwrap();
    let emitted = operator.probe().drain();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].meta.slice_start, 10);
    assert_eq!(emitted[0].meta.windows.len(), 2);
    assert!(emitted[0].meta.completed_window.is_some());

    // [0, 10) left with window [0, 20); the left watermark holds [20, 30) open.
    let starts: Vec<_> = operator.store().get_all_slices().iter().map(|s| s.start()).collect();
    assert_eq!(starts, vec![10, 20]);

    operator.terminate(TerminationType::Graceful).unwrap();
    assert!(operator.store().get_all_slices().is_empty());
    assert_eq!(operator.probe().drain().len(), 1);
}

// ── Cache staleness ──

#[test]
fn test_cached_slice_replaced_after_migration() {
    let config = WindowOperatorConfig::builder().tumbling(10).build().unwrap();
    let operator = WindowOperator::new(config, CollectingProbe::default());
    let origin = OriginId(1);
    operator.create_origin(origin);

    let buffer = |seq, ts| {
        RecordBuffer::new(origin, SequenceData::single(seq), 0).with_records(records([ts]))
    };
    operator.process(0, &buffer(1, 5)).unwrap();

    let pool = FixedBufferPool::new(64, 16);
    let buffers = operator.state_to_migrate(0, 10, &pool).unwrap();
    assert!(operator.store().is_empty());

    // The worker cache still points at the removed slice.
    operator.process(0, &buffer(2, 6)).unwrap();
    let metrics = operator.cache_metrics(0);
    assert_eq!(metrics.stale, 1);
    assert_eq!(metrics.hits, 0);

    let slice = operator.store().get_slice(0).unwrap();
    assert_eq!(slice.tuple_counts().left, 1);

    operator.restore_state(&buffers).unwrap();
    assert_eq!(slice.tuple_counts().left, 2);

    operator.process(0, &buffer(3, 7)).unwrap();
    assert_eq!(operator.cache_metrics(0).hits, 1);
    assert_eq!(slice.tuple_counts().left, 3);
}
