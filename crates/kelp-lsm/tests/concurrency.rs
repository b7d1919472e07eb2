//! Concurrency stress tests
//!
//! - Reservations from many threads never push total + pending past the
//!   budget, as seen by a concurrent reader
//! - Accounting does not drift under concurrent commit/release
//! - Racing failures produce exactly one background error
//! - Writers and flushers running together lose nothing

mod common;

use common::*;
use kelp_lsm::{
    ColumnFamilyDescriptor, Engine, EngineConfig, EngineContext, Error, PathSpaceTracker,
    SpaceBudgetEnforcer, WriteBatch, WriteOptions,
};
use kelp_observe::{CapturingMeter, SpaceKind};
use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 500;

#[test]
fn test_concurrent_reservations_respect_budget() {
    let budget = 4 * MIB;
    let enforcer = SpaceBudgetEnforcer::new(budget, Duration::from_secs(60));
    let tracker = Arc::new(PathSpaceTracker::new());
    let dir = Path::new("/virtual/p0");
    tracker.register(dir, 0).unwrap();
    enforcer.add_tracker(Arc::clone(&tracker));

    let next_file = AtomicU64::new(1);
    let done = AtomicBool::new(false);
    let denials = AtomicU64::new(0);

    thread::scope(|s| {
        // Reader: every snapshot must stay within budget
        let reader = s.spawn(|| {
            let mut checks = 0u64;
            while !done.load(Ordering::Acquire) {
                let usage = enforcer.usage();
                assert!(
                    usage.total_size + usage.pending_bytes <= budget,
                    "over budget: {:?}",
                    usage
                );
                checks += 1;
            }
            checks
        });

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    let mut rng = rand::thread_rng();
                    let mut committed = Vec::new();
                    for _ in 0..OPS_PER_THREAD {
                        let estimate = rng.gen_range(1..=128 * 1024);
                        let reservation = match enforcer.try_reserve(estimate) {
                            Ok(r) => r,
                            Err(Error::SpaceLimit { .. }) => {
                                denials.fetch_add(1, Ordering::Relaxed);
                                // Make room
                                if let Some(n) = committed.pop() {
                                    enforcer.release_file(&tracker, dir, n).unwrap();
                                }
                                continue;
                            }
                            Err(e) => panic!("unexpected error: {}", e),
                        };

                        match rng.gen_range(0..3) {
                            0 => reservation.release(),
                            1 => drop(reservation),
                            _ => {
                                let n = next_file.fetch_add(1, Ordering::Relaxed);
                                let actual = rng.gen_range(1..=estimate);
                                reservation.commit(&tracker, dir, n, actual).unwrap();
                                committed.push(n);
                            }
                        }
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
    });

    let usage = enforcer.usage();
    assert_eq!(usage.pending_bytes, 0);
    assert_eq!(usage.outstanding_reservations, 0);
    let file_sum: u64 = tracker.files().iter().map(|f| f.size).sum();
    assert_eq!(usage.total_size, file_sum);
    assert_eq!(tracker.total(), file_sum);
    assert!(denials.load(Ordering::Relaxed) > 0, "budget never pressed");
}

#[test]
fn test_first_failure_wins() {
    let dir = TempDir::new().unwrap();
    let families = (0..THREADS)
        .map(|i| ColumnFamilyDescriptor::new(format!("cf{}", i), dir.path().join(format!("cf{}", i))))
        .collect();
    let config = EngineConfig {
        column_families: families,
        max_allowed_space: 1024,
        ..Default::default()
    };
    let meter = CapturingMeter::new();
    let ctx = EngineContext {
        meter: Arc::new(meter.clone()),
        ..Default::default()
    };
    let engine = Engine::open_with(config, ctx).unwrap();
    let handles = engine.column_families();
    for cf in &handles {
        write_keys(&engine, cf, "k", 20, 512);
    }

    thread::scope(|s| {
        for cf in &handles {
            let engine = &engine;
            s.spawn(move || {
                let result = engine.flush(cf);
                assert!(matches!(
                    result,
                    Err(Error::FlushFailed { .. }) | Err(Error::BackgroundError { .. })
                ));
            });
        }
    });

    let transitions = meter
        .space_events()
        .into_iter()
        .filter(|k| matches!(k, SpaceKind::BackgroundError { .. }))
        .count();
    assert_eq!(transitions, 1);
    assert_eq!(engine.get_total_size(), 0);
    assert_eq!(engine.space_usage().pending_bytes, 0);
    for cf in &handles {
        assert_eq!(engine.buffered_entries(cf).unwrap().len(), 20);
    }
}

#[test]
fn test_writers_and_flushers() {
    let dir = TempDir::new().unwrap();
    let (engine, cf) = open(&dir, 0);
    let done = AtomicBool::new(false);
    let per_writer = 2_000;

    thread::scope(|s| {
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let (engine, cf) = (&engine, &cf);
                s.spawn(move || {
                    for i in 0..per_writer {
                        let mut batch = WriteBatch::new();
                        batch.put(cf, format!("w{}-{:06}", w, i), format!("v{}", i));
                        engine.put(&batch, &WriteOptions::default()).unwrap();
                    }
                })
            })
            .collect();

        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                engine.flush(&cf).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        });

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });
    engine.flush(&cf).unwrap();

    for w in 0..4 {
        for i in (0..per_writer).step_by(97) {
            let key = format!("w{}-{:06}", w, i);
            assert_eq!(
                engine.get(&cf, key.as_bytes()).unwrap(),
                Some(bytes::Bytes::from(format!("v{}", i))),
                "lost {}",
                key
            );
        }
    }
    assert!(engine.buffered_entries(&cf).unwrap().is_empty());
    assert_eq!(
        engine.get_total_size(),
        sst_bytes_on_disk(&dir.path().join("default"))
    );
}
