//! Concurrency and lifecycle tests for PrefetchPipeline.
//!
//! Tests cover:
//! - Delivery order equals production order
//! - No slot is ever observed half-written
//! - Slot conservation across the pool
//! - Shutdown while the worker is idle, blocked, or mid-batch
//! - Repeated setup / teardown cycles and drop cleanup
//! - A panicking loader aborts the process instead of stalling the consumer

mod common;
use common::{init_tracing, sequence_config, SequenceLoader};

use anyhow::{anyhow, Result};
use batch_prefetch::{
    prefetch::{prefetch_gen_range, PrefetchConfig, PrefetchPipeline, WorkerState},
    ArraySpec, BatchLoader, BatchSlot,
};
use std::collections::HashSet;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tch::{Kind, Tensor};

// ============================================================================
// Helper Loaders
// ============================================================================

/// Writes batch `k` one row at a time, yielding between rows so a reader
/// racing the writer would see a mix of values.
struct RowByRowLoader {
    next: i64,
    rows: i64,
    cols: i64,
}

impl BatchLoader for RowByRowLoader {
    fn load_batch(&mut self, slot: &mut BatchSlot) -> Result<()> {
        self.next += 1;
        let data = slot.reshape_data(&[self.rows, self.cols]);
        for row in 0..self.rows {
            let _ = data.narrow(0, row, 1).fill_(self.next);
            if row % 8 == 0 {
                thread::yield_now();
            }
        }
        Ok(())
    }
}

/// Records every slot id it is handed and sleeps a little, jittered.
struct IdRecordingLoader {
    next: i64,
    seen: Arc<Mutex<HashSet<usize>>>,
}

impl BatchLoader for IdRecordingLoader {
    fn load_batch(&mut self, slot: &mut BatchSlot) -> Result<()> {
        self.next += 1;
        self.seen
            .lock()
            .map_err(|_| anyhow!("seen-set lock poisoned"))?
            .insert(slot.id());
        let _ = slot.reshape_data(&[1]).fill_(self.next);
        thread::sleep(Duration::from_micros(prefetch_gen_range(0..500u64)));
        Ok(())
    }
}

/// Sleeps for `delay` on every batch.
struct SlowLoader {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl BatchLoader for SlowLoader {
    fn load_batch(&mut self, slot: &mut BatchSlot) -> Result<()> {
        let k = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        thread::sleep(self.delay);
        let _ = slot.reshape_data(&[1]).fill_(k as i64);
        Ok(())
    }
}

fn int_config(pool_size: usize) -> PrefetchConfig {
    PrefetchConfig::builder()
        .pool_size(pool_size)
        .data(ArraySpec::new([1], Kind::Int64))
        .stall_warning_interval(Duration::from_millis(100))
        .build()
}

// ============================================================================
// 1. Ordering
// ============================================================================
#[test]
fn test_delivery_order_matches_production_order() -> Result<()> {
    init_tracing();

    for pool_size in [1, 2, 3, 5] {
        let mut pipeline = PrefetchPipeline::new(SequenceLoader::new(), sequence_config(pool_size).build())?;
        pipeline.setup(false, false)?;

        let mut data = Tensor::new();
        let mut previous = 0.0;
        for _ in 0..(pool_size + 40) {
            pipeline.produce_next(&mut data, &mut [])?;
            let current = data.double_value(&[0, 0]);
            assert_eq!(
                current,
                previous + 1.0,
                "pool_size {}: got batch {} after {}",
                pool_size,
                current,
                previous
            );
            previous = current;
        }
        pipeline.teardown()?;
    }
    Ok(())
}

// ============================================================================
// 2. No concurrent mutation
// ============================================================================
#[test]
fn test_consumer_never_sees_half_written_slot() -> Result<()> {
    let loader = RowByRowLoader {
        next: 0,
        rows: 64,
        cols: 256,
    };
    let config = PrefetchConfig::builder()
        .pool_size(3)
        .data(ArraySpec::new([64, 256], Kind::Float))
        .build();

    let mut pipeline = PrefetchPipeline::new(loader, config)?;
    pipeline.setup(false, false)?;

    let mut data = Tensor::new();
    for k in 1..=300i64 {
        pipeline.produce_next(&mut data, &mut [])?;
        let min = data.min().double_value(&[]);
        let max = data.max().double_value(&[]);
        assert_eq!(min, max, "batch {} is mixed: min {} max {}", k, min, max);
        assert_eq!(min, k as f64);

        // Slow the consumer down now and then so both sides take turns waiting.
        if k % 50 == 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    pipeline.teardown()?;
    Ok(())
}

// ============================================================================
// 3. Slot conservation
// ============================================================================
#[test]
fn test_slot_conservation() -> Result<()> {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let loader = IdRecordingLoader {
        next: 0,
        seen: seen.clone(),
    };
    let config = PrefetchConfig::builder()
        .pool_size(3)
        .data(ArraySpec::new([1], Kind::Int64))
        .seed(99)
        .build();

    let mut pipeline = PrefetchPipeline::new(loader, config)?;
    pipeline.setup(false, false)?;

    let mut data = Tensor::new();
    for _ in 0..200 {
        pipeline.produce_next(&mut data, &mut [])?;
        // Queued slots never exceed the pool.
        assert!(pipeline.free_len() + pipeline.full_len() <= 3);
    }

    assert_eq!(pipeline.teardown()?, 3);

    let seen = seen.lock().map_err(|_| anyhow!("seen-set lock poisoned"))?;
    assert!(seen.iter().all(|&id| id < 3), "unexpected slot ids {:?}", seen);
    assert_eq!(seen.len(), 3);
    Ok(())
}

// ============================================================================
// 4. Shutdown safety
// ============================================================================
#[test]
fn test_teardown_while_worker_blocked_on_free_queue() -> Result<()> {
    let mut pipeline = PrefetchPipeline::new(SequenceLoader::new(), sequence_config(3).build())?;
    pipeline.setup(false, false)?;

    // Nothing is consumed: the worker fills all three slots and then blocks.
    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.full_len() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pipeline.full_len(), 3);

    let started = Instant::now();
    assert_eq!(pipeline.teardown()?, 3);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(pipeline.worker_state(), WorkerState::Stopped);
    Ok(())
}

#[test]
fn test_teardown_waits_for_batch_in_flight() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = SlowLoader {
        delay: Duration::from_millis(150),
        calls: calls.clone(),
    };
    let mut pipeline = PrefetchPipeline::new(loader, int_config(2))?;
    pipeline.setup(false, false)?;

    let mut data = Tensor::new();
    pipeline.produce_next(&mut data, &mut [])?;
    assert_eq!(data.int64_value(&[0]), 1);

    // The worker is now sleeping inside a load; teardown lets it finish.
    let started = Instant::now();
    assert_eq!(pipeline.teardown()?, 2);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(pipeline.worker_state(), WorkerState::Stopped);

    let after_teardown = calls.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(calls.load(Ordering::SeqCst), after_teardown);
    Ok(())
}

#[test]
fn test_consumer_waits_out_slow_loader() -> Result<()> {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = SlowLoader {
        // Longer than the stall warning interval, so warnings are logged.
        delay: Duration::from_millis(250),
        calls,
    };
    let mut pipeline = PrefetchPipeline::new(loader, int_config(2))?;
    pipeline.setup(false, false)?;

    let mut data = Tensor::new();
    for k in 1..=3 {
        pipeline.produce_next(&mut data, &mut [])?;
        assert_eq!(data.int64_value(&[0]), k);
    }
    pipeline.teardown()?;
    Ok(())
}

// ============================================================================
// 5. Lifecycle
// ============================================================================
#[test]
fn test_repeated_setup_teardown_cycles() -> Result<()> {
    let mut pipeline = PrefetchPipeline::new(SequenceLoader::new(), sequence_config(3).build())?;
    let mut data = Tensor::new();
    let mut labels = [Tensor::new(), Tensor::new()];

    for cycle in 0..5 {
        let with_labels = cycle % 2 == 1;
        pipeline.setup(with_labels, cycle == 4)?;
        assert!(matches!(
            pipeline.worker_state(),
            WorkerState::Running | WorkerState::Stopping
        ));

        let mut previous = 0.0;
        for _ in 0..10 {
            if with_labels {
                pipeline.produce_next(&mut data, &mut labels)?;
            } else {
                pipeline.produce_next(&mut data, &mut [])?;
            }
            let current = data.double_value(&[0, 0]);
            assert!(current > previous);
            previous = current;
        }

        assert_eq!(pipeline.teardown()?, 3);
        assert_eq!(pipeline.worker_state(), WorkerState::Stopped);
    }
    Ok(())
}

#[test]
fn test_drop_joins_worker_and_releases_loader() -> Result<()> {
    let marker = Arc::new(());
    let held = marker.clone();
    let loader = move |slot: &mut BatchSlot| -> Result<()> {
        let _ = &held;
        let _ = slot.reshape_data(&[1]).fill_(1i64);
        Ok(())
    };

    let mut pipeline = PrefetchPipeline::new(loader, int_config(3))?;
    pipeline.setup(false, false)?;
    let mut data = Tensor::new();
    pipeline.produce_next(&mut data, &mut [])?;
    assert_eq!(Arc::strong_count(&marker), 2);

    drop(pipeline);

    // The worker thread returned the loader and it was dropped with the pipeline.
    assert_eq!(Arc::strong_count(&marker), 1);
    Ok(())
}

// ============================================================================
// 6. Fatal loader faults
// ============================================================================
const PANIC_CHILD_ENV: &str = "BATCH_PREFETCH_PANIC_CHILD";

/// Child side: a loader that panics on its second batch. The consumer's
/// second `produce_next` must never return; the worker aborts the process.
fn run_panicking_loader() -> Result<()> {
    // If the abort never comes, exit cleanly so the parent sees success and fails.
    thread::spawn(|| {
        thread::sleep(Duration::from_secs(10));
        std::process::exit(0);
    });

    let mut calls = 0i64;
    let loader = move |slot: &mut BatchSlot| -> Result<()> {
        calls += 1;
        if calls == 2 {
            panic!("loader blew up on batch {}", calls);
        }
        let _ = slot.reshape_data(&[1]).fill_(calls);
        Ok(())
    };
    let mut pipeline = PrefetchPipeline::new(loader, int_config(2))?;
    pipeline.setup(false, false)?;

    let mut data = Tensor::new();
    pipeline.produce_next(&mut data, &mut [])?;
    pipeline.produce_next(&mut data, &mut [])?;
    Ok(())
}

#[test]
fn test_loader_panic_aborts_process() -> Result<()> {
    if std::env::var_os(PANIC_CHILD_ENV).is_some() {
        return run_panicking_loader();
    }

    let output = Command::new(std::env::current_exe()?)
        .args([
            "--exact",
            "test_loader_panic_aborts_process",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(PANIC_CHILD_ENV, "1")
        .output()?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "child exited cleanly: {}", stderr);
    assert!(stderr.contains("Fatal prefetch error"), "{}", stderr);
    assert!(stderr.contains("loader blew up on batch 2"), "{}", stderr);
    Ok(())
}
