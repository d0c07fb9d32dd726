#![allow(dead_code)]

use anyhow::Result;
use batch_prefetch::prefetch::PrefetchConfigBuilder;
use batch_prefetch::{ArraySpec, BatchSlot, PrefetchConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tch::{Device, Kind};

/// Routes `tracing` output to the test harness. Set `RUST_LOG=debug` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Number of rows the sequence loader uses for batch `k`.
pub fn rows_for(k: i64) -> i64 {
    1 + k % 3
}

/// Loader that stamps batch `k` (starting at 1) into every array it fills.
///
/// - data: `[rows_for(k), 4]` Float filled with `k`
/// - label 0: `[rows_for(k)]` Int64 filled with `k`
/// - label 1: `[rows_for(k), 2]` Float filled with `k / 2`
///
/// Labels are only written when the slot carries them.
pub struct SequenceLoader {
    pub next: i64,
    pub calls: Arc<AtomicUsize>,
    pub label_fills: Arc<AtomicUsize>,
}

impl SequenceLoader {
    pub fn new() -> Self {
        Self {
            next: 0,
            calls: Arc::new(AtomicUsize::new(0)),
            label_fills: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl batch_prefetch::BatchLoader for SequenceLoader {
    fn load_batch(&mut self, slot: &mut BatchSlot) -> Result<()> {
        self.next += 1;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let k = self.next;
        let rows = rows_for(k);

        let _ = slot.reshape_data(&[rows, 4]).fill_(k);
        if slot.num_labels() > 0 {
            let _ = slot.reshape_label(0, &[rows])?.fill_(k);
            let _ = slot.reshape_label(1, &[rows, 2])?.fill_(k as f64 / 2.0);
            self.label_fills.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Config builder whose array kinds match what `SequenceLoader` writes.
pub fn sequence_config(pool_size: usize) -> PrefetchConfigBuilder {
    PrefetchConfig::builder()
        .pool_size(pool_size)
        .data(ArraySpec::new([1, 4], Kind::Float))
        .label(ArraySpec::new([1], Kind::Int64))
        .label(ArraySpec::new([1, 2], Kind::Float))
        .staging_device(Device::Cpu)
        .stall_warning_interval(Duration::from_millis(200))
}
