//! src/prefetch/pipeline.rs
//!
//! The consumer-facing side of the prefetch pipeline.
//!
//! # Lifecycle
//!
//! - `new()` validates the configuration. Nothing is allocated yet.
//! - `setup()` allocates and warms up every slot, then starts the worker.
//! - `produce_next()` is called once per consumption step.
//! - `teardown()` stops and joins the worker and releases every slot. The
//!   loader is kept, so `setup()` may be called again afterwards.
//!
//! Dropping a pipeline that is still set up tears it down.
//!
//! # Teardown ordering
//!
//! The worker is only ever blocked on the free queue or inside the loader,
//! so teardown cannot deadlock as long as no `produce_next()` call is
//! outstanding. `produce_next()` takes `&mut self`, which rules that out for
//! a single owner.

use crate::loader::BatchLoader;
use crate::slot::{ArraySpec, BatchSlot};
use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::sync::Arc;
use tch::Tensor;

use super::config::PrefetchConfig;
use super::queue::BlockingQueue;
use super::worker::{run_prefetch_loop, PrefetchContext, PrefetchWorker, WorkerState};

/// Label logged while the consumer waits on an empty full queue.
pub const FULL_QUEUE_STALL_LABEL: &str = "Data layer prefetch queue empty";

/// Bounded-buffer prefetch pipeline.
///
/// A pool of `pool_size` [`BatchSlot`]s cycles between a background worker,
/// which fills free slots through the [`BatchLoader`], and the caller, which
/// drains full slots through [`produce_next`](Self::produce_next):
///
/// ```text
///   free queue --> worker: load_batch (+ stage) --> full queue
///       ^                                               |
///       +-------- produce_next: copy to caller <--------+
/// ```
///
/// Batches reach the caller in exactly the order the loader produced them.
pub struct PrefetchPipeline<L: BatchLoader> {
    config: PrefetchConfig,
    loader: Option<L>,
    worker: PrefetchWorker<L>,
    free: Arc<BlockingQueue<BatchSlot>>,
    full: Arc<BlockingQueue<BatchSlot>>,
    allocated: usize,
    output_labels: bool,
    device_staging: bool,
    base_seed: u64,
    generation: u64,
}

impl<L: BatchLoader> PrefetchPipeline<L> {
    /// Creates an idle pipeline around `loader`.
    ///
    /// # Errors
    /// - `pool_size` is 0
    /// - `stall_warning_interval` is zero
    /// - `thread_name` is empty
    pub fn new(loader: L, config: PrefetchConfig) -> Result<Self> {
        config.validate().context("Invalid prefetch configuration")?;

        let base_seed = config.seed.unwrap_or_else(|| rand::rng().random());
        let free = Arc::new(BlockingQueue::new(config.stall_warning_interval));
        let full = Arc::new(BlockingQueue::new(config.stall_warning_interval));
        let worker = PrefetchWorker::new(config.thread_name.clone());

        Ok(Self {
            config,
            loader: Some(loader),
            worker,
            free,
            full,
            allocated: 0,
            output_labels: false,
            device_staging: false,
            base_seed,
            generation: 0,
        })
    }

    /// Allocates the slot pool and starts the worker.
    ///
    /// - `output_labels`: allocate, fill and export the configured secondary
    ///   arrays. See [`output_labels_for`](super::config::output_labels_for).
    /// - `device_staging`: mirror every slot on `config.staging_device` and
    ///   stage it there before it is published.
    ///
    /// Every slot is warmed up here, before the worker exists, so the worker
    /// never races the caller on a first-use allocation.
    pub fn setup(&mut self, output_labels: bool, device_staging: bool) -> Result<()> {
        if self.allocated > 0 {
            return Err(anyhow!(
                "Prefetch pipeline is already set up; call teardown() first"
            ));
        }
        self.worker
            .reset()
            .context("Prefetch worker is not ready to start")?;
        let loader = self.loader.take().ok_or_else(|| {
            anyhow!(
                "Batch loader is unavailable: the previous worker thread either \
                 failed to spawn or panicked, and the loader went with it"
            )
        })?;

        let staging = device_staging.then_some(self.config.staging_device);
        let label_specs: &[ArraySpec] = if output_labels {
            self.config.labels.as_slice()
        } else {
            &[]
        };

        for id in 0..self.config.pool_size {
            let mut slot = BatchSlot::new(id, &self.config.data, label_specs);
            slot.warm_up(staging);
            self.free.push(slot);
        }
        self.allocated = self.config.pool_size;
        self.output_labels = output_labels;
        self.device_staging = device_staging;

        tracing::info!(
            pool_size = self.config.pool_size,
            output_labels,
            staging_device = ?staging,
            "Initializing prefetch"
        );

        let ctx = PrefetchContext {
            free: self.free.clone(),
            full: self.full.clone(),
            loader,
            staging,
            seed: self.base_seed,
            generation: self.generation,
        };
        if let Err(e) = self.worker.start(move |stop| run_prefetch_loop(ctx, &stop)) {
            self.free.drain();
            self.allocated = 0;
            return Err(e);
        }
        self.generation += 1;

        tracing::info!("Prefetch initialized");
        Ok(())
    }

    /// Hands the next prefetched batch to the caller.
    ///
    /// Blocks until the worker has published a slot, reshapes `data` (and,
    /// when labels are enabled, each tensor of `labels`) like the slot's
    /// arrays, copies them, and returns the slot to the worker.
    ///
    /// `labels` must be empty when labels are disabled, and hold exactly one
    /// tensor per configured secondary array when they are enabled.
    ///
    /// # Errors
    /// - called before `setup()` or after `teardown()`
    /// - wrong number of label destinations
    pub fn produce_next(&mut self, data: &mut Tensor, labels: &mut [Tensor]) -> Result<()> {
        if self.allocated == 0 {
            return Err(anyhow!("produce_next() called before setup()"));
        }
        if !self.output_labels && !labels.is_empty() {
            return Err(anyhow!(
                "{} label destinations supplied but labels are disabled",
                labels.len()
            ));
        }
        if self.output_labels && labels.len() != self.config.labels.len() {
            return Err(anyhow!(
                "Expected {} label destinations, got {}",
                self.config.labels.len(),
                labels.len()
            ));
        }

        let slot = self.full.pop_logged(FULL_QUEUE_STALL_LABEL);

        slot.export(data, labels);
        tracing::debug!(slot = slot.id(), "Prefetch copied");

        self.free.push(slot);
        Ok(())
    }

    /// Stops and joins the worker and releases every slot.
    ///
    /// Returns the number of slots released, which equals `pool_size` unless
    /// the worker thread panicked mid-batch. Calling it on a pipeline that is
    /// not set up is a no-op returning 0.
    pub fn teardown(&mut self) -> Result<usize> {
        if self.allocated == 0 && !self.worker.is_started() {
            return Ok(0);
        }

        let join_error = match self.worker.join() {
            Ok(Some(loader)) => {
                self.loader = Some(loader);
                None
            }
            Ok(None) => None,
            Err(e) => Some(e),
        };

        let mut released = self.free.drain();
        released.extend(self.full.drain());
        let count = released.len();
        if count != self.allocated {
            tracing::error!(
                expected = self.allocated,
                released = count,
                "Prefetch slots were not all returned"
            );
        }
        drop(released);
        self.allocated = 0;

        tracing::info!(released = count, "Prefetch stopped");
        match join_error {
            Some(e) => Err(e.context("Prefetch worker did not shut down cleanly")),
            None => Ok(count),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    pub fn is_set_up(&self) -> bool {
        self.allocated > 0
    }

    pub fn output_labels(&self) -> bool {
        self.output_labels
    }

    pub fn device_staging(&self) -> bool {
        self.device_staging
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Best-effort number of slots waiting for the worker.
    pub fn free_len(&self) -> usize {
        self.free.size()
    }

    /// Best-effort number of slots waiting for the consumer.
    pub fn full_len(&self) -> usize {
        self.full.size()
    }
}

impl<L: BatchLoader> Drop for PrefetchPipeline<L> {
    fn drop(&mut self) {
        if self.allocated > 0 || self.worker.is_started() {
            if let Err(e) = self.teardown() {
                tracing::error!(error = ?e, "Prefetch teardown failed during drop");
            }
        }
    }
}
