//! src/prefetch/mod.rs
//!
//! This module implements the `PrefetchPipeline`.
//!
//! The pipeline overlaps batch preparation (decode, augmentation, format
//! conversion, device transfer) with the consumer's compute step by cycling a
//! fixed pool of reusable `BatchSlot`s between one background worker thread
//! and the consumer.
//!
//! # Architecture Overview
//!
//! ```text
//!        setup(): allocate + warm up N slots
//!                         │
//!                         ↓
//!                 ┌──────────────┐
//!          ┌────→ │  Free Queue  │
//!          │      └──────┬───────┘
//!          │             │ pop (cancellable)
//!          │             ↓
//!          │      ┌──────────────┐
//!          │      │ Worker Thread│ ── BatchLoader::load_batch(slot)
//!          │      │              │ ── TransferStream::stage(slot) (optional)
//!          │      └──────┬───────┘
//!          │             │ push
//!          │             ↓
//!          │      ┌──────────────┐
//!          │      │  Full Queue  │
//!          │      └──────┬───────┘
//!          │             │ pop (logs on stalls)
//!          │             ↓
//!          │      ┌──────────────┐
//!          └───── │ produce_next │ ── copy into caller-owned tensors
//!                 └──────────────┘
//! ```
//!
//! # Module Structure
//!
//! ```text
//! src/prefetch/
//! ├── mod.rs             # Public API exports + module-level architecture docs
//! ├── config.rs          # PrefetchConfig, builder, and validation
//! ├── pipeline.rs        # PrefetchPipeline: setup, produce_next, teardown
//! ├── queue.rs           # BlockingQueue and StopToken
//! ├── staging.rs         # TransferStream for device staging
//! ├── worker.rs          # PrefetchWorker thread lifecycle + prefetch loop
//! └── common/
//!     ├── mod.rs
//!     └── thread.rs      # Thread-local worker RNG
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! let config = PrefetchConfig::builder()
//!     .pool_size(3)
//!     .data(ArraySpec::new([32, 3, 224, 224], Kind::Float))
//!     .label(ArraySpec::new([32], Kind::Int64))
//!     .build();
//!
//! let mut pipeline = PrefetchPipeline::new(loader, config)?;
//! pipeline.setup(output_labels_for(2), false)?;
//!
//! let mut images = Tensor::new();
//! let mut targets = [Tensor::new()];
//! for _ in 0..steps {
//!     pipeline.produce_next(&mut images, &mut targets)?;
//!     // forward / backward on images, targets[0]
//! }
//! pipeline.teardown()?;
//! ```
//!
//! # Performance Guidelines
//! - `pool_size = 1`: no overlap between loading and compute
//! - `pool_size = 2`: double buffering
//! - `pool_size = 3` (default): lets the worker absorb jitter in load times
//!
//! Memory usage is O(pool_size x batch bytes), doubled with device staging.

mod common;
mod config;
mod pipeline;
mod queue;
mod staging;
mod worker;

pub use config::{output_labels_for, PrefetchConfig, PrefetchConfigBuilder, DEFAULT_POOL_SIZE};
pub use pipeline::{PrefetchPipeline, FULL_QUEUE_STALL_LABEL};
pub use queue::{BlockingQueue, PopError, StopToken};
pub use staging::TransferStream;
pub use worker::{PrefetchWorker, WorkerState};

pub use common::thread::{init_prefetch_rng, prefetch_gen_bool, prefetch_gen_range, PREFETCH_RNG};
