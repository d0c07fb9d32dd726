//! src/prefetch/config.rs
//!
//! Configuration for PrefetchPipeline behaviour
//!
//! The `PrefetchConfig` struct stores the parameters that control
//! how batches are buffered and handed to the consumer.
//!
//! Example:
//! ```ignore
//! let config = PrefetchConfig::builder()
//!     .pool_size(3)
//!     .data(ArraySpec::new([32, 3, 224, 224], Kind::Float))
//!     .label(ArraySpec::new([32], Kind::Int64))
//!     .seed(42)
//!     .build();
//! ```
//!
//! # Performance considerations:
//! - `pool_size`: More slots let the worker run further ahead of the consumer
//!                but every slot holds a full batch (twice when staging).
//! - `stall_warning_interval`: Only affects logging, never blocking behaviour.

use crate::slot::ArraySpec;
use anyhow::{anyhow, Result};
use std::time::Duration;
use tch::Device;

/// Default number of slots cycled between worker and consumer.
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Configuration for PrefetchPipeline
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Number of reusable batch slots (must be > 0)
    pub pool_size: usize,
    /// Initial shape and kind of the primary array
    pub data: ArraySpec,
    /// Initial shapes and kinds of the secondary arrays, in export order.
    /// Only allocated when the pipeline is set up with labels enabled.
    pub labels: Vec<ArraySpec>,
    /// Device that slots are staged onto when staging is enabled.
    /// Default: first CUDA device if available, CPU otherwise.
    pub staging_device: Device,
    /// How long the consumer waits for a full slot before logging a warning.
    /// The consumer keeps waiting afterwards. Default: 1s
    pub stall_warning_interval: Duration,
    /// Seed for the worker's thread-local RNG (random when not set)
    pub seed: Option<u64>,
    /// Name given to the worker thread
    pub thread_name: String,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            data: ArraySpec::default(),
            labels: Vec::new(),
            staging_device: Device::cuda_if_available(),
            stall_warning_interval: Duration::from_secs(1),
            seed: None,
            thread_name: "prefetch-worker".to_string(),
        }
    }
}

impl PrefetchConfig {
    pub fn builder() -> PrefetchConfigBuilder {
        PrefetchConfigBuilder::default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(anyhow!(
                "Cannot create a prefetch pipeline with pool_size 0. \
                At least one slot is needed to hand batches to the consumer."
            ));
        }
        if self.stall_warning_interval.is_zero() {
            return Err(anyhow!("stall_warning_interval must be greater than zero"));
        }
        if self.thread_name.is_empty() {
            return Err(anyhow!("thread_name must not be empty"));
        }
        Ok(())
    }
}

/// Decides whether secondary arrays are produced, from the number of outputs
/// the consumer expects: a single output means data only.
pub fn output_labels_for(num_outputs: usize) -> bool {
    num_outputs > 1
}

/// Builder for PrefetchConfig with method chaining
#[derive(Default)]
pub struct PrefetchConfigBuilder {
    config: PrefetchConfig,
}

impl PrefetchConfigBuilder {
    /// Set the number of slots (must be > 0)
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the initial shape and kind of the primary array
    pub fn data(mut self, spec: ArraySpec) -> Self {
        self.config.data = spec;
        self
    }

    /// Append one secondary array
    pub fn label(mut self, spec: ArraySpec) -> Self {
        self.config.labels.push(spec);
        self
    }

    /// Replace all secondary arrays
    pub fn labels(mut self, specs: Vec<ArraySpec>) -> Self {
        self.config.labels = specs;
        self
    }

    /// Set the staging device
    pub fn staging_device(mut self, device: Device) -> Self {
        self.config.staging_device = device;
        self
    }

    /// Set the stall warning interval
    ///
    /// - Too low: noisy logs whenever loading is slower than compute.
    /// - Too high: slow to notice a stalled batch source.
    pub fn stall_warning_interval(mut self, interval: Duration) -> Self {
        self.config.stall_warning_interval = interval;
        self
    }

    /// Set the seed for the worker RNG.
    ///
    /// Loaders that draw from `prefetch_gen_bool` / `prefetch_gen_range`
    /// produce the same batch sequence for the same seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Set the worker thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> PrefetchConfig {
        self.config
    }
}
