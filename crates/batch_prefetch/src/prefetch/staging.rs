//! Device staging for prefetched slots.
//!
//! A `TransferStream` is created by the worker thread itself and lives for
//! as long as the worker loop runs. Staging a slot copies every host array
//! into the slot's pre-allocated device mirror, then waits for the device
//! to finish, so a slot is never published half-transferred.
//!
//! `tch` exposes no CUDA stream handles. The copies therefore go onto the
//! device's current stream, and `synchronize` waits for the whole device
//! through `tch::Cuda::synchronize`. That includes any kernels the consumer
//! has queued on the same device, so a `TransferStream` is a per-worker
//! staging handle, not a private CUDA stream.

use crate::slot::{copy_array, BatchSlot};
use anyhow::{anyhow, Result};
use tch::Device;

#[derive(Debug)]
pub struct TransferStream {
    device: Device,
    transfers: u64,
}

impl TransferStream {
    pub fn new(device: Device) -> Self {
        tracing::debug!(?device, "Transfer stream created");
        Self {
            device,
            transfers: 0,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of slots staged through this stream.
    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    /// Enqueues the host -> device copies for every array of `slot`.
    pub fn enqueue(&mut self, slot: &mut BatchSlot) -> Result<()> {
        let id = slot.id();
        let pairs = slot.staging_pairs().ok_or_else(|| {
            anyhow!(
                "Slot {} has no device buffers; it was not warmed up for staging",
                id
            )
        })?;
        for (host, mirror) in pairs {
            copy_array(host, mirror);
        }
        self.transfers += 1;
        Ok(())
    }

    /// Blocks until all queued work on the device has completed, not just
    /// this stream's copies. No-op for non-CUDA devices.
    pub fn synchronize(&self) {
        if let Device::Cuda(index) = self.device {
            tch::Cuda::synchronize(index as i64);
        }
    }

    /// Enqueue followed by synchronize.
    pub fn stage(&mut self, slot: &mut BatchSlot) -> Result<()> {
        self.enqueue(slot)?;
        self.synchronize();
        Ok(())
    }
}

impl Drop for TransferStream {
    fn drop(&mut self) {
        self.synchronize();
        tracing::debug!(
            device = ?self.device,
            transfers = self.transfers,
            "Transfer stream released"
        );
    }
}
