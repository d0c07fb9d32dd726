use crate::slot::BatchSlot;
use anyhow::Result;

/// Fills a [`BatchSlot`] with one new batch.
///
/// The prefetch worker calls `load_batch` synchronously on its own thread,
/// once per slot it claims from the free queue. An implementation must:
/// 1. fully populate the slot's primary array, and every secondary array the
///    slot carries (a slot only carries secondary arrays when labels are
///    enabled for the pipeline);
/// 2. not keep any reference into the slot after returning.
///
/// Returning an error is treated as an unrecoverable fault of the batch
/// source: the worker logs it and aborts the process.
///
/// Any `FnMut(&mut BatchSlot) -> Result<()>` closure is a loader:
/// ```ignore
/// let mut next = 0.0;
/// let loader = move |slot: &mut BatchSlot| -> Result<()> {
///     next += 1.0;
///     let _ = slot.reshape_data(&[1]).fill_(next);
///     Ok(())
/// };
/// ```
pub trait BatchLoader: Send + 'static {
    fn load_batch(&mut self, slot: &mut BatchSlot) -> Result<()>;
}

impl<F> BatchLoader for F
where
    F: FnMut(&mut BatchSlot) -> Result<()> + Send + 'static,
{
    fn load_batch(&mut self, slot: &mut BatchSlot) -> Result<()> {
        self(slot)
    }
}
