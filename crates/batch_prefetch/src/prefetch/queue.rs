//! Blocking hand-off queue between the prefetch worker and the consumer.
//!
//! The pipeline uses two of these: a free queue (consumer -> worker) and a
//! full queue (worker -> consumer). Both are FIFO and unbounded by capacity;
//! the number of slots in circulation is what bounds them.
//!
//! Blocking pops come in two flavours:
//! - `pop(&StopToken)`: used by the worker. Cancelling the token wakes the
//!   popper, which gets `PopError::Cancelled` instead of an item.
//! - `pop_logged(label)`: used by the consumer. Waits indefinitely, logging
//!   a warning every `stall_warning_interval` spent waiting.

use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    #[error("pop cancelled by a stop request")]
    Cancelled,
}

/// One-shot cancellation signal shared between a worker and its owner.
///
/// Holds the shutdown flag (only ever goes false -> true) and a channel whose
/// sender is dropped on cancel. A dropped sender makes the receiver ready
/// forever, which is what lets `BlockingQueue::pop` select on it.
#[derive(Debug)]
pub struct StopToken {
    stopped: AtomicBool,
    signal_tx: Mutex<Option<Sender<()>>>,
    signal_rx: Receiver<()>,
}

impl StopToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            stopped: AtomicBool::new(false),
            signal_tx: Mutex::new(Some(tx)),
            signal_rx: rx,
        }
    }

    /// Sets the shutdown flag and wakes every pop blocked on this token.
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.signal_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe FIFO queue with blocking, cancellable and non-blocking pops.
///
/// The queue owns both ends of its channel, so pushes never fail and pops
/// never observe a disconnect while the queue is alive. The only way a pop
/// comes back empty-handed is a cancelled `StopToken`.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    stall_warning_interval: Duration,
}

impl<T> BlockingQueue<T> {
    pub fn new(stall_warning_interval: Duration) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            stall_warning_interval,
        }
    }

    /// Inserts at the tail and wakes one blocked popper. Never blocks.
    pub fn push(&self, item: T) {
        // Cannot fail: `self.rx` keeps the channel connected.
        let _ = self.tx.send(item);
    }

    /// Blocks until an item is available or `stop` is cancelled.
    pub fn pop(&self, stop: &StopToken) -> Result<T, PopError> {
        select! {
            recv(self.rx) -> item => match item {
                Ok(item) => Ok(item),
                Err(_) => unreachable!("queue holds its own sender"),
            },
            recv(stop.signal_rx) -> _closed => Err(PopError::Cancelled),
        }
    }

    /// Blocks until an item is available, warning with `label` on stalls.
    pub fn pop_logged(&self, label: &str) -> T {
        let started = Instant::now();
        loop {
            match self.rx.recv_timeout(self.stall_warning_interval) {
                Ok(item) => return item,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        waited_ms = started.elapsed().as_millis() as u64,
                        "{}",
                        label
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    unreachable!("queue holds its own sender")
                }
            }
        }
    }

    /// Removes the head if there is one. Never blocks.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Best-effort snapshot of the number of queued items.
    pub fn size(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Removes every queued item without blocking.
    pub(crate) fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }
}
