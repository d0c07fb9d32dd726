//! Background worker thread for the prefetch pipeline.
//!
//! `PrefetchWorker<T>` owns the lifecycle of one named OS thread:
//!
//! ```text
//!   Idle --start()--> Running --request_stop()--> Stopping --(thread exits)--> Stopped
//!    ^                                                                            |
//!    +-------------------------------- reset() -----------------------------------+
//! ```
//!
//! The thread body receives the worker's `StopToken` and returns a value of
//! type `T` that `join()` hands back to the owner. The prefetch pipeline uses
//! this to get its `BatchLoader` back once the loop has ended.
//!
//! `run_prefetch_loop` is the body the pipeline runs on this thread.

use anyhow::{anyhow, Context, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tch::Device;

use super::common::thread::init_prefetch_rng;
use super::queue::{BlockingQueue, PopError, StopToken};
use super::staging::TransferStream;
use crate::loader::BatchLoader;
use crate::slot::BatchSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// A single background thread with an explicit start/stop/reset lifecycle.
pub struct PrefetchWorker<T> {
    name: String,
    state: Arc<Mutex<WorkerState>>,
    stop: Arc<StopToken>,
    handle: Option<thread::JoinHandle<T>>,
}

fn lock(state: &Mutex<WorkerState>) -> MutexGuard<'_, WorkerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> PrefetchWorker<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(WorkerState::Idle)),
            stop: Arc::new(StopToken::new()),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    /// True while the thread has been started and not yet joined.
    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawns the thread. Only valid from `Idle`.
    pub fn start<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(Arc<StopToken>) -> T + Send + 'static,
    {
        {
            let mut state = lock(&self.state);
            if *state != WorkerState::Idle {
                return Err(anyhow!(
                    "Cannot start worker '{}' in state {:?}; reset() it first",
                    self.name,
                    *state
                ));
            }
            *state = WorkerState::Running;
        }

        let stop = self.stop.clone();
        let state = self.state.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let output = body(stop);
                *lock(&state) = WorkerState::Stopped;
                output
            })
            .with_context(|| format!("Failed to spawn worker thread '{}'", self.name));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                *lock(&self.state) = WorkerState::Idle;
                Err(e)
            }
        }
    }

    /// Cancels the stop token. The thread notices at its next check.
    pub fn request_stop(&self) {
        self.stop.cancel();
        let mut state = lock(&self.state);
        if *state == WorkerState::Running {
            *state = WorkerState::Stopping;
        }
    }

    /// Requests a stop and waits for the thread to exit.
    ///
    /// Returns `Ok(None)` if the thread was never started (or already joined)
    /// and an error if the thread panicked.
    pub fn join(&mut self) -> Result<Option<T>> {
        self.request_stop();
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };

        let joined = handle.join();
        *lock(&self.state) = WorkerState::Stopped;
        joined
            .map(Some)
            .map_err(|_| anyhow!("Worker thread '{}' panicked", self.name))
    }

    /// Returns a stopped worker to `Idle` with a fresh stop token.
    pub fn reset(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            WorkerState::Idle => Ok(()),
            WorkerState::Stopped if self.handle.is_none() => {
                *state = WorkerState::Idle;
                self.stop = Arc::new(StopToken::new());
                Ok(())
            }
            other => Err(anyhow!(
                "Cannot reset worker '{}' in state {:?}; join() it first",
                self.name,
                other
            )),
        }
    }
}

impl<T> Drop for PrefetchWorker<T> {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Everything the prefetch loop needs, moved onto the worker thread.
pub(crate) struct PrefetchContext<L> {
    pub(crate) free: Arc<BlockingQueue<BatchSlot>>,
    pub(crate) full: Arc<BlockingQueue<BatchSlot>>,
    pub(crate) loader: L,
    pub(crate) staging: Option<Device>,
    pub(crate) seed: u64,
    pub(crate) generation: u64,
}

/// Free queue -> load -> (stage) -> full queue, until stopped.
///
/// Returns the loader so the pipeline can be set up again later.
pub(crate) fn run_prefetch_loop<L: BatchLoader>(ctx: PrefetchContext<L>, stop: &StopToken) -> L {
    let PrefetchContext {
        free,
        full,
        mut loader,
        staging,
        seed,
        generation,
    } = ctx;

    init_prefetch_rng(seed, generation);
    let mut stream = staging.map(TransferStream::new);
    let mut produced: u64 = 0;

    while !stop.is_cancelled() {
        let mut slot = match free.pop(stop) {
            Ok(slot) => slot,
            Err(PopError::Cancelled) => break,
        };

        if stop.is_cancelled() {
            free.push(slot);
            break;
        }

        let id = slot.id();
        if let Err(e) = catch_fault(|| loader.load_batch(&mut slot)) {
            abort_on_fault(
                "Batch loader failed",
                e.context(format!("while filling slot {}", id)),
            );
        }

        if let Some(stream) = stream.as_mut() {
            if let Err(e) = catch_fault(|| stream.stage(&mut slot)) {
                abort_on_fault("Device staging failed", e);
            }
        }

        full.push(slot);
        produced += 1;
    }

    drop(stream);
    tracing::debug!(produced, "Prefetch loop exited");
    loader
}

/// Runs `f`, turning a panic into an error so both end up in `abort_on_fault`.
fn catch_fault<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Prefetching has no partial-failure recovery: a broken batch source or
/// transfer ends the process, whether it returned an error or panicked.
fn abort_on_fault(what: &str, error: anyhow::Error) -> ! {
    tracing::error!(error = ?error, "{}; aborting", what);
    eprintln!("Fatal prefetch error: {}: {:?}", what, error);
    std::process::abort()
}
