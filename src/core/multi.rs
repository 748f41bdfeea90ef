// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Engine launching each work item on its own OS thread, with a bounded number
//! of threads in flight.

use super::engine::{Engine, EngineStats};
use super::error::{InitError, LaunchError};
use super::ring::SlotRing;
use super::spawn::{is_transient, join_until_finished, OsThreads, ThreadSpawner};
use super::worker::{Worker, WorkerContext};
#[cfg(feature = "log_statistics")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use std::sync::Arc;

/// An engine running each work item on a new OS thread, with at most
/// `concurrency_bound + 1` threads outstanding at any time.
///
/// Threads are assigned to a ring of slots. Launching into a full ring first
/// retires (joins) the oldest outstanding thread, so slots are always reused
/// in launch order, regardless of which threads finish first.
///
/// ```
/// # use spawnring::{Engine, MultiEngine, WorkerContext};
/// # use std::sync::atomic::{AtomicU64, Ordering};
/// # use std::sync::Arc;
/// fn cube(context: &WorkerContext<'_, [AtomicU64]>, _scratch: &mut ()) {
///     let i = context.item_index() as u64;
///     context.shared()[i as usize].store(i * i * i, Ordering::Relaxed);
/// }
///
/// let cubes: Arc<[AtomicU64]> = (0..100).map(|_| AtomicU64::new(0)).collect();
/// let mut engine = MultiEngine::init(cube, cubes.clone(), 7).unwrap();
/// engine.launch_range(99).unwrap();
/// // Results are only safe to read once every work item is retired.
/// engine.retire_all();
/// assert_eq!(cubes[10].load(Ordering::Relaxed), 1000);
/// ```
pub struct MultiEngine<S: ?Sized, T, W, P: ThreadSpawner<T> = OsThreads> {
    /// Function run by every work item.
    worker: Arc<W>,
    /// Read-only data shared by every work item.
    shared: Arc<S>,
    /// Ring of `concurrency_bound + 1` slots.
    slots: Box<[Slot<T, P::Handle>]>,
    /// Launch/retire indices over the slots.
    ring: SlotRing,
    /// Creates and joins the threads.
    spawner: P,
    /// Number of worker panics observed since the last retire-all.
    pending_panics: usize,
    stats: EngineStats,
}

/// One entry of the ring.
///
/// While a thread is outstanding in the slot, the thread owns the scratch
/// space and the slot only holds the thread handle. Joining the thread hands
/// the scratch space back.
struct Slot<T, H> {
    scratch: Option<T>,
    thread: Option<H>,
}

impl<S, T, W> MultiEngine<S, T, W>
where
    S: ?Sized + Send + Sync + 'static,
    T: Default + Send + 'static,
    W: Worker<S, T> + Send + Sync + 'static,
{
    /// Creates an engine running `worker` on OS threads, with at most
    /// `concurrency_bound + 1` threads in flight.
    ///
    /// This allocates the ring of slots, including one scratch space per slot.
    pub fn init(worker: W, shared: Arc<S>, concurrency_bound: usize) -> Result<Self, InitError> {
        Self::with_spawner(worker, shared, concurrency_bound, OsThreads::default())
    }
}

impl<S, T, W, P> MultiEngine<S, T, W, P>
where
    S: ?Sized + Send + Sync + 'static,
    T: Default + Send + 'static,
    W: Worker<S, T> + Send + Sync + 'static,
    P: ThreadSpawner<T>,
{
    /// Creates an engine like [`init()`](MultiEngine::init), using the given
    /// spawner to create and join threads.
    pub fn with_spawner(
        worker: W,
        shared: Arc<S>,
        concurrency_bound: usize,
        spawner: P,
    ) -> Result<Self, InitError> {
        let num_slots = concurrency_bound
            .checked_add(1)
            .ok_or(InitError::CapacityOverflow { concurrency_bound })?;

        let mut slots = Vec::new();
        if let Err(source) = slots.try_reserve_exact(num_slots) {
            log_error!("[main thread] Failed to allocate {num_slots} slots: {source}");
            return Err(InitError::Allocation {
                slots: num_slots,
                source,
            });
        }
        slots.extend((0..num_slots).map(|_| Slot {
            scratch: Some(T::default()),
            thread: None,
        }));
        log_debug!("[main thread] Allocated a ring of {num_slots} slots");

        Ok(Self {
            worker: Arc::new(worker),
            shared,
            slots: slots.into_boxed_slice(),
            ring: SlotRing::new(concurrency_bound),
            spawner,
            pending_panics: 0,
            stats: EngineStats::default(),
        })
    }
}

impl<S: ?Sized, T, W, P: ThreadSpawner<T>> MultiEngine<S, T, W, P> {
    /// Read-only data currently shared with the work items.
    pub fn shared(&self) -> &Arc<S> {
        &self.shared
    }

    /// Spawner creating and joining the threads.
    pub fn spawner(&self) -> &P {
        &self.spawner
    }

    /// Number of launched work items that haven't been retired yet.
    pub fn outstanding(&self) -> usize {
        self.ring.outstanding()
    }

    /// Releases the engine, joining any outstanding thread first.
    pub fn free(self) {
        drop(self)
    }

    /// Joins the thread in the oldest outstanding slot, and makes that slot
    /// available again. Does nothing if no slot is outstanding.
    fn retire_oldest(&mut self) {
        let Some(slot_index) = self.ring.oldest() else {
            return;
        };
        let slot = &mut self.slots[slot_index];
        if let Some(handle) = slot.thread.take() {
            match join_until_finished(&self.spawner, slot_index, handle) {
                Ok(scratch) => slot.scratch = Some(scratch),
                Err(_payload) => {
                    log_error!(
                        "[main thread] The worker in slot #{slot_index} panicked: {:?}",
                        _payload
                            .downcast_ref::<&str>()
                            .copied()
                            .or_else(|| _payload.downcast_ref::<String>().map(String::as_str))
                    );
                    // The scratch space went down with the worker.
                    slot.scratch = None;
                    self.pending_panics += 1;
                    self.stats.panicked += 1;
                }
            }
        }
        self.ring.commit_retire();
        self.stats.retired += 1;
        log_trace!("[main thread] Retired slot #{slot_index}");
    }

    /// Panics if any worker panicked since the last report, clearing the
    /// count first so that the engine stays usable.
    fn raise_pending_panics(&mut self) {
        let num_panics = std::mem::take(&mut self.pending_panics);
        if num_panics != 0 {
            log_error!("[main thread] {num_panics} worker thread(s) panicked!");
            panic!("{num_panics} worker thread(s) panicked!");
        }
    }

    /// Retires every outstanding slot, oldest first.
    fn retire_outstanding(&mut self) {
        if !self.ring.is_empty() {
            log_debug!(
                "[main thread] Retiring {} outstanding slot(s)...",
                self.ring.outstanding()
            );
        }
        while !self.ring.is_empty() {
            self.retire_oldest();
        }
        self.ring.reset();
    }
}

impl<S, T, W, P> Engine for MultiEngine<S, T, W, P>
where
    S: ?Sized + Send + Sync + 'static,
    T: Default + Send + 'static,
    W: Worker<S, T> + Send + Sync + 'static,
    P: ThreadSpawner<T>,
{
    type Shared = S;
    type Worker = W;

    fn concurrency_bound(&self) -> usize {
        self.ring.max_index()
    }

    fn launch_one(&mut self, item_index: usize) -> Result<(), LaunchError> {
        if self.ring.is_full() {
            self.retire_oldest();
        }
        let slot_index = self.ring.launch_index();

        loop {
            let scratch = self.slots[slot_index].scratch.take().unwrap_or_default();
            let worker = Arc::clone(&self.worker);
            let shared = Arc::clone(&self.shared);
            let task = move || {
                let mut scratch = scratch;
                let context = WorkerContext::new(&*shared, item_index, slot_index);
                W::run(&worker, &context, &mut scratch);
                scratch
            };

            let source = match self.spawner.spawn(slot_index, task) {
                Ok(handle) => {
                    self.slots[slot_index].thread = Some(handle);
                    self.ring.commit_launch();
                    self.stats.launched += 1;
                    self.stats.peak_outstanding =
                        self.stats.peak_outstanding.max(self.ring.outstanding());
                    log_trace!("[main thread] Launched item {item_index} in slot #{slot_index}");
                    return Ok(());
                }
                Err(source) => source,
            };

            if !is_transient(&source) {
                log_error!(
                    "[main thread] Failed to launch item {item_index} in slot #{slot_index}: {source}"
                );
                return Err(LaunchError::Spawn { item_index, source });
            }
            if self.ring.is_empty() {
                log_error!(
                    "[main thread] Out of resources to launch item {item_index}, with no thread left to retire: {source}"
                );
                return Err(LaunchError::Exhausted { item_index, source });
            }

            log_debug!(
                "[main thread] Out of resources to launch item {item_index}, retiring the oldest slot and retrying: {source}"
            );
            self.stats.spawn_retries += 1;
            self.retire_oldest();
        }
    }

    fn retire_all(&mut self) {
        self.retire_outstanding();
        self.raise_pending_panics();
    }

    fn rewind(&mut self, worker: W, shared: Arc<S>) {
        if !self.ring.is_empty() {
            log_warn!(
                "[main thread] Rewinding with {} outstanding slot(s), retiring them first",
                self.ring.outstanding()
            );
        }
        // Panics of the previous batch may have been joined while retrying a
        // launch, even if nothing is outstanding anymore.
        self.retire_outstanding();
        self.worker = Arc::new(worker);
        self.shared = shared;
        log_debug!("[main thread] Rewound the engine");
        self.raise_pending_panics();
    }

    fn stats(&self) -> EngineStats {
        self.stats
    }
}

impl<S: ?Sized, T, W, P: ThreadSpawner<T>> Drop for MultiEngine<S, T, W, P> {
    /// Joins all the outstanding threads.
    fn drop(&mut self) {
        if !self.ring.is_empty() {
            log_warn!(
                "[main thread] Dropping the engine with {} outstanding slot(s)",
                self.ring.outstanding()
            );
        }
        self.retire_outstanding();

        let num_panics = std::mem::take(&mut self.pending_panics);
        if num_panics != 0 {
            log_error!("[main thread] {num_panics} worker thread(s) panicked!");
        }

        #[cfg(feature = "log_statistics")]
        log_info!("[main thread] Engine statistics: {:?}", self.stats);
    }
}
