// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Engine contract, configuration and runtime selection of the realization.

use super::error::{InitError, LaunchError};
use super::mono::MonoEngine;
use super::multi::MultiEngine;
use super::spawn::{CpuPinningPolicy, OsThreads};
use super::worker::Worker;
use crate::macros::log_debug;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Operations shared by every engine.
///
/// A typical cycle launches a batch of work items, retires them all, reads the
/// results out of the shared data, and then rewinds the engine with a new
/// worker or new shared data for the next batch.
pub trait Engine {
    /// Read-only data shared by every work item.
    type Shared: ?Sized;
    /// Function run by every work item.
    type Worker;

    /// Maximum number of outstanding work items, minus one. The engine has
    /// `concurrency_bound() + 1` slots.
    fn concurrency_bound(&self) -> usize;

    /// Launches the work item with the given index.
    ///
    /// If all the slots are occupied, this first waits for the oldest
    /// outstanding work item to finish. On failure, the work items launched
    /// before are still outstanding.
    fn launch_one(&mut self, item_index: usize) -> Result<(), LaunchError>;

    /// Launches the work items `0..=max_item_index` in order, stopping at the
    /// first failure.
    ///
    /// This is exactly equivalent to calling [`launch_one()`](Self::launch_one)
    /// for each index.
    fn launch_range(&mut self, max_item_index: usize) -> Result<(), LaunchError> {
        for item_index in 0..=max_item_index {
            self.launch_one(item_index)?;
        }
        Ok(())
    }

    /// Waits for every outstanding work item to finish. After this returns,
    /// all their writes to the shared data are visible to the caller.
    ///
    /// # Panics
    ///
    /// Panics if any work item panicked since the last call, once all the
    /// other work items are retired.
    fn retire_all(&mut self);

    /// Rebinds the engine to a new worker and new shared data, keeping the
    /// slots and their scratch spaces.
    ///
    /// Outstanding work items are retired first.
    ///
    /// # Panics
    ///
    /// Panics after rebinding if any work item of the previous batch panicked
    /// and wasn't reported by [`retire_all()`](Self::retire_all) yet.
    fn rewind(&mut self, worker: Self::Worker, shared: Arc<Self::Shared>);

    /// Statistics accumulated since the engine was created.
    fn stats(&self) -> EngineStats;
}

/// Counters describing the activity of an engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of work items successfully launched.
    pub launched: u64,
    /// Number of work items retired (including panicked ones).
    pub retired: u64,
    /// Number of thread creations retried after a transient failure.
    pub spawn_retries: u64,
    /// Number of work items that panicked.
    pub panicked: u64,
    /// Largest number of work items outstanding at once.
    pub peak_outstanding: usize,
}

/// Realization of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineMode {
    /// Run each work item on its own OS thread.
    Multi,
    /// Run each work item synchronously on the calling thread.
    Mono,
}

/// Number of slots of an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotCount {
    /// Use the number returned by [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Use the given number of slots.
    Count(NonZeroUsize),
}

impl SlotCount {
    /// Resolves the number of slots.
    pub fn count(&self) -> Result<NonZeroUsize, InitError> {
        match self {
            SlotCount::AvailableParallelism => {
                std::thread::available_parallelism().map_err(InitError::Parallelism)
            }
            SlotCount::Count(count) => Ok(*count),
        }
    }
}

impl TryFrom<usize> for SlotCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(slots: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(slots)?;
        Ok(SlotCount::Count(count))
    }
}

/// Configuration of an engine.
#[derive(Clone, Debug)]
pub struct EngineBuilder {
    /// Realization of the engine.
    pub mode: EngineMode,
    /// Number of slots, i.e. the concurrency bound plus one. Ignored in
    /// [`EngineMode::Mono`], which always has a single slot.
    pub slots: SlotCount,
    /// Policy to pin the threads of each slot to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Prefix of the thread names, suffixed with the slot index.
    pub thread_name: Option<String>,
    /// Stack size of the spawned threads, in bytes. Defaults to the standard
    /// library's default.
    pub stack_size: Option<usize>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            mode: EngineMode::Multi,
            slots: SlotCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
            thread_name: None,
            stack_size: None,
        }
    }
}

impl EngineBuilder {
    /// Builds an engine with this configuration.
    ///
    /// ```
    /// # use spawnring::{CpuPinningPolicy, Engine, EngineBuilder, EngineMode, SlotCount, WorkerContext};
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// # use std::sync::Arc;
    /// fn add_one(context: &WorkerContext<'_, [AtomicU64]>, _scratch: &mut ()) {
    ///     context.shared()[context.item_index()].fetch_add(1, Ordering::Relaxed);
    /// }
    ///
    /// let counters: Arc<[AtomicU64]> = (0..16).map(|_| AtomicU64::new(0)).collect();
    /// let mut engine = EngineBuilder {
    ///     mode: EngineMode::Multi,
    ///     slots: SlotCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    ///     thread_name: Some("adder".to_owned()),
    ///     stack_size: None,
    /// }
    /// .build(add_one, counters.clone())
    /// .unwrap();
    /// assert_eq!(engine.concurrency_bound(), 3);
    ///
    /// engine.launch_range(15).unwrap();
    /// engine.retire_all();
    /// assert!(counters.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    /// ```
    pub fn build<S, T, W>(&self, worker: W, shared: Arc<S>) -> Result<AnyEngine<S, T, W>, InitError>
    where
        S: ?Sized + Send + Sync + 'static,
        T: Default + Send + 'static,
        W: Worker<S, T> + Send + Sync + 'static,
    {
        match self.mode {
            EngineMode::Mono => {
                log_debug!("[main thread] Building a mono-threaded engine");
                Ok(AnyEngine::Mono(MonoEngine::init(worker, shared)))
            }
            EngineMode::Multi => {
                let num_slots: usize = self.slots.count()?.into();
                log_debug!("[main thread] Building a multi-threaded engine with {num_slots} slots");

                let mut spawner = OsThreads::new(self.cpu_pinning)?;
                if let Some(prefix) = &self.thread_name {
                    spawner = spawner.with_thread_name(prefix.clone());
                }
                if let Some(stack_size) = self.stack_size {
                    spawner = spawner.with_stack_size(stack_size);
                }
                let engine = MultiEngine::with_spawner(worker, shared, num_slots - 1, spawner)?;
                Ok(AnyEngine::Multi(engine))
            }
        }
    }
}

/// An engine of either realization, selected at runtime by an
/// [`EngineBuilder`].
pub enum AnyEngine<S: ?Sized, T: Send + 'static, W> {
    /// Multi-threaded engine.
    Multi(MultiEngine<S, T, W>),
    /// Mono-threaded engine.
    Mono(MonoEngine<S, T, W>),
}

impl<S: ?Sized, T: Send + 'static, W> AnyEngine<S, T, W> {
    /// Realization of this engine.
    pub fn mode(&self) -> EngineMode {
        match self {
            AnyEngine::Multi(_) => EngineMode::Multi,
            AnyEngine::Mono(_) => EngineMode::Mono,
        }
    }

    /// Read-only data currently shared with the work items.
    pub fn shared(&self) -> &Arc<S> {
        match self {
            AnyEngine::Multi(engine) => engine.shared(),
            AnyEngine::Mono(engine) => engine.shared(),
        }
    }

    /// Releases the engine, joining any outstanding thread first.
    pub fn free(self) {
        drop(self)
    }
}

impl<S, T, W> Engine for AnyEngine<S, T, W>
where
    S: ?Sized + Send + Sync + 'static,
    T: Default + Send + 'static,
    W: Worker<S, T> + Send + Sync + 'static,
{
    type Shared = S;
    type Worker = W;

    fn concurrency_bound(&self) -> usize {
        match self {
            AnyEngine::Multi(engine) => engine.concurrency_bound(),
            AnyEngine::Mono(engine) => engine.concurrency_bound(),
        }
    }

    fn launch_one(&mut self, item_index: usize) -> Result<(), LaunchError> {
        match self {
            AnyEngine::Multi(engine) => engine.launch_one(item_index),
            AnyEngine::Mono(engine) => engine.launch_one(item_index),
        }
    }

    fn launch_range(&mut self, max_item_index: usize) -> Result<(), LaunchError> {
        match self {
            AnyEngine::Multi(engine) => engine.launch_range(max_item_index),
            AnyEngine::Mono(engine) => engine.launch_range(max_item_index),
        }
    }

    fn retire_all(&mut self) {
        match self {
            AnyEngine::Multi(engine) => engine.retire_all(),
            AnyEngine::Mono(engine) => engine.retire_all(),
        }
    }

    fn rewind(&mut self, worker: W, shared: Arc<S>) {
        match self {
            AnyEngine::Multi(engine) => engine.rewind(worker, shared),
            AnyEngine::Mono(engine) => engine.rewind(worker, shared),
        }
    }

    fn stats(&self) -> EngineStats {
        match self {
            AnyEngine::Multi(engine) => engine.stats(),
            AnyEngine::Mono(engine) => engine.stats(),
        }
    }
}
