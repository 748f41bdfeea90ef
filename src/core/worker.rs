// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker functions and the context they run with.

/// Context passed to every invocation of a [`Worker`].
///
/// The context is only valid for the duration of one invocation: results must
/// be written into memory reachable from the [shared data](Self::shared), and
/// read back by the launching thread once the work item is retired.
pub struct WorkerContext<'a, S: ?Sized> {
    shared: &'a S,
    item_index: usize,
    slot_index: usize,
}

impl<'a, S: ?Sized> WorkerContext<'a, S> {
    pub(crate) fn new(shared: &'a S, item_index: usize, slot_index: usize) -> Self {
        Self {
            shared,
            item_index,
            slot_index,
        }
    }

    /// Read-only data shared by every work item launched on the engine.
    pub fn shared(&self) -> &'a S {
        self.shared
    }

    /// Index of the work item, as passed to
    /// [`launch_one()`](crate::Engine::launch_one). Item indices are assigned
    /// by the caller and may be sparse or out of order.
    pub fn item_index(&self) -> usize {
        self.item_index
    }

    /// Index of the slot running this work item, in
    /// `0..=concurrency_bound`. No other work item runs in the same slot
    /// concurrently, so this can address per-slot scratch memory.
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }
}

impl<S: ?Sized> Clone for WorkerContext<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: ?Sized> Copy for WorkerContext<'_, S> {}

/// A function run once per launched work item.
///
/// `S` is the type of the shared read-only data and `T` the type of the
/// per-slot scratch space. Each slot owns one `T`, which is handed to the work
/// item running in that slot with exclusive access. Its contents on entry are
/// whatever the previous work item in that slot left behind (or
/// [`T::default()`](Default::default)), so workers must initialize it
/// themselves.
///
/// This is implemented for any function or closure with the matching
/// signature.
///
/// ```
/// # use spawnring::{Engine, MonoEngine, WorkerContext};
/// # use std::sync::atomic::{AtomicU64, Ordering};
/// # use std::sync::Arc;
/// fn square(context: &WorkerContext<'_, [AtomicU64]>, _scratch: &mut ()) {
///     let i = context.item_index();
///     context.shared()[i].store((i * i) as u64, Ordering::Relaxed);
/// }
///
/// let squares: Arc<[AtomicU64]> = (0..10).map(|_| AtomicU64::new(0)).collect();
/// let mut engine = MonoEngine::init(square, squares.clone());
/// engine.launch_range(9).unwrap();
/// engine.retire_all();
/// assert_eq!(squares[7].load(Ordering::Relaxed), 49);
/// ```
pub trait Worker<S: ?Sized, T> {
    /// Processes the work item described by the given context.
    fn run(&self, context: &WorkerContext<'_, S>, scratch: &mut T);
}

impl<S: ?Sized, T, F> Worker<S, T> for F
where
    F: Fn(&WorkerContext<'_, S>, &mut T),
{
    fn run(&self, context: &WorkerContext<'_, S>, scratch: &mut T) {
        self(context, scratch)
    }
}
