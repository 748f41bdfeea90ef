// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Single-threaded emulation of the engine.

use super::engine::{Engine, EngineStats};
use super::error::LaunchError;
use super::worker::{Worker, WorkerContext};
#[cfg(feature = "log_statistics")]
use crate::macros::log_info;
use crate::macros::{log_error, log_trace};
use std::sync::Arc;

/// An engine running each work item synchronously on the calling thread, in a
/// single slot.
///
/// This follows the same call sequence as a [`MultiEngine`](crate::MultiEngine)
/// and produces the same results for any worker that doesn't depend on
/// parallel timing, which makes it a reference to check workers against, and a
/// fallback where threads are unavailable. Each work item is retired as soon
/// as it returns, so [`retire_all()`](Engine::retire_all) has nothing to do.
pub struct MonoEngine<S: ?Sized, T, W> {
    /// Function run by every work item.
    worker: W,
    /// Read-only data shared by every work item.
    shared: Arc<S>,
    /// Scratch space of the single slot.
    scratch: T,
    stats: EngineStats,
}

impl<S: ?Sized, T: Default, W: Worker<S, T>> MonoEngine<S, T, W> {
    /// Creates an engine running `worker` on the calling thread.
    pub fn init(worker: W, shared: Arc<S>) -> Self {
        Self {
            worker,
            shared,
            scratch: T::default(),
            stats: EngineStats::default(),
        }
    }
}

impl<S: ?Sized, T, W> MonoEngine<S, T, W> {
    /// Read-only data currently shared with the work items.
    pub fn shared(&self) -> &Arc<S> {
        &self.shared
    }

    /// Releases the engine.
    pub fn free(self) {
        drop(self)
    }
}

impl<S: ?Sized, T, W: Worker<S, T>> Engine for MonoEngine<S, T, W> {
    type Shared = S;
    type Worker = W;

    fn concurrency_bound(&self) -> usize {
        0
    }

    fn launch_one(&mut self, item_index: usize) -> Result<(), LaunchError> {
        log_trace!("[main thread] Running item {item_index} in slot #0");
        // Accounts for the work item even if the worker panics.
        let retirement = Retirement {
            stats: &mut self.stats,
        };
        let context = WorkerContext::new(&*self.shared, item_index, 0);
        self.worker.run(&context, &mut self.scratch);
        drop(retirement);
        Ok(())
    }

    fn retire_all(&mut self) {}

    fn rewind(&mut self, worker: W, shared: Arc<S>) {
        self.worker = worker;
        self.shared = shared;
    }

    fn stats(&self) -> EngineStats {
        self.stats
    }
}

#[cfg(feature = "log_statistics")]
impl<S: ?Sized, T, W> Drop for MonoEngine<S, T, W> {
    fn drop(&mut self) {
        log_info!("[main thread] Engine statistics: {:?}", self.stats);
    }
}

/// Object whose destructor records that a work item ran to completion (or
/// panicked) in the single slot.
struct Retirement<'a> {
    stats: &'a mut EngineStats,
}

impl Drop for Retirement<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log_error!("[main thread] Detected panic in the worker");
            self.stats.panicked += 1;
        }
        self.stats.launched += 1;
        self.stats.retired += 1;
        self.stats.peak_outstanding = 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    type Log = RefCell<Vec<(usize, usize, u32)>>;

    /// Records each invocation, along with a counter kept in the scratch space.
    fn log_invocation(context: &WorkerContext<'_, Log>, scratch: &mut u32) {
        *scratch += 1;
        context
            .shared()
            .borrow_mut()
            .push((context.item_index(), context.slot_index(), *scratch));
    }

    fn log_twice(context: &WorkerContext<'_, Log>, scratch: &mut u32) {
        log_invocation(context, scratch);
        log_invocation(context, scratch);
    }

    #[test]
    fn test_runs_synchronously_in_order() {
        let log = Arc::new(Log::default());
        let mut engine: MonoEngine<Log, u32, _> = MonoEngine::init(log_invocation, log.clone());
        assert_eq!(engine.concurrency_bound(), 0);

        engine.launch_one(5).unwrap();
        // Already executed, before any retire-all.
        assert_eq!(*log.borrow(), [(5, 0, 1)]);

        engine.launch_range(2).unwrap();
        engine.retire_all();
        assert_eq!(*log.borrow(), [(5, 0, 1), (0, 0, 2), (1, 0, 3), (2, 0, 4)]);

        let stats = engine.stats();
        assert_eq!(stats.launched, 4);
        assert_eq!(stats.retired, 4);
        assert_eq!(stats.peak_outstanding, 1);
        assert_eq!(stats.spawn_retries, 0);
    }

    #[test]
    fn test_rewind() {
        let first = Arc::new(Log::default());
        let second = Arc::new(Log::default());
        let mut engine: MonoEngine<Log, u32, fn(&WorkerContext<'_, Log>, &mut u32)> =
            MonoEngine::init(log_invocation as fn(&WorkerContext<'_, Log>, &mut u32), first.clone());
        engine.launch_range(1).unwrap();
        engine.retire_all();

        engine.rewind(log_twice, second.clone());
        engine.launch_one(9).unwrap();
        engine.retire_all();

        assert_eq!(*first.borrow(), [(0, 0, 1), (1, 0, 2)]);
        // The scratch space survives the rewind.
        assert_eq!(*second.borrow(), [(9, 0, 3), (9, 0, 4)]);
        assert!(Arc::ptr_eq(engine.shared(), &second));
    }

    fn panic_on_three(context: &WorkerContext<'_, Log>, scratch: &mut u32) {
        if context.item_index() == 3 {
            panic!("arithmetic panic");
        }
        log_invocation(context, scratch);
    }

    #[test]
    #[should_panic = "arithmetic panic"]
    fn test_panic_unwinds_through_launch() {
        let log = Arc::new(Log::default());
        let mut engine: MonoEngine<Log, u32, _> = MonoEngine::init(panic_on_three, log);
        engine.launch_range(5).unwrap();
    }

    #[test]
    fn test_panic_stops_launch_range() {
        let log = Arc::new(Log::default());
        let mut engine: MonoEngine<Log, u32, _> = MonoEngine::init(panic_on_three, log.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| engine.launch_range(5)));
        assert!(outcome.is_err());
        assert_eq!(log.borrow().len(), 3);

        let stats = engine.stats();
        assert_eq!(stats.launched, 4);
        assert_eq!(stats.retired, 4);
        assert_eq!(stats.panicked, 1);

        // The engine keeps working after the panic.
        engine.launch_one(4).unwrap();
        assert_eq!(log.borrow().last(), Some(&(4, 0, 4)));
    }
}
