// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Creation and joining of OS threads.

use super::error::InitError;
use crate::macros::{log_debug, log_warn};
use crossbeam_utils::Backoff;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::any::Any;
use std::io;
use std::thread::JoinHandle;

/// Policy to pin launched threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin launched threads to CPUs.
    No,
    /// Pin the thread running in slot `k` to CPU `k % num_cpus`, if CPU pinning
    /// is supported and implemented on this platform.
    IfSupported,
    /// Pin the thread running in slot `k` to CPU `k % num_cpus`. If CPU pinning
    /// isn't supported on this platform (or not implemented), creating the
    /// engine fails.
    Always,
}

/// Outcome of a [`ThreadSpawner::join()`] call.
pub enum Joined<T, H> {
    /// The thread ran to completion and returned this value.
    Finished(T),
    /// The thread panicked with this payload.
    Panicked(Box<dyn Any + Send + 'static>),
    /// The OS failed to join the thread, which may still be running. The
    /// handle is given back so that the join can be retried.
    Interrupted(H),
}

/// A way to create and join threads, each returning a value of type `T`.
pub trait ThreadSpawner<T> {
    /// Handle to a running thread.
    type Handle;

    /// Starts a new thread running `task` on behalf of the given slot.
    ///
    /// On failure, `task` is dropped without running.
    fn spawn<F>(&self, slot_index: usize, task: F) -> io::Result<Self::Handle>
    where
        F: FnOnce() -> T + Send + 'static;

    /// Waits for the given thread to finish.
    fn join(&self, handle: Self::Handle) -> Joined<T, Self::Handle>;
}

/// Returns whether a thread creation error signals a temporary shortage of
/// resources (`EAGAIN` or `ENOMEM`), which retiring an outstanding thread may
/// resolve.
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory
    )
}

/// Joins the given thread, retrying for as long as the OS fails to join it.
///
/// This never gives up: the thread may still be using its slot, so returning
/// early would let the slot be reused under a live thread. A hang is preferred
/// over that.
pub(crate) fn join_until_finished<T, P: ThreadSpawner<T>>(
    spawner: &P,
    #[allow(unused_variables)] slot_index: usize,
    mut handle: P::Handle,
) -> Result<T, Box<dyn Any + Send + 'static>> {
    let backoff = Backoff::new();
    loop {
        match spawner.join(handle) {
            Joined::Finished(t) => return Ok(t),
            Joined::Panicked(payload) => return Err(payload),
            Joined::Interrupted(h) => {
                log_warn!("[main thread] Failed to join the thread in slot #{slot_index}, retrying");
                handle = h;
                backoff.snooze();
            }
        }
    }
}

/// Spawns OS threads via [`std::thread::Builder`].
#[derive(Clone, Debug)]
pub struct OsThreads {
    /// Prefix of the thread names, suffixed with the slot index.
    thread_name: Option<String>,
    /// Stack size of the spawned threads, or the platform default.
    stack_size: Option<usize>,
    /// Policy to pin spawned threads to CPUs.
    #[allow(dead_code)]
    cpu_pinning: CpuPinningPolicy,
    /// Number of CPUs that threads are pinned to, in a round-robin fashion
    /// over the slot indices.
    #[allow(dead_code)]
    num_cpus: usize,
}

impl Default for OsThreads {
    fn default() -> Self {
        Self {
            thread_name: None,
            stack_size: None,
            cpu_pinning: CpuPinningPolicy::No,
            num_cpus: 1,
        }
    }
}

impl OsThreads {
    /// Creates a spawner pinning threads according to the given policy.
    pub fn new(cpu_pinning: CpuPinningPolicy) -> Result<Self, InitError> {
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => return Err(InitError::PinningUnsupported),
        }

        let num_cpus = match cpu_pinning {
            CpuPinningPolicy::No => 1,
            CpuPinningPolicy::IfSupported | CpuPinningPolicy::Always => {
                std::thread::available_parallelism()
                    .map_err(InitError::Parallelism)?
                    .get()
            }
        };

        Ok(Self {
            thread_name: None,
            stack_size: None,
            cpu_pinning,
            num_cpus,
        })
    }

    /// Names spawned threads `{prefix}-{slot_index}`.
    pub fn with_thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = Some(prefix.into());
        self
    }

    /// Sets the stack size of spawned threads.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    fn pin_current_thread(cpu_pinning: CpuPinningPolicy, slot_index: usize, cpu: usize) {
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                let mut cpu_set = CpuSet::new();
                if let Err(_e) = cpu_set.set(cpu) {
                    log_warn!("Failed to set CPU affinity for slot #{slot_index}: {_e}");
                } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                    log_warn!("Failed to set CPU affinity for slot #{slot_index}: {_e}");
                } else {
                    log_debug!("Pinned slot #{slot_index} to CPU #{cpu}");
                }
            }
            CpuPinningPolicy::Always => {
                let mut cpu_set = CpuSet::new();
                if let Err(e) = cpu_set.set(cpu) {
                    panic!("Failed to set CPU affinity for slot #{slot_index}: {e}");
                } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                    panic!("Failed to set CPU affinity for slot #{slot_index}: {e}");
                } else {
                    log_debug!("Pinned slot #{slot_index} to CPU #{cpu}");
                }
            }
        }
    }
}

impl<T: Send + 'static> ThreadSpawner<T> for OsThreads {
    type Handle = JoinHandle<T>;

    fn spawn<F>(&self, slot_index: usize, task: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let mut builder = std::thread::Builder::new();
        if let Some(prefix) = &self.thread_name {
            builder = builder.name(format!("{prefix}-{slot_index}"));
        }
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        #[cfg(all(
            not(miri),
            any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            )
        ))]
        {
            let cpu_pinning = self.cpu_pinning;
            let cpu = slot_index % self.num_cpus;
            builder.spawn(move || {
                Self::pin_current_thread(cpu_pinning, slot_index, cpu);
                task()
            })
        }

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        builder.spawn(task)
    }

    fn join(&self, handle: JoinHandle<T>) -> Joined<T, JoinHandle<T>> {
        // The standard library panics on an OS-level join failure rather than
        // reporting it, so only completion or panic can be observed here.
        match handle.join() {
            Ok(t) => Joined::Finished(t),
            Err(payload) => Joined::Panicked(payload),
        }
    }
}
