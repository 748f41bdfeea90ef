// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::TryReserveError;
use std::io;

/// Raised when an engine cannot be created.
///
/// No partially initialized engine is ever returned alongside this error.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// The number of slots (`concurrency_bound + 1`) overflows `usize`.
    #[error("a concurrency bound of {concurrency_bound} needs more slots than can be represented")]
    CapacityOverflow {
        /// The requested concurrency bound.
        concurrency_bound: usize,
    },
    /// The slot ring could not be allocated.
    #[error("failed to allocate a ring of {slots} slots")]
    Allocation {
        /// Number of slots that were requested.
        slots: usize,
        /// Underlying allocation failure.
        #[source]
        source: TryReserveError,
    },
    /// The number of slots was derived from the available parallelism, which
    /// couldn't be determined.
    #[error("getting the available parallelism failed")]
    Parallelism(#[source] io::Error),
    /// CPU pinning was required but isn't implemented on this platform.
    #[error("pinning threads to CPUs is not implemented on this platform")]
    PinningUnsupported,
}

/// Raised when a work item could not be launched.
///
/// Whatever was launched before the failure is still outstanding: the caller
/// must still call [`retire_all()`](crate::Engine::retire_all) before reading
/// results.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Thread creation kept failing for lack of resources, and no outstanding
    /// thread was left to retire to free some.
    #[error("thread creation for item {item_index} is out of resources with no thread left to retire")]
    Exhausted {
        /// Item whose launch failed.
        item_index: usize,
        /// Last error reported by the OS.
        #[source]
        source: io::Error,
    },
    /// Thread creation failed for a reason that retrying cannot fix.
    #[error("thread creation for item {item_index} failed")]
    Spawn {
        /// Item whose launch failed.
        item_index: usize,
        /// Error reported by the OS.
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    /// Index of the work item that failed to launch.
    pub fn item_index(&self) -> usize {
        match self {
            LaunchError::Exhausted { item_index, .. } | LaunchError::Spawn { item_index, .. } => {
                *item_index
            }
        }
    }
}
