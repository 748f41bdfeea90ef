// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Circular slot allocator.
//!
//! The ring only tracks indices: which slot the next launch goes to, which slot
//! is the oldest outstanding one, and how many slots are outstanding. The slot
//! contents live alongside it in the engine.

/// Index arithmetic over a fixed ring of `max_index + 1` slots.
///
/// Slots are launched at `launch_index` and retired at `retire_index`, both
/// advancing circularly. Because both indices are equal when the ring is empty
/// and when it is full, the number of outstanding slots disambiguates the two
/// states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRing {
    /// Highest valid slot index, i.e. the concurrency bound.
    max_index: usize,
    /// Slot that the next launch will occupy.
    launch_index: usize,
    /// Oldest outstanding slot, if any.
    retire_index: usize,
    /// Number of launched but not yet retired slots.
    outstanding: usize,
}

impl SlotRing {
    /// Creates an empty ring with slots `0..=max_index`.
    pub fn new(max_index: usize) -> Self {
        Self {
            max_index,
            launch_index: 0,
            retire_index: 0,
            outstanding: 0,
        }
    }

    /// Highest valid slot index.
    pub fn max_index(&self) -> usize {
        self.max_index
    }

    /// Number of launched but not yet retired slots.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding == 0
    }

    /// Whether every slot is outstanding. In that case the launch index points
    /// at the oldest outstanding slot, which must be retired before reuse.
    pub fn is_full(&self) -> bool {
        self.outstanding > self.max_index
    }

    /// Slot that the next launch will occupy. Only free if the ring isn't
    /// [full](Self::is_full).
    pub fn launch_index(&self) -> usize {
        self.launch_index
    }

    /// Oldest outstanding slot, or [`None`] if the ring is empty.
    pub fn oldest(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.retire_index)
        }
    }

    /// Marks the slot at the launch index as outstanding and returns its index.
    pub fn commit_launch(&mut self) -> usize {
        assert!(!self.is_full(), "launching into a full slot ring");
        let index = self.launch_index;
        self.launch_index = self.next(index);
        self.outstanding += 1;
        index
    }

    /// Marks the oldest outstanding slot as retired and returns its index.
    pub fn commit_retire(&mut self) -> usize {
        assert!(!self.is_empty(), "retiring from an empty slot ring");
        let index = self.retire_index;
        self.retire_index = self.next(index);
        self.outstanding -= 1;
        index
    }

    /// Rewinds both indices to slot 0. Only valid once every slot is retired.
    pub fn reset(&mut self) {
        assert!(self.is_empty(), "resetting a slot ring with outstanding slots");
        self.launch_index = 0;
        self.retire_index = 0;
    }

    fn next(&self, index: usize) -> usize {
        if index == self.max_index {
            0
        } else {
            index + 1
        }
    }
}
