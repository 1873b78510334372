// Copyright 2026-Present the detector-driver contributors
// SPDX-License-Identifier: Apache-2.0

//! The pending-frame map: buffers frames that arrive out of order until
//! their predecessors show up, then drains them in order (spec §4.4).

use std::collections::BTreeMap;

/// Holds frames whose index is ahead of `next_expected`. The invariant
/// `next_expected` is never itself a key in the map holds across every
/// public method.
#[derive(Debug, Default)]
pub struct PendingFrames<T> {
    next_expected: usize,
    pending: BTreeMap<usize, T>,
    bound: usize,
}

impl<T> PendingFrames<T> {
    pub fn new(bound: usize) -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
            bound,
        }
    }

    pub fn next_expected(&self) -> usize {
        self.next_expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Inserts `frame` at `index`. If `index == next_expected`, returns it
    /// (and any now-contiguous successors already buffered) in order; the
    /// internal cursor advances past all of them. Otherwise the frame is
    /// buffered and an empty vec is returned.
    ///
    /// Returns `Err(())` if accepting `frame` would push the pending map
    /// past its configured bound (caller maps this to
    /// [`crate::error::DriverError::Overrun`]).
    pub fn insert(&mut self, index: usize, frame: T) -> Result<Vec<T>, ()> {
        if index < self.next_expected {
            // Already delivered or stale; drop silently.
            return Ok(Vec::new());
        }

        if index != self.next_expected {
            if self.pending.len() >= self.bound {
                return Err(());
            }
            self.pending.insert(index, frame);
            return Ok(Vec::new());
        }

        let mut ready = vec![frame];
        self.next_expected += 1;
        while let Some(next) = self.pending.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected += 1;
        }
        Ok(ready)
    }
}
