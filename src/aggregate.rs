// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared building blocks for the windowed-aggregate stages (CMA, EMA, MAV, RMS, and the linear
//! regression stage's per-channel window).
//!
//! Rather than a class hierarchy, reuse is expressed as two small value-typed primitives:
//! [`CircularWindow`], a fixed-capacity ring buffer of raw samples plus an eviction signal the
//! caller folds into its own running statistic, and [`PerChannelState`], the lazy-allocate/rebuild-
//! on-channel-change lifecycle every channel-aware stage shares.

use smallvec::SmallVec;

/// A fixed-capacity ring buffer of `f32` samples.
///
/// [`CircularWindow::push`] returns the evicted sample (if the window was already full) so the
/// caller can update a running statistic (e.g. `running_sum -= evicted.abs()`) without re-scanning
/// the window. [`CircularWindow::iter_arrival_order`] walks the current contents oldest-to-newest,
/// which is what the linear regression stage needs to assign `x = 0, 1, ..., count-1`.
#[derive(Debug, Clone)]
pub struct CircularWindow {
    data: Vec<f32>,
    write_idx: usize,
    len: usize,
}

impl CircularWindow {
    pub fn new(capacity: usize) -> Self {
        Self { data: vec![0.0; capacity], write_idx: 0, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Admit `x`. Returns the evicted sample if the window was already at capacity.
    pub fn push(&mut self, x: f32) -> Option<f32> {
        let cap = self.capacity();
        let evicted = if self.len == cap { Some(self.data[self.write_idx]) } else { None };
        self.data[self.write_idx] = x;
        self.write_idx = (self.write_idx + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
        evicted
    }

    /// Walk the current contents in arrival (oldest-to-newest) order.
    pub fn iter_arrival_order(&self) -> impl Iterator<Item = f32> + '_ {
        let start = if self.len < self.capacity() { 0 } else { self.write_idx };
        let cap = self.capacity().max(1);
        (0..self.len).map(move |i| self.data[(start + i) % cap])
    }

    /// Read-only access to the underlying index used by the arrival-order walk, needed by stages
    /// that must replicate "read `buf[(write_idx + i) mod W]`" exactly (the linear regression
    /// stage's specified enumeration when the window is full).
    pub fn write_idx(&self) -> usize {
        self.write_idx
    }

    pub fn raw(&self) -> &[f32] {
        &self.data
    }

    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
        self.write_idx = 0;
        self.len = 0;
    }

    /// Recompute a fold (e.g. `sum(|x|)` or `sum(x*x)`) over the current contents. Used by restore
    /// validation to cross-check a persisted running statistic against the window it was derived
    /// from.
    pub fn fold<A>(&self, init: A, f: impl Fn(A, f32) -> A) -> A {
        self.iter_arrival_order().fold(init, f)
    }
}

/// The lazy-allocate/rebuild-on-channel-change lifecycle shared by every channel-aware stage: a
/// stage is "unbound" until it first sees a channel count, then lazily allocates exactly that many
/// per-channel state records. A later call with a different channel count rebuilds the set from
/// scratch, discarding all prior continuity, per the channel-count stability contract the driver
/// guarantees.
#[derive(Debug, Clone, Default)]
pub struct PerChannelState<S> {
    channels: SmallVec<[S; 2]>,
    bound_num_channels: Option<usize>,
}

impl<S> PerChannelState<S> {
    pub fn new() -> Self {
        Self { channels: SmallVec::new(), bound_num_channels: None }
    }

    /// Ensure exactly `num_channels` records exist, rebuilding from `make` if the channel count
    /// has changed (or this is the first call).
    pub fn bind(&mut self, num_channels: usize, make: impl Fn() -> S) {
        if self.bound_num_channels != Some(num_channels) {
            self.channels = (0..num_channels).map(|_| make()).collect();
            self.bound_num_channels = Some(num_channels);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound_num_channels.is_some()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.channels.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.channels.iter()
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut S {
        &mut self.channels[idx]
    }

    pub fn get(&self, idx: usize) -> &S {
        &self.channels[idx]
    }

    /// Discard all per-channel state, returning to the unbound, post-construction lifecycle state.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.bound_num_channels = None;
    }

    /// Replace the per-channel records wholesale, e.g. when restoring from a serialized payload.
    /// `records` also fixes the bound channel count.
    pub fn restore(&mut self, records: impl IntoIterator<Item = S>) {
        self.channels = records.into_iter().collect();
        self.bound_num_channels = Some(self.channels.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_circular_window_eviction_and_order() {
        let mut w = CircularWindow::new(3);
        assert_eq!(w.push(1.0), None);
        assert_eq!(w.push(2.0), None);
        assert_eq!(w.push(3.0), None);
        assert!(w.is_full());
        assert_eq!(w.iter_arrival_order().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);

        assert_eq!(w.push(4.0), Some(1.0));
        assert_eq!(w.iter_arrival_order().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn verify_per_channel_state_rebuilds_on_channel_change() {
        let mut s: PerChannelState<i32> = PerChannelState::new();
        s.bind(2, || 0);
        *s.get_mut(0) = 5;
        assert_eq!(s.num_channels(), 2);

        // Same channel count: no rebuild, state preserved.
        s.bind(2, || 0);
        assert_eq!(*s.get(0), 5);

        // Different channel count: full rebuild.
        s.bind(3, || 7);
        assert_eq!(s.num_channels(), 3);
        assert_eq!(*s.get(0), 7);
    }
}
