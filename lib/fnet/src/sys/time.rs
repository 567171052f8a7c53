// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments, periodics, etc.
//!
//! The stack has no clock of its own. The host passes in the current
//! time as a [`Moment`] (milliseconds from any fixed origin, usually
//! a SysTick counter) and [`Periodic`] turns elapsed time into whole
//! timer ticks.

/// A point in time, in milliseconds.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    millis: u64,
}

impl Moment {
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Milliseconds from `earlier` to `self`; zero if the clock went
    /// backwards.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        self.millis.saturating_sub(earlier.millis)
    }
}

/// Converts wall-clock progress into a count of fixed-length ticks.
#[derive(Clone, Copy, Debug)]
pub struct Periodic {
    period_ms: u64,
    last: Moment,
}

impl Periodic {
    pub fn new(period_ms: u64, start: Moment) -> Self {
        Self { period_ms: period_ms.max(1), last: start }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Return how many whole periods have elapsed since the last call
    /// and carry the remainder forward.
    pub fn advance(&mut self, now: Moment) -> u64 {
        let ticks = now.delta_as_millis(self.last) / self.period_ms;
        self.last = Moment::from_millis(
            self.last.millis() + ticks * self.period_ms,
        );
        ticks
    }
}
