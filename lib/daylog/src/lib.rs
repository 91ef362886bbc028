// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SM's day-closer FIFO.
//!
//! Once a day the SM folds its 24 hourly buckets into a
//! [`SensorDataEntry`] and appends it here. The AP drains the ring over
//! SPI: count, fetch, then an explicit stored-to-flash ack per entry. The
//! tail advances on the ack and on nothing else; an entry the AP fetched
//! but never acked is simply fetched again on the next wake.
//!
//! If days pass without an AP visit and the ring fills, closing a new day
//! overwrites the oldest unacked entry; losing the oldest day beats losing
//! the newest.

#![cfg_attr(not(test), no_std)]

use drv_ssm_api::SensorDataEntry;
use heapless::Deque;

pub struct DayLog<const N: usize> {
    ring: Deque<SensorDataEntry, N>,
}

impl<const N: usize> Default for DayLog<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DayLog<N> {
    pub fn new() -> Self {
        Self { ring: Deque::new() }
    }

    /// Appends a freshly closed day. On a full ring the oldest entry is
    /// dropped to make room.
    pub fn close_day(&mut self, entry: SensorDataEntry) {
        if self.ring.is_full() {
            self.ring.pop_front();
        }
        // Cannot fail: we just guaranteed a free slot.
        let _ = self.ring.push_back(entry);
    }

    /// Entries awaiting drain; the answer to `GetEntriesInLog`.
    pub fn num_entries(&self) -> u16 {
        self.ring.len() as u16
    }

    /// The answer to `GetSensorDataEntries(remaining)`: the AP counts
    /// `remaining` down from `num_entries()` as it acks, so the requested
    /// entry is always `remaining` slots back from the head, i.e. the oldest
    /// unacked one when the two are in step.
    pub fn get(&self, remaining: u16) -> Option<&SensorDataEntry> {
        let remaining = remaining as usize;
        if remaining == 0 || remaining > self.ring.len() {
            return None;
        }
        self.ring.iter().nth(self.ring.len() - remaining)
    }

    /// The stored-to-flash ack: advance the tail past the oldest entry.
    /// Returns `false` (and moves nothing) on an empty ring.
    pub fn ack_stored(&mut self) -> bool {
        self.ring.pop_front().is_some()
    }
}
