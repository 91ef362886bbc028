// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for debugging drivers and tasks.
//!
//! Each module that wants tracing declares a static ring of a local `Trace`
//! enum and records entries at interesting points. The rings are designed to
//! be read out of a memory dump (or inspected directly in host tests); they
//! are cheap enough to leave in production code.
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module.
//!
//! ```ignore
//! ringbuf!(Trace, 16, Trace::None);
//!
//! // ...
//!
//! ringbuf_entry!(Trace::PasswordAccepted);
//! ```
//!
//! Consecutive identical entries recorded from the same line are coalesced
//! into a single entry with a bumped `count`, so a polling loop does not
//! flood the ring.

#![cfg_attr(not(test), no_std)]

/// One slot in a ring. `count` is how many times this payload was recorded
/// consecutively; `generation` increments each time the slot is rewritten,
/// which lets a reader order entries across the wrap point.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub fn new(unused: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: unused,
            }; N],
        }
    }

    pub fn entry(&mut self, payload: T, line: u16) {
        if let Some(last) = self.last {
            let ent = &mut self.buffer[last];
            if ent.line == line && ent.payload == payload {
                ent.count = ent.count.wrapping_add(1);
                return;
            }
        }

        let ndx = match self.last {
            Some(last) if last + 1 < N => last + 1,
            _ => 0,
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            generation: ent.generation.wrapping_add(1),
            count: 1,
            payload,
        };

        self.last = Some(ndx);
    }
}

/// The static wrapper the `ringbuf!` macro instantiates. A spin mutex keeps
/// recording safe from any context without `static mut` tricks.
pub struct StaticRingbuf<T: Copy + PartialEq, const N: usize> {
    inner: spin::Mutex<Ringbuf<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> StaticRingbuf<T, N> {
    /// Wraps a fully built ring. The [`ringbuf!`] macro builds the ring as
    /// a constant expression at the declaration site, which keeps this
    /// constructor trivially `const`.
    pub const fn new(ring: Ringbuf<T, N>) -> Self {
        Self {
            inner: spin::Mutex::new(ring),
        }
    }

    pub fn record(&self, payload: T, line: u16) {
        self.inner.lock().entry(payload, line);
    }

    /// Runs `f` against the ring contents. Intended for tests and dump
    /// tooling, not for the recording path.
    pub fn with<R>(&self, f: impl FnOnce(&Ringbuf<T, N>) -> R) -> R {
        f(&self.inner.lock())
    }

    /// The most recently recorded entry, if any.
    pub fn last_entry(&self) -> Option<RingbufEntry<T>> {
        let guard = self.inner.lock();
        guard.last.map(|ndx| guard.buffer[ndx])
    }
}

#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::StaticRingbuf<$t, $n> =
            $crate::StaticRingbuf::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[macro_export]
macro_rules! ringbuf_entry {
    ($name:ident, $payload:expr) => {
        $name.record($payload, line!() as u16);
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}
