// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for board-level plumbing: GPIO, blocking delays, the shared
//! UART, and the external watchdog.
//!
//! Every driver in this workspace reaches hardware through these traits so
//! the protocol and policy layers can be exercised on the host with fakes.

#![cfg_attr(not(test), no_std)]

/// One GPIO line, identified by a board-assigned index. The mapping from
/// index to port/pin lives with the HAL glue, not here.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pin(pub u8);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PinState {
    Low,
    High,
}

impl From<bool> for PinState {
    fn from(high: bool) -> Self {
        if high {
            PinState::High
        } else {
            PinState::Low
        }
    }
}

/// GPIO access.
pub trait Sys {
    /// Drives `pin` high.
    fn gpio_set(&self, pin: Pin);

    /// Drives `pin` low.
    fn gpio_reset(&self, pin: Pin);

    /// Samples an input pin.
    fn gpio_read(&self, pin: Pin) -> PinState;

    fn gpio_write(&self, pin: Pin, state: PinState) {
        match state {
            PinState::High => self.gpio_set(pin),
            PinState::Low => self.gpio_reset(pin),
        }
    }
}

/// Blocking delay, used only for hardware timing (reset pulses, boot
/// settle). Protocol timeouts are counted in units of these sleeps.
pub trait Delay {
    fn sleep_for(&self, ms: u64);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UartError {
    /// The transfer did not complete in time.
    Timeout,
    /// Hardware-level receive fault (framing, overrun).
    Fault,
}

/// Blocking UART access. The one physical UART is muxed between the debug
/// console and the SM's serial bootloader; routing is the caller's problem
/// (see `drv-ssm-flash`).
pub trait Uart {
    fn send(&mut self, data: &[u8]) -> Result<(), UartError>;

    /// Receives exactly `buf.len()` bytes. A zero-length `buf` returns
    /// immediately; some commands have no response.
    fn recv(&mut self, buf: &mut [u8]) -> Result<(), UartError>;
}

/// The external watchdog. Kicking it is all we ever do; if we stop, it
/// resets the board.
pub trait Watchdog {
    fn kick(&self);
}
