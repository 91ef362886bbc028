// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the shared SPI controller.
//!
//! The application processor has a single SPI controller with two devices
//! hanging off it on distinct chip selects: the external NAND flash and the
//! sensor micro (SM). Exactly one logical transaction may be outstanding at a
//! time; callers bracket multi-part transactions with `lock`/`release` (or
//! the RAII [`SpiServer::lock_auto`]).

#![cfg_attr(not(test), no_std)]

use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u32)]
pub enum SpiError {
    /// Transfer size is 0 or exceeds maximum
    BadTransferSize = 1,

    /// The controller reported a fault mid-transfer.
    Bus = 2,

    /// The device index handed to the server does not exist.
    BadDevice = 3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum CsState {
    NotAsserted = 0,
    Asserted = 1,
}

////////////////////////////////////////////////////////////////////////////////

pub struct ControllerLock<'a, S: SpiServer>(&'a S);

impl<S: SpiServer> Drop for ControllerLock<'_, S> {
    fn drop(&mut self) {
        // We ignore the result of release; there is nothing useful to do if
        // the controller is already unlocked.
        let _ = self.0.release();
    }
}

////////////////////////////////////////////////////////////////////////////////

pub trait SpiServer {
    /// Clocks `src` out while clocking `dest` in, full duplex. The two
    /// slices must be the same length.
    fn exchange(
        &self,
        device_index: u8,
        src: &[u8],
        dest: &mut [u8],
    ) -> Result<(), SpiError>;

    fn write(&self, device_index: u8, src: &[u8]) -> Result<(), SpiError>;

    fn read(&self, device_index: u8, dest: &mut [u8]) -> Result<(), SpiError>;

    /// Locks the controller to `device_index`, optionally asserting CS, until
    /// `release` is called. While locked, CS stays in the requested state
    /// across multiple transfers.
    fn lock(&self, device_index: u8, cs_state: CsState)
        -> Result<(), SpiError>;

    fn release(&self) -> Result<(), SpiError>;

    /// Variant of `lock` that returns a resource management object that, when
    /// dropped, will issue `release`. This makes it much easier to do fallible
    /// operations while locked.
    ///
    /// Otherwise, the rules are the same as for `lock`.
    fn lock_auto(
        &self,
        device_index: u8,
        cs_state: CsState,
    ) -> Result<ControllerLock<'_, Self>, SpiError>
    where
        Self: Sized,
    {
        self.lock(device_index, cs_state)?;
        Ok(ControllerLock(self))
    }

    /// Returns a `SpiDevice` that will use this controller with a fixed
    /// `device_index` for your convenience.
    ///
    /// This does _not_ check that `device_index` is valid!
    fn device(&self, device_index: u8) -> SpiDevice<Self>
    where
        Self: Sized + Clone,
    {
        SpiDevice::new(self.clone(), device_index)
    }
}

/// A wrapper for a `SpiServer` plus a fixed device index, so that callers
/// can stop worrying about which CS line they are supposed to be toggling.
#[derive(Clone)]
pub struct SpiDevice<S> {
    server: S,
    device_index: u8,
}

impl<S: SpiServer> SpiDevice<S> {
    pub fn new(server: S, device_index: u8) -> Self {
        Self {
            server,
            device_index,
        }
    }

    pub fn exchange(
        &self,
        src: &[u8],
        dest: &mut [u8],
    ) -> Result<(), SpiError> {
        self.server.exchange(self.device_index, src, dest)
    }

    pub fn write(&self, src: &[u8]) -> Result<(), SpiError> {
        self.server.write(self.device_index, src)
    }

    pub fn read(&self, dest: &mut [u8]) -> Result<(), SpiError> {
        self.server.read(self.device_index, dest)
    }

    pub fn lock(&self, cs_state: CsState) -> Result<(), SpiError> {
        self.server.lock(self.device_index, cs_state)
    }

    pub fn release(&self) -> Result<(), SpiError> {
        self.server.release()
    }

    pub fn lock_auto(
        &self,
        cs_state: CsState,
    ) -> Result<ControllerLock<'_, S>, SpiError> {
        self.server.lock_auto(self.device_index, cs_state)
    }
}
