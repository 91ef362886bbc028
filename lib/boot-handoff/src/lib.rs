// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootloader → application handoff block.
//!
//! A small piece of RAM that survives warm reset carries the bootloader's
//! account of why it loaded what it loaded. The bootloader writes it on every
//! boot; the application reads it exactly once during early init and then
//! the block is re-owned by the next bootloader run. No shared ownership
//! exists at any instant.
//!
//! The block is serialized with hubpack behind a `{version, magic}` header.
//! On a cold boot the RAM contents are garbage; a failed header check is how
//! the consumer learns it is looking at a cold boot rather than a warm one.
//!
//! The backing region is passed in as a slice so the whole thing runs on the
//! host; the platform layer points it at the real retained-RAM word range.

#![cfg_attr(not(test), no_std)]

use drv_image_api::{BootReason, SlotId};
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Size reserved for the handoff block in retained RAM.
pub const HANDOFF_REGION_SIZE: usize = 64;

/// Written as `cold_vs_warm_key` by the bootloader; any other value in that
/// field on load means the RAM did not survive (cold boot).
pub const WARM_BOOT_KEY: u32 = 0xCAFE_F00D;

const VERSION: u32 = 1;
const MAGIC: [u8; 12] = *b"BOOT-HANDOFF";

/// The header that prefixes the serialized block.
///
/// Version first so the payload type can evolve, magic second for visibility
/// in hexdumps.
#[derive(Serialize, Deserialize, SerializedSize)]
pub struct HandoffHeader {
    pub version: u32,
    pub magic: [u8; 12],
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct BootState {
    /// Total boots observed by the bootloader, monotonically increasing.
    pub start_count: u32,
    pub reason_last_loaded: BootReason,
    /// Which slot the bootloader jumped into. `None` when it halted without
    /// jumping (safe idle).
    pub last_loaded: Option<SlotId>,
    pub cold_vs_warm_key: u32,
}

const_assert!(
    HandoffHeader::MAX_SIZE + BootState::MAX_SIZE <= HANDOFF_REGION_SIZE
);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandoffLoadError {
    Deserialize,
    BadMagic,
    UnexpectedVersion(u32),
    /// Header parsed but the warm-boot key was absent: the region did not
    /// survive the reset.
    ColdBoot,
}

impl From<hubpack::Error> for HandoffLoadError {
    fn from(_: hubpack::Error) -> Self {
        HandoffLoadError::Deserialize
    }
}

impl BootState {
    /// Serializes `self` into the retained region. Returns the number of
    /// bytes written.
    pub fn store(&self, region: &mut [u8]) -> usize {
        let header = HandoffHeader {
            version: VERSION,
            magic: MAGIC,
        };
        // Failure to serialize into a region the const assert has already
        // sized is a programmer error, not a runtime condition.
        let n = hubpack::serialize(region, &header).unwrap();
        n + hubpack::serialize(&mut region[n..], self).unwrap()
    }

    /// Reads the block the bootloader left behind. The application calls
    /// this once; the result is not re-read later.
    pub fn load(region: &[u8]) -> Result<Self, HandoffLoadError> {
        let (header, rest) = hubpack::deserialize::<HandoffHeader>(region)?;
        if header.magic != MAGIC {
            return Err(HandoffLoadError::BadMagic);
        }
        if header.version != VERSION {
            return Err(HandoffLoadError::UnexpectedVersion(header.version));
        }
        let (state, _) = hubpack::deserialize::<BootState>(rest)?;
        if state.cold_vs_warm_key != WARM_BOOT_KEY {
            return Err(HandoffLoadError::ColdBoot);
        }
        Ok(state)
    }
}
