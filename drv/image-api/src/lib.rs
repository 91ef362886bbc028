// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared vocabulary for firmware images: slots, operational states,
//! versions, the on-flash layout, and the two-record package format used by
//! both the OTA pipeline and the manufacturing staging area.

#![cfg_attr(not(test), no_std)]

use crc::{Crc, CRC_16_IBM_3740};
use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

mod package;

pub use package::{
    read_version, validate_package, PackageError, PackageInfo, RecordHeader,
    RecordType, CRC_LEN, FW_VERSION_OFFSET, MAX_AP_IMAGE_LEN,
    MAX_SSM_IMAGE_LEN, RECORD_HEADER_LEN,
};

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), used for image bodies, the
/// staged package records, and the SM serial bootloader frames. Both MCUs
/// must agree on this bit for bit.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Convenience one-shot CRC over a byte slice. Total on any input.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Designates one of the two firmware slots on the external NAND. Each slot
/// stores an AP image and the matching SM record.
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
#[repr(u8)]
pub enum SlotId {
    A = 0,
    B = 1,
}

impl SlotId {
    /// The other slot. Fallback, OTA, and rollback logic all hinge on this.
    pub fn alternate(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }
}

impl TryFrom<u8> for SlotId {
    type Error = ();
    fn try_from(i: u8) -> Result<Self, Self::Error> {
        match i {
            0 => Ok(Self::A),
            1 => Ok(Self::B),
            _ => Err(()),
        }
    }
}

/// How much we trust the image in a slot.
///
/// `Unknown` means freshly written, bootability untried. `Partial` means it
/// ran at least once but has not confirmed cloud connectivity. `Full` means
/// it ran and reached the cloud. `Failed` means it refused to boot or forced
/// a fallback and must never be picked again until rewritten.
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
#[repr(u8)]
pub enum ImageOpState {
    Unknown = 0,
    Partial = 1,
    Full = 2,
    Failed = 3,
}

/// Firmware version triple carried in image metadata and the registry.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub struct ImageVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl ImageVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }
}

/// Why the bootloader loaded the image it loaded. Written into the handoff
/// cache on every boot and consumed exactly once by the application.
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
#[repr(u8)]
pub enum BootReason {
    Nominal = 0,
    Upgrade = 1,
    Fallback = 2,
    OffNominal = 3,
    Panic = 4,
    Unknown = 5,
    Manufacturing = 6,
}

/// On-NAND layout, addresses in bytes. The registry block sits above both
/// slots; everything below it belongs to the image regions.
pub mod layout {
    use super::SlotId;

    pub const SLOT_A_AP_START: u32 = 0x00_0000;
    pub const SLOT_A_SSM_START: u32 = 0x10_0000;
    pub const SLOT_B_AP_START: u32 = 0x20_0000;
    pub const SLOT_B_SSM_START: u32 = 0x30_0000;

    /// Registry and persisted configuration pages.
    pub const REGISTRY_START: u32 = 0x40_0000;

    pub fn ap_image_start(slot: SlotId) -> u32 {
        match slot {
            SlotId::A => SLOT_A_AP_START,
            SlotId::B => SLOT_B_AP_START,
        }
    }

    pub fn ssm_record_start(slot: SlotId) -> u32 {
        match slot {
            SlotId::A => SLOT_A_SSM_START,
            SlotId::B => SLOT_B_SSM_START,
        }
    }
}
