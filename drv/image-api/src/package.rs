// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two-record image package format.
//!
//! A package is `AP_record || SM_record`, each record being a 5-byte header
//! (`type`, big-endian `length`) followed by `length` body bytes. The first
//! two body bytes are a stored CRC-16 over everything after them. The same
//! format arrives over HTTP during OTA and sits in the internal-flash staging
//! area during manufacturing.

use crate::{ImageVersion, CRC16};

/// `type` byte plus the 4-byte big-endian body length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Stored CRC-16 at the front of each record body.
pub const CRC_LEN: usize = 2;

/// Offset of the firmware version triple from the start of an AP record
/// (header included): three big-endian u32s at 12..24.
pub const FW_VERSION_OFFSET: usize = 12;

/// 2 MiB minus the bootloader's reserve.
pub const MAX_AP_IMAGE_LEN: u32 = 0x1D_C130;

pub const MAX_SSM_IMAGE_LEN: u32 = 0xFF80;

/// The stored CRC covers the record from this offset (header plus the CRC
/// bytes themselves are excluded).
const CRC_COVERAGE_START: usize = RECORD_HEADER_LEN + CRC_LEN;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
    Ap = 0x01,
    Ssm = 0x02,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PackageError {
    /// Fewer bytes than a record header needs.
    Truncated,
    /// First byte of a record was not a known record type.
    BadRecordType(u8),
    /// Expected an AP record here.
    NotApRecord,
    /// Expected an SM record here.
    NotSsmRecord,
    ApTooLong,
    SsmTooLong,
    /// Stored vs. computed CRC of one of the records.
    CrcMismatch { stored: u16, computed: u16 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub length: u32,
}

impl RecordHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, PackageError> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Err(PackageError::Truncated);
        }
        let record_type = match bytes[0] {
            0x01 => RecordType::Ap,
            0x02 => RecordType::Ssm,
            b => return Err(PackageError::BadRecordType(b)),
        };
        let length = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Ok(Self {
            record_type,
            length,
        })
    }

    /// Total record size including the header.
    pub fn total_len(&self) -> usize {
        RECORD_HEADER_LEN + self.length as usize
    }
}

/// Pulls the firmware version triple out of an AP record (header included).
/// The caller must have checked that at least 24 bytes are present.
pub fn read_version(record: &[u8]) -> ImageVersion {
    let word = |off: usize| {
        u32::from_be_bytes([
            record[off],
            record[off + 1],
            record[off + 2],
            record[off + 3],
        ])
    };
    ImageVersion {
        major: word(FW_VERSION_OFFSET),
        minor: word(FW_VERSION_OFFSET + 4),
        build: word(FW_VERSION_OFFSET + 8),
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PackageInfo {
    pub ap_len: u32,
    pub ssm_len: u32,
    pub version: ImageVersion,
}

fn validate_record(record: &[u8], header: &RecordHeader) -> Result<(), PackageError> {
    let len = header.length as usize;
    if record.len() < RECORD_HEADER_LEN + len || len < CRC_LEN {
        return Err(PackageError::Truncated);
    }
    let stored = u16::from_be_bytes([
        record[RECORD_HEADER_LEN],
        record[RECORD_HEADER_LEN + 1],
    ]);
    let computed =
        CRC16.checksum(&record[CRC_COVERAGE_START..RECORD_HEADER_LEN + len]);
    if stored != computed {
        return Err(PackageError::CrcMismatch { stored, computed });
    }
    Ok(())
}

/// Validates a staged two-record package in place. Used by the bootloader to
/// decide whether the internal-flash staging area holds a manufacturing
/// image, and by tests to build known-good packages.
pub fn validate_package(staged: &[u8]) -> Result<PackageInfo, PackageError> {
    let ap = RecordHeader::parse(staged)?;
    if ap.record_type != RecordType::Ap {
        return Err(PackageError::NotApRecord);
    }
    if ap.length > MAX_AP_IMAGE_LEN {
        return Err(PackageError::ApTooLong);
    }
    validate_record(staged, &ap)?;
    if staged.len() < FW_VERSION_OFFSET + 12 {
        return Err(PackageError::Truncated);
    }
    let version = read_version(staged);

    let ssm_off = ap.total_len();
    let ssm_region = &staged[ssm_off..];
    let ssm = RecordHeader::parse(ssm_region)?;
    if ssm.record_type != RecordType::Ssm {
        return Err(PackageError::NotSsmRecord);
    }
    if ssm.length > MAX_SSM_IMAGE_LEN {
        return Err(PackageError::SsmTooLong);
    }
    validate_record(ssm_region, &ssm)?;

    Ok(PackageInfo {
        ap_len: ap.length,
        ssm_len: ssm.length,
        version,
    })
}
