// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-layout message payloads.
//!
//! All multi-byte fields are little-endian and the structs carry no padding,
//! so they serialize by reinterpretation on both sides of the link. Byte
//! flags are `u8` rather than `bool` so that any received bit pattern is a
//! valid value.

use num_derive::FromPrimitive;
use static_assertions::const_assert;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const HOURS_PER_DAY: usize = 24;

// payload_len is a single byte on the wire; nothing may outgrow it.
const_assert!(core::mem::size_of::<SensorDataEntry>() <= crate::MAX_PAYLOAD);
const_assert!(core::mem::size_of::<StatusPayload>() <= crate::MAX_PAYLOAD);

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C)]
pub struct CommandPayload {
    pub cmd: u8,
}

/// Ack and Nack both echo the id being answered: the command byte for
/// command messages, the message id otherwise.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C)]
pub struct AckPayload {
    pub id: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ActivatedState {
    Activated = 0,
    Deactivated = 1,
    Fault = 2,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C)]
pub struct StatusPayload {
    pub reset_state: u8,
    /// (major, minor, build)
    pub fw_version: [u8; 3],
    pub timestamp: U32,
    pub error_bits: U32,
    /// Raw [`ActivatedState`]; see [`StatusPayload::activated_state`].
    pub activated_state: u8,
    pub voltage_mv: U16,
    /// Percent.
    pub power_remaining: u8,
    pub magnet_detected: u8,
    pub unexpected_reset_count: U32,
    pub time_last_reset: U32,
    pub activated_date: U32,
}

impl StatusPayload {
    pub fn activated_state(&self) -> Option<ActivatedState> {
        num_traits::FromPrimitive::from_u8(self.activated_state)
    }
}

/// One closed day of telemetry, produced by the SM's day-closer and drained
/// by the AP into its own log.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C)]
pub struct SensorDataEntry {
    pub timestamp: U32,
    pub hourly_liters: [U16; HOURS_PER_DAY],
    /// Signed °C, stored as two's-complement bytes.
    pub hourly_temp_c: [u8; HOURS_PER_DAY],
    /// Percent relative humidity.
    pub hourly_humidity: [u8; HOURS_PER_DAY],
    pub hourly_strokes: [U16; HOURS_PER_DAY],
    /// Millimeters.
    pub hourly_stroke_height: [u8; HOURS_PER_DAY],
    pub daily_liters: U32,
    pub avg_liters: U16,
    pub total_liters: U32,
    pub breakdown: u8,
    pub pump_capacity: U16,
    pub battery_voltage_mv: U16,
    pub power_remaining: u8,
    pub state: u8,
    pub magnet_detected: u8,
    pub error_bits: U32,
    pub unexpected_resets: U32,
    pub timestamp_of_last_reset: U32,
    pub activated_date: U32,
}

impl SensorDataEntry {
    /// An all-zero entry, handy as a test scaffold and as the SM's blank
    /// ring slot.
    pub fn zeroed() -> Self {
        FromBytes::read_from_bytes(
            &[0u8; core::mem::size_of::<SensorDataEntry>()][..],
        )
        .unwrap()
    }
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C)]
pub struct GetSensorDataPayload {
    /// Entries remaining to fetch, counting down; see the drain protocol.
    pub entries_to_get: U16,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C)]
pub struct NumEntriesPayload {
    pub count: U16,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C)]
pub struct SetRtcPayload {
    /// Unix seconds. Zero means "time sync failed, ask again later".
    pub time: U32,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
#[repr(C)]
pub struct ConfigPayload {
    pub wake_interval_days: U16,
    pub stroke_alg_on: u8,
    pub red_flag_on_threshold: U16,
    pub red_flag_off_threshold: U16,
    pub reserved_4: U16,
    pub reserved_5: U16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn payloads_fit_one_frame() {
        // payload_len is a u8, so no payload may exceed 255 bytes.
        assert!(size_of::<SensorDataEntry>() <= 255);
        assert!(size_of::<StatusPayload>() <= 255);
        assert!(size_of::<ConfigPayload>() <= 255);
    }

    #[test]
    fn status_layout_is_stable() {
        // Wire compatibility: both MCUs bake this size in.
        assert_eq!(size_of::<StatusPayload>(), 29);
        assert_eq!(size_of::<CommandPayload>(), 1);
        assert_eq!(size_of::<SetRtcPayload>(), 4);
        assert_eq!(size_of::<ConfigPayload>(), 11);
    }

    #[test]
    fn sensor_entry_reinterprets() {
        let mut e = SensorDataEntry::zeroed();
        e.daily_liters = 1234.into();
        e.hourly_liters[5] = 77.into();
        let bytes = zerocopy::IntoBytes::as_bytes(&e);
        let back = SensorDataEntry::read_from_bytes(bytes).unwrap();
        assert_eq!(back, e);
    }
}
