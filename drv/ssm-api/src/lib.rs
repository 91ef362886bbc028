// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire format for AP ⇄ SM messages over SPI.
//!
//! Both firmwares build against this crate (the SM side through a
//! code-generated mirror), so the constants here, the start-of-frame magic
//! and the checksum, must never drift between the two sides.
//!
//! A frame is a fixed four-byte header, a payload, and a one-byte checksum:
//!
//! ```text
//! { start_frame, payload_len, msg_id, response_id } payload... checksum
//! ```
//!
//! `response_id` names the message the sender expects back; the receiver
//! uses it to pre-size its reply, and the master uses it to know how many
//! bytes to clock out. The checksum is the 8-bit sum of header plus payload,
//! modulo 256.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

mod payload;

pub use payload::{
    ActivatedState, AckPayload, CommandPayload, ConfigPayload,
    GetSensorDataPayload, NumEntriesPayload, SensorDataEntry, SetRtcPayload,
    StatusPayload, HOURS_PER_DAY,
};

pub const START_FRAME: u8 = 0xA5;
pub const HEADER_LEN: usize = 4;
pub const CHECKSUM_LEN: usize = 1;
pub const MAX_PAYLOAD: usize = 255;
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD + CHECKSUM_LEN;

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum MsgId {
    Command = 0x01,
    Ack = 0x02,
    Nack = 0x03,
    Status = 0x04,
    AttnSource = 0x05,
    AttnSourceAck = 0x06,
    GetSensorDataEntries = 0x07,
    SensorData = 0x08,
    NumDataEntries = 0x09,
    SetRtc = 0x0A,
    Config = 0x0B,
}

impl MsgId {
    /// Payload size for messages whose size is fixed by their type, which
    /// is all of them. The slave consults this through `response_id` to
    /// build its reply; the master uses it to size the read.
    pub fn payload_len(self) -> usize {
        use core::mem::size_of;
        match self {
            MsgId::Command => size_of::<CommandPayload>(),
            MsgId::Ack | MsgId::Nack => size_of::<AckPayload>(),
            MsgId::Status => size_of::<StatusPayload>(),
            MsgId::AttnSource | MsgId::AttnSourceAck => 1,
            MsgId::GetSensorDataEntries => {
                size_of::<GetSensorDataPayload>()
            }
            MsgId::SensorData => size_of::<SensorDataEntry>(),
            MsgId::NumDataEntries => size_of::<NumEntriesPayload>(),
            MsgId::SetRtc => size_of::<SetRtcPayload>(),
            MsgId::Config => size_of::<ConfigPayload>(),
        }
    }

    /// Whole-frame size for this message type.
    pub fn frame_len(self) -> usize {
        HEADER_LEN + self.payload_len() + CHECKSUM_LEN
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    GetStatus = 0x01,
    GetAttnSrc = 0x02,
    Activate = 0x03,
    Deactivate = 0x04,
    SwReset = 0x05,
    HwReset = 0x06,
    GetEntriesInLog = 0x07,
    IncrementSensorDataTail = 0x08,
    ResetAlarms = 0x09,
}

bitflags! {
    /// Attention sources the SM can raise. The AP acknowledges by echoing
    /// the mask it handled; the SM clears only acknowledged bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct AttnSource: u8 {
        const ACTIVATE = 1 << 0;
        const TIME_REQUEST = 1 << 1;
        const CHECK_IN_DEACTIVATED = 1 << 2;
        const CHECK_IN_ACTIVATED = 1 << 3;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameError {
    /// Missing start-of-frame magic, or too short to hold a header.
    BadFrame,
    /// Fewer bytes available than `payload_len` promises.
    ShortFrame,
    ChecksumMismatch,
    /// `msg_id` is not one we know.
    BadMsgId(u8),
}

/// A parsed view into a received buffer.
#[derive(Copy, Clone, Debug)]
pub struct Frame<'a> {
    pub msg_id: MsgId,
    pub response_id: u8,
    pub payload: &'a [u8],
}

fn checksum(header: &[u8], payload: &[u8]) -> u8 {
    let mut sum = 0u8;
    for b in header.iter().chain(payload) {
        sum = sum.wrapping_add(*b);
    }
    sum
}

/// Serializes one frame into `out`, returning the number of bytes used.
///
/// Panics if `payload` exceeds [`MAX_PAYLOAD`] or `out` is smaller than the
/// frame; both are static properties of the call sites, which all use
/// fixed-size payload structs and `MAX_FRAME` buffers.
pub fn pack_frame(
    msg_id: MsgId,
    response_id: MsgId,
    payload: &[u8],
    out: &mut [u8],
) -> usize {
    let header = [
        START_FRAME,
        payload.len() as u8,
        msg_id as u8,
        response_id as u8,
    ];
    let total = HEADER_LEN + payload.len() + CHECKSUM_LEN;
    out[..HEADER_LEN].copy_from_slice(&header);
    out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    out[total - 1] = checksum(&header, payload);
    total
}

/// Parses a frame from the front of `buf`. Trailing bytes beyond the frame
/// (idle fill clocked out by the master) are ignored.
pub fn parse_frame(buf: &[u8]) -> Result<Frame<'_>, FrameError> {
    if buf.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(FrameError::BadFrame);
    }
    if buf[0] != START_FRAME {
        return Err(FrameError::BadFrame);
    }
    let payload_len = buf[1] as usize;
    let total = HEADER_LEN + payload_len + CHECKSUM_LEN;
    if buf.len() < total {
        return Err(FrameError::ShortFrame);
    }
    let payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];
    if checksum(&buf[..HEADER_LEN], payload) != buf[total - 1] {
        return Err(FrameError::ChecksumMismatch);
    }
    let msg_id =
        MsgId::from_u8(buf[2]).ok_or(FrameError::BadMsgId(buf[2]))?;
    Ok(Frame {
        msg_id,
        response_id: buf[3],
        payload,
    })
}
