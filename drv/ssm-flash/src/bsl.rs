// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SM's factory serial bootloader protocol.
//!
//! Every command is `{0x80, len_lo, len_hi, cmd, payload..., crc_lo,
//! crc_hi}` with a CRC-16/CCITT-FALSE over `cmd` plus payload. Responses
//! are `{ACK, 0x80, len_lo, len_hi, rsp_cmd, status, data..., crc_lo,
//! crc_hi}`; `rsp_cmd` is 0x3B for a status reply and 0x3A for data.
//!
//! The UART calls are blocking on purpose: a firmware load is the only
//! thing happening while the bootloader is engaged.

use drv_image_api::CRC16;
use drv_sys_api::{Uart, UartError};

const HEADER: u8 = 0x80;
const ACK: u8 = 0x00;

const RX_PASSWORD: u8 = 0x11;
const RX_DATA_BLOCK: u8 = 0x10;
const TX_DATA_BLOCK: u8 = 0x18;
const MASS_ERASE: u8 = 0x15;
const LOAD_PC: u8 = 0x17;
const CRC_CHECK: u8 = 0x16;

const STATUS_RSP_CMD: u8 = 0x3B;
const DATA_RSP_CMD: u8 = 0x3A;

pub const PASSWORD_LEN: usize = 32;

/// Largest data payload one RX_DATA_BLOCK can carry.
pub const MAX_CHUNK: usize = 254;

/// ACK + header + len + rsp_cmd + status.
const STATUS_RESPONSE_LEN: usize = 8;
/// Data responses carry their payload between byte 5 and the CRC.
const DATA_RESPONSE_OVERHEAD: usize = 7;
const CRC_RESPONSE_LEN: usize = 9;

const MAX_MSG: usize = MAX_CHUNK + 45;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BslError {
    Uart(UartError),
    /// The bootloader answered with something other than ACK; the byte is
    /// its error code (0x51..0x57).
    Nak(u8),
    /// ACKed, but the response framing or status byte was wrong.
    BadResponse,
}

impl From<UartError> for BslError {
    fn from(e: UartError) -> Self {
        BslError::Uart(e)
    }
}

pub struct Bsl<'a, U> {
    uart: &'a mut U,
    tx: [u8; MAX_MSG],
    rx: [u8; MAX_MSG],
}

impl<'a, U: Uart> Bsl<'a, U> {
    pub fn new(uart: &'a mut U) -> Self {
        Self {
            uart,
            tx: [0; MAX_MSG],
            rx: [0; MAX_MSG],
        }
    }

    /// Builds a command frame and runs the exchange, receiving exactly
    /// `rsp_len` bytes (zero for commands with no reply).
    fn exchange(
        &mut self,
        cmd: u8,
        payload: &[u8],
        rsp_len: usize,
    ) -> Result<(), BslError> {
        let core_len = 1 + payload.len();
        let mut n = 0;
        self.tx[n] = HEADER;
        n += 1;
        self.tx[n] = core_len as u8;
        n += 1;
        self.tx[n] = (core_len >> 8) as u8;
        n += 1;
        let crc_start = n;
        self.tx[n] = cmd;
        n += 1;
        self.tx[n..n + payload.len()].copy_from_slice(payload);
        n += payload.len();
        let crc = CRC16.checksum(&self.tx[crc_start..n]);
        self.tx[n] = crc as u8;
        n += 1;
        self.tx[n] = (crc >> 8) as u8;
        n += 1;

        self.uart.send(&self.tx[..n])?;
        self.rx[..rsp_len].fill(0);
        self.uart.recv(&mut self.rx[..rsp_len])?;
        Ok(())
    }

    /// Common validation for status-only replies.
    fn check_status(&self) -> Result<(), BslError> {
        if self.rx[0] != ACK {
            return Err(BslError::Nak(self.rx[0]));
        }
        if self.rx[1] != HEADER
            || self.rx[4] != STATUS_RSP_CMD
            || self.rx[5] != 0x00
        {
            return Err(BslError::BadResponse);
        }
        Ok(())
    }

    pub fn write_password(
        &mut self,
        password: &[u8; PASSWORD_LEN],
    ) -> Result<(), BslError> {
        self.exchange(RX_PASSWORD, password, STATUS_RESPONSE_LEN)?;
        self.check_status()
    }

    /// The blank-device password. Sending it against a programmed part
    /// fails and mass-erases the part by design; sending it again then
    /// succeeds.
    pub fn write_password_default(&mut self) -> Result<(), BslError> {
        self.write_password(&[0xFF; PASSWORD_LEN])
    }

    /// Writes one chunk (≤ [`MAX_CHUNK`]) into SM memory.
    pub fn write_memory(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), BslError> {
        assert!(data.len() <= MAX_CHUNK);
        let mut payload = [0u8; 3 + MAX_CHUNK];
        payload[0] = address as u8;
        payload[1] = (address >> 8) as u8;
        payload[2] = (address >> 16) as u8;
        payload[3..3 + data.len()].copy_from_slice(data);
        self.exchange(
            RX_DATA_BLOCK,
            &payload[..3 + data.len()],
            STATUS_RESPONSE_LEN,
        )?;
        self.check_status()
    }

    /// Writes an arbitrarily large block, chunking to [`MAX_CHUNK`]. Each
    /// chunk gets one retry on a bad acknowledgement before the whole write
    /// aborts.
    pub fn write_large(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), BslError> {
        let mut address = address;
        let mut data = data;
        while !data.is_empty() {
            let n = data.len().min(MAX_CHUNK);
            let (chunk, rest) = data.split_at(n);
            if let Err(first) = self.write_memory(address, chunk) {
                match first {
                    BslError::Nak(_) | BslError::BadResponse => {
                        self.write_memory(address, chunk)?;
                    }
                    other => return Err(other),
                }
            }
            address += n as u32;
            data = rest;
        }
        Ok(())
    }

    /// Reads `out.len()` (≤ [`MAX_CHUNK`]) bytes back from SM memory.
    pub fn read_memory(
        &mut self,
        address: u32,
        out: &mut [u8],
    ) -> Result<(), BslError> {
        assert!(out.len() <= MAX_CHUNK);
        let payload = [
            address as u8,
            (address >> 8) as u8,
            (address >> 16) as u8,
            out.len() as u8,
            (out.len() >> 8) as u8,
        ];
        self.exchange(
            TX_DATA_BLOCK,
            &payload,
            out.len() + DATA_RESPONSE_OVERHEAD,
        )?;
        if self.rx[0] != ACK {
            return Err(BslError::Nak(self.rx[0]));
        }
        if self.rx[1] != HEADER || self.rx[4] != DATA_RSP_CMD {
            return Err(BslError::BadResponse);
        }
        out.copy_from_slice(&self.rx[5..5 + out.len()]);
        Ok(())
    }

    pub fn mass_erase(&mut self) -> Result<(), BslError> {
        self.exchange(MASS_ERASE, &[], STATUS_RESPONSE_LEN)?;
        self.check_status()
    }

    /// Jumps the SM to `address`. The bootloader does not answer this one.
    pub fn load_pc(&mut self, address: u32) -> Result<(), BslError> {
        let payload = [
            address as u8,
            (address >> 8) as u8,
            (address >> 16) as u8,
        ];
        self.exchange(LOAD_PC, &payload, 0)
    }

    /// Asks the bootloader for its CRC over `len` bytes at `address`.
    pub fn crc_check(
        &mut self,
        address: u32,
        len: u16,
    ) -> Result<u16, BslError> {
        let payload = [
            address as u8,
            (address >> 8) as u8,
            (address >> 16) as u8,
            len as u8,
            (len >> 8) as u8,
        ];
        self.exchange(CRC_CHECK, &payload, CRC_RESPONSE_LEN)?;
        if self.rx[0] != ACK {
            return Err(BslError::Nak(self.rx[0]));
        }
        if self.rx[1] != HEADER || self.rx[4] != DATA_RSP_CMD {
            return Err(BslError::BadResponse);
        }
        Ok(u16::from_le_bytes([self.rx[5], self.rx[6]]))
    }
}
