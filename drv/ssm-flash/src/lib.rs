// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-flashing the SM from a record stored on the external NAND.
//!
//! The SM keeps its firmware in FRAM and carries a factory serial
//! bootloader that survives any application image. To load it we:
//!
//! 1. Drive the SM into that bootloader with a timed RST/TEST pin dance.
//! 2. Route the shared UART mux to the SM (held by a guard so every exit
//!    path releases it).
//! 3. Send the blank-device password. Against a programmed part this fails
//!    and mass-erases the FRAM by design; a following send must succeed.
//! 4. Stream each FRAM section named by the record's metadata from NAND to
//!    the SM in bootloader-sized chunks.
//! 5. Reset the SM, give its application time to boot, and confirm it
//!    answers a status request over the SPI link.
//!
//! The whole sequence is retried once by [`SsmProgrammer::program_with_retry`];
//! callers decide what a second failure means (rollback, escalation).
//!
//! Attention handling is implicitly suppressed for the duration: the
//! programmer holds `&mut` on everything the SPI attention path would need,
//! so no poll can interleave with a programming attempt.

#![cfg_attr(not(test), no_std)]

use drv_image_api::RecordType;
use drv_mt29f_nand::{NandError, NandFlash, PAGE_DATA_SIZE};
use drv_sys_api::{Delay, Pin, Sys, Uart};
use ringlog::{ringbuf, ringbuf_entry};

mod bsl;

pub use bsl::{Bsl, BslError, MAX_CHUNK, PASSWORD_LEN};

/// Number of `(fram_address, fram_length)` pairs a record's metadata can
/// name. Unused pairs are zero-length.
pub const MAX_FRAM_SECTIONS: usize = 9;

/// On-flash metadata descriptor at the front of an SM record body:
/// stored CRC, type, length, version triple, then the section table. All
/// multi-byte fields big-endian.
pub const SSM_METADATA_LEN: usize = 2 + 1 + 4 + 12 + 4 * MAX_FRAM_SECTIONS;

/// How long the SM application needs from reset to answering SPI.
const SSM_BOOT_SETTLE_MS: u64 = 5_000;

/// Password attempts; the first against a programmed part erases it.
const PASSWORD_ATTEMPTS: u32 = 3;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    EnteredBootloader,
    PasswordErasedPart,
    PasswordAccepted,
    PasswordRejected,
    Section { index: usize, fram_addr: u32, len: u32 },
    SectionFailed(usize),
    ResetAndVerify,
    VerifyFailed,
    AttemptFailed,
}

ringbuf!(Trace, 32, Trace::None);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProgramError {
    /// The record at the given address is not an SM record.
    InvalidImage,
    /// The bootloader never accepted the default password.
    PasswordRejected,
    Bsl(BslError),
    Flash(NandError),
    /// Programming looked fine but the SM application did not come back on
    /// the SPI link.
    VerifyFailed,
}

impl From<BslError> for ProgramError {
    fn from(e: BslError) -> Self {
        ProgramError::Bsl(e)
    }
}

impl From<NandError> for ProgramError {
    fn from(e: NandError) -> Self {
        ProgramError::Flash(e)
    }
}

/// Post-programming liveness check, implemented over the AP⇄SM SPI link by
/// the task layer (a single GetStatus round trip).
pub trait SsmVerify {
    fn comm_check(&mut self) -> bool;
}

/// Board wiring for the SM control lines.
#[derive(Copy, Clone, Debug)]
pub struct ProgrammerConfig {
    /// SM reset line.
    pub rst: Pin,
    /// SM TEST line, part of the bootloader entry dance.
    pub test: Pin,
    /// Routes the shared UART to the SM bootloader while high.
    pub uart_mux: Pin,
    /// Heads-up line: raised before we start so the SM application can
    /// quiesce.
    pub boot: Pin,
}

/// Parsed SM record metadata.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SsmMetadata {
    pub stored_crc: u16,
    pub length: u32,
    pub version: (u32, u32, u32),
    pub sections: [(u32, u32); MAX_FRAM_SECTIONS],
}

impl SsmMetadata {
    /// Parses the descriptor, insisting it describes an SM record.
    pub fn parse(raw: &[u8; SSM_METADATA_LEN]) -> Result<Self, ProgramError> {
        if raw[2] != RecordType::Ssm as u8 {
            return Err(ProgramError::InvalidImage);
        }
        let be16 = |o: usize| u16::from_be_bytes([raw[o], raw[o + 1]]);
        let be32 = |o: usize| {
            u32::from_be_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]])
        };
        let mut sections = [(0u32, 0u32); MAX_FRAM_SECTIONS];
        let table = 2 + 1 + 4 + 12;
        for (i, section) in sections.iter_mut().enumerate() {
            let addr = be16(table + 2 * i) as u32;
            let len = be16(table + 2 * MAX_FRAM_SECTIONS + 2 * i) as u32;
            *section = (addr, len);
        }
        Ok(Self {
            stored_crc: be16(0),
            length: be32(3),
            version: (be32(7), be32(11), be32(15)),
            sections,
        })
    }
}

pub struct SsmProgrammer<'a, Y, D, U> {
    sys: &'a Y,
    delay: &'a D,
    uart: &'a mut U,
    config: ProgrammerConfig,
}

/// Holds the UART mux routed to the SM; dropping it releases the mux back
/// to the console no matter how the programming attempt ended.
struct MuxGuard<'a, Y: Sys> {
    sys: &'a Y,
    pin: Pin,
}

impl<'a, Y: Sys> MuxGuard<'a, Y> {
    fn route(sys: &'a Y, pin: Pin) -> Self {
        sys.gpio_set(pin);
        Self { sys, pin }
    }
}

impl<Y: Sys> Drop for MuxGuard<'_, Y> {
    fn drop(&mut self) {
        self.sys.gpio_reset(self.pin);
    }
}

impl<'a, Y, D, U> SsmProgrammer<'a, Y, D, U>
where
    Y: Sys,
    D: Delay,
    U: Uart,
{
    pub fn new(
        sys: &'a Y,
        delay: &'a D,
        uart: &'a mut U,
        config: ProgrammerConfig,
    ) -> Self {
        Self {
            sys,
            delay,
            uart,
            config,
        }
    }

    /// Raises the heads-up line so the SM application can park itself, and
    /// lowers it again after `settle_ms`.
    pub fn warn_ssm(&self, settle_ms: u64) {
        self.sys.gpio_set(self.config.boot);
        self.delay.sleep_for(settle_ms);
        self.sys.gpio_reset(self.config.boot);
    }

    /// The timed RST/TEST dance that lands the SM in its factory serial
    /// bootloader. Edge timing per the SM datasheet; every hold is at
    /// least 2 ms.
    fn enter_bootloader(&self) {
        let rst = self.config.rst;
        let test = self.config.test;

        self.sys.gpio_reset(rst);
        self.sys.gpio_set(test);
        self.delay.sleep_for(200);

        self.sys.gpio_reset(test);
        self.delay.sleep_for(2);
        self.sys.gpio_set(test);
        self.delay.sleep_for(2);
        self.sys.gpio_reset(test);
        self.delay.sleep_for(2);
        self.sys.gpio_set(test);
        self.delay.sleep_for(2);

        // Release reset while TEST is high, then drop TEST; the part wakes
        // up in the bootloader instead of the application.
        self.sys.gpio_set(rst);
        self.delay.sleep_for(2);
        self.sys.gpio_reset(test);

        ringbuf_entry!(Trace::EnteredBootloader);
    }

    /// Hard reset into the application image.
    pub fn hardware_reset(&self) {
        self.sys.gpio_reset(self.config.test);
        self.sys.gpio_reset(self.config.rst);
        self.delay.sleep_for(200);
        self.sys.gpio_set(self.config.rst);
        self.delay.sleep_for(2);
        self.sys.gpio_reset(self.config.rst);
    }

    fn unlock_with_password(&mut self) -> Result<(), ProgramError> {
        let mut bsl = Bsl::new(self.uart);
        for attempt in 0..PASSWORD_ATTEMPTS {
            match bsl.write_password_default() {
                Ok(()) => {
                    ringbuf_entry!(Trace::PasswordAccepted);
                    return Ok(());
                }
                Err(_) if attempt + 1 < PASSWORD_ATTEMPTS => {
                    // Expected exactly once against a programmed part: the
                    // mismatch wiped the FRAM, so the next send is checked
                    // against the blank-device password.
                    ringbuf_entry!(Trace::PasswordErasedPart);
                }
                Err(_) => break,
            }
        }
        ringbuf_entry!(Trace::PasswordRejected);
        Err(ProgramError::PasswordRejected)
    }

    /// Streams every FRAM section of the record at `record_addr` from NAND
    /// into the SM.
    fn program_sections<F: NandFlash>(
        &mut self,
        flash: &mut F,
        record_addr: u32,
        meta: &SsmMetadata,
    ) -> Result<(), ProgramError> {
        let mut nand_addr = record_addr + SSM_METADATA_LEN as u32;
        let mut page = [0u8; PAGE_DATA_SIZE];

        for (i, &(fram_addr, len)) in meta.sections.iter().enumerate() {
            if len == 0 {
                continue;
            }
            ringbuf_entry!(Trace::Section {
                index: i,
                fram_addr,
                len
            });
            let mut fram_addr = fram_addr;
            let mut remaining = len;
            while remaining > 0 {
                let n = (remaining as usize).min(PAGE_DATA_SIZE);
                flash.read(nand_addr, &mut page[..n])?;

                let mut bsl = Bsl::new(self.uart);
                if let Err(e) = bsl.write_large(fram_addr, &page[..n]) {
                    ringbuf_entry!(Trace::SectionFailed(i));
                    return Err(e.into());
                }
                nand_addr += n as u32;
                fram_addr += n as u32;
                remaining -= n as u32;
            }
        }
        Ok(())
    }

    /// One full programming attempt against the record at `record_addr`.
    pub fn program_from_flash<F: NandFlash, V: SsmVerify>(
        &mut self,
        flash: &mut F,
        record_addr: u32,
        verify: &mut V,
    ) -> Result<(), ProgramError> {
        let mut raw = [0u8; SSM_METADATA_LEN];
        flash.read(record_addr, &mut raw)?;
        let meta = SsmMetadata::parse(&raw)?;

        self.enter_bootloader();
        self.delay.sleep_for(100);

        let result = {
            let _mux = MuxGuard::route(self.sys, self.config.uart_mux);
            self.delay.sleep_for(500);

            self.unlock_with_password().and_then(|()| {
                self.delay.sleep_for(2_000);
                self.program_sections(flash, record_addr, &meta)
            })
        };
        // Mux is released here, success or not.
        self.delay.sleep_for(100);
        result?;

        ringbuf_entry!(Trace::ResetAndVerify);
        self.hardware_reset();
        self.delay.sleep_for(SSM_BOOT_SETTLE_MS);

        if verify.comm_check() {
            Ok(())
        } else {
            ringbuf_entry!(Trace::VerifyFailed);
            Err(ProgramError::VerifyFailed)
        }
    }

    /// The whole sequence, retried once. Callers escalate further failures
    /// (rollback to the other slot, safe idle) per their own policy.
    pub fn program_with_retry<F: NandFlash, V: SsmVerify>(
        &mut self,
        flash: &mut F,
        record_addr: u32,
        verify: &mut V,
    ) -> Result<(), ProgramError> {
        match self.program_from_flash(flash, record_addr, verify) {
            Ok(()) => Ok(()),
            Err(_) => {
                ringbuf_entry!(Trace::AttemptFailed);
                self.program_from_flash(flash, record_addr, verify)
            }
        }
    }
}
