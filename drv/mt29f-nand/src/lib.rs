// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the MT29F1G01-class SPI NAND that backs the image slots and
//! the registry.
//!
//! Geometry: 2048-byte data pages (+128 spare), 64 pages per block, 1024
//! blocks. A block erase is the only way to reclaim a page for rewriting;
//! erasing sets all bits to 1 and programming can only clear them.
//!
//! Every mutating command is bracketed the way the part requires: Write
//! Enable first, then the operation, then a poll of the status feature
//! register until `OIP` clears, then a check of the program/erase fail bits.
//! This layer knows nothing about slots, records, or the registry.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use drv_spi_api::{CsState, SpiDevice, SpiError, SpiServer};
use drv_sys_api::Delay;

pub const PAGE_DATA_SIZE: usize = 2048;
pub const PAGE_SPARE_SIZE: usize = 128;
pub const PAGES_PER_BLOCK: u32 = 64;
pub const NUM_BLOCKS: u32 = 1024;
pub const BLOCK_DATA_SIZE: u32 = PAGES_PER_BLOCK * PAGE_DATA_SIZE as u32;

/// One past the last byte-addressable data location.
pub const DEVICE_SIZE: u32 = NUM_BLOCKS * BLOCK_DATA_SIZE;

/// Expected READ ID bytes (manufacturer, device).
const MICRON_MFR_ID: u8 = 0x2C;
const MT29F1G01_DEVICE_ID: u8 = 0x14;

/// Poll budget for page program / page read, in 1 ms steps.
const OP_TIMEOUT_MS: u64 = 1_000;
/// Block erase is allowed far longer before we declare the part wedged.
const ERASE_TIMEOUT_MS: u64 = 10_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Command {
    BlockErase = 0xD8,
    GetFeature = 0x0F,
    PageRead = 0x13,
    ProgramExec = 0x10,
    ProgramLoad = 0x02,
    ProgramLoadRandom = 0x84,
    ReadCache = 0x03,
    ReadId = 0x9F,
    Reset = 0xFF,
    SetFeature = 0x1F,
    WriteDisable = 0x04,
    WriteEnable = 0x06,
}

/// Feature register addresses for Get/Set Feature.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Feature {
    BlockLock = 0xA0,
    Configuration = 0xB0,
    Status = 0xC0,
}

bitflags! {
    /// Bits of the status feature register (0xC0).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Status: u8 {
        const OIP = 1 << 0;
        const WEL = 1 << 1;
        const E_FAIL = 1 << 2;
        const P_FAIL = 1 << 3;
    }
}

/// Block-lock register settings: which slice of the part is write
/// protected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Protection {
    None = 0x00,
    Upper1_32 = 0x02 << 3,
    Upper1_16 = 0x03 << 3,
    Upper1_8 = 0x04 << 3,
    Upper1_4 = 0x05 << 3,
    Upper1_2 = 0x06 << 3,
    All = 0x07 << 3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NandError {
    /// Address or length falls outside the data area.
    AddressInvalid,
    ProgramFailed,
    EraseFailed,
    /// `OIP` refused to clear within the poll budget.
    OperationTimeout,
    /// READ ID returned something other than the part we were built for.
    WrongDeviceId,
    Spi(SpiError),
}

impl From<SpiError> for NandError {
    fn from(e: SpiError) -> Self {
        NandError::Spi(e)
    }
}

/// Byte-addressed view of the NAND data area. The registry, the OTA
/// pipeline, and the SM programmer all work through this trait so their
/// logic can run against a RAM fake on the host.
pub trait NandFlash {
    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), NandError>;

    /// Programs `data` at `addr`, splitting on page boundaries. The target
    /// range must have been erased.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), NandError>;

    /// Erases every block overlapping `addr..addr + len`.
    fn erase_range(&mut self, addr: u32, len: u32) -> Result<(), NandError>;
}

/// Row address (block and page-in-block) for a byte address.
pub fn row_of(addr: u32) -> u32 {
    addr >> 11
}

/// Column (byte offset within the page) for a byte address.
pub fn column_of(addr: u32) -> u16 {
    (addr & (PAGE_DATA_SIZE as u32 - 1)) as u16
}

/// Block index for a byte address.
pub fn block_of(addr: u32) -> u32 {
    addr / BLOCK_DATA_SIZE
}

pub struct Mt29f<S, D> {
    dev: SpiDevice<S>,
    delay: D,
}

impl<S: SpiServer, D: Delay> Mt29f<S, D> {
    pub fn new(dev: SpiDevice<S>, delay: D) -> Self {
        Self { dev, delay }
    }

    /// Resets the part, confirms its identity, and unlocks all blocks for
    /// writing. Call once before anything else.
    pub fn init(&self) -> Result<(), NandError> {
        self.reset()?;
        self.delay.sleep_for(2);
        let (mfr, dev) = self.read_id()?;
        if mfr != MICRON_MFR_ID || dev != MT29F1G01_DEVICE_ID {
            return Err(NandError::WrongDeviceId);
        }
        self.unlock_all()
    }

    pub fn reset(&self) -> Result<(), NandError> {
        self.dev.write(&[Command::Reset as u8])?;
        Ok(())
    }

    pub fn read_id(&self) -> Result<(u8, u8), NandError> {
        // Opcode, one dummy byte, then two ID bytes.
        let mut id = [0u8; 2];
        self.transact(&[Command::ReadId as u8, 0x00], &mut id)?;
        Ok((id[0], id[1]))
    }

    pub fn get_feature(&self, reg: Feature) -> Result<u8, NandError> {
        let mut val = [0u8; 1];
        self.transact(&[Command::GetFeature as u8, reg as u8], &mut val)?;
        Ok(val[0])
    }

    pub fn set_feature(&self, reg: Feature, val: u8) -> Result<(), NandError> {
        self.dev
            .write(&[Command::SetFeature as u8, reg as u8, val])?;
        Ok(())
    }

    /// Sets the block-protection level. The bits map directly onto the
    /// block-lock feature register; `Protection::None` opens the whole
    /// part for writing.
    pub fn unlock(&self, level: Protection) -> Result<(), NandError> {
        self.set_feature(Feature::BlockLock, level as u8)
    }

    /// Clears all block-protection bits.
    pub fn unlock_all(&self) -> Result<(), NandError> {
        self.unlock(Protection::None)
    }

    pub fn status(&self) -> Result<Status, NandError> {
        Ok(Status::from_bits_truncate(
            self.get_feature(Feature::Status)?,
        ))
    }

    pub fn is_operation_in_progress(&self) -> Result<bool, NandError> {
        Ok(self.status()?.contains(Status::OIP))
    }

    /// Erases the block containing `addr`.
    pub fn erase_block(&self, block: u32) -> Result<(), NandError> {
        if block >= NUM_BLOCKS {
            return Err(NandError::AddressInvalid);
        }
        let row = block * PAGES_PER_BLOCK;
        self.write_enable()?;
        let r = row.to_be_bytes();
        self.dev
            .write(&[Command::BlockErase as u8, r[1], r[2], r[3]])?;
        let status = self.poll_oip(ERASE_TIMEOUT_MS)?;
        if status.contains(Status::E_FAIL) {
            return Err(NandError::EraseFailed);
        }
        Ok(())
    }

    /// Programs up to one page's worth of data at `row`/`column`.
    pub fn program_page(
        &self,
        row: u32,
        column: u16,
        data: &[u8],
    ) -> Result<(), NandError> {
        if data.is_empty()
            || column as usize + data.len() > PAGE_DATA_SIZE
            || row > row_of(DEVICE_SIZE - 1)
        {
            return Err(NandError::AddressInvalid);
        }
        self.write_enable()?;
        {
            let _lock = self.dev.lock_auto(CsState::Asserted)?;
            let c = column.to_be_bytes();
            self.dev.write(&[Command::ProgramLoad as u8, c[0], c[1]])?;
            self.dev.write(data)?;
        }
        self.program_exec(row)
    }

    /// Program Load Random followed by a single execute: deposits several
    /// disjoint chunks into the cache register, then programs the page once.
    pub fn random_program(
        &self,
        row: u32,
        chunks: &[(u16, &[u8])],
    ) -> Result<(), NandError> {
        if chunks.is_empty() {
            return Err(NandError::AddressInvalid);
        }
        for (column, data) in chunks {
            if *column as usize + data.len() > PAGE_DATA_SIZE {
                return Err(NandError::AddressInvalid);
            }
        }
        self.write_enable()?;
        for (column, data) in chunks {
            let _lock = self.dev.lock_auto(CsState::Asserted)?;
            let c = column.to_be_bytes();
            self.dev
                .write(&[Command::ProgramLoadRandom as u8, c[0], c[1]])?;
            self.dev.write(data)?;
        }
        self.program_exec(row)
    }

    /// Moves a page into the cache register and reads `out.len()` bytes
    /// starting at `column`.
    pub fn read_page(
        &self,
        row: u32,
        column: u16,
        out: &mut [u8],
    ) -> Result<(), NandError> {
        if column as usize + out.len() > PAGE_DATA_SIZE + PAGE_SPARE_SIZE {
            return Err(NandError::AddressInvalid);
        }
        let r = row.to_be_bytes();
        self.dev
            .write(&[Command::PageRead as u8, r[1], r[2], r[3]])?;
        self.poll_oip(OP_TIMEOUT_MS)?;

        let c = column.to_be_bytes();
        // Read From Cache wants the column plus one dummy byte.
        self.transact(&[Command::ReadCache as u8, c[0], c[1], 0x00], out)
    }

    fn write_enable(&self) -> Result<(), NandError> {
        self.dev.write(&[Command::WriteEnable as u8])?;
        Ok(())
    }

    fn program_exec(&self, row: u32) -> Result<(), NandError> {
        let r = row.to_be_bytes();
        self.dev
            .write(&[Command::ProgramExec as u8, r[1], r[2], r[3]])?;
        let status = self.poll_oip(OP_TIMEOUT_MS)?;
        if status.contains(Status::P_FAIL) {
            return Err(NandError::ProgramFailed);
        }
        Ok(())
    }

    /// Header write plus data read under one chip select.
    fn transact(&self, hdr: &[u8], out: &mut [u8]) -> Result<(), NandError> {
        let _lock = self.dev.lock_auto(CsState::Asserted)?;
        self.dev.write(hdr)?;
        if !out.is_empty() {
            self.dev.read(out)?;
        }
        Ok(())
    }

    fn poll_oip(&self, budget_ms: u64) -> Result<Status, NandError> {
        let mut waited = 0;
        loop {
            let status = self.status()?;
            if !status.contains(Status::OIP) {
                return Ok(status);
            }
            if waited >= budget_ms {
                return Err(NandError::OperationTimeout);
            }
            self.delay.sleep_for(1);
            waited += 1;
        }
    }
}

impl<S: SpiServer, D: Delay> NandFlash for Mt29f<S, D> {
    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), NandError> {
        check_range(addr, out.len())?;
        let mut addr = addr;
        let mut out = out;
        while !out.is_empty() {
            let column = column_of(addr);
            let n = out
                .len()
                .min(PAGE_DATA_SIZE - column as usize);
            let (chunk, rest) = out.split_at_mut(n);
            self.read_page(row_of(addr), column, chunk)?;
            out = rest;
            addr += n as u32;
        }
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), NandError> {
        check_range(addr, data.len())?;
        let mut addr = addr;
        let mut data = data;
        while !data.is_empty() {
            let column = column_of(addr);
            let n = data
                .len()
                .min(PAGE_DATA_SIZE - column as usize);
            let (chunk, rest) = data.split_at(n);
            self.program_page(row_of(addr), column, chunk)?;
            data = rest;
            addr += n as u32;
        }
        Ok(())
    }

    fn erase_range(&mut self, addr: u32, len: u32) -> Result<(), NandError> {
        if len == 0 {
            return Ok(());
        }
        check_range(addr, len as usize)?;
        let first = block_of(addr);
        let last = block_of(addr + len - 1);
        for block in first..=last {
            self.erase_block(block)?;
        }
        Ok(())
    }
}

fn check_range(addr: u32, len: usize) -> Result<(), NandError> {
    if (addr as u64) + (len as u64) > DEVICE_SIZE as u64 {
        return Err(NandError::AddressInvalid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A bus-level fake of the part: interprets the opcode stream the driver
    /// produces against an in-memory array, including Write Enable
    /// discipline and erase-before-program behavior.
    struct FakeNandBus {
        mem: Vec<u8>,
        cache: Vec<u8>,
        cache_row: u32,
        wel: bool,
        status: u8,
        locked: bool,
        /// Bytes written since lock (or last interpreted command).
        tx: Vec<u8>,
    }

    impl FakeNandBus {
        fn new() -> Self {
            Self {
                mem: vec![0xFF; DEVICE_SIZE as usize],
                cache: vec![0xFF; PAGE_DATA_SIZE],
                cache_row: 0,
                wel: false,
                status: 0,
                locked: false,
                tx: Vec::new(),
            }
        }

        fn handle(&mut self, frame: &[u8]) {
            match frame[0] {
                x if x == Command::WriteEnable as u8 => self.wel = true,
                x if x == Command::WriteDisable as u8 => self.wel = false,
                x if x == Command::Reset as u8 => self.status = 0,
                x if x == Command::SetFeature as u8 => {}
                x if x == Command::PageRead as u8 => {
                    let row = u32::from_be_bytes([
                        0, frame[1], frame[2], frame[3],
                    ]);
                    self.cache_row = row;
                    let base = row as usize * PAGE_DATA_SIZE;
                    self.cache
                        .copy_from_slice(&self.mem[base..base + PAGE_DATA_SIZE]);
                }
                x if x == Command::BlockErase as u8 => {
                    assert!(self.wel, "erase without write enable");
                    self.wel = false;
                    let row = u32::from_be_bytes([
                        0, frame[1], frame[2], frame[3],
                    ]);
                    let block = row / PAGES_PER_BLOCK;
                    let base = (block * BLOCK_DATA_SIZE) as usize;
                    self.mem[base..base + BLOCK_DATA_SIZE as usize].fill(0xFF);
                }
                x if x == Command::ProgramLoad as u8
                    || x == Command::ProgramLoadRandom as u8 =>
                {
                    let col =
                        u16::from_be_bytes([frame[1], frame[2]]) as usize;
                    let data = &frame[3..];
                    if x == Command::ProgramLoad as u8 {
                        // Program Load resets untouched cache bytes to 0xFF.
                        self.cache.fill(0xFF);
                    }
                    self.cache[col..col + data.len()].copy_from_slice(data);
                }
                x if x == Command::ProgramExec as u8 => {
                    assert!(self.wel, "program without write enable");
                    self.wel = false;
                    let row = u32::from_be_bytes([
                        0, frame[1], frame[2], frame[3],
                    ]);
                    let base = row as usize * PAGE_DATA_SIZE;
                    // NAND semantics: programming can only clear bits.
                    for (m, c) in self.mem[base..base + PAGE_DATA_SIZE]
                        .iter_mut()
                        .zip(&self.cache)
                    {
                        *m &= *c;
                    }
                }
                _ => {}
            }
        }

        fn respond(&mut self, dest: &mut [u8]) {
            match self.tx[0] {
                x if x == Command::GetFeature as u8 => {
                    dest[0] = self.status;
                }
                x if x == Command::ReadId as u8 => {
                    dest[0] = 0x2C;
                    dest[1] = 0x14;
                }
                x if x == Command::ReadCache as u8 => {
                    let col =
                        u16::from_be_bytes([self.tx[1], self.tx[2]]) as usize;
                    dest.copy_from_slice(&self.cache[col..col + dest.len()]);
                }
                other => panic!("unexpected read for opcode {other:#x}"),
            }
        }
    }

    #[derive(Clone)]
    struct FakeSpi(Rc<RefCell<FakeNandBus>>);

    impl SpiServer for FakeSpi {
        fn exchange(
            &self,
            _di: u8,
            src: &[u8],
            dest: &mut [u8],
        ) -> Result<(), SpiError> {
            self.write(0, src)?;
            self.read(0, dest)
        }

        fn write(&self, _di: u8, src: &[u8]) -> Result<(), SpiError> {
            let mut bus = self.0.borrow_mut();
            if bus.locked {
                bus.tx.extend_from_slice(src);
            } else {
                bus.tx = src.to_vec();
                let frame = std::mem::take(&mut bus.tx);
                bus.handle(&frame);
            }
            Ok(())
        }

        fn read(&self, _di: u8, dest: &mut [u8]) -> Result<(), SpiError> {
            let mut bus = self.0.borrow_mut();
            bus.respond(dest);
            Ok(())
        }

        fn lock(&self, _di: u8, _cs: CsState) -> Result<(), SpiError> {
            let mut bus = self.0.borrow_mut();
            bus.locked = true;
            bus.tx.clear();
            Ok(())
        }

        fn release(&self) -> Result<(), SpiError> {
            let mut bus = self.0.borrow_mut();
            bus.locked = false;
            let frame = std::mem::take(&mut bus.tx);
            if !frame.is_empty()
                && frame[0] != Command::GetFeature as u8
                && frame[0] != Command::ReadId as u8
                && frame[0] != Command::ReadCache as u8
            {
                bus.handle(&frame);
            }
            Ok(())
        }
    }

    struct NoDelay;
    impl Delay for NoDelay {
        fn sleep_for(&self, _ms: u64) {}
    }

    fn make_uut() -> (Mt29f<FakeSpi, NoDelay>, Rc<RefCell<FakeNandBus>>) {
        let bus = Rc::new(RefCell::new(FakeNandBus::new()));
        let spi = FakeSpi(Rc::clone(&bus));
        (Mt29f::new(spi.device(0), NoDelay), bus)
    }

    #[test]
    fn init_accepts_the_right_part() {
        let (uut, _) = make_uut();
        uut.init().unwrap();
    }

    #[test]
    fn write_read_roundtrip_across_pages() {
        let (mut uut, _) = make_uut();
        let data: Vec<u8> =
            (0..5000u32).map(|i| (i % 251) as u8).collect();
        // Start mid-page to force a short first chunk.
        uut.write(1000, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        uut.read(1000, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn erase_resets_to_ff() {
        let (mut uut, _) = make_uut();
        uut.write(0, &[0u8; 16]).unwrap();
        uut.erase_range(0, 16).unwrap();
        let mut back = [0u8; 16];
        uut.read(0, &mut back).unwrap();
        assert_eq!(back, [0xFF; 16]);
    }

    #[test]
    fn erase_range_covers_overlapped_blocks() {
        let (mut uut, _) = make_uut();
        // Two bytes straddling a block boundary.
        let boundary = BLOCK_DATA_SIZE;
        uut.write(boundary - 1, &[0, 0]).unwrap();
        uut.erase_range(boundary - 1, 2).unwrap();
        let mut back = [0u8; 2];
        uut.read(boundary - 1, &mut back).unwrap();
        assert_eq!(back, [0xFF, 0xFF]);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let (mut uut, _) = make_uut();
        assert_eq!(
            uut.write(DEVICE_SIZE - 1, &[0, 0]),
            Err(NandError::AddressInvalid)
        );
        assert_eq!(
            uut.read(DEVICE_SIZE, &mut [0]),
            Err(NandError::AddressInvalid)
        );
    }

    #[test]
    fn random_program_places_chunks() {
        let (uut, _) = make_uut();
        uut.random_program(3, &[(0, &[1, 2, 3]), (100, &[9, 9])])
            .unwrap();
        let mut back = [0u8; 3];
        uut.read_page(3, 0, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3]);
        let mut back = [0u8; 2];
        uut.read_page(3, 100, &mut back).unwrap();
        assert_eq!(back, [9, 9]);
    }

    #[test]
    fn addressing_math() {
        assert_eq!(row_of(0), 0);
        assert_eq!(row_of(PAGE_DATA_SIZE as u32), 1);
        assert_eq!(column_of(PAGE_DATA_SIZE as u32 + 5), 5);
        assert_eq!(block_of(BLOCK_DATA_SIZE), 1);
        assert_eq!(row_of(BLOCK_DATA_SIZE), PAGES_PER_BLOCK);
    }
}
