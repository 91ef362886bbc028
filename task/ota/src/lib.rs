// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OTA download pipeline: streams a two-record firmware package off a TCP
//! body and into the NAND slot we are *not* running from.
//!
//! The body is `AP_record || SM_record`; each record is a 5-byte header
//! (type byte, big-endian length) followed by `length` body bytes whose
//! first two bytes are a stored CRC-16. The record headers are consumed
//! here; only the bodies land on flash.
//!
//! TCP segmentation is arbitrary: a record header, the AP/SM boundary, or
//! the version field can split anywhere. [`Download::feed`] is a streaming
//! parser over the byte sequence whose only persistent state is the phase
//! tag, the write buffer, and the NAND cursor. Writes are buffered into a
//! 40-page window and flushed when the window fills, at the record
//! boundary, and at the end. Those points are fixed by stream position, so the
//! write sequence is identical no matter how the body was segmented.
//!
//! On completion both records are streamed back off the NAND through the
//! running CRC. A mismatch invalidates the freshly written slot (its
//! metadata page is reset to erased 0xFF) and surfaces as an error; the
//! caller raises `FwDownloadFail` and the registry is left untouched.

#![cfg_attr(not(test), no_std)]

use drv_image_api::{
    layout, ImageVersion, RecordHeader, RecordType, CRC16, CRC_LEN,
    MAX_AP_IMAGE_LEN, MAX_SSM_IMAGE_LEN, RECORD_HEADER_LEN,
};
use drv_mt29f_nand::{NandError, NandFlash, PAGE_DATA_SIZE};
use ringlog::{ringbuf, ringbuf_entry};

/// Buffered pages between flash writes; batching keeps the program count
/// (and wear) down during a multi-hundred-kilobyte download.
pub const WRITE_BUFFER_PAGES: usize = 40;
pub const WRITE_BUFFER_SIZE: usize = WRITE_BUFFER_PAGES * PAGE_DATA_SIZE;

/// The version triple sits at body offsets 7..19 of the AP record.
const VERSION_PREFIX_LEN: usize = 19;
const VERSION_OFFSET_IN_BODY: usize = 7;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    ApHeader { len: u32 },
    SsmHeader { len: u32 },
    Flush { addr: u32, len: usize },
    BoundaryCrossed,
    VerifyOk,
    VerifyFailed,
    Invalidated(u32),
}

ringbuf!(Trace, 32, Trace::None);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OtaError {
    /// The body did not open with an AP record.
    FirstPacketNotAp,
    /// The bytes after the AP record were not an SM record.
    NotSsmRecord,
    ApRecordTooLong,
    SsmRecordTooLong,
    /// Record lengths don't add up to the advertised Content-Length.
    LengthMismatch,
    /// Bytes kept arriving after the package was complete.
    TooMuchData,
    /// Read-back CRC of one of the landed images.
    CrcMismatch { stored: u16, computed: u16 },
    Flash(NandError),
}

impl From<NandError> for OtaError {
    fn from(e: NandError) -> Self {
        OtaError::Flash(e)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    /// Collecting the AP record header from the front of the body.
    FirstPacket,
    DownloadingApRecord,
    /// The AP record ended mid-header; carrying partial SM header bytes.
    WaitingOnSsmHeader,
    DownloadingSsmRecord,
    Done,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DownloadOutcome {
    pub target: drv_image_api::SlotId,
    pub version: ImageVersion,
    pub ap_len: u32,
    pub ssm_len: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Progress {
    InProgress,
    Complete(DownloadOutcome),
}

pub struct Download {
    phase: Phase,
    target: drv_image_api::SlotId,
    expected_total: u32,
    received: u32,

    buf: [u8; WRITE_BUFFER_SIZE],
    buf_len: usize,
    cursor: u32,

    hdr: [u8; RECORD_HEADER_LEN],
    hdr_got: usize,

    /// First bytes of the AP record body, held until the version field is
    /// complete.
    prefix: [u8; VERSION_PREFIX_LEN],
    prefix_got: usize,

    ap_len: u32,
    ssm_len: u32,
    remaining: u32,
    version: ImageVersion,
}

impl Download {
    /// `target` is the slot other than the one we booted from;
    /// `expected_total` is the HTTP Content-Length.
    pub fn new(target: drv_image_api::SlotId, expected_total: u32) -> Self {
        Self {
            phase: Phase::FirstPacket,
            target,
            expected_total,
            received: 0,
            buf: [0; WRITE_BUFFER_SIZE],
            buf_len: 0,
            cursor: layout::ap_image_start(target),
            hdr: [0; RECORD_HEADER_LEN],
            hdr_got: 0,
            prefix: [0; VERSION_PREFIX_LEN],
            prefix_got: 0,
            ap_len: 0,
            ssm_len: 0,
            remaining: 0,
            version: ImageVersion::default(),
        }
    }

    /// Feeds one TCP segment. The receive callback hands segments to the
    /// download task's queue; the task calls this. All flash writes happen
    /// on this path.
    pub fn feed<F: NandFlash>(
        &mut self,
        flash: &mut F,
        segment: &[u8],
    ) -> Result<Progress, OtaError> {
        let mut data = segment;
        while !data.is_empty() {
            match self.phase {
                Phase::FirstPacket => {
                    data = self.take_header(data);
                    if self.hdr_got == RECORD_HEADER_LEN {
                        self.begin_ap_record(flash)?;
                    }
                }
                Phase::DownloadingApRecord => {
                    let n = (self.remaining as usize).min(data.len());
                    let (chunk, rest) = data.split_at(n);
                    self.capture_prefix(chunk);
                    self.append(flash, chunk)?;
                    self.remaining -= n as u32;
                    data = rest;
                    if self.remaining == 0 {
                        // AP record complete: flush its tail and move the
                        // cursor to the SM region before its header shows
                        // up.
                        ringbuf_entry!(Trace::BoundaryCrossed);
                        self.flush(flash)?;
                        self.cursor = layout::ssm_record_start(self.target);
                        self.hdr_got = 0;
                        self.phase = Phase::WaitingOnSsmHeader;
                    }
                }
                Phase::WaitingOnSsmHeader => {
                    data = self.take_header(data);
                    if self.hdr_got == RECORD_HEADER_LEN {
                        self.begin_ssm_record(flash)?;
                    }
                }
                Phase::DownloadingSsmRecord => {
                    let n = (self.remaining as usize).min(data.len());
                    let (chunk, rest) = data.split_at(n);
                    self.append(flash, chunk)?;
                    self.remaining -= n as u32;
                    data = rest;
                    if self.remaining == 0 {
                        self.flush(flash)?;
                        self.phase = Phase::Done;
                    }
                }
                Phase::Done => return Err(OtaError::TooMuchData),
            }
        }

        self.received += segment.len() as u32;
        if self.phase == Phase::Done {
            if self.received != self.expected_total {
                return Err(OtaError::LengthMismatch);
            }
            let outcome = self.verify(flash)?;
            Ok(Progress::Complete(outcome))
        } else {
            Ok(Progress::InProgress)
        }
    }

    /// Convenience for the chained-segment shape the TCP stack delivers
    /// (up to three buffers per upcall).
    pub fn feed_chained<F: NandFlash>(
        &mut self,
        flash: &mut F,
        segments: &[&[u8]],
    ) -> Result<Progress, OtaError> {
        let mut progress = Progress::InProgress;
        for segment in segments {
            progress = self.feed(flash, segment)?;
        }
        Ok(progress)
    }

    fn take_header<'d>(&mut self, data: &'d [u8]) -> &'d [u8] {
        let n = (RECORD_HEADER_LEN - self.hdr_got).min(data.len());
        self.hdr[self.hdr_got..self.hdr_got + n]
            .copy_from_slice(&data[..n]);
        self.hdr_got += n;
        &data[n..]
    }

    fn begin_ap_record<F: NandFlash>(
        &mut self,
        flash: &mut F,
    ) -> Result<(), OtaError> {
        let hdr = RecordHeader::parse(&self.hdr)
            .map_err(|_| OtaError::FirstPacketNotAp)?;
        if hdr.record_type != RecordType::Ap {
            return Err(OtaError::FirstPacketNotAp);
        }
        if hdr.length > MAX_AP_IMAGE_LEN {
            return Err(OtaError::ApRecordTooLong);
        }
        if hdr.length < CRC_LEN as u32 {
            // Too short to even hold its stored CRC.
            return Err(OtaError::LengthMismatch);
        }
        ringbuf_entry!(Trace::ApHeader { len: hdr.length });
        self.ap_len = hdr.length;
        self.remaining = hdr.length;
        // Reclaim the whole landing zone before the first program.
        flash.erase_range(
            layout::ap_image_start(self.target),
            hdr.length,
        )?;
        self.phase = Phase::DownloadingApRecord;
        Ok(())
    }

    fn begin_ssm_record<F: NandFlash>(
        &mut self,
        flash: &mut F,
    ) -> Result<(), OtaError> {
        let hdr = RecordHeader::parse(&self.hdr)
            .map_err(|_| OtaError::NotSsmRecord)?;
        if hdr.record_type != RecordType::Ssm {
            return Err(OtaError::NotSsmRecord);
        }
        if hdr.length > MAX_SSM_IMAGE_LEN {
            return Err(OtaError::SsmRecordTooLong);
        }
        if hdr.length < CRC_LEN as u32 {
            return Err(OtaError::LengthMismatch);
        }
        ringbuf_entry!(Trace::SsmHeader { len: hdr.length });
        self.ssm_len = hdr.length;
        self.remaining = hdr.length;

        let advertised = 2 * RECORD_HEADER_LEN as u32 + self.ap_len + hdr.length;
        if advertised != self.expected_total {
            return Err(OtaError::LengthMismatch);
        }

        flash.erase_range(
            layout::ssm_record_start(self.target),
            hdr.length,
        )?;
        self.phase = Phase::DownloadingSsmRecord;
        Ok(())
    }

    fn capture_prefix(&mut self, chunk: &[u8]) {
        if self.prefix_got < VERSION_PREFIX_LEN {
            let n = (VERSION_PREFIX_LEN - self.prefix_got).min(chunk.len());
            self.prefix[self.prefix_got..self.prefix_got + n]
                .copy_from_slice(&chunk[..n]);
            self.prefix_got += n;
            if self.prefix_got == VERSION_PREFIX_LEN {
                let word = |o: usize| {
                    u32::from_be_bytes([
                        self.prefix[o],
                        self.prefix[o + 1],
                        self.prefix[o + 2],
                        self.prefix[o + 3],
                    ])
                };
                self.version = ImageVersion {
                    major: word(VERSION_OFFSET_IN_BODY),
                    minor: word(VERSION_OFFSET_IN_BODY + 4),
                    build: word(VERSION_OFFSET_IN_BODY + 8),
                };
            }
        }
    }

    /// Buffers bytes toward flash, flushing whenever the 40-page window
    /// fills. Flush points depend only on how many bytes of the current
    /// record have streamed, never on segment boundaries.
    fn append<F: NandFlash>(
        &mut self,
        flash: &mut F,
        mut bytes: &[u8],
    ) -> Result<(), OtaError> {
        while !bytes.is_empty() {
            let space = WRITE_BUFFER_SIZE - self.buf_len;
            let n = space.min(bytes.len());
            self.buf[self.buf_len..self.buf_len + n]
                .copy_from_slice(&bytes[..n]);
            self.buf_len += n;
            bytes = &bytes[n..];
            if self.buf_len == WRITE_BUFFER_SIZE {
                self.flush(flash)?;
            }
        }
        Ok(())
    }

    fn flush<F: NandFlash>(&mut self, flash: &mut F) -> Result<(), OtaError> {
        if self.buf_len == 0 {
            return Ok(());
        }
        ringbuf_entry!(Trace::Flush {
            addr: self.cursor,
            len: self.buf_len
        });
        flash.write(self.cursor, &self.buf[..self.buf_len])?;
        self.cursor += self.buf_len as u32;
        self.buf_len = 0;
        Ok(())
    }

    /// Streams both landed records back off the NAND through the running
    /// CRC and compares against the stored values. On mismatch the target
    /// slot's metadata page is reset to erased flash so the bootloader can
    /// never mistake the half-good image for a real one.
    fn verify<F: NandFlash>(
        &mut self,
        flash: &mut F,
    ) -> Result<DownloadOutcome, OtaError> {
        let ap_start = layout::ap_image_start(self.target);
        let ssm_start = layout::ssm_record_start(self.target);

        let result = check_record_crc(flash, ap_start, self.ap_len)
            .and_then(|()| check_record_crc(flash, ssm_start, self.ssm_len));

        match result {
            Ok(()) => {
                ringbuf_entry!(Trace::VerifyOk);
                Ok(DownloadOutcome {
                    target: self.target,
                    version: self.version,
                    ap_len: self.ap_len,
                    ssm_len: self.ssm_len,
                })
            }
            Err(e) => {
                ringbuf_entry!(Trace::VerifyFailed);
                ringbuf_entry!(Trace::Invalidated(ap_start));
                flash.erase_range(ap_start, PAGE_DATA_SIZE as u32)?;
                Err(e)
            }
        }
    }
}

/// CRC check of one landed record body: the stored CRC is its first two
/// bytes, computed over everything after them.
fn check_record_crc<F: NandFlash>(
    flash: &mut F,
    start: u32,
    body_len: u32,
) -> Result<(), OtaError> {
    let mut crc_bytes = [0u8; CRC_LEN];
    flash.read(start, &mut crc_bytes)?;
    let stored = u16::from_be_bytes(crc_bytes);

    let mut digest = CRC16.digest();
    let mut addr = start + CRC_LEN as u32;
    let mut remaining = body_len - CRC_LEN as u32;
    let mut page = [0u8; PAGE_DATA_SIZE];
    while remaining > 0 {
        let n = (remaining as usize).min(PAGE_DATA_SIZE);
        flash.read(addr, &mut page[..n])?;
        digest.update(&page[..n]);
        addr += n as u32;
        remaining -= n as u32;
    }
    let computed = digest.finalize();
    if computed != stored {
        return Err(OtaError::CrcMismatch { stored, computed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_image_api::{crc16, SlotId};
    use drv_mt29f_nand::BLOCK_DATA_SIZE;
    use proptest::prelude::*;

    /// RAM NAND that logs every operation so write-sequence equality can
    /// be asserted exactly.
    struct RamNand {
        mem: Vec<u8>,
        ops: Vec<(char, u32, u32)>,
    }

    impl RamNand {
        fn new() -> Self {
            Self {
                mem: vec![0xFF; 0x50_0000],
                ops: Vec::new(),
            }
        }
    }

    impl NandFlash for RamNand {
        fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), NandError> {
            let a = addr as usize;
            out.copy_from_slice(&self.mem[a..a + out.len()]);
            Ok(())
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), NandError> {
            self.ops.push(('w', addr, data.len() as u32));
            let a = addr as usize;
            for (m, d) in self.mem[a..a + data.len()].iter_mut().zip(data) {
                *m &= *d;
            }
            Ok(())
        }

        fn erase_range(&mut self, addr: u32, len: u32) -> Result<(), NandError> {
            self.ops.push(('e', addr, len));
            let start = (addr / BLOCK_DATA_SIZE * BLOCK_DATA_SIZE) as usize;
            let end =
                (((addr + len - 1) / BLOCK_DATA_SIZE + 1) * BLOCK_DATA_SIZE)
                    as usize;
            let end = end.min(self.mem.len());
            self.mem[start..end].fill(0xFF);
            Ok(())
        }
    }

    /// Builds a record body (stored CRC + metadata/binary payload).
    fn make_body(payload: &[u8]) -> Vec<u8> {
        let mut body = crc16(payload).to_be_bytes().to_vec();
        body.extend_from_slice(payload);
        body
    }

    fn ap_payload(version: ImageVersion, bin: &[u8]) -> Vec<u8> {
        // Body after the CRC: 5 reserved bytes, version triple, binary.
        let mut p = vec![0u8; 5];
        p.extend_from_slice(&version.major.to_be_bytes());
        p.extend_from_slice(&version.minor.to_be_bytes());
        p.extend_from_slice(&version.build.to_be_bytes());
        p.extend_from_slice(bin);
        p
    }

    fn make_package(
        version: ImageVersion,
        ap_bin: &[u8],
        ssm_payload: &[u8],
    ) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let ap_body = make_body(&ap_payload(version, ap_bin));
        let ssm_body = make_body(ssm_payload);
        let mut pkg = vec![RecordType::Ap as u8];
        pkg.extend_from_slice(&(ap_body.len() as u32).to_be_bytes());
        pkg.extend_from_slice(&ap_body);
        pkg.push(RecordType::Ssm as u8);
        pkg.extend_from_slice(&(ssm_body.len() as u32).to_be_bytes());
        pkg.extend_from_slice(&ssm_body);
        (pkg, ap_body, ssm_body)
    }

    fn run_segmented(
        pkg: &[u8],
        seg_len: usize,
    ) -> (RamNand, Result<Progress, OtaError>) {
        let mut nand = RamNand::new();
        let mut dl = Download::new(SlotId::B, pkg.len() as u32);
        let mut last = Ok(Progress::InProgress);
        for chunk in pkg.chunks(seg_len.max(1)) {
            last = dl.feed(&mut nand, chunk);
            if last.is_err() {
                break;
            }
        }
        (nand, last)
    }

    #[test]
    fn happy_path_lands_both_records() {
        let v = ImageVersion::new(2, 1, 40);
        let (pkg, ap_body, ssm_body) =
            make_package(v, &[0xA7; 100_000], &[0x33; 9_000]);

        let (mut nand, last) = run_segmented(&pkg, 1460);
        let outcome = match last.unwrap() {
            Progress::Complete(o) => o,
            p => panic!("not complete: {p:?}"),
        };
        assert_eq!(outcome.target, SlotId::B);
        assert_eq!(outcome.version, v);
        assert_eq!(outcome.ap_len, ap_body.len() as u32);
        assert_eq!(outcome.ssm_len, ssm_body.len() as u32);

        let mut back = vec![0u8; ap_body.len()];
        nand.read(layout::SLOT_B_AP_START, &mut back).unwrap();
        assert_eq!(back, ap_body);
        let mut back = vec![0u8; ssm_body.len()];
        nand.read(layout::SLOT_B_SSM_START, &mut back).unwrap();
        assert_eq!(back, ssm_body);
    }

    #[test]
    fn record_aligned_to_packet_boundary() {
        let v = ImageVersion::new(1, 0, 1);
        let (pkg, ap_body, _) = make_package(v, &[1; 500], &[2; 60]);

        let mut nand = RamNand::new();
        let mut dl = Download::new(SlotId::B, pkg.len() as u32);
        // First segment ends exactly at the end of the AP record.
        let split = RECORD_HEADER_LEN + ap_body.len();
        assert!(matches!(
            dl.feed(&mut nand, &pkg[..split]).unwrap(),
            Progress::InProgress
        ));
        assert!(matches!(
            dl.feed(&mut nand, &pkg[split..]).unwrap(),
            Progress::Complete(_)
        ));
    }

    #[test]
    fn ssm_header_split_four_one() {
        let v = ImageVersion::new(1, 0, 2);
        let (pkg, ap_body, _) = make_package(v, &[3; 700], &[4; 80]);

        let mut nand = RamNand::new();
        let mut dl = Download::new(SlotId::B, pkg.len() as u32);
        // Four bytes of the SM header arrive with the AP tail, the fifth
        // alone in the next segment.
        let split = RECORD_HEADER_LEN + ap_body.len() + 4;
        assert!(matches!(
            dl.feed(&mut nand, &pkg[..split]).unwrap(),
            Progress::InProgress
        ));
        assert!(matches!(
            dl.feed(&mut nand, &pkg[split..split + 1]).unwrap(),
            Progress::InProgress
        ));
        assert!(matches!(
            dl.feed(&mut nand, &pkg[split + 1..]).unwrap(),
            Progress::Complete(_)
        ));
    }

    #[test]
    fn first_packet_must_be_ap() {
        let (mut pkg, _, _) =
            make_package(ImageVersion::default(), &[1; 64], &[2; 16]);
        pkg[0] = RecordType::Ssm as u8;
        let (_, last) = run_segmented(&pkg, 512);
        assert_eq!(last, Err(OtaError::FirstPacketNotAp));
    }

    #[test]
    fn corrupt_ssm_record_invalidates_slot_and_reports() {
        let v = ImageVersion::new(3, 0, 0);
        let (mut pkg, ap_body, _) =
            make_package(v, &[0x5C; 4_000], &[0x66; 300]);
        // Flip one SM body byte past its stored CRC.
        let ssm_body_start = RECORD_HEADER_LEN + ap_body.len() + RECORD_HEADER_LEN;
        pkg[ssm_body_start + CRC_LEN + 40] ^= 0x01;

        let (mut nand, last) = run_segmented(&pkg, 1460);
        assert!(matches!(last, Err(OtaError::CrcMismatch { .. })));

        // The AP image bytes landed, but the slot's metadata page reads as
        // erased flash, so it can never be picked up as a real image.
        let mut page = [0u8; PAGE_DATA_SIZE];
        nand.read(layout::SLOT_B_AP_START, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn oversized_ap_record_is_rejected() {
        let mut pkg = vec![RecordType::Ap as u8];
        pkg.extend_from_slice(&(MAX_AP_IMAGE_LEN + 1).to_be_bytes());
        pkg.extend_from_slice(&[0; 64]);
        let mut nand = RamNand::new();
        let mut dl = Download::new(SlotId::B, 0xFFFF_FFFF);
        assert_eq!(
            dl.feed(&mut nand, &pkg),
            Err(OtaError::ApRecordTooLong)
        );
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let (pkg, _, _) =
            make_package(ImageVersion::default(), &[1; 64], &[2; 16]);
        let mut nand = RamNand::new();
        let mut dl = Download::new(SlotId::B, pkg.len() as u32);
        dl.feed(&mut nand, &pkg).unwrap();
        assert_eq!(
            dl.feed(&mut nand, &[0x00]),
            Err(OtaError::TooMuchData)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // For any segmentation, the flash op sequence and final
        // contents equal the unsegmented run's.
        #[test]
        fn write_sequence_invariant_under_segmentation(
            ap_bin_len in 1usize..40_000,
            ssm_len in 1usize..2_000,
            seg in 1usize..4_000,
            seed: u8,
        ) {
            let ap_bin: Vec<u8> =
                (0..ap_bin_len).map(|i| (i as u8).wrapping_add(seed)).collect();
            let ssm: Vec<u8> =
                (0..ssm_len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
            let (pkg, _, _) = make_package(
                ImageVersion::new(1, 2, 3),
                &ap_bin,
                &ssm,
            );

            let (whole, r1) = run_segmented(&pkg, pkg.len());
            let (split, r2) = run_segmented(&pkg, seg);
            prop_assert_eq!(r1.unwrap(), r2.unwrap());
            prop_assert_eq!(&whole.ops, &split.ops);
            prop_assert_eq!(&whole.mem, &split.mem);
        }
    }
}
