// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image registry: the single persisted record describing both firmware
//! slots plus the device's long-lived configuration and counters.
//!
//! The registry occupies one NAND page in its own block. NAND pages are
//! write-once-per-erase, so every mutation rewrites the whole page: erase
//! the block, program the new image. Mutators here each pay that cost;
//! callers with several updates to make in one go should use
//! [`RegistryStore::update`] and batch them in the closure.
//!
//! There is exactly one cached copy process-wide, owned by the
//! `RegistryStore`; all readers and writers go through it.

#![cfg_attr(not(test), no_std)]

use drv_image_api::{layout, ImageOpState, ImageVersion, SlotId};
use drv_mt29f_nand::{NandError, NandFlash, PAGE_DATA_SIZE};
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

const VERSION: u32 = 1;
const MAGIC: [u8; 12] = *b"IMG-REGISTRY";

/// Bootloop circuit breaker: this many boots without reaching standby force
/// an SM re-flash.
pub const MAX_RESETS_SINCE_LP_MODE: u8 = 3;

/// RSSI byte meaning "never measured".
pub const RSSI_UNKNOWN: u8 = 0xFF;

#[derive(Serialize, Deserialize, SerializedSize)]
struct RegistryHeader {
    version: u32,
    magic: [u8; 12],
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct SlotInfo {
    pub version: ImageVersion,
    pub op_state: ImageOpState,
}

impl Default for SlotInfo {
    fn default() -> Self {
        Self {
            version: ImageVersion::default(),
            op_state: ImageOpState::Unknown,
        }
    }
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
#[repr(u8)]
pub enum AntennaChoice {
    Primary = 0,
    Secondary = 1,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct GpsFix {
    /// Microdegrees.
    pub latitude: i32,
    /// Microdegrees.
    pub longitude: i32,
    pub timestamp: u32,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct GpsConfig {
    /// How long a single fix attempt may run.
    pub max_fix_time_s: u16,
    /// Fix attempts allowed before we stop trying until asked again.
    pub max_retries: u8,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            max_fix_time_s: 300,
            max_retries: 3,
        }
    }
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct Registry {
    pub primary: SlotId,
    /// Slot the currently executing AP image was booted from. `None` until
    /// the running image has identified itself by version.
    pub loaded: Option<SlotId>,
    pub slot_a: SlotInfo,
    pub slot_b: SlotInfo,
    pub mfg_complete: bool,
    pub antenna: AntennaChoice,
    pub gps_fix: Option<GpsFix>,
    pub gps_retries: u8,
    pub gps_sent: bool,
    /// Unexpected (unplanned) reset count.
    pub reset_counter: u16,
    pub last_reset_timestamp: u32,
    /// Monotonic cloud message sequence number.
    pub msg_number: u64,
    pub ap_wake_rate_days: u16,
    pub stroke_detection_enabled: bool,
    pub gps_cfg: GpsConfig,
    pub red_flag_on_threshold: u16,
    pub red_flag_off_threshold: u16,
    /// Boots since standby was last entered. See
    /// [`MAX_RESETS_SINCE_LP_MODE`].
    pub resets_since_lp_mode: u8,
    pub seconds_to_wait_for_mfg: u32,
    pub ant_rssi_primary: u8,
    pub ant_rssi_secondary: u8,
    pub last_antenna_switch_ts: u32,
}

const_assert!(
    RegistryHeader::MAX_SIZE + Registry::MAX_SIZE <= PAGE_DATA_SIZE
);

impl Default for Registry {
    fn default() -> Self {
        Self {
            primary: SlotId::A,
            loaded: None,
            slot_a: SlotInfo::default(),
            slot_b: SlotInfo::default(),
            mfg_complete: false,
            antenna: AntennaChoice::Primary,
            gps_fix: None,
            gps_retries: 0,
            gps_sent: false,
            reset_counter: 0,
            last_reset_timestamp: 0,
            msg_number: 0,
            ap_wake_rate_days: 1,
            stroke_detection_enabled: true,
            gps_cfg: GpsConfig::default(),
            red_flag_on_threshold: 0,
            red_flag_off_threshold: 0,
            resets_since_lp_mode: 0,
            seconds_to_wait_for_mfg: 0,
            ant_rssi_primary: RSSI_UNKNOWN,
            ant_rssi_secondary: RSSI_UNKNOWN,
            last_antenna_switch_ts: 0,
        }
    }
}

impl Registry {
    pub fn slot(&self, slot: SlotId) -> &SlotInfo {
        match slot {
            SlotId::A => &self.slot_a,
            SlotId::B => &self.slot_b,
        }
    }

    fn slot_mut(&mut self, slot: SlotId) -> &mut SlotInfo {
        match slot {
            SlotId::A => &mut self.slot_a,
            SlotId::B => &mut self.slot_b,
        }
    }

    pub fn op_state(&self, slot: SlotId) -> ImageOpState {
        self.slot(slot).op_state
    }

    /// Which slot holds an image with exactly this version, if either does.
    /// The running AP uses this to identify itself after boot.
    pub fn slot_with_version(&self, v: ImageVersion) -> Option<SlotId> {
        if self.slot_a.version == v {
            Some(SlotId::A)
        } else if self.slot_b.version == v {
            Some(SlotId::B)
        } else {
            None
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// Header or payload failed to parse; the page is corrupt or blank.
    Corrupt,
    /// `load` has not succeeded yet.
    NotLoaded,
    /// The requested op-state change is not in the transition table.
    InvalidTransition {
        from: ImageOpState,
        to: ImageOpState,
    },
    /// Refusing to make a `Failed` slot primary.
    SlotFailed,
    Flash(NandError),
}

impl From<NandError> for RegistryError {
    fn from(e: NandError) -> Self {
        RegistryError::Flash(e)
    }
}

/// `Unknown → Partial → Full`, anything → `Failed`, same-state writes
/// idempotent. `Failed` leaves only via [`RegistryStore::record_ota_write`].
fn transition_allowed(from: ImageOpState, to: ImageOpState) -> bool {
    use ImageOpState::*;
    matches!(
        (from, to),
        (Unknown, Partial) | (Partial, Full) | (_, Failed)
    ) || from == to
}

pub struct RegistryStore<D> {
    flash: D,
    cached: Option<Registry>,
}

impl<D: NandFlash> RegistryStore<D> {
    pub fn new(flash: D) -> Self {
        Self {
            flash,
            cached: None,
        }
    }

    /// Reads and verifies the registry page. Idempotent after the first
    /// success.
    pub fn load(&mut self) -> Result<&Registry, RegistryError> {
        if self.cached.is_none() {
            let mut page = [0u8; PAGE_DATA_SIZE];
            self.flash.read(layout::REGISTRY_START, &mut page)?;
            let (header, rest) =
                hubpack::deserialize::<RegistryHeader>(&page)
                    .map_err(|_| RegistryError::Corrupt)?;
            if header.magic != MAGIC || header.version != VERSION {
                return Err(RegistryError::Corrupt);
            }
            let (reg, _) = hubpack::deserialize::<Registry>(rest)
                .map_err(|_| RegistryError::Corrupt)?;
            self.cached = Some(reg);
        }
        Ok(self.cached.as_ref().unwrap())
    }

    /// Writes a factory-default registry. Used on first power-up and as the
    /// recovery path when the page is corrupt.
    pub fn format_default(&mut self) -> Result<(), RegistryError> {
        self.cached = Some(Registry::default());
        self.persist()
    }

    pub fn registry(&self) -> Result<&Registry, RegistryError> {
        self.cached.as_ref().ok_or(RegistryError::NotLoaded)
    }

    /// Applies `f` to the cached registry and rewrites the page once. Batch
    /// related mutations here; each call costs a block erase.
    pub fn update(
        &mut self,
        f: impl FnOnce(&mut Registry),
    ) -> Result<(), RegistryError> {
        let reg = self.cached.as_mut().ok_or(RegistryError::NotLoaded)?;
        f(reg);
        self.persist()
    }

    fn persist(&mut self) -> Result<(), RegistryError> {
        let reg = self.cached.as_ref().ok_or(RegistryError::NotLoaded)?;
        let mut page = [0xFFu8; PAGE_DATA_SIZE];
        let header = RegistryHeader {
            version: VERSION,
            magic: MAGIC,
        };
        // Sized by the const assert above; failure is a programmer error.
        let mut n = hubpack::serialize(&mut page, &header).unwrap();
        n += hubpack::serialize(&mut page[n..], reg).unwrap();
        self.flash
            .erase_range(layout::REGISTRY_START, PAGE_DATA_SIZE as u32)?;
        self.flash.write(layout::REGISTRY_START, &page[..n])?;
        Ok(())
    }

    pub fn primary(&self) -> Result<SlotId, RegistryError> {
        Ok(self.registry()?.primary)
    }

    /// Makes `slot` the bootloader's preferred slot. Refuses slots marked
    /// `Failed`; the bootloader relies on this to never pick one.
    pub fn set_primary(&mut self, slot: SlotId) -> Result<(), RegistryError> {
        if self.registry()?.op_state(slot) == ImageOpState::Failed {
            return Err(RegistryError::SlotFailed);
        }
        self.update(|r| r.primary = slot)
    }

    pub fn loaded(&self) -> Result<Option<SlotId>, RegistryError> {
        Ok(self.registry()?.loaded)
    }

    pub fn set_loaded(&mut self, slot: SlotId) -> Result<(), RegistryError> {
        self.update(|r| r.loaded = Some(slot))
    }

    pub fn op_state(&self, slot: SlotId) -> Result<ImageOpState, RegistryError> {
        Ok(self.registry()?.op_state(slot))
    }

    pub fn set_op_state(
        &mut self,
        slot: SlotId,
        to: ImageOpState,
    ) -> Result<(), RegistryError> {
        let from = self.op_state(slot)?;
        if !transition_allowed(from, to) {
            return Err(RegistryError::InvalidTransition { from, to });
        }
        if from == to {
            // Idempotent; skip the erase cycle.
            return Ok(());
        }
        self.update(|r| r.slot_mut(slot).op_state = to)
    }

    /// Records that the OTA pipeline just landed verified bytes in `slot`:
    /// op-state becomes `Unknown` (even from `Failed`; this is the one
    /// legal exit) and the stored version is replaced.
    pub fn record_ota_write(
        &mut self,
        slot: SlotId,
        version: ImageVersion,
    ) -> Result<(), RegistryError> {
        self.update(|r| {
            let s = r.slot_mut(slot);
            s.op_state = ImageOpState::Unknown;
            s.version = version;
        })
    }

    pub fn slot_with_version(
        &self,
        v: ImageVersion,
    ) -> Result<Option<SlotId>, RegistryError> {
        Ok(self.registry()?.slot_with_version(v))
    }

    pub fn incr_unexpected_reset(
        &mut self,
        timestamp: u32,
    ) -> Result<(), RegistryError> {
        self.update(|r| {
            r.reset_counter = r.reset_counter.saturating_add(1);
            r.last_reset_timestamp = timestamp;
        })
    }

    pub fn resets_since_lp_mode(&self) -> Result<u8, RegistryError> {
        Ok(self.registry()?.resets_since_lp_mode)
    }

    pub fn set_resets_since_lp_mode(
        &mut self,
        n: u8,
    ) -> Result<(), RegistryError> {
        self.update(|r| r.resets_since_lp_mode = n)
    }

    /// Returns the next message number and persists the advance.
    pub fn advance_msg_number(&mut self) -> Result<u64, RegistryError> {
        let mut next = 0;
        self.update(|r| {
            r.msg_number = r.msg_number.wrapping_add(1);
            next = r.msg_number;
        })?;
        Ok(next)
    }

    pub fn set_mfg_complete(&mut self, v: bool) -> Result<(), RegistryError> {
        self.update(|r| r.mfg_complete = v)
    }

    pub fn set_antenna(
        &mut self,
        choice: AntennaChoice,
        switch_ts: u32,
    ) -> Result<(), RegistryError> {
        self.update(|r| {
            r.antenna = choice;
            r.last_antenna_switch_ts = switch_ts;
        })
    }

    pub fn set_antenna_rssi(
        &mut self,
        primary: u8,
        secondary: u8,
    ) -> Result<(), RegistryError> {
        self.update(|r| {
            r.ant_rssi_primary = primary;
            r.ant_rssi_secondary = secondary;
        })
    }

    pub fn set_gps_fix(
        &mut self,
        fix: Option<GpsFix>,
        sent: bool,
    ) -> Result<(), RegistryError> {
        self.update(|r| {
            r.gps_fix = fix;
            r.gps_sent = sent;
        })
    }

    pub fn set_gps_sent(&mut self, sent: bool) -> Result<(), RegistryError> {
        self.update(|r| r.gps_sent = sent)
    }

    pub fn set_gps_retries(&mut self, n: u8) -> Result<(), RegistryError> {
        self.update(|r| r.gps_retries = n)
    }

    pub fn set_gps_config(
        &mut self,
        cfg: GpsConfig,
    ) -> Result<(), RegistryError> {
        self.update(|r| r.gps_cfg = cfg)
    }

    pub fn set_wake_rate_days(
        &mut self,
        days: u16,
    ) -> Result<(), RegistryError> {
        self.update(|r| r.ap_wake_rate_days = days)
    }

    pub fn set_stroke_detection(
        &mut self,
        enabled: bool,
    ) -> Result<(), RegistryError> {
        self.update(|r| r.stroke_detection_enabled = enabled)
    }

    pub fn set_red_flag_thresholds(
        &mut self,
        on: u16,
        off: u16,
    ) -> Result<(), RegistryError> {
        self.update(|r| {
            r.red_flag_on_threshold = on;
            r.red_flag_off_threshold = off;
        })
    }

    pub fn set_seconds_to_wait_for_mfg(
        &mut self,
        seconds: u32,
    ) -> Result<(), RegistryError> {
        self.update(|r| r.seconds_to_wait_for_mfg = seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// RAM-backed NAND with real erase/program semantics: programming can
    /// only clear bits, so a write without an erase shows up as corruption.
    #[derive(Clone)]
    struct RamNand(Rc<RefCell<Vec<u8>>>);

    impl RamNand {
        fn new() -> Self {
            RamNand(Rc::new(RefCell::new(vec![
                0xFF;
                (layout::REGISTRY_START
                    as usize)
                    + 4 * PAGE_DATA_SIZE
            ])))
        }
    }

    impl NandFlash for RamNand {
        fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), NandError> {
            let a = addr as usize;
            out.copy_from_slice(&self.0.borrow()[a..a + out.len()]);
            Ok(())
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), NandError> {
            let a = addr as usize;
            let mut mem = self.0.borrow_mut();
            for (m, d) in mem[a..a + data.len()].iter_mut().zip(data) {
                *m &= *d;
            }
            Ok(())
        }

        fn erase_range(&mut self, addr: u32, len: u32) -> Result<(), NandError> {
            const BLOCK: u32 = drv_mt29f_nand::BLOCK_DATA_SIZE;
            let start = (addr / BLOCK * BLOCK) as usize;
            let end = (((addr + len - 1) / BLOCK + 1) * BLOCK) as usize;
            let mut mem = self.0.borrow_mut();
            let end = end.min(mem.len());
            mem[start..end].fill(0xFF);
            Ok(())
        }
    }

    fn fresh_store() -> RegistryStore<RamNand> {
        let mut s = RegistryStore::new(RamNand::new());
        s.format_default().unwrap();
        s
    }

    #[test]
    fn blank_page_is_corrupt() {
        let mut s = RegistryStore::new(RamNand::new());
        assert_eq!(s.load().err(), Some(RegistryError::Corrupt));
    }

    #[test]
    fn persists_across_reload() {
        let nand = RamNand::new();
        let mut s = RegistryStore::new(nand.clone());
        s.format_default().unwrap();
        s.set_primary(SlotId::B).unwrap();
        s.set_resets_since_lp_mode(2).unwrap();
        s.set_antenna_rssi(42, 17).unwrap();

        // Same flash, fresh cache: simulates a reboot.
        let mut s2 = RegistryStore::new(nand);
        let reg = s2.load().unwrap();
        assert_eq!(reg.primary, SlotId::B);
        assert_eq!(reg.resets_since_lp_mode, 2);
        assert_eq!(reg.ant_rssi_primary, 42);
    }

    #[test]
    fn op_state_transition_table() {
        let mut s = fresh_store();
        // Unknown -> Full is not a thing.
        assert!(matches!(
            s.set_op_state(SlotId::A, ImageOpState::Full),
            Err(RegistryError::InvalidTransition { .. })
        ));
        s.set_op_state(SlotId::A, ImageOpState::Partial).unwrap();
        s.set_op_state(SlotId::A, ImageOpState::Full).unwrap();
        // Idempotent same-state write.
        s.set_op_state(SlotId::A, ImageOpState::Full).unwrap();
        // Anything -> Failed.
        s.set_op_state(SlotId::A, ImageOpState::Failed).unwrap();
        // Failed is sticky except through an OTA write.
        assert!(matches!(
            s.set_op_state(SlotId::A, ImageOpState::Partial),
            Err(RegistryError::InvalidTransition { .. })
        ));
        s.record_ota_write(SlotId::A, ImageVersion::new(2, 0, 0))
            .unwrap();
        assert_eq!(s.op_state(SlotId::A).unwrap(), ImageOpState::Unknown);
    }

    #[test]
    fn set_primary_refuses_failed_slot() {
        let mut s = fresh_store();
        s.set_op_state(SlotId::B, ImageOpState::Failed).unwrap();
        assert_eq!(s.set_primary(SlotId::B), Err(RegistryError::SlotFailed));
        assert_eq!(s.primary().unwrap(), SlotId::A);
    }

    #[test]
    fn version_lookup_identifies_slot() {
        let mut s = fresh_store();
        let v = ImageVersion::new(1, 2, 3);
        s.record_ota_write(SlotId::B, v).unwrap();
        assert_eq!(s.slot_with_version(v).unwrap(), Some(SlotId::B));
        assert_eq!(
            s.slot_with_version(ImageVersion::new(9, 9, 9)).unwrap(),
            None
        );
    }

    #[test]
    fn counters() {
        let mut s = fresh_store();
        s.incr_unexpected_reset(1234).unwrap();
        s.incr_unexpected_reset(2345).unwrap();
        let reg = s.registry().unwrap();
        assert_eq!(reg.reset_counter, 2);
        assert_eq!(reg.last_reset_timestamp, 2345);

        assert_eq!(s.advance_msg_number().unwrap(), 1);
        assert_eq!(s.advance_msg_number().unwrap(), 2);
    }
}
