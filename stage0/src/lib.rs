// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootloader policy.
//!
//! On every reset the bootloader reads the handoff block and the image
//! registry, decides which slot to run and why, records that decision back
//! into the handoff block, and jumps. The actual internal-flash programming
//! and jump are board glue; everything decidable is here, where it can be
//! tested.
//!
//! Decision order:
//!
//! 1. Bootloop circuit breaker: too many boots without reaching standby
//!    means we boot the primary with reason `Fallback` so the application
//!    runs its SM-recovery ladder first thing.
//! 2. Manufacturing: if provisioning has never completed and the internal
//!    flash staging area holds a valid two-record package, boot slot A with
//!    reason `Manufacturing`.
//! 3. Nominal: boot the primary; if the primary is `Failed`, the alternate
//!    (if usable) with reason `Fallback`; if both slots are `Failed`, give
//!    up and sit in safe idle kicking the watchdog.

#![cfg_attr(not(test), no_std)]

use boot_handoff::{BootState, HandoffLoadError, WARM_BOOT_KEY};
use drv_image_api::{validate_package, BootReason, ImageOpState, SlotId};
use drv_image_registry::{Registry, MAX_RESETS_SINCE_LP_MODE};
use drv_sys_api::{Delay, Watchdog};
use ringlog::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Decision(BootReason, SlotId),
    BothSlotsFailed,
    StagedPackageValid,
}

ringbuf!(Trace, 16, Trace::None);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootChoice {
    pub reason: BootReason,
    pub slot: SlotId,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootDecision {
    Boot(BootChoice),
    /// Both slots are unusable. Terminal; only the watchdog gets serviced.
    SafeIdle,
}

/// Pure slot selection for a nominal boot: the primary unless it is
/// `Failed`, else the alternate unless it is also `Failed`.
pub fn pick_boot_slot(registry: &Registry) -> Option<(SlotId, BootReason)> {
    let primary = registry.primary;
    if registry.op_state(primary) != ImageOpState::Failed {
        return Some((primary, BootReason::Nominal));
    }
    let alt = primary.alternate();
    if registry.op_state(alt) != ImageOpState::Failed {
        return Some((alt, BootReason::Fallback));
    }
    None
}

/// The full decision, given the registry and the internal-flash staging
/// area contents.
pub fn pick_boot_choice(registry: &Registry, staging: &[u8]) -> BootDecision {
    if registry.resets_since_lp_mode >= MAX_RESETS_SINCE_LP_MODE {
        // Boot whatever pick_boot_slot would boot, but tell the application
        // it is a fallback so it recovers the SM before anything else.
        return match pick_boot_slot(registry) {
            Some((slot, _)) => {
                ringbuf_entry!(Trace::Decision(BootReason::Fallback, slot));
                BootDecision::Boot(BootChoice {
                    reason: BootReason::Fallback,
                    slot,
                })
            }
            None => {
                ringbuf_entry!(Trace::BothSlotsFailed);
                BootDecision::SafeIdle
            }
        };
    }

    if !registry.mfg_complete && validate_package(staging).is_ok() {
        ringbuf_entry!(Trace::StagedPackageValid);
        return BootDecision::Boot(BootChoice {
            reason: BootReason::Manufacturing,
            slot: SlotId::A,
        });
    }

    match pick_boot_slot(registry) {
        Some((slot, reason)) => {
            ringbuf_entry!(Trace::Decision(reason, slot));
            BootDecision::Boot(BootChoice { reason, slot })
        }
        None => {
            ringbuf_entry!(Trace::BothSlotsFailed);
            BootDecision::SafeIdle
        }
    }
}

/// Builds the handoff block for a decided boot. `prev` is whatever the
/// outgoing block held (absent on a cold boot); the start counter carries
/// across it.
pub fn handoff_for_choice(
    prev: Result<BootState, HandoffLoadError>,
    choice: BootChoice,
) -> BootState {
    let start_count = match prev {
        Ok(state) => state.start_count.wrapping_add(1),
        Err(_) => 1,
    };
    BootState {
        start_count,
        reason_last_loaded: choice.reason,
        last_loaded: Some(choice.slot),
        cold_vs_warm_key: WARM_BOOT_KEY,
    }
}

/// One bootloader pass over the handoff region: load the previous block,
/// decide, store the new block. Returns the decision for the jump glue.
pub fn boot_cycle(
    registry: &Registry,
    staging: &[u8],
    handoff_region: &mut [u8],
) -> BootDecision {
    let prev = BootState::load(handoff_region);
    let decision = pick_boot_choice(registry, staging);
    if let BootDecision::Boot(choice) = decision {
        handoff_for_choice(prev, choice).store(handoff_region);
    }
    decision
}

/// Terminal state when no image is bootable: keep the external watchdog
/// happy and do nothing else, forever.
pub fn safe_idle(watchdog: &impl Watchdog, delay: &impl Delay) -> ! {
    loop {
        watchdog.kick();
        delay.sleep_for(500);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_handoff::HANDOFF_REGION_SIZE;
    use drv_image_api::{crc16, ImageVersion, RecordType, CRC_LEN};
    use proptest::prelude::*;

    fn make_record(rtype: RecordType, payload: &[u8]) -> Vec<u8> {
        let body_len = (payload.len() + CRC_LEN) as u32;
        let mut rec = vec![rtype as u8];
        rec.extend_from_slice(&body_len.to_be_bytes());
        rec.extend_from_slice(&crc16(payload).to_be_bytes());
        rec.extend_from_slice(payload);
        rec
    }

    fn valid_staging() -> Vec<u8> {
        // AP payload needs the 17 bytes of reserved+version metadata in
        // front of the binary for the version read to be in bounds.
        let mut ap_payload = vec![0u8; 17];
        ap_payload.extend_from_slice(&[0xAB; 100]);
        let mut pkg = make_record(RecordType::Ap, &ap_payload);
        pkg.extend_from_slice(&make_record(RecordType::Ssm, &[0xCD; 32]));
        pkg
    }

    fn registry_with(
        primary: SlotId,
        a: ImageOpState,
        b: ImageOpState,
    ) -> Registry {
        let mut r = Registry::default();
        r.primary = primary;
        r.slot_a.op_state = a;
        r.slot_b.op_state = b;
        r.slot_a.version = ImageVersion::new(1, 0, 0);
        r.slot_b.version = ImageVersion::new(1, 1, 0);
        r.mfg_complete = true;
        r
    }

    #[test]
    fn nominal_boot_prefers_primary() {
        let r = registry_with(SlotId::B, ImageOpState::Full, ImageOpState::Full);
        assert_eq!(
            pick_boot_choice(&r, &[]),
            BootDecision::Boot(BootChoice {
                reason: BootReason::Nominal,
                slot: SlotId::B,
            })
        );
    }

    #[test]
    fn failed_primary_falls_back() {
        let r =
            registry_with(SlotId::A, ImageOpState::Failed, ImageOpState::Full);
        assert_eq!(
            pick_boot_choice(&r, &[]),
            BootDecision::Boot(BootChoice {
                reason: BootReason::Fallback,
                slot: SlotId::B,
            })
        );
    }

    #[test]
    fn both_failed_is_safe_idle() {
        let r = registry_with(
            SlotId::A,
            ImageOpState::Failed,
            ImageOpState::Failed,
        );
        assert_eq!(pick_boot_choice(&r, &[]), BootDecision::SafeIdle);
    }

    #[test]
    fn bootloop_counter_forces_fallback_reason() {
        let mut r =
            registry_with(SlotId::A, ImageOpState::Full, ImageOpState::Full);
        r.resets_since_lp_mode = MAX_RESETS_SINCE_LP_MODE;
        assert_eq!(
            pick_boot_choice(&r, &[]),
            BootDecision::Boot(BootChoice {
                reason: BootReason::Fallback,
                slot: SlotId::A,
            })
        );
    }

    #[test]
    fn staged_package_triggers_manufacturing() {
        let mut r =
            registry_with(SlotId::A, ImageOpState::Unknown, ImageOpState::Unknown);
        r.mfg_complete = false;
        let staging = valid_staging();
        assert_eq!(
            pick_boot_choice(&r, &staging),
            BootDecision::Boot(BootChoice {
                reason: BootReason::Manufacturing,
                slot: SlotId::A,
            })
        );

        // Once provisioning completed, the same staging area is ignored.
        r.mfg_complete = true;
        r.slot_a.op_state = ImageOpState::Full;
        assert_eq!(
            pick_boot_choice(&r, &staging),
            BootDecision::Boot(BootChoice {
                reason: BootReason::Nominal,
                slot: SlotId::A,
            })
        );
    }

    #[test]
    fn boot_cycle_writes_handoff_and_counts_starts() {
        let r = registry_with(SlotId::A, ImageOpState::Full, ImageOpState::Full);
        let mut region = [0u8; HANDOFF_REGION_SIZE];

        let d1 = boot_cycle(&r, &[], &mut region);
        assert!(matches!(d1, BootDecision::Boot(_)));
        let s1 = BootState::load(&region).unwrap();
        assert_eq!(s1.start_count, 1);
        assert_eq!(s1.last_loaded, Some(SlotId::A));

        boot_cycle(&r, &[], &mut region);
        let s2 = BootState::load(&region).unwrap();
        assert_eq!(s2.start_count, 2);
    }

    #[test]
    fn safe_idle_leaves_handoff_untouched() {
        let r = registry_with(
            SlotId::A,
            ImageOpState::Failed,
            ImageOpState::Failed,
        );
        let mut region = [0x11u8; HANDOFF_REGION_SIZE];
        let before = region;
        assert_eq!(boot_cycle(&r, &[], &mut region), BootDecision::SafeIdle);
        assert_eq!(region, before);
    }

    proptest! {
        // Whatever the op-state permutation, a Failed slot is never
        // chosen, and if any slot is usable we boot.
        #[test]
        fn never_boots_a_failed_slot(
            primary_b: bool,
            a in 0u8..4,
            b in 0u8..4,
            resets in 0u8..6,
        ) {
            use ImageOpState::*;
            let states = [Unknown, Partial, Full, Failed];
            let mut r = registry_with(
                if primary_b { SlotId::B } else { SlotId::A },
                states[a as usize],
                states[b as usize],
            );
            r.resets_since_lp_mode = resets;

            match pick_boot_choice(&r, &[]) {
                BootDecision::Boot(choice) => {
                    prop_assert_ne!(
                        r.op_state(choice.slot),
                        ImageOpState::Failed
                    );
                }
                BootDecision::SafeIdle => {
                    prop_assert_eq!(r.op_state(SlotId::A), ImageOpState::Failed);
                    prop_assert_eq!(r.op_state(SlotId::B), ImageOpState::Failed);
                }
            }
        }
    }
}
