// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application-side early initialization.
//!
//! Runs once, before the event core starts, and consumes the bootloader's
//! handoff block exactly once. Responsibilities, in order:
//!
//! 1. Count the boot and run the bootloop circuit breaker: three boots
//!    without reaching standby means the SM firmware is the prime suspect,
//!    so re-flash it from the primary slot before anything else.
//! 2. Act on the boot reason: fallback recovery, post-upgrade `Partial`
//!    marking (then straight back to standby), or manufacturing
//!    provisioning from the internal-flash staging area.
//! 3. Confirm the SM application is alive, resetting and ultimately
//!    re-flashing it if not.
//! 4. Account unexpected resets.
//!
//! The caller supplies ports for the SM maintenance operations and acts on
//! the returned [`StartupOutcome`]; this keeps every branch of the ladder
//! testable on the host.

#![cfg_attr(not(test), no_std)]

use boot_handoff::{BootState, HandoffLoadError};
use drv_image_api::{
    layout, validate_package, BootReason, ImageOpState, ImageVersion, SlotId,
    RECORD_HEADER_LEN,
};
use drv_image_registry::{
    RegistryError, RegistryStore, MAX_RESETS_SINCE_LP_MODE,
};
use drv_mt29f_nand::NandFlash;
use ringlog::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    BootCounted(u8),
    CircuitBreakerTripped,
    SsmAlive,
    SsmDeadAfterReset,
    FallbackReflash(SlotId),
    RollbackTo(SlotId),
    UpgradeMarkedPartial(SlotId),
    ManufacturingProvisioned,
    UnknownRunningVersion,
    UnexpectedReset,
    RegistryTrouble(RegistryError),
}

ringbuf!(Trace, 32, Trace::None);

/// What `main` should do once startup returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StartupOutcome {
    /// Proceed to the event core.
    Continue,
    /// Planned nap (post-upgrade): go straight back to standby.
    EnterStandby,
    /// Registry was rearranged (rollback); reset so the bootloader picks
    /// the new primary.
    SystemReset,
    /// Nothing left to try; service the watchdog and stop.
    SafeIdle,
}

/// SM maintenance operations used during startup. Implemented over the SPI
/// link and the BSL programmer by the task glue; faked in tests.
pub trait SsmMaintenance {
    /// One GetStatus round trip; true if the SM application answered.
    fn comm_check(&mut self) -> bool;

    /// Hard-resets the SM and waits out its boot settle time.
    fn hardware_reset(&mut self);

    /// Raises the heads-up line so a live SM application can park itself
    /// before we yank its firmware.
    fn warn_before_program(&mut self);

    /// One full programming attempt (bootloader entry, erase, stream,
    /// verify) of the SM record at `record_addr`.
    fn program(&mut self, record_addr: u32) -> bool;

    /// Timestamp from the SM's status message, for reset accounting.
    fn status_timestamp(&mut self) -> Option<u32>;
}

/// Programming with the standard retry: one more attempt on failure.
fn program_twice<M: SsmMaintenance>(ssm: &mut M, record_addr: u32) -> bool {
    ssm.program(record_addr) || ssm.program(record_addr)
}

pub fn run_startup<F, G, M>(
    registry: &mut RegistryStore<F>,
    flash: &mut G,
    staging: &[u8],
    handoff: Result<BootState, HandoffLoadError>,
    running_version: ImageVersion,
    ssm: &mut M,
) -> StartupOutcome
where
    F: NandFlash,
    G: NandFlash,
    M: SsmMaintenance,
{
    match startup_inner(registry, flash, staging, handoff, running_version, ssm)
    {
        Ok(outcome) => outcome,
        Err(e) => {
            // A registry we cannot read or write leaves no safe move.
            ringbuf_entry!(Trace::RegistryTrouble(e));
            StartupOutcome::SafeIdle
        }
    }
}

fn startup_inner<F, G, M>(
    registry: &mut RegistryStore<F>,
    flash: &mut G,
    staging: &[u8],
    handoff: Result<BootState, HandoffLoadError>,
    running_version: ImageVersion,
    ssm: &mut M,
) -> Result<StartupOutcome, RegistryError>
where
    F: NandFlash,
    G: NandFlash,
    M: SsmMaintenance,
{
    registry.load()?;

    // Every boot counts against the circuit breaker until standby clears
    // it, so a cold read here is always at least 1.
    let resets = registry.resets_since_lp_mode()?.saturating_add(1);
    registry.set_resets_since_lp_mode(resets)?;
    ringbuf_entry!(Trace::BootCounted(resets));

    let reason = match handoff {
        Ok(state) => state.reason_last_loaded,
        Err(_) => BootReason::Unknown,
    };

    if resets > MAX_RESETS_SINCE_LP_MODE {
        // We keep booting without ever reaching standby. The cheapest
        // plausible fix is a fresh SM image; do that before anything else.
        ringbuf_entry!(Trace::CircuitBreakerTripped);
        return breaker_reflash(registry, ssm);
    }

    match reason {
        BootReason::Fallback => return consume_fallback(registry, ssm),
        BootReason::Manufacturing => {
            return provision_from_staging(registry, flash, staging, ssm)
        }
        _ => {}
    }

    // Identify which slot we are, and record it before anything else
    // trusts `loaded`.
    let Some(current) = registry.slot_with_version(running_version)? else {
        // Running an image the registry has no record of; nothing below
        // can be decided safely, so just run.
        ringbuf_entry!(Trace::UnknownRunningVersion);
        return Ok(StartupOutcome::Continue);
    };
    if registry.loaded()? != Some(current) {
        registry.set_loaded(current)?;
    }

    if registry.primary()? == current
        && registry.op_state(current)? == ImageOpState::Unknown
    {
        // First boot of freshly written bytes.
        registry.set_op_state(current, ImageOpState::Partial)?;
        ringbuf_entry!(Trace::UpgradeMarkedPartial(current));
        if reason == BootReason::Upgrade {
            // The SM was already re-flashed before the post-OTA reset;
            // nothing else to do awake. Cloud confirmation happens on the
            // next nominal wake.
            return Ok(StartupOutcome::EnterStandby);
        }
    }

    // Make sure the SM application is actually running before the event
    // core starts leaning on it.
    if ssm.comm_check() {
        ringbuf_entry!(Trace::SsmAlive);
    } else {
        ssm.hardware_reset();
        if !ssm.comm_check() {
            ringbuf_entry!(Trace::SsmDeadAfterReset);
            return breaker_reflash(registry, ssm);
        }
    }

    // More than one boot since standby means at least one of them was
    // unplanned.
    if resets > 1 {
        ringbuf_entry!(Trace::UnexpectedReset);
        let ts = ssm.status_timestamp().unwrap_or(0);
        registry.incr_unexpected_reset(ts)?;
    }

    Ok(StartupOutcome::Continue)
}

/// The SM recovery ladder: re-flash from the primary slot; if that fails,
/// fail the primary over to the alternate and re-flash from there; if that
/// also fails, give up.
fn breaker_reflash<F: NandFlash, M: SsmMaintenance>(
    registry: &mut RegistryStore<F>,
    ssm: &mut M,
) -> Result<StartupOutcome, RegistryError> {
    let primary = registry.primary()?;
    ringbuf_entry!(Trace::FallbackReflash(primary));
    ssm.warn_before_program();
    if program_twice(ssm, layout::ssm_record_start(primary)) {
        // Recovered in place; the counter clears when we reach standby.
        return Ok(StartupOutcome::Continue);
    }

    let alt = primary.alternate();
    let alt_state = registry.op_state(alt)?;
    if !matches!(alt_state, ImageOpState::Partial | ImageOpState::Full) {
        // No proven image to roll back to.
        return Ok(StartupOutcome::SafeIdle);
    }

    ringbuf_entry!(Trace::RollbackTo(alt));
    registry.set_primary(alt)?;
    registry.set_op_state(primary, ImageOpState::Failed)?;
    if program_twice(ssm, layout::ssm_record_start(alt)) {
        // The bootloader must now hand control to the alternate image.
        Ok(StartupOutcome::SystemReset)
    } else {
        Ok(StartupOutcome::SafeIdle)
    }
}

/// Boot reason `Fallback`: the bootloader switched slots on us (or wants
/// the recovery ladder after a bootloop).
fn consume_fallback<F: NandFlash, M: SsmMaintenance>(
    registry: &mut RegistryStore<F>,
    ssm: &mut M,
) -> Result<StartupOutcome, RegistryError> {
    let Some(loaded) = registry.loaded()? else {
        return breaker_reflash(registry, ssm);
    };
    if registry.primary()? == loaded {
        // No slot switch happened; this is bootloop recovery.
        return breaker_reflash(registry, ssm);
    }

    // The bootloader abandoned the old primary. Make the switch stick:
    // the slot that failed to boot must never be picked again, and the SM
    // must be put back in step with the image that *is* running.
    let abandoned = loaded.alternate();
    registry.set_primary(loaded)?;
    registry.set_op_state(abandoned, ImageOpState::Failed)?;

    ringbuf_entry!(Trace::FallbackReflash(loaded));
    ssm.warn_before_program();
    if program_twice(ssm, layout::ssm_record_start(loaded)) {
        Ok(StartupOutcome::Continue)
    } else {
        Ok(StartupOutcome::SafeIdle)
    }
}

/// Boot reason `Manufacturing`: move the staged package from internal
/// flash into slot A, mark it `Partial`, and give the SM its first
/// firmware. We stay awake afterwards; the line worker is waiting.
fn provision_from_staging<F, G, M>(
    registry: &mut RegistryStore<F>,
    flash: &mut G,
    staging: &[u8],
    ssm: &mut M,
) -> Result<StartupOutcome, RegistryError>
where
    F: NandFlash,
    G: NandFlash,
    M: SsmMaintenance,
{
    let Ok(info) = validate_package(staging) else {
        // The bootloader validated this before choosing Manufacturing; a
        // mismatch here means the staging area changed under us.
        return Ok(StartupOutcome::SafeIdle);
    };

    // Record bodies land exactly as an OTA would land them.
    let ap_body =
        &staging[RECORD_HEADER_LEN..RECORD_HEADER_LEN + info.ap_len as usize];
    let ssm_off = RECORD_HEADER_LEN + info.ap_len as usize;
    let ssm_body = &staging[ssm_off + RECORD_HEADER_LEN
        ..ssm_off + RECORD_HEADER_LEN + info.ssm_len as usize];

    let ap_start = layout::ap_image_start(SlotId::A);
    flash.erase_range(ap_start, info.ap_len).map_err(RegistryError::Flash)?;
    flash.write(ap_start, ap_body).map_err(RegistryError::Flash)?;

    let ssm_start = layout::ssm_record_start(SlotId::A);
    flash
        .erase_range(ssm_start, info.ssm_len)
        .map_err(RegistryError::Flash)?;
    flash.write(ssm_start, ssm_body).map_err(RegistryError::Flash)?;

    registry.record_ota_write(SlotId::A, info.version)?;
    registry.set_op_state(SlotId::A, ImageOpState::Partial)?;
    registry.set_primary(SlotId::A)?;
    registry.set_loaded(SlotId::A)?;

    ringbuf_entry!(Trace::ManufacturingProvisioned);

    // First firmware for a blank SM.
    if !program_twice(ssm, ssm_start) {
        return Ok(StartupOutcome::SafeIdle);
    }
    Ok(StartupOutcome::Continue)
}
