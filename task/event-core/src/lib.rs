// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event core: one queue, one loop, every wake-cycle decision.
//!
//! The core pulls tagged events off a bounded queue fed by the SM
//! attention poll, MQTT, NTP, GPS, and timers, and drives the cellular
//! modem, the SM, and the registry in response. It is single-threaded and
//! cooperative; `service()` drains the queue and `tick()` advances time,
//! polls the wake line, and enforces the on-budget.
//!
//! The device lives on a power budget, not a schedule: from wake it has 11
//! minutes (15 once an OTA starts) to finish everything, plus a 500 ms
//! grace if MQTT is mid-operation at the deadline. Expiry forces standby,
//! which is also the only cancellation mechanism: power removal.
//!
//! Entering standby always clears `resets_since_lp_mode` first; that
//! counter reaching its limit is how the bootloader learns we keep dying
//! mid-cycle.

#![cfg_attr(not(test), no_std)]

use drv_image_api::{ImageOpState, ImageVersion, SlotId};
use drv_image_registry::{GpsFix, RegistryError, RegistryStore};
use drv_mt29f_nand::NandFlash;
use drv_ssm_api::{AttnSource, ConfigPayload, StatusPayload};
use ringlog::{ringbuf, ringbuf_entry};

/// Queue poll period when idle.
pub const POLL_PERIOD_MS: u64 = 100;

/// Nominal on-budget from wake to forced standby.
pub const TIME_ON_NOMINAL_MS: u64 = 11 * 60 * 1000;

/// Raised budget while an OTA download is in flight.
pub const TIME_ON_OTA_MS: u64 = 15 * 60 * 1000;

/// Grace beyond the budget when MQTT reports an operation in progress.
pub const BUDGET_TOLERANCE_MS: u64 = 500;

/// Event queue depth; posts beyond this are dropped (and traced).
pub const QUEUE_DEPTH: usize = 10;

pub const MAX_OTA_URL: usize = 160;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub wake_rate_days: u16,
    pub stroke_detection: bool,
    pub red_flag_on_threshold: u16,
    pub red_flag_off_threshold: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    ActivateFromSsm,
    ActivateFromCloud,
    Deactivate,
    CheckInActivated,
    CheckInDeactivated,
    InitiateNtpTimeSync,
    NtpTimeSyncSuccess { timestamp: u32 },
    NtpTimeSyncFailure,
    MqttReady,
    MqttNwError,
    NoNewJobs,
    CloudConnectFailure,
    NewConfigs(ConfigUpdate),
    HwResetCmd { deactivate_first: bool },
    ResetAlarmsCmd,
    OtaStart { url: heapless::String<MAX_OTA_URL> },
    FwDownloadComplete { target: SlotId, version: ImageVersion },
    FwDownloadFail,
    SensorDataMsgReceived,
    SensorDataReady,
    SensorDataPublishSuccess,
    SsmUnresponsive,
    SsmNackedRequest,
    GpsFixSuccess { fix: GpsFix },
    GpsFixTimeout,
    GpsFixRequested { new_measurement: bool },
    MfgCompleteTimerFired,
}

/// Everything the event core drives. One implementation wires the real
/// modem/MQTT/GPS/NTP tasks and the SM link plus programmer; tests use a
/// recording fake. This bundle stands where per-server client handles
/// would in a richer IPC system.
pub trait Platform {
    fn modem_on(&mut self);
    fn modem_off(&mut self);

    fn mqtt_connect(&mut self);
    fn mqtt_publish_status(&mut self, msg_number: u64) -> bool;
    fn mqtt_publish_gps(&mut self, fix: &GpsFix) -> bool;
    fn mqtt_publish_sensor_data(&mut self) -> bool;
    fn mqtt_job_succeeded(&mut self);
    fn mqtt_job_failed(&mut self);
    fn mqtt_request_next_job(&mut self);
    fn mqtt_disconnect(&mut self);
    fn mqtt_operation_in_progress(&self) -> bool;

    fn gps_enable(&mut self);
    fn gps_disable(&mut self);
    fn gps_enabled(&self) -> bool;

    fn ntp_start_sync(&mut self);

    fn enter_standby(&mut self);
    fn system_reset(&mut self);
    fn halt_safe_idle(&mut self);

    fn ota_start(&mut self, url: &str);

    fn ssm_wake_pending(&self) -> bool;
    /// Fetch-and-ack of the attention mask; `None` on link failure.
    fn ssm_drain_attention(&mut self) -> Option<AttnSource>;
    fn ssm_activate(&mut self) -> bool;
    fn ssm_deactivate(&mut self) -> bool;
    fn ssm_request_status(&mut self) -> Option<StatusPayload>;
    fn ssm_set_rtc(&mut self, timestamp: u32) -> bool;
    fn ssm_send_configs(&mut self, config: &ConfigPayload) -> bool;
    fn ssm_hw_reset(&mut self) -> bool;
    fn ssm_reset_alarms(&mut self) -> bool;
    /// Drains the SM's daily records into local flash, staging a cloud
    /// payload. Returns entries drained, or `None` on failure.
    fn ssm_drain_sensor_data(&mut self) -> Option<u16>;
    /// Raises the heads-up line before the SM loses its firmware.
    fn ssm_warn(&mut self);
    /// One full SM programming attempt from `slot`'s SM record.
    fn ssm_program_slot(&mut self, slot: SlotId) -> bool;
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Posted,
    QueueFull,
    AttnBits(u8),
    BudgetExpired,
    Standby,
    PromotedToFull(SlotId),
    OtaApplied(SlotId),
    OtaSsmRollback(SlotId),
    SafeIdle,
    SsmUnresponsive,
    SsmNacked,
    RegistryTrouble(RegistryError),
}

ringbuf!(Trace, 32, Trace::None);

pub struct EventCore<P, F> {
    platform: P,
    registry: RegistryStore<F>,
    queue: heapless::Deque<Event, QUEUE_DEPTH>,

    time_on_ms: u64,
    allowed_on_ms: u64,
    waiting_on_cell: bool,
    aws_connected: bool,
    test_mode: bool,
    sensor_data_staged: bool,
    mfg_status_pending: bool,
    mfg_timer_ms: Option<u64>,
    halted: bool,
}

impl<P: Platform, F: NandFlash> EventCore<P, F> {
    pub fn new(platform: P, registry: RegistryStore<F>) -> Self {
        Self {
            platform,
            registry,
            queue: heapless::Deque::new(),
            time_on_ms: 0,
            allowed_on_ms: TIME_ON_NOMINAL_MS,
            waiting_on_cell: false,
            aws_connected: false,
            test_mode: false,
            sensor_data_staged: false,
            mfg_status_pending: false,
            mfg_timer_ms: None,
            halted: false,
        }
    }

    /// Diagnostic escape hatch: in test mode the budget never forces
    /// standby and standby requests are ignored.
    pub fn set_test_mode(&mut self, on: bool) {
        self.test_mode = on;
    }

    /// Arms the manufacturing-complete timer; when it fires we report in
    /// to the cloud once.
    pub fn start_mfg_timer(&mut self, seconds: u32) {
        self.mfg_timer_ms = Some(u64::from(seconds) * 1000);
    }

    pub fn post(&mut self, event: Event) {
        if self.queue.push_back(event).is_err() {
            ringbuf_entry!(Trace::QueueFull);
        } else {
            ringbuf_entry!(Trace::Posted);
        }
    }

    pub fn registry(&self) -> &RegistryStore<F> {
        &self.registry
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Handles one queued event; false when the queue is empty.
    pub fn step(&mut self) -> bool {
        if self.halted {
            return false;
        }
        let Some(event) = self.queue.pop_front() else {
            return false;
        };
        self.handle(event);
        true
    }

    /// Drains the queue.
    pub fn service(&mut self) {
        while self.step() {}
    }

    /// One poll period: advance timers, poll the SM wake line, enforce
    /// the on-budget.
    pub fn tick(&mut self, elapsed_ms: u64) {
        if self.halted {
            return;
        }
        self.time_on_ms += elapsed_ms;

        if let Some(left) = self.mfg_timer_ms {
            if left <= elapsed_ms {
                self.mfg_timer_ms = None;
                self.post(Event::MfgCompleteTimerFired);
            } else {
                self.mfg_timer_ms = Some(left - elapsed_ms);
            }
        }

        if self.platform.ssm_wake_pending() {
            self.poll_attention();
        }

        if self.time_on_ms >= self.allowed_on_ms && !self.test_mode {
            let grace = self.platform.mqtt_operation_in_progress()
                && self.time_on_ms
                    < self.allowed_on_ms + BUDGET_TOLERANCE_MS;
            if !grace {
                ringbuf_entry!(Trace::BudgetExpired);
                self.power_down();
            }
        }
    }

    /// Fetches the attention mask and turns each bit into its event, in
    /// bit order. The ack happens inside the platform's drain; bits
    /// raised after the fetch stay set in the SM for the next poll.
    fn poll_attention(&mut self) {
        let Some(mask) = self.platform.ssm_drain_attention() else {
            return;
        };
        ringbuf_entry!(Trace::AttnBits(mask.bits()));
        for (bit, event) in [
            (AttnSource::ACTIVATE, Event::ActivateFromSsm),
            (AttnSource::TIME_REQUEST, Event::InitiateNtpTimeSync),
            (AttnSource::CHECK_IN_DEACTIVATED, Event::CheckInDeactivated),
            (AttnSource::CHECK_IN_ACTIVATED, Event::CheckInActivated),
        ] {
            if mask.contains(bit) {
                self.post(event);
            }
        }
    }

    fn note(&self, r: Result<(), RegistryError>) {
        if let Err(e) = r {
            ringbuf_entry!(Trace::RegistryTrouble(e));
        }
    }

    /// Modem off, counter cleared, lights out. The registry write comes
    /// first: a standby we never wake from must still read as "reached
    /// standby" on the next boot.
    fn power_down(&mut self) {
        self.platform.modem_off();
        self.aws_connected = false;
        let r = self.registry.set_resets_since_lp_mode(0);
        self.note(r);
        if !self.test_mode {
            ringbuf_entry!(Trace::Standby);
            self.platform.enter_standby();
        }
    }

    fn bring_up_cell(&mut self) {
        self.platform.modem_on();
        self.platform.mqtt_connect();
        self.waiting_on_cell = true;
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::ActivateFromSsm | Event::ActivateFromCloud => {
                self.bring_up_cell();
                self.platform.ssm_activate();
                self.platform.ssm_request_status();
                if !self.test_mode {
                    self.platform.gps_enable();
                }
            }
            Event::Deactivate => {
                self.platform.ssm_deactivate();
                self.platform.gps_disable();
            }
            Event::CheckInActivated => {
                self.bring_up_cell();
                match self.platform.ssm_drain_sensor_data() {
                    Some(n) if n > 0 => {
                        self.sensor_data_staged = true;
                        self.post(Event::SensorDataReady);
                    }
                    _ => {}
                }
            }
            Event::CheckInDeactivated => {
                self.bring_up_cell();
            }
            Event::InitiateNtpTimeSync => {
                self.platform.ntp_start_sync();
            }
            Event::NtpTimeSyncSuccess { timestamp } => {
                self.platform.ssm_set_rtc(timestamp);
            }
            Event::NtpTimeSyncFailure => {
                // Zero tells the SM to raise TIME_REQUEST again later.
                self.platform.ssm_set_rtc(0);
            }
            Event::MqttReady => self.handle_mqtt_ready(),
            Event::MqttNwError => {}
            Event::NoNewJobs => {
                self.waiting_on_cell = false;
                // Let a running GPS fix finish on the modem's power.
                if !self.platform.gps_enabled() {
                    self.power_down();
                }
            }
            Event::CloudConnectFailure => {
                if !self.platform.gps_enabled() {
                    self.power_down();
                }
            }
            Event::NewConfigs(update) => self.handle_new_configs(update),
            Event::HwResetCmd { deactivate_first } => {
                if deactivate_first {
                    self.platform.ssm_deactivate();
                }
                self.platform.ssm_hw_reset();
                self.platform.mqtt_job_succeeded();
                self.platform.system_reset();
            }
            Event::ResetAlarmsCmd => {
                if self.platform.ssm_reset_alarms() {
                    self.platform.mqtt_job_succeeded();
                } else {
                    self.platform.mqtt_job_failed();
                }
                self.platform.mqtt_request_next_job();
            }
            Event::OtaStart { url } => {
                // Downloads get the long budget.
                self.allowed_on_ms = TIME_ON_OTA_MS;
                self.platform.ota_start(&url);
            }
            Event::FwDownloadComplete { target, version } => {
                self.handle_fw_download_complete(target, version);
            }
            Event::FwDownloadFail => {
                self.platform.mqtt_job_failed();
                self.platform.mqtt_request_next_job();
            }
            Event::SensorDataMsgReceived => {
                self.sensor_data_staged = true;
            }
            Event::SensorDataReady => {
                if self.aws_connected && self.sensor_data_staged {
                    self.publish_sensor_data();
                }
            }
            Event::SensorDataPublishSuccess => {
                self.sensor_data_staged = false;
                self.platform.mqtt_request_next_job();
            }
            Event::SsmUnresponsive => {
                // Recovery happens at next boot via the reset counter.
                ringbuf_entry!(Trace::SsmUnresponsive);
            }
            Event::SsmNackedRequest => {
                ringbuf_entry!(Trace::SsmNacked);
            }
            Event::GpsFixSuccess { fix } => {
                self.platform.gps_disable();
                let r = self.registry.set_gps_fix(Some(fix), false);
                self.note(r);
                if self.aws_connected {
                    self.platform.mqtt_publish_gps(&fix);
                    let r = self.registry.set_gps_sent(true);
                    self.note(r);
                    self.platform.mqtt_request_next_job();
                }
            }
            Event::GpsFixTimeout => {
                self.platform.gps_disable();
                let retries = self
                    .registry
                    .registry()
                    .map(|r| r.gps_retries)
                    .unwrap_or(0);
                let r = self
                    .registry
                    .set_gps_retries(retries.saturating_add(1));
                self.note(r);
                if !self.waiting_on_cell {
                    self.power_down();
                }
            }
            Event::GpsFixRequested { new_measurement } => {
                self.handle_gps_job(new_measurement);
            }
            Event::MfgCompleteTimerFired => {
                let r = self.registry.set_mfg_complete(true);
                self.note(r);
                if self.aws_connected {
                    self.publish_status();
                } else {
                    self.mfg_status_pending = true;
                    self.bring_up_cell();
                }
            }
        }
    }

    fn publish_status(&mut self) {
        let msg_number = self.registry.advance_msg_number().unwrap_or(0);
        self.platform.mqtt_publish_status(msg_number);
    }

    fn publish_sensor_data(&mut self) {
        if self.platform.mqtt_publish_sensor_data() {
            self.post(Event::SensorDataPublishSuccess);
        }
    }

    /// The cloud link is up. Priority order: a GPS fix we owe the cloud,
    /// then staged sensor data, then plain status plus a job request.
    fn handle_mqtt_ready(&mut self) {
        self.aws_connected = true;

        // First cloud contact proves the running image end to end.
        let promote = self.registry.registry().ok().and_then(|r| {
            r.loaded
                .filter(|&s| r.op_state(s) == ImageOpState::Partial)
        });
        if let Some(slot) = promote {
            let r = self.registry.set_op_state(slot, ImageOpState::Full);
            self.note(r);
            ringbuf_entry!(Trace::PromotedToFull(slot));
        }

        if self.mfg_status_pending {
            self.mfg_status_pending = false;
            self.publish_status();
            self.platform.mqtt_request_next_job();
            return;
        }

        let unsent_fix = self
            .registry
            .registry()
            .ok()
            .and_then(|r| if r.gps_sent { None } else { r.gps_fix });
        if let Some(fix) = unsent_fix {
            self.platform.mqtt_publish_gps(&fix);
            let r = self.registry.set_gps_sent(true);
            self.note(r);
            self.platform.mqtt_request_next_job();
        } else if self.sensor_data_staged {
            self.publish_sensor_data();
        } else {
            self.publish_status();
            self.platform.mqtt_request_next_job();
        }
    }

    fn handle_new_configs(&mut self, update: ConfigUpdate) {
        let r = self.registry.set_wake_rate_days(update.wake_rate_days);
        self.note(r);
        let r = self
            .registry
            .set_stroke_detection(update.stroke_detection);
        self.note(r);
        let r = self.registry.set_red_flag_thresholds(
            update.red_flag_on_threshold,
            update.red_flag_off_threshold,
        );
        self.note(r);

        let payload = ConfigPayload {
            wake_interval_days: update.wake_rate_days.into(),
            stroke_alg_on: update.stroke_detection as u8,
            red_flag_on_threshold: update.red_flag_on_threshold.into(),
            red_flag_off_threshold: update.red_flag_off_threshold.into(),
            reserved_4: 0.into(),
            reserved_5: 0.into(),
        };
        if self.platform.ssm_send_configs(&payload) {
            self.platform.mqtt_job_succeeded();
        } else {
            self.platform.mqtt_job_failed();
        }
        self.platform.mqtt_request_next_job();
    }

    fn handle_gps_job(&mut self, new_measurement: bool) {
        if new_measurement {
            self.platform.mqtt_job_succeeded();
            self.platform.gps_enable();
            self.platform.mqtt_request_next_job();
            return;
        }
        let stored = self
            .registry
            .registry()
            .ok()
            .and_then(|r| r.gps_fix);
        match stored {
            Some(fix) => {
                self.platform.mqtt_publish_gps(&fix);
                let r = self.registry.set_gps_sent(true);
                self.note(r);
                self.platform.mqtt_job_succeeded();
            }
            None => self.platform.mqtt_job_failed(),
        }
        self.platform.mqtt_request_next_job();
    }

    /// Both images are on the NAND and verified. Hand the new slot to the
    /// registry, cut the cloud loose, give the SM its matching firmware,
    /// and reset into the bootloader so it picks up the new primary.
    fn handle_fw_download_complete(
        &mut self,
        target: SlotId,
        version: ImageVersion,
    ) {
        // The SM gets a heads-up before its world changes.
        self.platform.ssm_warn();
        self.platform.mqtt_job_succeeded();
        self.platform.mqtt_disconnect();
        self.platform.modem_off();
        self.aws_connected = false;

        let r = self.registry.record_ota_write(target, version);
        self.note(r);
        let r = self.registry.set_primary(target);
        self.note(r);
        ringbuf_entry!(Trace::OtaApplied(target));

        if self.platform.ssm_program_slot(target)
            || self.platform.ssm_program_slot(target)
        {
            let r = self.registry.set_resets_since_lp_mode(0);
            self.note(r);
            self.platform.system_reset();
            return;
        }

        // The new slot's SM record won't take. Undo the switch and put the
        // SM back in step with the image we are actually running.
        let previous = target.alternate();
        ringbuf_entry!(Trace::OtaSsmRollback(previous));
        let r = self.registry.set_op_state(target, ImageOpState::Failed);
        self.note(r);
        let r = self.registry.set_primary(previous);
        self.note(r);

        if self.platform.ssm_program_slot(previous)
            || self.platform.ssm_program_slot(previous)
        {
            self.power_down();
        } else {
            // No slot has an SM image the SM will accept.
            ringbuf_entry!(Trace::SafeIdle);
            self.halted = true;
            self.platform.halt_safe_idle();
        }
    }
}
