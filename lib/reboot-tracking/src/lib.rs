// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracking of reboot reasons across system resets.
//!
//! A crash on an embedded device usually ends in a reset, and the only
//! storage guaranteed to survive a warm reset is RAM that no startup code
//! initializes. This crate manages a 64-byte record in such a region: the
//! embedder places a `[u8; REGION_SIZE]` in a NOINIT linker section and hands
//! it to [`RebootTracker::boot`] once, early in startup, every boot. Using
//! normally-initialized memory for the region is a configuration error -- the
//! record would be wiped before it could be read.
//!
//! The record is validated by magic/version stamp rather than relying on any
//! initialization, so a corrupt or first-boot region simply starts fresh.
//!
//! Two policies live here:
//!
//! - **First-cause latching.** The first reason recorded after the record was
//!   last cleared is the one that sticks. When a device enters a crash loop,
//!   later iterations may reboot for secondary reasons (watchdog, assert);
//!   reporting the reason that *started* the loop is what makes the report
//!   actionable.
//! - **Crash counting.** Each boot classified as unexpected increments a
//!   saturating counter, cleared only by [`RebootTracker::reset_crash_count`]
//!   -- typically once the stored crash data has been drained to the cloud.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of the RAM region the embedder must reserve, in bytes.
pub const REGION_SIZE: usize = 64;

const MAGIC: u32 = 0x2154_4252;
const VERSION: u8 = 2;

/// Sentinel stored in `last_reboot_reason` when no reason is latched.
const REASON_NOT_SET: u32 = 0xffff_ffff;

/// Reboot reasons, reported with reset events and coredumps.
///
/// Values below [`RebootReason::UnknownError`] describe expected resets;
/// `Unknown` and everything from `UnknownError` up classify the boot as
/// unexpected and count toward the crash counter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum RebootReason {
    Unknown = 0x0000,

    //
    // Expected resets
    //
    UserShutdown = 0x0001,
    UserReset = 0x0002,
    FirmwareUpdate = 0x0003,
    LowPower = 0x0004,
    DebuggerHalted = 0x0005,
    ButtonReset = 0x0006,
    PowerOnReset = 0x0007,
    SoftwareReset = 0x0008,
    DeepSleep = 0x0009,
    PinReset = 0x000A,

    //
    // Error resets
    //
    UnknownError = 0x8000,
    Assert = 0x8001,
    BrownOutReset = 0x8003,
    Nmi = 0x8004,
    HardwareWatchdog = 0x8005,
    SoftwareWatchdog = 0x8006,
    ClockFailure = 0x8007,
    KernelPanic = 0x8008,
    FirmwareUpdateError = 0x8009,
    BusFault = 0x9100,
    MemFault = 0x9200,
    UsageFault = 0x9300,
    HardFault = 0x9400,
    Lockup = 0x9401,
}

impl RebootReason {
    /// True for reasons that classify a boot as unexpected.
    pub fn is_error(self) -> bool {
        self == RebootReason::Unknown
            || self as u32 >= RebootReason::UnknownError as u32
    }
}

/// The persistent record. Fields are little-endian and packed; the layout is
/// shared with whatever firmware images touch the region (bootloader and
/// application must agree).
///
/// New fields must be appended by carving bytes off `rsvd2` and bumping the
/// version, so older images keep recognizing the prefix.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RebootInfoRecord {
    /// A cheap way to check whether the data in the region is valid.
    magic: U32,
    version: u8,
    /// Number of resets classified as unexpected since the counter was last
    /// cleared. Saturates at 255.
    crash_count: u8,
    rsvd1: u8,
    coredump_saved: u8,
    /// Latched first-cause reason, or [`REASON_NOT_SET`].
    last_reboot_reason: U32,
    pc: U32,
    lr: U32,
    /// Raw value of the MCU's reset-reason register, captured at boot. Useful
    /// for resets that run no code beforehand (brown-out, hardware watchdog).
    reset_reason_reg0: U32,
    rsvd2: [u8; 40],
}

const_assert_eq!(core::mem::size_of::<RebootInfoRecord>(), REGION_SIZE);

/// Reset-reason register value plus any decoded reason the platform can
/// offer at boot time.
#[derive(Copy, Clone, Debug)]
pub struct BootupInfo {
    /// Raw reset-reason register contents, or 0 if unavailable.
    pub reset_reason_reg: u32,
    /// Reason decoded from the register, or `Unknown`.
    pub reset_reason: RebootReason,
}

/// Register state captured when a reset is about to be requested.
#[derive(Copy, Clone, Debug, Default)]
pub struct RegInfo {
    pub pc: u32,
    pub lr: u32,
}

/// The latched crash record, as read back for serialization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResetInfo {
    pub reason: RebootReason,
    pub pc: u32,
    pub lr: u32,
    pub reset_reason_reg0: u32,
    pub coredump_saved: bool,
}

/// The reboot-reason pair for the current boot cycle. Lives in ordinary RAM
/// and is rebuilt by every [`RebootTracker::boot`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RebootReasonPair {
    /// Reason decoded from hardware during this boot.
    pub reboot_reg_reason: RebootReason,
    /// Reason recorded before the reset: the latched reason if one was set,
    /// otherwise the hardware reason.
    pub prior_stored_reason: RebootReason,
}

pub struct RebootTracker<'a> {
    record: &'a mut RebootInfoRecord,
    current_boot: RebootReasonPair,
}

impl<'a> RebootTracker<'a> {
    /// Validates (stamping if necessary) the persistent region and records
    /// this boot's reason.
    ///
    /// Must be called once, before any other reboot-tracking use, on every
    /// boot. Callers must ensure single-threaded access; the record is
    /// conceptually initialized once on cold boot.
    pub fn boot(
        region: &'a mut [u8; REGION_SIZE],
        bootup_info: Option<BootupInfo>,
    ) -> Self {
        let record = check_or_init_record(region);

        let mut reset_reason = RebootReason::Unknown;
        if let Some(info) = bootup_info {
            record.reset_reason_reg0 = U32::new(info.reset_reason_reg);
            reset_reason = info.reset_reason;
        }

        let prior_raw = record.last_reboot_reason.get();
        let current_boot = RebootReasonPair {
            reboot_reg_reason: reset_reason,
            prior_stored_reason: if prior_raw != REASON_NOT_SET {
                decode_reason(prior_raw)
            } else {
                reset_reason
            },
        };

        let mut tracker = Self {
            record,
            current_boot,
        };
        tracker.record_reboot_event(reset_reason, None);

        if tracker.unexpected_reboot_occurred() {
            tracker.record.crash_count =
                tracker.record.crash_count.saturating_add(1);
        }

        tracker
    }

    /// Latches `reason` (and pc/lr) unless a reason is already latched.
    ///
    /// This is the one user-visible way to record an *expected* reason -- a
    /// firmware update, a user-requested reboot -- before requesting a
    /// software reset. An already-latched reason is never overwritten:
    /// generally the first reboot in a loop reveals what started it.
    pub fn mark_reset_imminent(
        &mut self,
        reason: RebootReason,
        reg: Option<RegInfo>,
    ) {
        self.record_reboot_event(reason, reg);
    }

    fn record_reboot_event(
        &mut self,
        reason: RebootReason,
        reg: Option<RegInfo>,
    ) {
        if self.record.last_reboot_reason.get() != REASON_NOT_SET {
            return;
        }
        self.record.last_reboot_reason = U32::new(reason as u32);
        if let Some(reg) = reg {
            self.record.pc = U32::new(reg.pc);
            self.record.lr = U32::new(reg.lr);
        }
    }

    /// Returns the latched crash record, if any reset info was captured.
    pub fn read_reset_info(&self) -> Option<ResetInfo> {
        if self.record.last_reboot_reason.get() == REASON_NOT_SET
            && self.record.reset_reason_reg0.get() == 0
        {
            return None; // no reset crashes!
        }

        Some(ResetInfo {
            reason: decode_reason(self.record.last_reboot_reason.get()),
            pc: self.record.pc.get(),
            lr: self.record.lr.get(),
            reset_reason_reg0: self.record.reset_reason_reg0.get(),
            coredump_saved: self.record.coredump_saved == 1,
        })
    }

    /// Unlatches the stored reason so the next reset can record a fresh
    /// first cause. Called after the reset info has been serialized out.
    pub fn clear_reset_info(&mut self) {
        self.record.last_reboot_reason = U32::new(REASON_NOT_SET);
        self.record.coredump_saved = 0;
        self.record.pc = U32::new(0);
        self.record.lr = U32::new(0);
        self.record.reset_reason_reg0 = U32::new(0);
    }

    pub fn crash_count(&self) -> u8 {
        self.record.crash_count
    }

    pub fn reset_crash_count(&mut self) {
        self.record.crash_count = 0;
    }

    /// Flags that a coredump was collected as part of the tracked reset.
    pub fn mark_coredump_saved(&mut self) {
        self.record.coredump_saved = 1;
    }

    /// The reboot-reason pair recorded for the current boot.
    pub fn reboot_reason(&self) -> RebootReasonPair {
        self.current_boot
    }

    /// Whether this boot followed an unexpected reboot: true iff either the
    /// prior stored reason or the hardware reason is unknown or in the error
    /// range.
    pub fn unexpected_reboot_occurred(&self) -> bool {
        self.current_boot.prior_stored_reason.is_error()
            || self.current_boot.reboot_reg_reason.is_error()
    }
}

fn decode_reason(raw: u32) -> RebootReason {
    RebootReason::from_u32(raw).unwrap_or(RebootReason::Unknown)
}

fn check_or_init_record(region: &mut [u8; REGION_SIZE]) -> &mut RebootInfoRecord {
    // The region is caller-provided bytes with no alignment or content
    // guarantees beyond its size; the record layout has no padding and
    // alignment 1 via the byteorder field types, so this cannot fail.
    let record = RebootInfoRecord::mut_from_bytes(region.as_mut_slice())
        .unwrap_or_else(|_| unreachable!());

    if record.magic.get() != MAGIC {
        // The region doesn't hold a record we recognize; reset it.
        *record = RebootInfoRecord {
            magic: U32::new(MAGIC),
            version: VERSION,
            crash_count: 0,
            rsvd1: 0,
            coredump_saved: 0,
            last_reboot_reason: U32::new(REASON_NOT_SET),
            pc: U32::new(0),
            lr: U32::new(0),
            reset_reason_reg0: U32::new(0),
            rsvd2: [0; 40],
        };
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_with(
        region: &mut [u8; REGION_SIZE],
        reg: u32,
        reason: RebootReason,
    ) -> RebootTracker<'_> {
        RebootTracker::boot(
            region,
            Some(BootupInfo {
                reset_reason_reg: reg,
                reset_reason: reason,
            }),
        )
    }

    #[test]
    fn first_boot_stamps_region() {
        let mut region = [0xa5u8; REGION_SIZE];
        let tracker = RebootTracker::boot(&mut region, None);
        // No bootup info: reason Unknown, which counts as unexpected.
        assert_eq!(tracker.crash_count(), 1);
        drop(tracker);
        assert_eq!(&region[0..4], &MAGIC.to_le_bytes());
        assert_eq!(region[4], VERSION);
    }

    #[test]
    fn crash_loop_keeps_first_cause() {
        let mut region = [0u8; REGION_SIZE];

        // Scenario from the wire-format contract: first boot with an
        // unknown hw reason latches Unknown and counts a crash.
        let mut tracker = boot_with(&mut region, 0x1, RebootReason::Unknown);
        assert_eq!(tracker.crash_count(), 1);
        let info = tracker.read_reset_info().unwrap();
        assert_eq!(info.reason, RebootReason::Unknown);

        // An expected reason marked later must not displace the latched one.
        tracker.mark_reset_imminent(
            RebootReason::FirmwareUpdate,
            Some(RegInfo { pc: 0, lr: 0 }),
        );
        assert_eq!(
            tracker.read_reset_info().unwrap().reason,
            RebootReason::Unknown
        );
        drop(tracker);

        // Second boot of the loop: crash count advances, reason stays, the
        // new register value is captured.
        let tracker = boot_with(&mut region, 0xdead, RebootReason::Assert);
        assert_eq!(tracker.crash_count(), 2);
        let info = tracker.read_reset_info().unwrap();
        assert_eq!(info.reason, RebootReason::Unknown);
        assert_eq!(info.reset_reason_reg0, 0xdead);
    }

    #[test]
    fn expected_reboot_does_not_count() {
        let mut region = [0u8; REGION_SIZE];
        {
            let mut tracker =
                boot_with(&mut region, 0x4, RebootReason::PowerOnReset);
            assert_eq!(tracker.crash_count(), 0);
            assert!(!tracker.unexpected_reboot_occurred());
            tracker.mark_reset_imminent(RebootReason::FirmwareUpdate, None);
        }

        // Next boot sees the prior FirmwareUpdate reason: still expected.
        let tracker = boot_with(&mut region, 0x4, RebootReason::SoftwareReset);
        assert_eq!(tracker.crash_count(), 0);
        assert!(!tracker.unexpected_reboot_occurred());
        assert_eq!(
            tracker.reboot_reason(),
            RebootReasonPair {
                reboot_reg_reason: RebootReason::SoftwareReset,
                prior_stored_reason: RebootReason::FirmwareUpdate,
            }
        );
    }

    #[test]
    fn error_hw_reason_counts_even_with_expected_prior() {
        let mut region = [0u8; REGION_SIZE];
        {
            let mut tracker =
                boot_with(&mut region, 0, RebootReason::PowerOnReset);
            tracker.mark_reset_imminent(RebootReason::UserReset, None);
        }
        let tracker =
            boot_with(&mut region, 0x8, RebootReason::HardwareWatchdog);
        assert!(tracker.unexpected_reboot_occurred());
        assert_eq!(tracker.crash_count(), 1);
    }

    #[test]
    fn clear_reset_info_unlatches() {
        let mut region = [0u8; REGION_SIZE];
        let mut tracker = boot_with(&mut region, 0x2, RebootReason::Assert);
        assert!(tracker.read_reset_info().is_some());

        tracker.clear_reset_info();
        assert!(tracker.read_reset_info().is_none());

        // A new reason can latch now.
        tracker.mark_reset_imminent(
            RebootReason::UserReset,
            Some(RegInfo {
                pc: 0x1000,
                lr: 0x2000,
            }),
        );
        let info = tracker.read_reset_info().unwrap();
        assert_eq!(info.reason, RebootReason::UserReset);
        assert_eq!(info.pc, 0x1000);
        assert_eq!(info.lr, 0x2000);
    }

    #[test]
    fn reset_info_reported_for_register_only() {
        let mut region = [0u8; REGION_SIZE];
        let mut tracker = boot_with(&mut region, 0x30, RebootReason::PinReset);
        // Latched reason present; clear it but keep a fresh register value.
        tracker.clear_reset_info();
        assert!(tracker.read_reset_info().is_none());
        drop(tracker);

        let tracker = boot_with(&mut region, 0x30, RebootReason::PinReset);
        let info = tracker.read_reset_info().unwrap();
        assert_eq!(info.reset_reason_reg0, 0x30);
        assert_eq!(info.reason, RebootReason::PinReset);
    }

    #[test]
    fn crash_count_saturates() {
        let mut region = [0u8; REGION_SIZE];
        for _ in 0..300 {
            let tracker = boot_with(&mut region, 0, RebootReason::Unknown);
            assert!(tracker.crash_count() >= 1);
        }
        let mut tracker = boot_with(&mut region, 0, RebootReason::Unknown);
        assert_eq!(tracker.crash_count(), 255);
        tracker.reset_crash_count();
        assert_eq!(tracker.crash_count(), 0);
    }

    #[test]
    fn coredump_saved_flag_roundtrips() {
        let mut region = [0u8; REGION_SIZE];
        {
            let mut tracker = boot_with(&mut region, 0, RebootReason::Assert);
            tracker.mark_coredump_saved();
        }
        let tracker = boot_with(&mut region, 0, RebootReason::Assert);
        assert!(tracker.read_reset_info().unwrap().coredump_saved);
    }
}
