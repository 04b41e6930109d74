// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Converts the tracked reboot record into a trace event for upload.
//!
//! Called once per boot, after event storage is up: reads the latched reset
//! info, serializes it, and -- only once the event is safely stored --
//! unlatches the record so the next reset can capture a fresh first cause.

use event_store::EventSink;
use reboot_tracking::RebootTracker;
use telemetry_api::DevicePlatform;
use wirecbor::{compute_size, Encoder, NotEnoughSpace};

use crate::envelope::{encode_u32_kv, SerializerOptions};
use crate::keys;
use crate::storage::{check_storage_size, encode_to_storage, DropStats};
use crate::trace::{encode_trace_fields, TraceEventFields};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollectError {
    /// Event storage could not hold the serialized reset event.
    StorageTooSmall,
}

fn encode_reset_info(
    e: &mut Encoder<'_>,
    platform: &dyn DevicePlatform,
    opts: SerializerOptions,
    info: &reboot_tracking::ResetInfo,
) -> Result<(), NotEnoughSpace> {
    let extra_pairs = 1 // coredump_saved
        + usize::from(info.reset_reason_reg0 != 0);

    let fields = TraceEventFields {
        reason_key: keys::trace_info::REASON,
        reason_value: info.reason as u32,
        pc: info.pc,
        lr: info.lr,
        extra_pairs,
    };
    encode_trace_fields(e, platform, opts, &fields)?;

    if info.reset_reason_reg0 != 0 {
        encode_u32_kv(
            e,
            keys::trace_info::MCU_REASON_REGISTER,
            info.reset_reason_reg0,
        )?;
    }
    encode_u32_kv(
        e,
        keys::trace_info::COREDUMP_SAVED,
        u32::from(info.coredump_saved),
    )
}

/// Worst-case serialized size of a reset event, for sizing storage.
pub fn worst_case_size(
    platform: &dyn DevicePlatform,
    opts: SerializerOptions,
) -> usize {
    let info = reboot_tracking::ResetInfo {
        reason: reboot_tracking::RebootReason::HardFault,
        pc: u32::MAX,
        lr: u32::MAX,
        reset_reason_reg0: u32::MAX,
        coredump_saved: true,
    };
    compute_size(|e| encode_reset_info(e, platform, opts, &info))
}

/// Pushes the latched reset info (if any) into event storage and clears it.
///
/// Returns `Ok(false)` when there was nothing to collect -- either no reset
/// info was captured, or the tracker has not seen a reset since the record
/// was last cleared.
pub fn collect_reset_info(
    tracker: &mut RebootTracker<'_>,
    sink: &mut dyn EventSink,
    stats: &mut DropStats,
    platform: &dyn DevicePlatform,
    opts: SerializerOptions,
) -> Result<bool, CollectError> {
    // Advisory only; we fall through and try to encode anyway so the user
    // sees a sizing warning rather than a silent drop.
    check_storage_size(sink, worst_case_size(platform, opts), "reboot");

    let Some(info) = tracker.read_reset_info() else {
        log::warn!("no reset info collected");
        return Ok(false);
    };

    if !encode_to_storage(sink, stats, |e| {
        encode_reset_info(e, platform, opts, &info)
    }) {
        return Err(CollectError::StorageTooSmall);
    }

    tracker.clear_reset_info();
    Ok(true)
}
