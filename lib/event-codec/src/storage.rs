// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Encoding events into event storage, with rollback and drop accounting.

use event_store::EventSink;
use wirecbor::{Encoder, NotEnoughSpace};

/// Counters for events dropped because storage was full.
///
/// One instance is shared across all serializers so the drop telemetry (for
/// example a heartbeat metric) reflects every event type. Drops are counted
/// from the last successful store; `read_drop_count` drains the running sum.
#[derive(Default)]
pub struct DropStats {
    /// Events dropped since the last successful store.
    since_last_success: u32,
    /// Drops accumulated since `read_drop_count` was last called.
    unread: u32,
}

impl DropStats {
    /// Returns drops accumulated since the last call, and resets.
    pub fn read_drop_count(&mut self) -> u32 {
        let count = self.unread + self.since_last_success;
        self.unread = 0;
        self.since_last_success = 0;
        count
    }

    fn record_drop(&mut self) {
        if self.since_last_success == 0 {
            log::error!("event storage full");
        }
        self.since_last_success += 1;
    }

    fn record_success(&mut self) {
        if self.since_last_success != 0 {
            log::info!(
                "event saved successfully after {} drops",
                self.since_last_success
            );
            self.unread += self.since_last_success;
            self.since_last_success = 0;
        }
    }
}

/// Runs `encode` against a reservation in `sink`, committing on success and
/// rolling back (and counting a drop) on failure.
///
/// The encoder is capped at the space the sink reports available, so a
/// too-large event fails cleanly inside `encode` rather than overflowing
/// the ring.
pub fn encode_to_storage(
    sink: &mut dyn EventSink,
    stats: &mut DropStats,
    mut encode: impl FnMut(&mut Encoder<'_>) -> Result<(), NotEnoughSpace>,
) -> bool {
    let space = sink.begin_write();

    let mut append_failed = false;
    let encoded_ok = {
        let mut write = |_offset: usize, data: &[u8]| {
            append_failed |= sink.append(data).is_err();
        };
        let mut e = Encoder::new(space, &mut write);
        encode(&mut e).is_ok()
    };
    let success = encoded_ok && !append_failed;
    sink.finish_write(!success);

    if success {
        stats.record_success();
    } else {
        stats.record_drop();
    }
    success
}

/// Warns when `sink` cannot hold even one worst-case `label` event.
///
/// Purely advisory, so integration mistakes surface at boot rather than as
/// silent drops in the field.
pub fn check_storage_size(
    sink: &dyn EventSink,
    worst_case_size: usize,
    label: &str,
) -> bool {
    let storage_size = sink.storage_size();
    if worst_case_size > storage_size {
        log::warn!(
            "event storage ({}) smaller than largest {} event ({})",
            storage_size,
            label,
            worst_case_size
        );
        return false;
    }
    true
}
