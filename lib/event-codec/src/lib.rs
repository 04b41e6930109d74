// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialization of events into their on-wire CBOR envelope.
//!
//! Every event the device reports -- heartbeat, trace, reboot record, log
//! snapshot, custom data recording -- shares one outer shape: a CBOR map with
//! small integer keys carrying the event type, schema version, device
//! identity, and finally an `event_info` value whose shape is
//! per-event-type. This crate owns that envelope ([`envelope`]), the
//! store-with-rollback write path ([`storage`]), and the event types that
//! don't need a subsystem of their own: trace events ([`trace`]), the reboot
//! record collector ([`reboot`]), and custom data recordings ([`cdr`]).
//!
//! Integer keys keep the wire payload small; the decoder side knows the
//! schema. Key and type values are pinned in [`keys`] and must never be
//! renumbered.

#![cfg_attr(not(test), no_std)]

pub mod cdr;
pub mod envelope;
pub mod keys;
pub mod reboot;
pub mod storage;
pub mod trace;

/// Number of build-id bytes included in events. The full id is 20 bytes;
/// this prefix is plenty to disambiguate builds and saves wire bytes.
pub const EVENT_BUILD_ID_LEN: usize = 6;

#[cfg(test)]
pub(crate) mod test_support {
    use telemetry_api::{BuildId, CurrentTime, DeviceInfo, DevicePlatform};

    /// The device identity used across serializer tests.
    pub struct FakePlatform {
        pub time: CurrentTime,
        pub build_id: Option<BuildId>,
    }

    impl Default for FakePlatform {
        fn default() -> Self {
            Self {
                time: CurrentTime::Unknown,
                build_id: None,
            }
        }
    }

    impl DevicePlatform for FakePlatform {
        fn device_info(&self) -> DeviceInfo<'_> {
            DeviceInfo {
                device_serial: "DAABBCCDD",
                software_type: "main",
                software_version: "1.2.3",
                hardware_version: "evt_24",
            }
        }

        fn build_id(&self) -> Option<BuildId> {
            self.build_id
        }

        fn current_time(&self) -> CurrentTime {
            self.time
        }
    }

    /// `0xa6`-style envelope prefix shared by expected-bytes tests:
    /// `{2: ty, 3: 1, 10: "main", 9: "1.2.3", 6: "evt_24", ...`.
    pub fn envelope_prefix(num_pairs: u8, ty: u8) -> Vec<u8> {
        let mut v = vec![0xa0 + num_pairs, 0x02, ty, 0x03, 0x01];
        v.extend_from_slice(&[0x0a, 0x64, b'm', b'a', b'i', b'n']);
        v.extend_from_slice(&[0x09, 0x65, b'1', b'.', b'2', b'.', b'3']);
        v.extend_from_slice(&[0x06, 0x66, b'e', b'v', b't', b'_', b'2', b'4']);
        v
    }
}
