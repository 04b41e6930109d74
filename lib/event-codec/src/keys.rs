// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integer keys used in serialized events.
//!
//! These values are shared with the cloud decoder and must never change.

/// Version of the event schema itself, reported under [`event::SCHEMA_VERSION`].
pub const SCHEMA_VERSION_V1: u32 = 1;

/// Keys of the top-level event map.
pub mod event {
    pub const CAPTURED_DATE_UNIX_TIMESTAMP: u32 = 1;
    pub const TYPE: u32 = 2;
    pub const SCHEMA_VERSION: u32 = 3;
    pub const EVENT_INFO: u32 = 4;
    pub const USER_INFO: u32 = 5;
    pub const HARDWARE_VERSION: u32 = 6;
    pub const DEVICE_SERIAL: u32 = 7;
    pub const SOFTWARE_VERSION: u32 = 9;
    pub const SOFTWARE_TYPE: u32 = 10;
    pub const BUILD_ID: u32 = 11;
}

/// Values of the [`event::TYPE`] field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EventType {
    Heartbeat = 1,
    Trace = 2,
    LogError = 3,
    Logs = 4,
    Cdr = 5,
}

/// `event_info` keys for [`EventType::Trace`] events (also used by the
/// reboot-record event, which is a trace on the wire).
pub mod trace_info {
    pub const REASON: u32 = 1;
    pub const PROGRAM_COUNTER: u32 = 2;
    pub const LINK_REGISTER: u32 = 3;
    pub const MCU_REASON_REGISTER: u32 = 4;
    pub const COREDUMP_SAVED: u32 = 5;
    pub const USER_REASON: u32 = 6;
    pub const STATUS_CODE: u32 = 7;
    pub const LOG: u32 = 8;
    pub const COMPACT_LOG: u32 = 9;
}

/// `event_info` keys for [`EventType::Heartbeat`] events.
pub mod heartbeat_info {
    pub const METRICS: u32 = 1;
}

/// `event_info` keys for [`EventType::Cdr`] events.
pub mod cdr_info {
    pub const DURATION_MS: u32 = 1;
    pub const MIMETYPES: u32 = 2;
    pub const REASON: u32 = 3;
    pub const DATA: u32 = 4;
}

// For EventType::Logs the event_info is a single array holding all logs:
// [lvl1, msg1, lvl2, msg2, ...].
