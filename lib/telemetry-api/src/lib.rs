// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared vocabulary for the telemetry core.
//!
//! Every subsystem that produces data for transport (event storage, the
//! coredump reader, the log snapshotter, custom data recordings) exposes the
//! same pull interface, [`DataSource`], which the packetizer drains in a fixed
//! priority order. This crate holds that interface together with the handful
//! of types that cross crate boundaries: the wire message types, the
//! active-source mask, device identity, and the platform time traits.
//!
//! Nothing in here allocates or does I/O; platform integration happens by
//! implementing the traits on embedder-owned types and lending them to the
//! subsystems at construction time.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;

/// A source of messages for the packetizer.
///
/// The contract mirrors the storage subsystems' read sides: once
/// [`has_more_msgs`](DataSource::has_more_msgs) reports a message of size `S`,
/// reads at offsets within `[0, S)` must succeed and return stable bytes until
/// [`mark_msg_read`](DataSource::mark_msg_read) is called. Marking a message
/// read is the sole way to advance to the next one.
pub trait DataSource {
    /// Checks whether a message is available, returning its total size.
    fn has_more_msgs(&mut self) -> Option<usize>;

    /// Copies `buf.len()` bytes of the current message starting at `offset`.
    ///
    /// Returns false if the requested window falls outside the message.
    fn read_msg(&mut self, offset: u32, buf: &mut [u8]) -> bool;

    /// Consumes the current message.
    fn mark_msg_read(&mut self);
}

/// Message types understood by the ingestion endpoint. These values form the
/// lower nibble of the first byte of every packetized message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    None = 0,
    Coredump = 1,
    Event = 2,
    Log = 3,
    Cdr = 4,
}

impl MessageType {
    /// The source-mask bit corresponding to this message type.
    pub fn mask(self) -> SourceMask {
        SourceMask::from_bits_truncate(1 << (self as u32))
    }
}

bitflags! {
    /// Which data sources the packetizer is allowed to drain.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct SourceMask: u32 {
        const COREDUMP = 1 << (MessageType::Coredump as u32);
        const EVENT = 1 << (MessageType::Event as u32);
        const LOG = 1 << (MessageType::Log as u32);
        const CDR = 1 << (MessageType::Cdr as u32);
    }
}

impl SourceMask {
    /// Convenience mask enabling every source, the power-on default.
    pub const ALL: Self = Self::all();
}

/// Identity strings reported with every event and coredump.
///
/// Borrowed from the platform for the duration of a serialization call; the
/// strings typically live in flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo<'a> {
    pub device_serial: &'a str,
    pub software_type: &'a str,
    pub software_version: &'a str,
    pub hardware_version: &'a str,
}

/// Length of a build identifier, matching a full SHA-1.
pub const BUILD_ID_LEN: usize = 20;

/// An opaque identifier for the running firmware image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BuildId(pub [u8; BUILD_ID_LEN]);

/// Wall-clock time, when the platform has one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CurrentTime {
    /// No trustworthy wall clock; the cloud will use time of arrival.
    Unknown,
    /// Seconds since the unix epoch.
    UnixEpochSecs(u64),
}

/// Device identity and (optional) wall-clock access, consumed by the event
/// serializers.
pub trait DevicePlatform {
    fn device_info(&self) -> DeviceInfo<'_>;

    /// Identifies the running image. `None` omits the field from events.
    fn build_id(&self) -> Option<BuildId> {
        None
    }

    fn current_time(&self) -> CurrentTime {
        CurrentTime::Unknown
    }
}

/// Monotonic milliseconds since boot. Must never go backwards; wrapping is
/// handled by consumers (metric timers mask to 31 bits).
pub trait Monotonic {
    fn time_since_boot_ms(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_masks_line_up() {
        assert_eq!(MessageType::Coredump.mask(), SourceMask::COREDUMP);
        assert_eq!(MessageType::Event.mask(), SourceMask::EVENT);
        assert_eq!(MessageType::Log.mask(), SourceMask::LOG);
        assert_eq!(MessageType::Cdr.mask(), SourceMask::CDR);
        assert_eq!(
            SourceMask::ALL,
            SourceMask::COREDUMP
                | SourceMask::EVENT
                | SourceMask::LOG
                | SourceMask::CDR
        );
    }
}
