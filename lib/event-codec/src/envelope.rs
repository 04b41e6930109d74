// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The outer CBOR map shared by all event types.

use telemetry_api::{CurrentTime, DevicePlatform};
use wirecbor::{Encoder, NotEnoughSpace};

use crate::keys::{self, EventType};
use crate::EVENT_BUILD_ID_LEN;

/// Options applied to every serialized event.
#[derive(Copy, Clone, Debug, Default)]
pub struct SerializerOptions {
    /// By default the device serial is not encoded in each event to conserve
    /// space; the cloud derives it from the identifier in the chunk upload
    /// URL. Set this to carry it in-band instead.
    pub include_device_serial: bool,
}

pub fn encode_u32_kv(
    e: &mut Encoder<'_>,
    key: u32,
    value: u32,
) -> Result<(), NotEnoughSpace> {
    e.unsigned(key)?;
    e.unsigned(value)
}

pub fn encode_i32_kv(
    e: &mut Encoder<'_>,
    key: u32,
    value: i32,
) -> Result<(), NotEnoughSpace> {
    e.unsigned(key)?;
    e.signed(value)
}

pub fn encode_bytes_kv(
    e: &mut Encoder<'_>,
    key: u32,
    value: &[u8],
) -> Result<(), NotEnoughSpace> {
    e.unsigned(key)?;
    e.bytes(value)
}

pub fn encode_str_kv(
    e: &mut Encoder<'_>,
    key: u32,
    value: &str,
) -> Result<(), NotEnoughSpace> {
    e.unsigned(key)?;
    e.str(value)
}

/// Encodes the event envelope up to, but not including, the `event_info`
/// pair. The caller must follow with key [`keys::event::EVENT_INFO`] and the
/// event-type-specific value -- the pair is already counted in the map
/// header.
///
/// Uses the platform wall clock; see
/// [`encode_metadata_with_time`] when the event carries its own capture
/// time.
pub fn encode_metadata(
    e: &mut Encoder<'_>,
    ty: EventType,
    platform: &dyn DevicePlatform,
    opts: SerializerOptions,
) -> Result<(), NotEnoughSpace> {
    encode_metadata_with_time(e, ty, platform.current_time(), platform, opts)
}

pub fn encode_metadata_with_time(
    e: &mut Encoder<'_>,
    ty: EventType,
    time: CurrentTime,
    platform: &dyn DevicePlatform,
    opts: SerializerOptions,
) -> Result<(), NotEnoughSpace> {
    let timestamp = match time {
        CurrentTime::UnixEpochSecs(secs) => Some(secs),
        CurrentTime::Unknown => None,
    };
    let build_id = platform.build_id();

    let num_pairs = 1 // type
        + usize::from(timestamp.is_some())
        + usize::from(opts.include_device_serial)
        + 3 // sw version, sw type, hw version
        + usize::from(build_id.is_some())
        + 1 // schema version
        + 1; // event_info, encoded by the caller

    e.map_begin(num_pairs)?;

    encode_u32_kv(e, keys::event::TYPE, ty as u32)?;
    encode_u32_kv(e, keys::event::SCHEMA_VERSION, keys::SCHEMA_VERSION_V1)?;

    let info = platform.device_info();
    if opts.include_device_serial {
        encode_str_kv(e, keys::event::DEVICE_SERIAL, info.device_serial)?;
    }
    encode_str_kv(e, keys::event::SOFTWARE_TYPE, info.software_type)?;
    encode_str_kv(e, keys::event::SOFTWARE_VERSION, info.software_version)?;
    encode_str_kv(e, keys::event::HARDWARE_VERSION, info.hardware_version)?;

    if let Some(id) = build_id {
        encode_bytes_kv(e, keys::event::BUILD_ID, &id.0[..EVENT_BUILD_ID_LEN])?;
    }

    if let Some(secs) = timestamp {
        encode_u32_kv(
            e,
            keys::event::CAPTURED_DATE_UNIX_TIMESTAMP,
            secs as u32,
        )?;
    }

    Ok(())
}
