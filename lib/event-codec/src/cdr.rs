// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Custom Data Recordings: arbitrary user blobs published with metadata.
//!
//! Projects often have domain data worth uploading alongside the built-in
//! event types -- proprietary trace buffers, audio captures, CSV dumps. A
//! CDR wraps such a blob with a mimetype list, a collection reason, and
//! timing, so the cloud can index it without understanding the contents.
//!
//! A recording's serialized form is the usual event envelope whose
//! `event_info` ends in a byte-string head of exactly the blob's size; the
//! blob bytes follow raw. The metadata prefix is pre-serialized into a
//! fixed buffer the first time a recording is offered, because transports
//! with small chunk sizes would otherwise re-encode it for every few dozen
//! bytes read.
//!
//! User recordings register a [`CdrSource`]; up to [`MAX_CDR_SOURCES`] may
//! be registered and they are polled in registration order.

use heapless::Vec;
use telemetry_api::{CurrentTime, DataSource, DevicePlatform};
use wirecbor::{Encoder, NotEnoughSpace};

use crate::envelope::{self, encode_u32_kv, SerializerOptions};
use crate::keys::{self, EventType};

/// Well-known mimetypes for recordings.
pub const MIMETYPE_BINARY: &str = "application/octet-stream";
pub const MIMETYPE_TEXT: &str = "text/plain";
pub const MIMETYPE_CSV: &str = "text/csv";

/// How many recording sources may be registered.
pub const MAX_CDR_SOURCES: usize = 4;

/// Upper bound on the serialized metadata prefix of one recording.
///
/// Covers the envelope plus mimetypes and reason strings; a recording whose
/// metadata encodes larger than this is skipped with an error log.
pub const MAX_ENCODED_METADATA_LEN: usize = 160;

/// Describes one recording. Returned by [`CdrSource::has_cdr`]; the
/// borrowed strings live in the source.
#[derive(Copy, Clone, Debug)]
pub struct CdrMetadata<'a> {
    /// When the recording started, or [`CurrentTime::Unknown`] to let the
    /// cloud approximate from arrival time minus duration.
    pub start_time: CurrentTime,
    /// Ordered most specific first.
    pub mimetypes: &'a [&'a str],
    /// Total size of the recording payload, in bytes.
    pub data_size_bytes: u32,
    /// Time span the recording covers; 0 if unknown.
    pub duration_ms: u32,
    /// Why the data was captured, e.g. "ble connection failure".
    pub collection_reason: &'a str,
}

/// A user-provided recording source.
///
/// `has_cdr` may be called repeatedly before the recording is consumed; it
/// must keep describing the same recording until `mark_cdr_read`.
pub trait CdrSource {
    fn has_cdr(&mut self) -> Option<CdrMetadata<'_>>;
    fn read_data(&mut self, offset: u32, buf: &mut [u8]) -> bool;
    fn mark_cdr_read(&mut self);
}

struct ActiveRecording {
    source_idx: usize,
    meta_len: usize,
    meta: [u8; MAX_ENCODED_METADATA_LEN],
    total_len: usize,
}

/// The packetizer-facing aggregator over all registered recording sources.
pub struct CdrDataSource<'a> {
    platform: &'a dyn DevicePlatform,
    opts: SerializerOptions,
    sources: Vec<&'a mut dyn CdrSource, MAX_CDR_SOURCES>,
    active: Option<ActiveRecording>,
}

/// Error returned when the source registry is full.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegistryFull;

fn encode_cdr_metadata(
    e: &mut Encoder<'_>,
    platform: &dyn DevicePlatform,
    opts: SerializerOptions,
    md: &CdrMetadata<'_>,
) -> Result<(), NotEnoughSpace> {
    envelope::encode_metadata_with_time(
        e,
        EventType::Cdr,
        md.start_time,
        platform,
        opts,
    )?;
    e.unsigned(keys::event::EVENT_INFO)?;

    // mimetypes, duration, reason, and the recording itself.
    e.map_begin(4)?;

    encode_u32_kv(e, keys::cdr_info::DURATION_MS, md.duration_ms)?;

    e.unsigned(keys::cdr_info::MIMETYPES)?;
    e.array_begin(md.mimetypes.len())?;
    for mimetype in md.mimetypes {
        e.str(mimetype)?;
    }

    e.unsigned(keys::cdr_info::REASON)?;
    e.str(md.collection_reason)?;

    e.unsigned(keys::cdr_info::DATA)?;
    // All that remains after this head is the blob itself.
    e.bytes_begin(md.data_size_bytes as usize)
}

impl<'a> CdrDataSource<'a> {
    pub fn new(platform: &'a dyn DevicePlatform, opts: SerializerOptions) -> Self {
        Self {
            platform,
            opts,
            sources: Vec::new(),
            active: None,
        }
    }

    /// Registers a recording source. Sources are polled in registration
    /// order.
    pub fn register(
        &mut self,
        source: &'a mut dyn CdrSource,
    ) -> Result<(), RegistryFull> {
        self.sources.push(source).map_err(|_| RegistryFull)
    }

    fn activate_source_with_data(&mut self) {
        if self.active.is_some() {
            return;
        }

        for (source_idx, source) in self.sources.iter_mut().enumerate() {
            let Some(md) = source.has_cdr() else {
                continue;
            };

            let mut meta = [0u8; MAX_ENCODED_METADATA_LEN];
            let (encoded, meta_len) = {
                let mut write = |offset: usize, data: &[u8]| {
                    meta[offset..offset + data.len()].copy_from_slice(data);
                };
                let mut e =
                    Encoder::new(MAX_ENCODED_METADATA_LEN, &mut write);
                let ok = encode_cdr_metadata(
                    &mut e,
                    self.platform,
                    self.opts,
                    &md,
                )
                .is_ok();
                (ok, e.finish())
            };
            if !encoded {
                log::error!("cdr metadata too large, recording skipped");
                continue;
            }

            self.active = Some(ActiveRecording {
                source_idx,
                meta_len,
                meta,
                total_len: meta_len + md.data_size_bytes as usize,
            });
            return;
        }
    }
}

impl DataSource for CdrDataSource<'_> {
    fn has_more_msgs(&mut self) -> Option<usize> {
        self.activate_source_with_data();
        self.active.as_ref().map(|a| a.total_len)
    }

    fn read_msg(&mut self, offset: u32, buf: &mut [u8]) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        let mut offset = offset as usize;
        if offset + buf.len() > active.total_len {
            return false;
        }

        // Serve the pre-encoded metadata prefix, then the blob.
        let mut filled = 0;
        if offset < active.meta_len {
            let n = buf.len().min(active.meta_len - offset);
            buf[..n].copy_from_slice(&active.meta[offset..offset + n]);
            if n == buf.len() {
                return true;
            }
            filled = n;
            offset = 0;
        } else {
            offset -= active.meta_len;
        }

        let source_idx = active.source_idx;
        self.sources[source_idx].read_data(offset as u32, &mut buf[filled..])
    }

    fn mark_msg_read(&mut self) {
        if let Some(active) = self.active.take() {
            self.sources[active.source_idx].mark_cdr_read();
        }
    }
}
