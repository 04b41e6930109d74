// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The packetizer: turns stored diagnostic data into transport chunks.
//!
//! Four kinds of data wait on a device -- coredumps, events, log snapshots,
//! and custom recordings -- each behind the same [`DataSource`] pull
//! interface. The packetizer scans them in a fixed priority order
//! (coredump first: it describes a crash, everything else is context),
//! frames the first available message with a one-byte type header, and
//! splits it into chunks the caller pushes to the ingestion endpoint.
//!
//! The framing byte is `message_type | 0x80` when the payload was
//! run-length encoded; everything after it is one complete CBOR document
//! (or coredump image).
//!
//! A message, once begun, streams to completion before any other source is
//! consulted, and a source is only consumed (`mark_msg_read`) after its
//! last byte has been handed out. [`Packetizer::abort`] rewinds without
//! consuming, so a failed upload re-sends the identical bytes from offset
//! zero.
//!
//! Mid-stream read failures are deliberately not fatal: the offending
//! bytes are scribbled with a recognizable pattern and streaming
//! continues, because rewinding on a persistent fault would retry the same
//! failing read forever.

#![cfg_attr(not(test), no_std)]

pub mod chunk;
mod rle_source;

use chunk::ChunkTransport;
use rle_source::RleStream;
use telemetry_api::{DataSource, MessageType, SourceMask};

/// Minimum buffer accepted by [`Packetizer::get_next`]; smaller buffers
/// produce zero bytes.
pub const MIN_BUF_LEN: usize = chunk::MIN_CHUNK_BUF_LEN;

/// Pattern scribbled over bytes a data source failed to read.
const READ_FAILURE_PATTERN: u8 = 0xef;
const READ_FAILURE_PATTERN_MAX_LEN: usize = 16;

/// Flag bit in the message header marking an RLE-compressed payload.
const RLE_FLAG: u8 = 0x80;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketizerStatus {
    /// Nothing to send at this time.
    NoMoreData,
    /// A complete chunk was produced; send it, then call `begin` again.
    EndOfChunk,
    /// More packets remain in the current chunk. Only returned in
    /// multi-packet mode.
    MoreDataForChunk,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct PacketizerConfig {
    /// When false every `get_next` yields one self-contained chunk; when
    /// true a single chunk spans calls until `EndOfChunk`.
    pub enable_multi_packet_chunk: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketizerMetadata {
    /// True when part of the current message has already been handed out.
    pub send_in_progress: bool,
    /// Size of the message as a single chunk, for `Content-Length`.
    pub single_chunk_message_length: u32,
}

/// The data sources the packetizer drains, in priority order. Absent
/// subsystems stay `None`.
#[derive(Default)]
pub struct Sources<'a> {
    pub coredump: Option<&'a mut dyn DataSource>,
    pub event: Option<&'a mut dyn DataSource>,
    pub log: Option<&'a mut dyn DataSource>,
    pub cdr: Option<&'a mut dyn DataSource>,
}

impl Sources<'_> {
    fn get_mut(&mut self, ty: MessageType) -> Option<&mut dyn DataSource> {
        let slot = match ty {
            MessageType::Coredump => &mut self.coredump,
            MessageType::Event => &mut self.event,
            MessageType::Log => &mut self.log,
            MessageType::Cdr => &mut self.cdr,
            MessageType::None => return None,
        };
        slot.as_deref_mut().map(|s| s as &mut dyn DataSource)
    }
}

const PRIORITY: [MessageType; 4] = [
    MessageType::Coredump,
    MessageType::Event,
    MessageType::Log,
    MessageType::Cdr,
];

struct ActiveMessage {
    msg_type: MessageType,
    rle: Option<RleStream>,
    transport: ChunkTransport,
}

impl ActiveMessage {
    fn header_byte(&self) -> u8 {
        let ty = self.msg_type as u8;
        if self.rle.is_some() {
            ty | RLE_FLAG
        } else {
            ty
        }
    }
}

pub struct Packetizer<'a> {
    sources: Sources<'a>,
    active_mask: SourceMask,
    /// Sources whose messages are wrapped in run-length encoding.
    rle_mask: SourceMask,
    active: Option<ActiveMessage>,
}

impl<'a> Packetizer<'a> {
    pub fn new(sources: Sources<'a>) -> Self {
        Self {
            sources,
            active_mask: SourceMask::ALL,
            rle_mask: SourceMask::empty(),
            active: None,
        }
    }

    /// Restricts which sources are drained. Implicitly aborts any message
    /// in progress.
    pub fn set_active_sources(&mut self, mask: SourceMask) {
        self.abort();
        self.active_mask = mask;
    }

    /// Marks sources whose messages should be RLE-compressed on the wire.
    pub fn set_rle_sources(&mut self, mask: SourceMask) {
        self.rle_mask = mask;
    }

    /// Forgets any in-progress message without consuming its source; the
    /// next `begin` restarts the same message from offset zero.
    pub fn abort(&mut self) {
        self.active = None;
    }

    /// True when a message is active or any enabled source has data.
    pub fn data_available(&mut self) -> bool {
        if self.active.is_some() {
            return true;
        }
        for ty in PRIORITY {
            if !self.active_mask.contains(ty.mask()) {
                continue;
            }
            if let Some(source) = self.sources.get_mut(ty) {
                if source.has_more_msgs().is_some() {
                    return true;
                }
            }
        }
        false
    }

    /// Selects (or resumes) the message to send. Returns `None` when no
    /// source has data.
    pub fn begin(
        &mut self,
        cfg: PacketizerConfig,
    ) -> Option<PacketizerMetadata> {
        if self.active.is_none() && !self.load_next_message(cfg) {
            return None;
        }

        let active = self.active.as_ref().unwrap_or_else(|| unreachable!());
        Some(PacketizerMetadata {
            send_in_progress: active.transport.read_offset() != 0,
            single_chunk_message_length: active
                .transport
                .single_chunk_message_length(),
        })
    }

    fn load_next_message(&mut self, cfg: PacketizerConfig) -> bool {
        for ty in PRIORITY {
            if !self.active_mask.contains(ty.mask()) {
                // The embedder has disabled extraction from this source.
                continue;
            }
            let rle_wanted = self.rle_mask.contains(ty.mask());
            let Some(source) = self.sources.get_mut(ty) else {
                continue;
            };
            let Some(total_size) = source.has_more_msgs() else {
                continue;
            };

            // For a wrappable source, a sizing pass over the whole message
            // determines the compressed wire size; a read failure here
            // just falls back to the uncompressed form.
            let (rle, wire_size) = if rle_wanted {
                match rle_source::compressed_total(source, total_size) {
                    Some(compressed) => {
                        (Some(RleStream::new(total_size)), compressed)
                    }
                    None => (None, total_size),
                }
            } else {
                (None, total_size)
            };

            self.active = Some(ActiveMessage {
                msg_type: ty,
                rle,
                transport: ChunkTransport::new(
                    wire_size as u32 + 1, // the type header byte
                    cfg.enable_multi_packet_chunk,
                ),
            });
            return true;
        }
        false
    }

    /// Fills `buf` with the next packet of the current message.
    ///
    /// Returns the status and the number of bytes written. Must be
    /// preceded by a successful [`begin`](Self::begin).
    pub fn get_next(&mut self, buf: &mut [u8]) -> (PacketizerStatus, usize) {
        let Some(active) = self.active.as_mut() else {
            // begin() must be called to load a message first.
            return (PacketizerStatus::NoMoreData, 0);
        };

        let header_byte = active.header_byte();
        let msg_type = active.msg_type;
        let multi_call = active.transport.multi_call();
        let rle = &mut active.rle;
        let source = self.sources.get_mut(msg_type);

        let (written, more) = active.transport.next_chunk(buf, |offset, out| {
            read_message_bytes(header_byte, msg_type, source, rle, offset, out);
        });
        if written == 0 {
            log::error!("buffer of {} bytes too small to packetize", buf.len());
        }

        if !more {
            // The entire message has been handed out; consume it.
            if let Some(source) = self.sources.get_mut(msg_type) {
                source.mark_msg_read();
            }
            self.active = None;
            return (PacketizerStatus::EndOfChunk, written);
        }

        if multi_call {
            (PacketizerStatus::MoreDataForChunk, written)
        } else {
            (PacketizerStatus::EndOfChunk, written)
        }
    }

    /// Convenience wrapper producing one self-contained chunk, or `None`
    /// when there is nothing to send.
    pub fn get_chunk(&mut self, buf: &mut [u8]) -> Option<usize> {
        let cfg = PacketizerConfig {
            enable_multi_packet_chunk: false,
        };
        self.begin(cfg)?;

        match self.get_next(buf) {
            (PacketizerStatus::EndOfChunk, written) if written > 0 => {
                Some(written)
            }
            (status, _) => {
                // Data was available, so anything else is unexpected.
                log::error!("unexpected packetizer status: {status:?}");
                None
            }
        }
    }
}

/// Reads `out.len()` bytes of the framed message at `offset`: the header
/// byte first, then source (or RLE-stream) bytes.
fn read_message_bytes(
    header_byte: u8,
    msg_type: MessageType,
    source: Option<&mut dyn DataSource>,
    rle: &mut Option<RleStream>,
    offset: u32,
    out: &mut [u8],
) {
    let mut out = out;
    let mut read_offset = offset;
    if offset == 0 {
        out[0] = header_byte;
        out = &mut out[1..];
        if out.is_empty() {
            return;
        }
    } else {
        read_offset = offset - 1;
    }

    let Some(source) = source else {
        return;
    };
    let ok = match rle {
        Some(stream) => stream.read(source, read_offset, out),
        None => source.read_msg(read_offset, out),
    };
    if !ok {
        // Read failures really should never happen, and we can't tell a
        // transient fault from a persistent one. Aborting could loop
        // forever re-reading the same bad offset, so scrub the bytes with
        // a known pattern and keep going.
        log::error!(
            "read at offset {read_offset:#x} ({} bytes) for source type {} failed",
            out.len(),
            msg_type as u8,
        );
        let n = out.len().min(READ_FAILURE_PATTERN_MAX_LEN);
        out[..n].fill(READ_FAILURE_PATTERN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        data: Vec<u8>,
        available: bool,
        fail_reads: bool,
        marked: usize,
    }

    impl FakeSource {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                available: true,
                fail_reads: false,
                marked: 0,
            }
        }
    }

    impl DataSource for FakeSource {
        fn has_more_msgs(&mut self) -> Option<usize> {
            self.available.then_some(self.data.len())
        }
        fn read_msg(&mut self, offset: u32, buf: &mut [u8]) -> bool {
            if self.fail_reads {
                return false;
            }
            let offset = offset as usize;
            if offset + buf.len() > self.data.len() {
                return false;
            }
            buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
            true
        }
        fn mark_msg_read(&mut self) {
            self.marked += 1;
            self.available = false;
        }
    }

    const COREDUMP: &[u8] = &[0x1, 0x2, 0x3, 0x4, 0x5, 0x6, 0x7, 0x8, 0xa];
    const EVENT: &[u8] = &[0xa, 0xb, 0xc, 0xd, 0xe, 0xf, 0x10, 0x11];

    fn single_chunk_cfg() -> PacketizerConfig {
        PacketizerConfig {
            enable_multi_packet_chunk: false,
        }
    }

    #[test]
    fn no_sources_no_data() {
        let mut packetizer = Packetizer::new(Sources::default());
        assert!(!packetizer.data_available());
        assert!(packetizer.begin(single_chunk_cfg()).is_none());
        let mut buf = [0u8; 16];
        assert_eq!(
            packetizer.get_next(&mut buf),
            (PacketizerStatus::NoMoreData, 0)
        );
    }

    #[test]
    fn coredump_drains_as_single_chunk() {
        let mut coredump = FakeSource::new(COREDUMP);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            ..Sources::default()
        });

        let metadata = packetizer.begin(single_chunk_cfg()).unwrap();
        assert!(!metadata.send_in_progress);
        assert_eq!(
            metadata.single_chunk_message_length as usize,
            COREDUMP.len() + 1
        );

        let mut buf = [0u8; 16];
        let (status, written) = packetizer.get_next(&mut buf);
        assert_eq!(status, PacketizerStatus::EndOfChunk);
        assert_eq!(written, COREDUMP.len() + 1);
        assert_eq!(buf[0], 0x01); // coredump message type
        assert_eq!(&buf[1..written], COREDUMP);

        assert!(packetizer.begin(single_chunk_cfg()).is_none());
        assert_eq!(coredump.marked, 1);
    }

    #[test]
    fn priority_order_prefers_coredump() {
        let mut coredump = FakeSource::new(COREDUMP);
        let mut event = FakeSource::new(EVENT);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            event: Some(&mut event),
            ..Sources::default()
        });

        let mut buf = [0u8; 32];
        let written = packetizer.get_chunk(&mut buf).unwrap();
        assert_eq!(buf[0], 0x01);

        // With the coredump consumed, events come next.
        let written2 = packetizer.get_chunk(&mut buf).unwrap();
        assert_eq!(buf[0], 0x02);
        assert_eq!(&buf[1..written2], EVENT);

        assert!(packetizer.get_chunk(&mut buf).is_none());
        assert_eq!(written, COREDUMP.len() + 1);
    }

    #[test]
    fn source_mask_disables_sources() {
        let mut coredump = FakeSource::new(COREDUMP);
        let mut event = FakeSource::new(EVENT);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            event: Some(&mut event),
            ..Sources::default()
        });
        packetizer.set_active_sources(SourceMask::EVENT);

        let mut buf = [0u8; 32];
        let written = packetizer.get_chunk(&mut buf).unwrap();
        assert_eq!(buf[0], 0x02);
        assert_eq!(&buf[1..written], EVENT);
        assert!(packetizer.get_chunk(&mut buf).is_none());
        assert_eq!(coredump.marked, 0);
    }

    #[test]
    fn multi_packet_chunk_spans_calls() {
        let mut coredump = FakeSource::new(&[0x42; 40]);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            ..Sources::default()
        });

        let cfg = PacketizerConfig {
            enable_multi_packet_chunk: true,
        };
        packetizer.begin(cfg).unwrap();

        let mut assembled = Vec::new();
        loop {
            let mut buf = [0u8; 16];
            let (status, written) = packetizer.get_next(&mut buf);
            assembled.extend_from_slice(&buf[..written]);
            match status {
                PacketizerStatus::MoreDataForChunk => continue,
                PacketizerStatus::EndOfChunk => break,
                PacketizerStatus::NoMoreData => panic!("ended early"),
            }
        }
        assert_eq!(assembled[0], 0x01);
        assert_eq!(&assembled[1..], &[0x42; 40]);
        assert_eq!(coredump.marked, 1);
    }

    #[test]
    fn resume_metadata_reports_send_in_progress() {
        let mut coredump = FakeSource::new(&[0x42; 40]);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            ..Sources::default()
        });

        let cfg = PacketizerConfig {
            enable_multi_packet_chunk: true,
        };
        packetizer.begin(cfg).unwrap();
        let mut buf = [0u8; 16];
        let (status, _) = packetizer.get_next(&mut buf);
        assert_eq!(status, PacketizerStatus::MoreDataForChunk);

        let metadata = packetizer.begin(cfg).unwrap();
        assert!(metadata.send_in_progress);
    }

    #[test]
    fn abort_replays_identical_bytes() {
        let mut coredump = FakeSource::new(COREDUMP);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            ..Sources::default()
        });

        // Partially drain, then abort.
        let cfg = PacketizerConfig {
            enable_multi_packet_chunk: true,
        };
        packetizer.begin(cfg).unwrap();
        let mut first = [0u8; MIN_BUF_LEN];
        packetizer.get_next(&mut first);
        packetizer.abort();

        // A full drain now emits byte-for-byte what an undisturbed drain
        // would have.
        let mut buf = [0u8; 32];
        let written = packetizer.get_chunk(&mut buf).unwrap();
        assert_eq!(buf[0], 0x01);
        assert_eq!(&buf[1..written], COREDUMP);
        assert_eq!(coredump.marked, 1);
    }

    #[test]
    fn undersized_buffer_yields_nothing() {
        let mut coredump = FakeSource::new(COREDUMP);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            ..Sources::default()
        });
        packetizer.begin(single_chunk_cfg()).unwrap();

        let mut tiny = [0u8; MIN_BUF_LEN - 1];
        let (_, written) = packetizer.get_next(&mut tiny);
        assert_eq!(written, 0);

        // Nothing was consumed; a proper buffer still gets everything.
        let mut buf = [0u8; 32];
        let written = packetizer.get_chunk(&mut buf).unwrap();
        assert_eq!(written, COREDUMP.len() + 1);
    }

    #[test]
    fn read_failure_scribbles_and_continues() {
        let mut coredump = FakeSource::new(COREDUMP);
        coredump.fail_reads = true;
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            ..Sources::default()
        });

        let mut buf = [0u8; 32];
        let written = packetizer.get_chunk(&mut buf).unwrap();
        assert_eq!(written, COREDUMP.len() + 1);
        assert_eq!(buf[0], 0x01);
        // The failed payload bytes carry the scrub pattern.
        assert!(buf[1..written]
            .iter()
            .all(|&b| b == READ_FAILURE_PATTERN));
        // The message was still consumed so we don't loop on the fault.
        assert_eq!(coredump.marked, 1);
    }

    #[test]
    fn rle_wrapped_source_sets_flag_and_roundtrips() {
        let payload = {
            let mut v = vec![0u8; 64];
            v.extend_from_slice(b"tail");
            v
        };
        let mut coredump = FakeSource::new(&payload);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            ..Sources::default()
        });
        packetizer.set_rle_sources(SourceMask::COREDUMP);

        let metadata = packetizer.begin(single_chunk_cfg()).unwrap();
        // The run collapses, so the wire form is smaller than the source.
        assert!(
            (metadata.single_chunk_message_length as usize) < payload.len()
        );

        let mut buf = [0u8; 64];
        let (status, written) = packetizer.get_next(&mut buf);
        assert_eq!(status, PacketizerStatus::EndOfChunk);
        assert_eq!(buf[0], 0x01 | 0x80);

        // Decompressing the payload restores the original message.
        let mut decompressor = runlen::Decompressor::default();
        let mut input = &buf[1..written];
        let mut out = vec![0u8; payload.len() + 16];
        let decoded =
            runlen::decompress(&mut decompressor, &mut input, &mut out);
        assert_eq!(decoded, payload.as_slice());
        assert_eq!(coredump.marked, 1);
    }

    #[test]
    fn rle_abort_then_drain_matches() {
        // Five long runs compress to ~30 bytes, enough to span packets.
        let mut payload = Vec::new();
        for b in 0u8..5 {
            payload.extend_from_slice(&vec![b; 300]);
        }
        let mut coredump = FakeSource::new(&payload);
        let mut packetizer = Packetizer::new(Sources {
            coredump: Some(&mut coredump),
            ..Sources::default()
        });
        packetizer.set_rle_sources(SourceMask::COREDUMP);

        let cfg = PacketizerConfig {
            enable_multi_packet_chunk: true,
        };
        packetizer.begin(cfg).unwrap();
        let mut partial = [0u8; MIN_BUF_LEN];
        let (status, _) = packetizer.get_next(&mut partial);
        assert_eq!(status, PacketizerStatus::MoreDataForChunk);
        packetizer.abort();

        let mut buf = [0u8; 64];
        let written = packetizer.get_chunk(&mut buf).unwrap();
        assert_eq!(buf[0], 0x01 | 0x80);

        let mut decompressor = runlen::Decompressor::default();
        let mut input = &buf[1..written];
        let mut decoded = Vec::new();
        let mut out = [0u8; 256];
        loop {
            let chunk =
                runlen::decompress(&mut decompressor, &mut input, &mut out);
            if chunk.is_empty() {
                break;
            }
            decoded.extend_from_slice(chunk);
        }
        assert_eq!(decoded, payload);
    }
}
