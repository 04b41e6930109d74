// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-RAM log ring with triggered upload.
//!
//! Log lines are saved into a circular buffer as compact entries: a 1-byte
//! header, a 1-byte length, and the message (capped at
//! [`MAX_LOG_LINE_LEN`]). Under normal operation the ring simply wraps,
//! oldest lines giving way to new ones.
//!
//! Upload is pull-based and explicit: [`LogStore::trigger_collection`]
//! freezes a snapshot -- the count of unsent lines and the wall-clock time --
//! and from then on the store acts as a [`DataSource`] whose message is a
//! CBOR event holding `[level, msg, level, msg, ...]` for exactly the
//! snapshotted lines. Lines appended after the trigger are excluded; the
//! message size has already been promised to the transport.
//!
//! Reads are windowed: the transport asks for `[offset, offset+len)` of the
//! serialized form, and the store re-runs the encoder, copying only the
//! bytes that intersect the window and abandoning the encode as soon as the
//! output passes the window's end.
//!
//! While a snapshot is outstanding, a save that would have to evict an
//! unsent line is dropped and counted instead -- rewinding a half-read
//! message is worse than losing a line. A summary line ("... N messages
//! dropped ...") is inserted ahead of the next save that succeeds.

#![cfg_attr(not(test), no_std)]

use core::cell::{Cell, RefCell};
use core::fmt::Write as _;

use bytering::ByteRing;
use event_codec::envelope::{self, SerializerOptions};
use event_codec::keys::{self, EventType};
use heapless::String;
use telemetry_api::{CurrentTime, DataSource, DevicePlatform};
use wirecbor::{compute_size, Encoder};

/// Longest message stored per line; longer saves are truncated.
pub const MAX_LOG_LINE_LEN: usize = 128;

// Entry header layout: 0brsxx_tlll
//  r = read, s = sent, x = rsvd, t = type, l = level
pub const HDR_READ_MASK: u8 = 0x80;
pub const HDR_SENT_MASK: u8 = 0x40;
pub const HDR_TYPE_MASK: u8 = 0x08;
pub const HDR_LEVEL_MASK: u8 = 0x07;

/// Size of the per-entry header (header byte + length byte).
const ENTRY_OVERHEAD: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

/// How a stored line is encoded on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogKind {
    /// Plain text, sent as a CBOR text string.
    Preformatted,
    /// Pre-encoded compact log, sent as a CBOR byte string so the decoder
    /// can tell the two apart.
    Compact,
}

/// Error returned when a save was dropped to protect an in-flight snapshot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogDropped;

/// One stored line, as returned by [`LogStore::read_next`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub kind: LogKind,
    pub msg: heapless::Vec<u8, MAX_LOG_LINE_LEN>,
}

fn level_from_hdr(hdr: u8) -> LogLevel {
    match hdr & HDR_LEVEL_MASK {
        0 => LogLevel::Debug,
        1 => LogLevel::Info,
        2 => LogLevel::Warning,
        _ => LogLevel::Error,
    }
}

struct Snapshot {
    num_logs: usize,
    time: CurrentTime,
}

pub struct LogStore<'a> {
    ring: ByteRing<'a>,
    platform: &'a dyn DevicePlatform,
    opts: SerializerOptions,
    snapshot: Option<Snapshot>,
    dropped: u32,
}

fn hdr_level(hdr: u8) -> u32 {
    u32::from(hdr & HDR_LEVEL_MASK)
}

fn hdr_kind(hdr: u8) -> LogKind {
    if hdr & HDR_TYPE_MASK == 0 {
        LogKind::Preformatted
    } else {
        LogKind::Compact
    }
}

fn hdr_is_sent(hdr: u8) -> bool {
    hdr & HDR_SENT_MASK != 0
}

impl<'a> LogStore<'a> {
    pub fn new(
        storage: &'a mut [u8],
        platform: &'a dyn DevicePlatform,
        opts: SerializerOptions,
    ) -> Self {
        Self {
            ring: ByteRing::new(storage),
            platform,
            opts,
            snapshot: None,
            dropped: 0,
        }
    }

    /// Saves one log line, truncating to [`MAX_LOG_LINE_LEN`].
    ///
    /// Returns [`LogDropped`] when the line had to be discarded because
    /// making room would have evicted lines an in-flight snapshot still
    /// needs.
    pub fn save(
        &mut self,
        level: LogLevel,
        kind: LogKind,
        msg: &[u8],
    ) -> Result<(), LogDropped> {
        let msg = &msg[..msg.len().min(MAX_LOG_LINE_LEN)];

        if self.dropped > 0 {
            // Surface the gap before the line that follows it.
            let mut notice: String<MAX_LOG_LINE_LEN> = String::new();
            let _ = write!(notice, "... {} messages dropped ...", self.dropped);
            if self
                .write_entry(
                    LogLevel::Warning,
                    LogKind::Preformatted,
                    notice.as_bytes(),
                )
                .is_ok()
            {
                self.dropped = 0;
            }
        }

        match self.write_entry(level, kind, msg) {
            Ok(()) => Ok(()),
            Err(()) => {
                self.dropped += 1;
                Err(LogDropped)
            }
        }
    }

    fn write_entry(
        &mut self,
        level: LogLevel,
        kind: LogKind,
        msg: &[u8],
    ) -> Result<(), ()> {
        let needed = ENTRY_OVERHEAD + msg.len();
        if needed > self.ring.capacity() {
            return Err(());
        }

        // Make room by evicting oldest entries, stopping at any unsent
        // entry while a snapshot is outstanding.
        while self.ring.bytes_free() < needed {
            let (hdr, len) = self.peek_entry(0).ok_or(())?;
            if self.snapshot.is_some() && !hdr_is_sent(hdr) {
                return Err(());
            }
            let _ = self.ring.consume(ENTRY_OVERHEAD + len as usize);
        }

        let type_bit = match kind {
            LogKind::Preformatted => 0,
            LogKind::Compact => HDR_TYPE_MASK,
        };
        let hdr = [(level as u8) | type_bit, msg.len() as u8];
        self.ring.write(&hdr).map_err(|_| ())?;
        self.ring.write(msg).map_err(|_| ())
    }

    fn peek_entry(&self, offset: usize) -> Option<(u8, u8)> {
        let mut hdr = [0u8; ENTRY_OVERHEAD];
        self.ring.read(offset, &mut hdr).ok()?;
        Some((hdr[0], hdr[1]))
    }

    /// Walks entries in order, calling `f(entry_offset, hdr, len)` until it
    /// returns false or the ring is exhausted.
    fn for_each_entry(&self, mut f: impl FnMut(usize, u8, u8) -> bool) {
        let mut offset = 0;
        while let Some((hdr, len)) = self.peek_entry(offset) {
            if !f(offset, hdr, len) {
                return;
            }
            offset += ENTRY_OVERHEAD + len as usize;
        }
    }

    /// Pops the oldest line not yet read through this API, for local
    /// consumption (a console dump, a crash log export).
    ///
    /// The read flag is independent of the sent flag: reading a line
    /// locally neither hides it from nor duplicates it in an upload
    /// snapshot.
    pub fn read_next(&mut self) -> Option<LogLine> {
        let mut offset = 0;
        loop {
            let (hdr, len) = self.peek_entry(offset)?;
            if hdr & HDR_READ_MASK == 0 {
                let mut msg = heapless::Vec::new();
                let _ = self.ring.read_with(
                    offset + ENTRY_OVERHEAD,
                    len as usize,
                    |_, frag| msg.extend_from_slice(frag).is_ok(),
                );

                let from_end = self.ring.bytes_used() - offset;
                let _ = self
                    .ring
                    .write_at_offset_from_end(from_end, &[hdr | HDR_READ_MASK]);

                return Some(LogLine {
                    level: level_from_hdr(hdr),
                    kind: hdr_kind(hdr),
                    msg,
                });
            }
            offset += ENTRY_OVERHEAD + len as usize;
        }
    }

    /// Number of lines that have not yet been sent.
    pub fn count_unsent(&self) -> usize {
        let mut count = 0;
        self.for_each_entry(|_, hdr, _| {
            if !hdr_is_sent(hdr) {
                count += 1;
            }
            true
        });
        count
    }

    /// Number of saves dropped since the last inserted summary line.
    pub fn dropped_count(&self) -> u32 {
        self.dropped
    }

    /// Freezes the current unsent lines for upload.
    ///
    /// A no-op when a snapshot is already outstanding or there is nothing
    /// to send. At most one snapshot exists at a time.
    pub fn trigger_collection(&mut self) {
        if self.snapshot.is_some() {
            return;
        }
        let num_logs = self.count_unsent();
        if num_logs == 0 {
            return;
        }
        self.snapshot = Some(Snapshot {
            num_logs,
            time: self.platform.current_time(),
        });
    }

    pub fn collection_triggered(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Encodes the snapshot message. `stop` aborts the walk early once a
    /// windowed writer has seen everything it wanted.
    ///
    /// Encode errors cannot occur on these paths (the size-only and
    /// windowed writers never reject bytes), so results are discarded.
    fn encode_snapshot(&self, e: &mut Encoder<'_>, stop: Option<&Cell<bool>>) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };

        let _ = envelope::encode_metadata_with_time(
            e,
            EventType::Logs,
            snapshot.time,
            self.platform,
            self.opts,
        );
        let _ = e.unsigned(keys::event::EVENT_INFO);
        // All lines share a single flat array; a map per line would double
        // the overhead.
        let _ = e.array_begin(2 * snapshot.num_logs);

        let mut encoded = 0;
        self.for_each_entry(|offset, hdr, len| {
            if stop.is_some_and(Cell::get) {
                return false;
            }
            if hdr_is_sent(hdr) {
                return true;
            }

            let _ = e.unsigned(hdr_level(hdr));
            let _ = match hdr_kind(hdr) {
                LogKind::Preformatted => e.str_begin(len as usize),
                LogKind::Compact => e.bytes_begin(len as usize),
            };
            let _ = self.ring.read_with(
                offset + ENTRY_OVERHEAD,
                len as usize,
                |_, frag| e.join(frag).is_ok(),
            );

            encoded += 1;
            // Lines past the snapshot count arrived after the trigger; the
            // promised message size does not include them.
            encoded < snapshot.num_logs
        });
    }
}

struct Window<'b> {
    offset: usize,
    buf: &'b mut [u8],
    written: usize,
}

impl DataSource for LogStore<'_> {
    fn has_more_msgs(&mut self) -> Option<usize> {
        self.snapshot.as_ref()?;
        Some(compute_size(|e| {
            self.encode_snapshot(e, None);
            Ok(())
        }))
    }

    fn read_msg(&mut self, offset: u32, buf: &mut [u8]) -> bool {
        if self.snapshot.is_none() {
            return false;
        }

        let stop = Cell::new(false);
        let window = RefCell::new(Window {
            offset: offset as usize,
            buf,
            written: 0,
        });

        let written = {
            let mut write = |src_offset: usize, data: &[u8]| {
                let mut w = window.borrow_mut();
                let dest_end = w.offset + w.buf.len();
                if src_offset > dest_end {
                    // Everything from here on is past the window.
                    stop.set(true);
                    return;
                }
                let src_end = src_offset + data.len();
                let start = src_offset.max(w.offset);
                let end = src_end.min(dest_end);
                if end <= start {
                    return;
                }
                let n = end - start;
                let dest_start = start - w.offset;
                let src_start = start - src_offset;
                w.buf[dest_start..dest_start + n]
                    .copy_from_slice(&data[src_start..src_start + n]);
                w.written += n;
            };
            // The window writer bounds itself, so the encoder cap is moot.
            let mut e = Encoder::new(usize::MAX, &mut write);
            self.encode_snapshot(&mut e, Some(&stop));
            let w = window.borrow();
            w.written
        };
        written == buf.len()
    }

    fn mark_msg_read(&mut self) {
        let Some(snapshot) = self.snapshot.take() else {
            return;
        };

        // Set the sent bit on exactly the snapshotted lines.
        let mut offset = 0;
        let mut marked = 0;
        while marked < snapshot.num_logs {
            let Some((hdr, len)) = self.peek_entry(offset) else {
                break;
            };
            if !hdr_is_sent(hdr) {
                let from_end = self.ring.bytes_used() - offset;
                let _ = self
                    .ring
                    .write_at_offset_from_end(from_end, &[hdr | HDR_SENT_MASK]);
                marked += 1;
            }
            offset += ENTRY_OVERHEAD + len as usize;
        }
    }
}
