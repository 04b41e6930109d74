// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RAM-backed storage for serialized events.
//!
//! Events (heartbeats, trace events, reboot records) are CBOR documents of
//! unpredictable size, produced incrementally and sometimes abandoned halfway
//! when the encoder runs out of room. The store therefore speaks a two-phase
//! protocol over a circular byte buffer:
//!
//! 1. [`begin_write`](EventSink::begin_write) reserves a 2-byte length prefix
//!    holding the sentinel [`WRITE_IN_PROGRESS`]. Readers scanning the ring
//!    stop at the sentinel, so a half-written event is never observed -- even
//!    if the device resets mid-write, the prefix never describes bytes that
//!    weren't appended.
//! 2. [`append`](EventSink::append) adds payload bytes.
//! 3. [`finish_write`](EventSink::finish_write) either patches the prefix
//!    with the final length (commit) or returns the reservation to the free
//!    pool (rollback).
//!
//! On the read side the store is a [`DataSource`]: complete entries are
//! walked from the oldest end and -- with the `batching` feature -- coalesced
//! into one outbound message, prefixed by a CBOR array header when more than
//! one event is included. The per-entry length prefixes are stripped from
//! the serialized output; the cloud sees only CBOR.
//!
//! An optional non-volatile backend ([`NonVolatileEventStorage`]) lets the
//! embedder spill RAM-resident events to flash; while it reports itself
//! enabled, [`EventDataSource`] routes the packetizer at it instead of RAM.

#![cfg_attr(not(test), no_std)]

use bytering::ByteRing;
use telemetry_api::DataSource;

pub mod batched;

/// Length-prefix sentinel marking a reservation that has not committed.
pub const WRITE_IN_PROGRESS: u16 = 0xffff;

/// Size of the per-entry length prefix.
const HEADER_LEN: usize = 2;

/// Error returned when the ring cannot fit an append.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StorageFull;

/// Ring utilization snapshot handed to the persist-request hook.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StorageStats {
    pub bytes_used: usize,
    pub bytes_free: usize,
}

/// The write half of event storage, consumed by the serializers.
pub trait EventSink {
    /// Reserves a new entry and returns the bytes available for its payload.
    /// Returns 0 when the reservation does not fit or a write is already in
    /// progress.
    fn begin_write(&mut self) -> usize;

    /// Appends payload bytes to the open reservation.
    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageFull>;

    /// Commits the open reservation, or rolls it back as if `begin_write`
    /// had never been called.
    fn finish_write(&mut self, rollback: bool);

    /// Total capacity of the backing storage (used + free), for worst-case
    /// sizing checks.
    fn storage_size(&self) -> usize;
}

/// Interface to an embedder-provided non-volatile spill area for events.
pub trait NonVolatileEventStorage {
    /// Whether the backend is currently usable. May change at runtime (e.g.
    /// filesystem not yet mounted).
    fn enabled(&self) -> bool;

    /// Size of the oldest stored event, if any.
    fn has_event(&mut self) -> Option<usize>;

    /// Reads from the oldest stored event.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> bool;

    /// Discards the oldest stored event.
    fn consume(&mut self);

    /// Writes one `total_size`-byte event, pulling its bytes through `read`.
    fn write(
        &mut self,
        total_size: usize,
        read: &mut dyn FnMut(u32, &mut [u8]) -> bool,
    ) -> bool;
}

#[derive(Default)]
struct WriteState {
    in_progress: bool,
    bytes_written: usize,
}

#[derive(Default)]
struct ReadState {
    /// Ring bytes (prefixes included) covered by the current read.
    active_read_size: usize,
    num_events: usize,
    header: batched::BatchedHeader,
}

impl ReadState {
    /// Size of the serialized message: batched header plus payloads, with
    /// the per-entry prefixes stripped.
    fn total_event_size(&self) -> usize {
        if self.num_events == 0 {
            return 0;
        }
        let prefix_overhead = self.num_events * HEADER_LEN;
        (self.active_read_size + self.header.len) - prefix_overhead
    }
}

pub struct EventStore<'a> {
    ring: ByteRing<'a>,
    write: WriteState,
    read: ReadState,
    /// Cap on the bytes coalesced into one batched message.
    batch_cap: usize,
    /// Invoked after every committed event so the embedder can schedule a
    /// flush (over the transport or into NV storage).
    persist_hook: Option<fn(StorageStats)>,
}

impl<'a> EventStore<'a> {
    pub fn new(storage: &'a mut [u8]) -> Self {
        Self {
            ring: ByteRing::new(storage),
            write: WriteState::default(),
            read: ReadState::default(),
            batch_cap: usize::MAX,
            persist_hook: None,
        }
    }

    /// Limits how many serialized bytes may be coalesced into a single
    /// batched message. Only meaningful with the `batching` feature.
    pub fn set_read_batching_cap(&mut self, bytes: usize) {
        self.batch_cap = bytes;
    }

    pub fn set_persist_hook(&mut self, hook: fn(StorageStats)) {
        self.persist_hook = Some(hook);
    }

    pub fn bytes_used(&self) -> usize {
        self.ring.bytes_used()
    }

    pub fn bytes_free(&self) -> usize {
        self.ring.bytes_free()
    }

    fn read_entry_prefix(&self, offset: usize) -> Option<u16> {
        let mut hdr = [0u8; HEADER_LEN];
        self.ring.read(offset, &mut hdr).ok()?;
        Some(u16::from_le_bytes(hdr))
    }

    /// Walks the ring and decides which complete entries the next message
    /// will cover.
    fn compute_read_state(&mut self) {
        let mut state = ReadState::default();
        loop {
            let Some(size) = self.read_entry_prefix(state.active_read_size)
            else {
                break;
            };
            if size == WRITE_IN_PROGRESS {
                // Reader never crosses an uncommitted reservation.
                break;
            }

            state.num_events += 1;
            state.active_read_size += size as usize;

            if !cfg!(feature = "batching") {
                break;
            }
            if state.num_events > 1 && state.total_event_size() > self.batch_cap
            {
                // More bytes than desired, so don't count this event.
                state.num_events -= 1;
                state.active_read_size -= size as usize;
                break;
            }
        }

        if cfg!(feature = "batching") {
            state.header = batched::build_header(state.num_events);
        }
        self.read = state;
    }

    fn has_data_ram(&mut self) -> Option<usize> {
        // A read already in progress keeps its size until marked read.
        let current = self.read.total_event_size();
        if current != 0 {
            return Some(current);
        }

        self.compute_read_state();
        match self.read.total_event_size() {
            0 => None,
            n => Some(n),
        }
    }

    fn read_ram(&self, mut offset: u32, buf: &mut [u8]) -> bool {
        let total = self.read.total_event_size();
        let mut remaining = buf.len();
        if offset as usize + remaining > total {
            return false;
        }

        // Serve the batched header first, when one is present.
        let mut filled = 0;
        let header = &self.read.header;
        if (offset as usize) < header.len {
            let n = remaining.min(header.len - offset as usize);
            buf[..n].copy_from_slice(&header.data[offset as usize..][..n]);
            filled = n;
            remaining -= n;
            offset = 0;
        } else {
            offset -= header.len as u32;
        }

        // Then concatenate entry payloads, skipping each 2-byte prefix.
        let mut payload_offset = 0usize; // logical offset across payloads
        let mut ring_offset = 0usize; // physical offset in the ring
        while remaining > 0 {
            let Some(size) = self.read_entry_prefix(ring_offset) else {
                // Not reachable unless the ring is corrupt.
                return false;
            };
            ring_offset += HEADER_LEN;
            let payload_len = size as usize - HEADER_LEN;

            if payload_offset + payload_len < offset as usize {
                payload_offset += payload_len;
                ring_offset += payload_len;
                continue;
            }

            let start_within = offset as usize - payload_offset;
            let n = (payload_len - start_within).min(remaining);
            if self
                .ring
                .read(ring_offset + start_within, &mut buf[filled..filled + n])
                .is_err()
            {
                return false;
            }

            filled += n;
            payload_offset += payload_len;
            ring_offset += payload_len;
            remaining -= n;
            offset += n as u32;
        }
        true
    }

    fn mark_read_ram(&mut self) {
        if self.read.active_read_size == 0 {
            return; // no active read to clear
        }
        // Consume the raw ring bytes, prefixes included.
        let _ = self.ring.consume(self.read.active_read_size);
        self.read = ReadState::default();
    }

    fn request_persist(&self) {
        if let Some(hook) = self.persist_hook {
            hook(StorageStats {
                bytes_used: self.ring.bytes_used(),
                bytes_free: self.ring.bytes_free(),
            });
        }
    }

    /// Drains RAM-resident events into `nv`, one message per write.
    ///
    /// Returns the number of messages saved. Stops at the first write the
    /// backend rejects.
    pub fn persist(&mut self, nv: &mut dyn NonVolatileEventStorage) -> usize {
        if !nv.enabled() {
            return 0;
        }

        let mut saved = 0;
        while let Some(total) = self.has_data_ram() {
            let store = &*self;
            if !nv.write(total, &mut |offset, buf| store.read_ram(offset, buf))
            {
                break;
            }
            self.mark_read_ram();
            saved += 1;
        }
        saved
    }
}

impl EventSink for EventStore<'_> {
    fn begin_write(&mut self) -> usize {
        if self.write.in_progress {
            return 0;
        }

        let prefix = WRITE_IN_PROGRESS.to_le_bytes();
        if self.ring.write(&prefix).is_err() {
            return 0;
        }

        self.write = WriteState {
            in_progress: true,
            bytes_written: HEADER_LEN,
        };
        self.ring.bytes_free()
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageFull> {
        self.ring.write(bytes).map_err(|_| StorageFull)?;
        self.write.bytes_written += bytes.len();
        Ok(())
    }

    fn finish_write(&mut self, rollback: bool) {
        if !self.write.in_progress {
            return;
        }

        if rollback {
            let _ = self.ring.consume_from_end(self.write.bytes_written);
        } else {
            let prefix = (self.write.bytes_written as u16).to_le_bytes();
            let _ = self
                .ring
                .write_at_offset_from_end(self.write.bytes_written, &prefix);
        }

        self.write = WriteState::default();
        if !rollback {
            self.request_persist();
        }
    }

    fn storage_size(&self) -> usize {
        self.ring.capacity()
    }
}

impl DataSource for EventStore<'_> {
    fn has_more_msgs(&mut self) -> Option<usize> {
        self.has_data_ram()
    }

    fn read_msg(&mut self, offset: u32, buf: &mut [u8]) -> bool {
        self.read_ram(offset, buf)
    }

    fn mark_msg_read(&mut self) {
        self.mark_read_ram();
    }
}

/// The packetizer-facing event source: RAM-backed normally, delegating to
/// the non-volatile backend while it reports itself enabled.
pub struct EventDataSource<'a, 's> {
    store: &'a mut EventStore<'s>,
    nv: Option<&'a mut dyn NonVolatileEventStorage>,
    nv_was_enabled: bool,
}

impl<'a, 's> EventDataSource<'a, 's> {
    pub fn new(store: &'a mut EventStore<'s>) -> Self {
        Self {
            store,
            nv: None,
            nv_was_enabled: false,
        }
    }

    pub fn with_nv_storage(
        store: &'a mut EventStore<'s>,
        nv: &'a mut dyn NonVolatileEventStorage,
    ) -> Self {
        Self {
            store,
            nv: Some(nv),
            nv_was_enabled: false,
        }
    }

    fn nv_enabled(&mut self) -> bool {
        let enabled = match &self.nv {
            Some(nv) => nv.enabled(),
            None => false,
        };
        if self.nv_was_enabled && !enabled {
            // Indicative of a failure in the backend; reset the RAM read
            // state in case we were mid-copy into it.
            log::warn!("nv event storage disabled while in use");
            self.store.read = ReadState::default();
        }
        self.nv_was_enabled = enabled;
        enabled
    }
}

impl DataSource for EventDataSource<'_, '_> {
    fn has_more_msgs(&mut self) -> Option<usize> {
        if self.nv_enabled() {
            self.nv.as_mut().and_then(|nv| nv.has_event())
        } else {
            self.store.has_data_ram()
        }
    }

    fn read_msg(&mut self, offset: u32, buf: &mut [u8]) -> bool {
        if self.nv_enabled() {
            match &mut self.nv {
                Some(nv) => nv.read(offset, buf),
                None => false,
            }
        } else {
            self.store.read_ram(offset, buf)
        }
    }

    fn mark_msg_read(&mut self) {
        if self.nv_enabled() {
            if let Some(nv) = &mut self.nv {
                nv.consume();
            }
            // Anything still buffered in RAM wants another persist pass.
            if self.store.has_data_ram().is_some() {
                self.store.request_persist();
            }
        } else {
            self.store.mark_read_ram();
        }
    }
}
