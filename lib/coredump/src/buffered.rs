// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Write buffering for storage with a minimum write granularity.
//!
//! Many flash parts only accept writes of a fixed block size at aligned
//! offsets, while the coredump writer produces byte-granular appends plus
//! one out-of-order write: the 12-byte header, written last at offset 0.
//! [`BufferedStorage`] sits between the two, accumulating bytes into
//! block-sized working buffers and flushing each block once every byte of
//! it has been written.
//!
//! Two working buffers are kept: one pinned to block 0 -- which stays
//! incomplete until the final header write commits the save -- and one that
//! follows the sequential body writes. Aligned full-block spans bypass the
//! buffers entirely.

use crate::format::HEADER_LEN;
use crate::{CoredumpStorage, StorageInfo};

/// A block-granular storage device.
pub trait BlockStorage {
    fn info(&self) -> StorageInfo;

    /// Writes one full block at a block-aligned `offset`.
    fn write_block(&mut self, offset: u32, block: &[u8]) -> bool;

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> bool;

    fn erase(&mut self, offset: u32, len: usize) -> bool;

    fn clear(&mut self);
}

struct WorkingBuffer<const B: usize> {
    block_offset: u32,
    dirty: bool,
    written: [bool; B],
    data: [u8; B],
}

impl<const B: usize> WorkingBuffer<B> {
    const fn new() -> Self {
        Self {
            block_offset: 0,
            dirty: false,
            // Unwritten bytes flush as 0xff, matching erased flash.
            written: [false; B],
            data: [0xff; B],
        }
    }

    fn reset(&mut self, block_offset: u32) {
        self.block_offset = block_offset;
        self.dirty = false;
        self.written = [false; B];
        self.data = [0xff; B];
    }

    fn fill(&mut self, offset_in_block: usize, data: &[u8]) {
        self.data[offset_in_block..offset_in_block + data.len()]
            .copy_from_slice(data);
        for flag in
            &mut self.written[offset_in_block..offset_in_block + data.len()]
        {
            *flag = true;
        }
        self.dirty = true;
    }

    fn complete(&self) -> bool {
        self.written.iter().all(|&w| w)
    }
}

/// `B` is the device's write block size. It must be at least the 12-byte
/// coredump header, so the out-of-order header commit stays within the
/// staged first block (checked at compile time).
pub struct BufferedStorage<'a, const B: usize> {
    dev: &'a mut dyn BlockStorage,
    /// Buffer pinned to block 0, completed by the final header write.
    header: WorkingBuffer<B>,
    /// Buffer following the sequential body writes.
    body: WorkingBuffer<B>,
}

impl<'a, const B: usize> BufferedStorage<'a, B> {
    const BLOCK_FITS_HEADER: () = assert!(B >= HEADER_LEN);

    pub fn new(dev: &'a mut dyn BlockStorage) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::BLOCK_FITS_HEADER;
        let mut body = WorkingBuffer::new();
        // Start the body buffer off block 0, which the header buffer owns.
        body.block_offset = B as u32;
        Self {
            dev,
            header: WorkingBuffer::new(),
            body,
        }
    }

    fn flush(dev: &mut dyn BlockStorage, buf: &mut WorkingBuffer<B>) -> bool {
        if !dev.write_block(buf.block_offset, &buf.data) {
            return false;
        }
        let next = buf.block_offset;
        buf.reset(next);
        true
    }

    fn write_span(&mut self, offset: u32, data: &[u8]) -> bool {
        // Invariant from the caller: the span lies within one block.
        let block_offset = offset - (offset % B as u32);
        let offset_in_block = (offset % B as u32) as usize;

        if offset_in_block == 0 && data.len() == B && block_offset != 0 {
            // A whole aligned block; no need to stage it. Block 0 always
            // stages, since its commit is deferred to the header write.
            return self.dev.write_block(block_offset, data);
        }

        if block_offset == 0 {
            self.header.fill(offset_in_block, data);
            if self.header.complete() {
                // Completing block 0 is the save's commit point, so any
                // straggling body bytes must land first (their unwritten
                // neighbors flush as the erased value).
                if self.body.dirty && !Self::flush(self.dev, &mut self.body)
                {
                    return false;
                }
                return Self::flush(self.dev, &mut self.header);
            }
            return true;
        }

        if self.body.dirty && self.body.block_offset != block_offset {
            // The body moved on with the previous block incomplete; push
            // out what we have.
            if !Self::flush(self.dev, &mut self.body) {
                return false;
            }
        }
        if self.body.block_offset != block_offset {
            self.body.reset(block_offset);
        }

        self.body.fill(offset_in_block, data);
        if self.body.complete() {
            return Self::flush(self.dev, &mut self.body);
        }
        true
    }
}

impl<const B: usize> CoredumpStorage for BufferedStorage<'_, B> {
    fn info(&self) -> StorageInfo {
        self.dev.info()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> bool {
        self.dev.read(offset, buf)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> bool {
        let info = self.dev.info();
        if info.size % B != 0 {
            // A region that isn't block-granular can never flush cleanly.
            return false;
        }
        if offset as usize + data.len() > info.size {
            return false;
        }

        let mut offset = offset;
        let mut data = data;
        while !data.is_empty() {
            let room_in_block = B - (offset as usize % B);
            let span = data.len().min(room_in_block);
            if !self.write_span(offset, &data[..span]) {
                return false;
            }
            offset += span as u32;
            data = &data[span..];
        }
        true
    }

    fn erase(&mut self, offset: u32, len: usize) -> bool {
        self.dev.erase(offset, len)
    }

    fn clear(&mut self) {
        self.dev.clear();
    }
}
