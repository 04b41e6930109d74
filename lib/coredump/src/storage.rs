// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The storage interface the coredump writer targets, and a RAM-backed
//! implementation.
//!
//! Every operation runs from a fault handler with interrupts disabled, so
//! implementations must not block on other contexts, allocate, or assume a
//! running RTOS.

use crate::format::{CoredumpHeader, HEADER_LEN};
use zerocopy::FromBytes as _;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageInfo {
    /// Usable bytes in the coredump region.
    pub size: usize,
    /// Erase granularity, for informational purposes; 0 if not applicable.
    pub sector_size: usize,
}

pub trait CoredumpStorage {
    fn info(&self) -> StorageInfo;

    /// Reads `buf.len()` bytes at `offset`. May return false while a clear
    /// is still in flight, which readers treat as "no coredump".
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> bool;

    fn write(&mut self, offset: u32, data: &[u8]) -> bool;

    fn erase(&mut self, offset: u32, len: usize) -> bool;

    /// Invalidates any stored coredump. Only needs to destroy the header
    /// magic; a lazy (asynchronous) erase is fine as long as reads report
    /// failure until it lands.
    fn clear(&mut self);

    /// Hook run before a save begins; a port can power rails or take
    /// peripheral locks here.
    fn prepare(&mut self) -> bool {
        true
    }
}

/// Checks whether `storage` holds a committed coredump, returning its total
/// size.
pub fn has_valid_coredump(storage: &mut dyn CoredumpStorage) -> Option<usize> {
    if storage.info().size < HEADER_LEN {
        return None;
    }
    let mut raw = [0u8; HEADER_LEN];
    if !storage.read(0, &mut raw) {
        return None;
    }
    let header = CoredumpHeader::read_from_bytes(&raw).ok()?;
    if header.magic.get() != crate::format::MAGIC {
        return None;
    }
    Some(header.total_size.get() as usize)
}

/// Coredump storage in a RAM region the embedder placed in a NOINIT
/// section, so a coredump survives the warm reset that follows the fault.
///
/// `clear` only scrubs the header magic; the rest of the region is left for
/// the next save's erase.
pub struct RamCoredumpStorage<'a> {
    region: &'a mut [u8],
}

impl<'a> RamCoredumpStorage<'a> {
    pub fn new(region: &'a mut [u8]) -> Self {
        Self { region }
    }
}

impl CoredumpStorage for RamCoredumpStorage<'_> {
    fn info(&self) -> StorageInfo {
        StorageInfo {
            size: self.region.len(),
            sector_size: self.region.len(),
        }
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> bool {
        let offset = offset as usize;
        let Some(src) = self.region.get(offset..offset + buf.len()) else {
            return false;
        };
        buf.copy_from_slice(src);
        true
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> bool {
        let offset = offset as usize;
        let Some(dst) = self.region.get_mut(offset..offset + data.len()) else {
            return false;
        };
        dst.copy_from_slice(data);
        true
    }

    fn erase(&mut self, offset: u32, len: usize) -> bool {
        let offset = offset as usize;
        let Some(dst) = self.region.get_mut(offset..offset + len) else {
            return false;
        };
        dst.fill(0);
        true
    }

    fn clear(&mut self) {
        if self.region.len() >= HEADER_LEN {
            self.region[..4].fill(0);
        }
    }
}

/// The packetizer-facing source: one message per stored coredump, consumed
/// by clearing storage.
pub struct CoredumpDataSource<'a> {
    storage: &'a mut dyn CoredumpStorage,
}

impl<'a> CoredumpDataSource<'a> {
    pub fn new(storage: &'a mut dyn CoredumpStorage) -> Self {
        Self { storage }
    }
}

impl telemetry_api::DataSource for CoredumpDataSource<'_> {
    fn has_more_msgs(&mut self) -> Option<usize> {
        has_valid_coredump(self.storage)
    }

    fn read_msg(&mut self, offset: u32, buf: &mut [u8]) -> bool {
        self.storage.read(offset, buf)
    }

    fn mark_msg_read(&mut self) {
        self.storage.clear();
    }
}

#[cfg(test)]
pub(crate) fn write_fake_coredump(
    storage: &mut dyn CoredumpStorage,
    payload: &[u8],
) -> usize {
    use crate::format::{MAGIC, VERSION};
    use zerocopy::byteorder::little_endian::U32;
    use zerocopy::IntoBytes as _;

    let total = HEADER_LEN + payload.len();
    let header = CoredumpHeader {
        magic: U32::new(MAGIC),
        version: U32::new(VERSION),
        total_size: U32::new(total as u32),
    };
    assert!(storage.write(HEADER_LEN as u32, payload));
    assert!(storage.write(0, header.as_bytes()));
    total
}
