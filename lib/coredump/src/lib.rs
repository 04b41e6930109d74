// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-mortem coredump capture.
//!
//! When a fault handler runs, it hands this crate the captured register
//! frame, a trace reason, and the memory regions worth keeping. The save
//! runs with interrupts disabled on whatever platform state survived the
//! crash, so the rules are strict: no allocation, no locks, storage access
//! only through the narrow [`CoredumpStorage`] trait, and any unrecoverable
//! storage error is reported to the caller (whose only recourse in a fault
//! handler is to reboot).
//!
//! Save ordering is what makes the result trustworthy:
//!
//! 1. If storage already holds a valid coredump, the save is refused -- in a
//!    crash loop, the dump of the *first* crash is the valuable one.
//! 2. Blocks are written front to back, starting past the header.
//! 3. If space runs out, the current block is truncated to a word-aligned
//!    fit and the footer records the truncation.
//! 4. The header is written last. Its magic is the commit point: a reader
//!    never sees a torn save, only "no coredump" or a complete one.
//!
//! [`compute_save_size`] runs the identical layout pass with writes
//! suppressed, so a port can size its storage region up front.

#![cfg_attr(not(test), no_std)]

pub mod buffered;
pub mod check;
pub mod format;
mod storage;

pub use storage::{
    has_valid_coredump, CoredumpDataSource, CoredumpStorage,
    RamCoredumpStorage, StorageInfo,
};

use format::{
    BlockHeader, BlockType, CachedBlockHeader, CoredumpFooter, CoredumpHeader,
    FooterFlags, MachineType, BLOCK_HEADER_LEN, CACHED_BLOCK_HEADER_LEN,
    FOOTER_LEN, HEADER_LEN,
};
use telemetry_api::DevicePlatform;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes as _, IntoBytes as _};

/// Kinds of memory region a fault handler can ask to be captured.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Memory,
    /// Backing hardware tolerates only 32-bit accesses (e.g. memory-mapped
    /// peripheral registers); copied one word at a time.
    MemoryWordAccessOnly,
    /// Data captured earlier into a buffer, prefixed by a
    /// [`CachedBlockHeader`]; recorded at the original address.
    CachedMemory,
    /// An unrolled MPU register capture.
    ArmV6orV7MpuUnrolled,
}

/// One region to capture.
///
/// `data` is the bytes to store and `address` the address they describe.
/// In a fault handler the slice typically aliases the address itself; in a
/// cached region it points at the earlier capture instead.
#[derive(Copy, Clone)]
pub struct Region<'a> {
    pub kind: RegionKind,
    pub address: u32,
    pub data: &'a [u8],
}

impl<'a> Region<'a> {
    pub fn memory(address: u32, data: &'a [u8]) -> Self {
        Self {
            kind: RegionKind::Memory,
            address,
            data,
        }
    }

    pub fn word_access_only(address: u32, data: &'a [u8]) -> Self {
        Self {
            kind: RegionKind::MemoryWordAccessOnly,
            address,
            data,
        }
    }

    /// `data` must begin with a [`CachedBlockHeader`].
    pub fn cached(data: &'a [u8]) -> Self {
        Self {
            kind: RegionKind::CachedMemory,
            address: 0,
            data,
        }
    }
}

/// Everything the fault handler provides for one save.
pub struct SaveInfo<'a> {
    /// The captured register frame, stored as a CurrentRegisters block.
    pub regs: Option<&'a [u8]>,
    /// Why the system faulted; mirrors the reboot-tracking reason.
    pub trace_reason: u32,
    /// Architecture-specific regions (fault status registers, MPU state).
    pub arch_regions: &'a [Region<'a>],
    /// SDK-internal regions (event and log rings, reboot record).
    pub sdk_regions: &'a [Region<'a>],
    /// Caller-selected regions, captured last.
    pub regions: &'a [Region<'a>],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SaveError {
    /// No caller regions were provided.
    InvalidArgument,
    /// Storage reported zero size or an unreadable header.
    NoStorage,
    /// A valid coredump is already stored; not overwriting it.
    AlreadyStored,
    PrepareFailed,
    EraseFailed,
    /// A storage write failed partway; the region contents are undefined
    /// but uncommitted (no valid header was written).
    StorageFailed,
}

/// Result of a completed save.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SavedCoredump {
    pub total_size: usize,
    pub truncated: bool,
}

struct WriteCtx<'a> {
    /// `None` when only computing the layout size.
    storage: Option<&'a mut dyn CoredumpStorage>,
    offset: usize,
    /// Bytes usable for blocks (footer space excluded). Unused in
    /// size-only mode, where nothing is bounded.
    storage_size: usize,
    truncated: bool,
    write_error: bool,
}

impl WriteCtx<'_> {
    fn compute_only(&self) -> bool {
        self.storage.is_none()
    }

    fn write(&mut self, data: &[u8]) -> bool {
        if let Some(storage) = &mut self.storage {
            if !storage.write(self.offset as u32, data) {
                self.write_error = true;
                return false;
            }
        }
        self.offset += data.len();
        true
    }
}

/// Writes one block. Returns false when no further blocks should be
/// attempted (storage exhausted or a write failed).
fn write_block(
    ctx: &mut WriteCtx<'_>,
    block_type: BlockType,
    address: u32,
    payload: &[u8],
    word_reads_only: bool,
) -> bool {
    if payload.is_empty() {
        return true;
    }

    let mut payload = payload;
    let total = BLOCK_HEADER_LEN + payload.len();
    if !ctx.compute_only() {
        let free = ctx.storage_size.saturating_sub(ctx.offset);
        if free < total {
            // Out of room; truncate the payload to a word-aligned fit so
            // the block is still parseable, and stop after it.
            ctx.truncated = true;
            if free < BLOCK_HEADER_LEN {
                return false;
            }
            let fit = (free - BLOCK_HEADER_LEN) & !3;
            if fit == 0 {
                return false;
            }
            payload = &payload[..fit];
        }
    }

    let header = BlockHeader::new(block_type, address, payload.len());
    if !ctx.write(header.as_bytes()) {
        return false;
    }

    if word_reads_only && payload.len() % 4 == 0 {
        // The source only tolerates 32-bit accesses; typically a small
        // memory-mapped register bank.
        for word in payload.chunks_exact(4) {
            if !ctx.write(word) {
                return false;
            }
        }
    } else if !ctx.write(payload) {
        return false;
    }

    !ctx.truncated
}

fn write_info_block(
    ctx: &mut WriteCtx<'_>,
    block_type: BlockType,
    payload: &[u8],
) -> bool {
    write_block(ctx, block_type, 0, payload, false)
}

fn write_device_info_blocks(
    ctx: &mut WriteCtx<'_>,
    platform: &dyn DevicePlatform,
) -> bool {
    if let Some(build_id) = platform.build_id() {
        if !write_info_block(ctx, BlockType::BuildId, &build_id.0) {
            return false;
        }
    }

    let info = platform.device_info();
    let blocks = [
        (BlockType::DeviceSerial, info.device_serial),
        (BlockType::SoftwareVersion, info.software_version),
        (BlockType::SoftwareType, info.software_type),
        (BlockType::HardwareVersion, info.hardware_version),
    ];
    for (block_type, value) in blocks {
        if !write_info_block(ctx, block_type, value.as_bytes()) {
            return false;
        }
    }

    let machine = (MachineType::current() as u32).to_le_bytes();
    write_info_block(ctx, BlockType::MachineType, &machine)
}

/// Pads the write position out to a word boundary with a padding block.
fn insert_padding_if_necessary(ctx: &mut WriteCtx<'_>) {
    let remainder = ctx.offset % 4;
    if remainder == 0 {
        return;
    }
    let pad = [0u8; 3];
    write_info_block(ctx, BlockType::Padding, &pad[..4 - remainder]);
}

fn write_regions(ctx: &mut WriteCtx<'_>, regions: &[Region<'_>]) -> bool {
    for region in regions {
        insert_padding_if_necessary(ctx);

        let (block_type, address, data, word_reads) = match region.kind {
            RegionKind::Memory => (
                BlockType::MemoryRegion,
                region.address,
                region.data,
                false,
            ),
            RegionKind::MemoryWordAccessOnly => (
                BlockType::MemoryRegion,
                region.address,
                region.data,
                true,
            ),
            RegionKind::ArmV6orV7MpuUnrolled => (
                BlockType::ArmV6orV7Mpu,
                region.address,
                region.data,
                false,
            ),
            RegionKind::CachedMemory => {
                let Ok((header, payload)) =
                    CachedBlockHeader::read_from_prefix(region.data)
                else {
                    continue;
                };
                if header.valid.get() == 0 {
                    // Nothing was captured into this buffer; skip it.
                    continue;
                }
                let size = (header.size.get() as usize).min(payload.len());
                (
                    BlockType::MemoryRegion,
                    header.cached_address.get(),
                    &payload[..size],
                    false,
                )
            }
        };

        if !write_block(ctx, block_type, address, data, word_reads) {
            return false;
        }
    }
    true
}

fn write_sections(
    ctx: &mut WriteCtx<'_>,
    platform: &dyn DevicePlatform,
    info: &SaveInfo<'_>,
) -> Result<usize, SaveError> {
    // The header is written last as the commit mark; start past it.
    ctx.offset = HEADER_LEN;

    if let Some(regs) = info.regs {
        if !write_info_block(ctx, BlockType::CurrentRegisters, regs)
            && ctx.write_error
        {
            return Err(SaveError::StorageFailed);
        }
    }
    if !write_device_info_blocks(ctx, platform) && ctx.write_error {
        return Err(SaveError::StorageFailed);
    }
    if !write_info_block(
        ctx,
        BlockType::TraceReason,
        &info.trace_reason.to_le_bytes(),
    ) && ctx.write_error
    {
        return Err(SaveError::StorageFailed);
    }

    let completed = write_regions(ctx, info.arch_regions)
        && write_regions(ctx, info.sdk_regions)
        && write_regions(ctx, info.regions);
    if !completed && ctx.write_error {
        return Err(SaveError::StorageFailed);
    }

    let footer = CoredumpFooter {
        magic: U32::new(format::FOOTER_MAGIC),
        flags: U32::new(if ctx.truncated {
            FooterFlags::TRUNCATED.bits()
        } else {
            0
        }),
        rsvd: [0; 8],
    };
    if !ctx.write(footer.as_bytes()) {
        return Err(SaveError::StorageFailed);
    }

    let total_size = ctx.offset;

    // Commit: the header goes in last, at offset 0.
    ctx.offset = 0;
    let header = CoredumpHeader {
        magic: U32::new(format::MAGIC),
        version: U32::new(format::VERSION),
        total_size: U32::new(total_size as u32),
    };
    if !ctx.write(header.as_bytes()) {
        return Err(SaveError::StorageFailed);
    }

    Ok(total_size)
}

/// Saves a coredump. Refuses to overwrite an existing valid one.
pub fn save(
    storage: &mut dyn CoredumpStorage,
    platform: &dyn DevicePlatform,
    info: &SaveInfo<'_>,
) -> Result<SavedCoredump, SaveError> {
    if info.regions.is_empty() {
        // Sanity check that the fault handler gave us something to save.
        return Err(SaveError::InvalidArgument);
    }

    if !storage.prepare() {
        return Err(SaveError::PrepareFailed);
    }

    let storage_info = storage.info();
    if storage_info.size == 0 {
        return Err(SaveError::NoStorage);
    }
    if has_valid_coredump_or_unreadable(storage)? {
        return Err(SaveError::AlreadyStored);
    }

    if !storage.erase(0, storage_info.size) {
        return Err(SaveError::EraseFailed);
    }

    let mut ctx = WriteCtx {
        storage: Some(storage),
        offset: 0,
        // Always leave room for the footer.
        storage_size: storage_info.size.saturating_sub(FOOTER_LEN),
        truncated: false,
        write_error: false,
    };
    let total_size = write_sections(&mut ctx, platform, info)?;

    Ok(SavedCoredump {
        total_size,
        truncated: ctx.truncated,
    })
}

fn has_valid_coredump_or_unreadable(
    storage: &mut dyn CoredumpStorage,
) -> Result<bool, SaveError> {
    let mut raw = [0u8; HEADER_LEN];
    if !storage.read(0, &mut raw) {
        // Expected when a previous clear is still asynchronous; the
        // storage is not safe to touch.
        return Err(SaveError::NoStorage);
    }
    let header = CoredumpHeader::read_from_bytes(&raw)
        .unwrap_or_else(|_| unreachable!());
    Ok(header.magic.get() == format::MAGIC)
}

/// Computes the storage bytes a save of `info` would need, without I/O.
pub fn compute_save_size(
    platform: &dyn DevicePlatform,
    info: &SaveInfo<'_>,
) -> usize {
    let mut ctx = WriteCtx {
        storage: None,
        offset: 0,
        storage_size: 0,
        truncated: false,
        write_error: false,
    };
    write_sections(&mut ctx, platform, info).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_api::{BuildId, CurrentTime, DeviceInfo};

    struct FakePlatform;

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
            Some(BuildId([0x1d; 20]))
        }
        fn current_time(&self) -> CurrentTime {
            CurrentTime::Unknown
        }
    }

    /// Walks the TLV blocks of a saved image, returning
    /// `(type, address, payload)` tuples.
    fn parse_blocks(image: &[u8]) -> Vec<(u8, u32, Vec<u8>)> {
        let header = CoredumpHeader::read_from_bytes(&image[..HEADER_LEN])
            .unwrap();
        assert_eq!(header.magic.get(), format::MAGIC);
        assert_eq!(header.version.get(), format::VERSION);
        let total = header.total_size.get() as usize;

        let mut blocks = Vec::new();
        let mut offset = HEADER_LEN;
        let body_end = total - FOOTER_LEN;
        while offset < body_end {
            let block = BlockHeader::read_from_bytes(
                &image[offset..offset + BLOCK_HEADER_LEN],
            )
            .unwrap();
            offset += BLOCK_HEADER_LEN;
            let len = block.length.get() as usize;
            blocks.push((
                block.block_type,
                block.address.get(),
                image[offset..offset + len].to_vec(),
            ));
            offset += len;
        }
        assert_eq!(offset, body_end);

        let footer = CoredumpFooter::read_from_bytes(
            &image[body_end..body_end + FOOTER_LEN],
        )
        .unwrap();
        assert_eq!(footer.magic.get(), format::FOOTER_MAGIC);
        blocks
    }

    fn image_footer_flags(image: &[u8]) -> u32 {
        let header =
            CoredumpHeader::read_from_bytes(&image[..HEADER_LEN]).unwrap();
        let total = header.total_size.get() as usize;
        let footer = CoredumpFooter::read_from_bytes(
            &image[total - FOOTER_LEN..total],
        )
        .unwrap();
        footer.flags.get()
    }

    fn basic_save_info<'a>(regions: &'a [Region<'a>]) -> SaveInfo<'a> {
        SaveInfo {
            regs: Some(b"registerframe123"),
            trace_reason: 0x8001,
            arch_regions: &[],
            sdk_regions: &[],
            regions,
        }
    }

    #[test]
    fn save_layout_roundtrips() {
        let mut region_data = [0u8; 64];
        for (i, b) in region_data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let regions = [Region::memory(0x2000_0000, &region_data)];
        let info = basic_save_info(&regions);

        let mut backing = [0xffu8; 512];
        let mut storage = RamCoredumpStorage::new(&mut backing);
        let saved = save(&mut storage, &FakePlatform, &info).unwrap();
        assert!(!saved.truncated);
        assert_eq!(saved.total_size, compute_save_size(&FakePlatform, &info));

        let blocks = parse_blocks(&backing);
        let types: Vec<u8> = blocks.iter().map(|b| b.0).collect();
        assert_eq!(
            types,
            vec![
                BlockType::CurrentRegisters as u8,
                BlockType::BuildId as u8,
                BlockType::DeviceSerial as u8,
                BlockType::SoftwareVersion as u8,
                BlockType::SoftwareType as u8,
                BlockType::HardwareVersion as u8,
                BlockType::MachineType as u8,
                BlockType::TraceReason as u8,
                BlockType::MemoryRegion as u8,
            ]
        );
        assert_eq!(blocks[0].2, b"registerframe123");
        assert_eq!(blocks[1].2, vec![0x1d; 20]);
        assert_eq!(blocks[2].2, b"DAABBCCDD");
        assert_eq!(blocks[7].2, 0x8001u32.to_le_bytes());
        let memory = &blocks[8];
        assert_eq!(memory.1, 0x2000_0000);
        assert_eq!(memory.2, region_data.to_vec());

        assert_eq!(image_footer_flags(&backing), 0);
    }

    #[test]
    fn refuses_to_overwrite_existing_coredump() {
        let regions = [Region::memory(0, b"abcd")];
        let info = basic_save_info(&regions);

        let mut backing = [0u8; 512];
        let mut storage = RamCoredumpStorage::new(&mut backing);
        save(&mut storage, &FakePlatform, &info).unwrap();

        // The first crash of a loop wins.
        assert_eq!(
            save(&mut storage, &FakePlatform, &info),
            Err(SaveError::AlreadyStored)
        );

        storage.clear();
        save(&mut storage, &FakePlatform, &info).unwrap();
    }

    #[test]
    fn truncates_when_storage_is_short() {
        let big = [0xaau8; 4096];
        let regions = [Region::memory(0x2000_0000, &big)];
        let info = basic_save_info(&regions);

        let mut backing = [0u8; 256];
        let mut storage = RamCoredumpStorage::new(&mut backing);
        let saved = save(&mut storage, &FakePlatform, &info).unwrap();
        assert!(saved.truncated);
        assert!(saved.total_size <= 256);

        let blocks = parse_blocks(&backing);
        let memory = blocks.last().unwrap();
        assert_eq!(memory.0, BlockType::MemoryRegion as u8);
        // Truncated to a word-aligned length that still fits.
        assert!(memory.2.len() < big.len());
        assert_eq!(memory.2.len() % 4, 0);

        assert_eq!(
            image_footer_flags(&backing),
            FooterFlags::TRUNCATED.bits()
        );
    }

    #[test]
    fn word_access_region_copies_exactly() {
        let words = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let regions = [Region::word_access_only(0x4000_0000, &words)];
        let info = basic_save_info(&regions);

        let mut backing = [0u8; 512];
        let mut storage = RamCoredumpStorage::new(&mut backing);
        save(&mut storage, &FakePlatform, &info).unwrap();

        let blocks = parse_blocks(&backing);
        let memory = blocks.last().unwrap();
        assert_eq!(memory.1, 0x4000_0000);
        assert_eq!(memory.2, words.to_vec());
    }

    #[test]
    fn cached_regions_rewrite_to_original_address() {
        use zerocopy::IntoBytes as _;

        let mut cached = Vec::new();
        let valid_header = CachedBlockHeader {
            valid: U32::new(1),
            cached_address: U32::new(0x0800_4000),
            size: U32::new(4),
        };
        cached.extend_from_slice(valid_header.as_bytes());
        cached.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let mut invalid = Vec::new();
        let invalid_header = CachedBlockHeader {
            valid: U32::new(0),
            cached_address: U32::new(0x0800_8000),
            size: U32::new(4),
        };
        invalid.extend_from_slice(invalid_header.as_bytes());
        invalid.extend_from_slice(&[1, 2, 3, 4]);

        let regions = [
            Region::cached(&invalid),
            Region::cached(&cached),
            Region::memory(0x2000_0000, b"tail"),
        ];
        let info = basic_save_info(&regions);

        let mut backing = [0u8; 512];
        let mut storage = RamCoredumpStorage::new(&mut backing);
        save(&mut storage, &FakePlatform, &info).unwrap();

        let blocks = parse_blocks(&backing);
        // The invalid cached region was skipped entirely.
        assert!(!blocks.iter().any(|b| b.1 == 0x0800_8000));
        let cached_block = blocks
            .iter()
            .find(|b| b.1 == 0x0800_4000)
            .expect("cached block missing");
        assert_eq!(cached_block.0, BlockType::MemoryRegion as u8);
        assert_eq!(cached_block.2, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn blocks_are_word_aligned_via_padding() {
        // A 5-byte region forces padding before the following block.
        let regions = [
            Region::memory(0x1000, b"hello"),
            Region::memory(0x2000, b"next"),
        ];
        let info = basic_save_info(&regions);

        let mut backing = [0u8; 512];
        let mut storage = RamCoredumpStorage::new(&mut backing);
        save(&mut storage, &FakePlatform, &info).unwrap();

        let blocks = parse_blocks(&backing);
        let padding: Vec<_> = blocks
            .iter()
            .filter(|b| b.0 == BlockType::Padding as u8)
            .collect();
        assert!(!padding.is_empty());
        // Both memory regions surfaced intact.
        assert!(blocks.iter().any(|b| b.2 == b"hello"));
        assert!(blocks.iter().any(|b| b.2 == b"next"));
    }

    #[test]
    fn no_regions_is_invalid() {
        let info = SaveInfo {
            regs: None,
            trace_reason: 0,
            arch_regions: &[],
            sdk_regions: &[],
            regions: &[],
        };
        let mut backing = [0u8; 64];
        let mut storage = RamCoredumpStorage::new(&mut backing);
        assert_eq!(
            save(&mut storage, &FakePlatform, &info),
            Err(SaveError::InvalidArgument)
        );
    }

    #[test]
    fn compute_size_matches_actual_layout() {
        let data = [0u8; 100];
        let regions = [
            Region::memory(0x1000, &data[..37]),
            Region::word_access_only(0x2000, &data[..8]),
        ];
        let info = basic_save_info(&regions);

        let needed = compute_save_size(&FakePlatform, &info);
        let mut backing = vec![0u8; needed];
        let mut storage = RamCoredumpStorage::new(&mut backing);
        let saved = save(&mut storage, &FakePlatform, &info).unwrap();
        assert!(!saved.truncated);
        assert_eq!(saved.total_size, needed);
    }

    #[test]
    fn write_failure_surfaces_as_storage_error() {
        struct FailingStorage {
            inner_region: [u8; 256],
            fail_after: usize,
            writes: usize,
        }
        impl CoredumpStorage for FailingStorage {
            fn info(&self) -> StorageInfo {
                StorageInfo {
                    size: self.inner_region.len(),
                    sector_size: self.inner_region.len(),
                }
            }
            fn read(&mut self, offset: u32, buf: &mut [u8]) -> bool {
                let offset = offset as usize;
                buf.copy_from_slice(
                    &self.inner_region[offset..offset + buf.len()],
                );
                true
            }
            fn write(&mut self, offset: u32, data: &[u8]) -> bool {
                self.writes += 1;
                if self.writes > self.fail_after {
                    return false;
                }
                let offset = offset as usize;
                self.inner_region[offset..offset + data.len()]
                    .copy_from_slice(data);
                true
            }
            fn erase(&mut self, _offset: u32, _len: usize) -> bool {
                self.inner_region.fill(0);
                true
            }
            fn clear(&mut self) {}
        }

        let regions = [Region::memory(0, b"abcd")];
        let info = basic_save_info(&regions);
        let mut storage = FailingStorage {
            inner_region: [0; 256],
            fail_after: 3,
            writes: 0,
        };
        assert_eq!(
            save(&mut storage, &FakePlatform, &info),
            Err(SaveError::StorageFailed)
        );
        // No header was committed.
        assert_eq!(&storage.inner_region[..4], &[0, 0, 0, 0]);
    }
}
