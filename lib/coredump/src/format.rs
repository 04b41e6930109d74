// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The on-storage coredump format.
//!
//! A saved coredump is a 12-byte header, a sequence of TLV blocks, and a
//! footer:
//!
//! ```text
//! { magic, version, total_size }
//! { block_type, rsvd[3], address, length } payload[length]   (repeated)
//! { magic, flags, rsvd[8] }
//! ```
//!
//! The header is written *last*: its magic is the commit point, so a reader
//! finding anything else at offset 0 treats the region as empty. The footer
//! carries a truncation flag for saves that ran out of storage -- a truncated
//! coredump is still committed, just incomplete.
//!
//! All integers are little-endian; blocks are 4-byte aligned via padding
//! blocks so word-granular storage and parsers stay happy.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// "CORE", little-endian.
pub const MAGIC: u32 = 0x4552_4f43;

/// Version 2: truncation supported, footer added.
pub const VERSION: u32 = 2;

/// "DUMP", little-endian.
pub const FOOTER_MAGIC: u32 = 0x504d_5544;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CoredumpHeader {
    pub magic: U32,
    pub version: U32,
    pub total_size: U32,
}

pub const HEADER_LEN: usize = core::mem::size_of::<CoredumpHeader>();
const_assert_eq!(HEADER_LEN, 12);

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FooterFlags: u32 {
        /// The save ran out of storage and one or more blocks were cut
        /// short or omitted.
        const TRUNCATED = 1 << 0;
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CoredumpFooter {
    pub magic: U32,
    pub flags: U32,
    // Reserved for future footer additions such as a CRC over the contents.
    pub rsvd: [u8; 8],
}

pub const FOOTER_LEN: usize = core::mem::size_of::<CoredumpFooter>();
const_assert_eq!(FOOTER_LEN, 16);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    CurrentRegisters = 0,
    MemoryRegion = 1,
    DeviceSerial = 2,
    HardwareVersion = 4,
    TraceReason = 5,
    Padding = 6,
    MachineType = 7,
    ArmV6orV7Mpu = 9,
    SoftwareVersion = 10,
    SoftwareType = 11,
    BuildId = 12,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BlockHeader {
    pub block_type: u8,
    pub rsvd: [u8; 3],
    /// Source address of the payload; 0 for non-memory blocks.
    pub address: U32,
    pub length: U32,
}

pub const BLOCK_HEADER_LEN: usize = core::mem::size_of::<BlockHeader>();
const_assert_eq!(BLOCK_HEADER_LEN, 12);

impl BlockHeader {
    pub fn new(block_type: BlockType, address: u32, length: usize) -> Self {
        Self {
            block_type: block_type as u8,
            rsvd: [0; 3],
            address: U32::new(address),
            length: U32::new(length as u32),
        }
    }
}

/// Machine type encoding follows the ELF `e_machine` half-word, with a
/// subtype extension in the upper 16 bits.
pub const MACHINE_TYPE_SUBTYPE_OFFSET: u32 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MachineType {
    None = 0,
    Arm = 40,
    Xtensa = 94,
    Aarch64 = 183,
    XtensaLx106 = (1 << MACHINE_TYPE_SUBTYPE_OFFSET) | 94,
}

impl MachineType {
    /// The machine type of the code doing the saving.
    pub fn current() -> Self {
        if cfg!(target_arch = "arm") {
            MachineType::Arm
        } else if cfg!(target_arch = "aarch64") {
            MachineType::Aarch64
        } else if cfg!(target_arch = "xtensa") {
            MachineType::Xtensa
        } else {
            MachineType::None
        }
    }
}

/// Header prefixed to a [`CachedMemory`](crate::RegionKind::CachedMemory)
/// region's data. The capture ran earlier (e.g. before a cache was torn
/// down); a valid cached block is rewritten as a plain memory block at the
/// address the data was cached from.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CachedBlockHeader {
    /// Nonzero when the cached contents are meaningful.
    pub valid: U32,
    pub cached_address: U32,
    pub size: U32,
}

pub const CACHED_BLOCK_HEADER_LEN: usize =
    core::mem::size_of::<CachedBlockHeader>();
