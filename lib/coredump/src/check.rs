// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Self-test for a platform's coredump storage implementation.
//!
//! Ports get storage drivers wrong in ways that only surface during a real
//! crash -- offset math, write granularity, asynchronous erases. This
//! utility exercises the storage the same way a save does (erase, then
//! sequential writes at shifting offsets, with the header region written
//! last) and verifies every byte read back, so the driver can be validated
//! during bring-up instead of during the first field fault.
//!
//! Run it the way a save runs: with interrupts disabled. The verification
//! half is separate so the post-analysis can happen with the system live.

use crate::format::HEADER_LEN;
use crate::CoredumpStorage;

/// Which storage operation a failure was detected in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckOp {
    GetInfo,
    Prepare,
    Erase,
    Write,
    Clear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CheckFailure {
    pub op: CheckOp,
    /// Storage offset implicated, when meaningful.
    pub offset: usize,
}

/// Patterns chosen so adjacent writes are distinguishable; the first is
/// exactly one header long, mirroring the final write of a real save.
const PATTERN_A: [u8; HEADER_LEN] =
    [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xab];
const PATTERN_B: [u8; 7] = [0x5f, 0x5e, 0x5d, 0x5c, 0x5b, 0x5a, 0x59];

/// A value the patterns never contain, used to scrub the read buffer so a
/// read that "succeeds" without writing anything still fails the compare.
const SCRUB: u8 = 0xef;

fn verify_erased(byte: u8) -> bool {
    // Depends on storage topology: 0x00 for RAM, 0xff for flash.
    byte == 0x00 || byte == 0xff
}

fn expected_pattern(write_index: usize) -> &'static [u8] {
    if write_index % 2 == 0 {
        &PATTERN_A
    } else {
        &PATTERN_B
    }
}

/// Exercises `storage` destructively. Any stored coredump is lost.
pub fn run_storage_check(
    storage: &mut dyn CoredumpStorage,
) -> Result<(), CheckFailure> {
    let size = storage.info().size;
    if size == 0 {
        return Err(CheckFailure {
            op: CheckOp::GetInfo,
            offset: 0,
        });
    }
    if !storage.prepare() {
        return Err(CheckFailure {
            op: CheckOp::Prepare,
            offset: 0,
        });
    }

    // The whole region must erase, and read back as an erased value.
    if !storage.erase(0, size) {
        return Err(CheckFailure {
            op: CheckOp::Erase,
            offset: 0,
        });
    }
    let mut read_buf = [0u8; 16];
    let mut offset = 0;
    while offset < size {
        read_buf.fill(SCRUB);
        let n = read_buf.len().min(size - offset);
        if !storage.read(offset as u32, &mut read_buf[..n]) {
            return Err(CheckFailure {
                op: CheckOp::Erase,
                offset,
            });
        }
        if let Some(bad) =
            read_buf[..n].iter().position(|&b| !verify_erased(b))
        {
            return Err(CheckFailure {
                op: CheckOp::Erase,
                offset: offset + bad,
            });
        }
        offset += n;
    }

    // Writes alternate two co-prime pattern lengths so block boundaries and
    // offset math both get exercised; the header region is written last,
    // like a real save.
    let mut offset = PATTERN_A.len();
    let mut write_index = 1;
    while offset < size {
        let pattern = expected_pattern(write_index);
        let len = pattern.len().min(size - offset);
        if !storage.write(offset as u32, &pattern[..len]) {
            return Err(CheckFailure {
                op: CheckOp::Write,
                offset,
            });
        }
        offset += len;
        write_index += 1;
    }
    if !storage.write(0, &PATTERN_A) {
        return Err(CheckFailure {
            op: CheckOp::Write,
            offset: 0,
        });
    }

    // Verify every byte landed where the pattern sequence put it.
    let mut offset = PATTERN_A.len();
    let mut write_index = 1;
    while offset < size {
        let pattern = expected_pattern(write_index);
        let len = pattern.len().min(size - offset);
        read_buf.fill(SCRUB);
        if !storage.read(offset as u32, &mut read_buf[..len]) {
            return Err(CheckFailure {
                op: CheckOp::Write,
                offset,
            });
        }
        if read_buf[..len] != pattern[..len] {
            return Err(CheckFailure {
                op: CheckOp::Write,
                offset,
            });
        }
        offset += len;
        write_index += 1;
    }
    read_buf.fill(SCRUB);
    if !storage.read(0, &mut read_buf[..PATTERN_A.len()])
        || read_buf[..PATTERN_A.len()] != PATTERN_A
    {
        return Err(CheckFailure {
            op: CheckOp::Write,
            offset: 0,
        });
    }

    // Clear must at least take out the header magic so the region reads as
    // "no coredump".
    storage.clear();
    read_buf.fill(SCRUB);
    if !storage.read(0, &mut read_buf[..4]) {
        // An asynchronous clear may legitimately fail reads; accept it.
        return Ok(());
    }
    if read_buf[..4] == PATTERN_A[..4] {
        return Err(CheckFailure {
            op: CheckOp::Clear,
            offset: 0,
        });
    }
    Ok(())
}
