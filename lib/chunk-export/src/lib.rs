// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chunk export over a log stream.
//!
//! Before a real transport is integrated -- or on products whose only
//! uplink is a logging facility -- chunks can be emitted as base64 lines
//! and re-posted to the ingestion endpoint by whatever collects the logs.
//! Each chunk becomes one line:
//!
//! ```text
//! MC:<base64 of chunk>:
//! ```
//!
//! The `MC:`/`:` delimiters let a collector pick chunk lines out of
//! interleaved log output.

#![cfg_attr(not(test), no_std)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use packetizer::Packetizer;

/// Largest chunk the export path will emit. Kept small since log lines
/// are the transport.
pub const CHUNK_MAX_LEN: usize = 80;

pub const PREFIX: &str = "MC:";
pub const SUFFIX: &str = ":";

/// base64 output bytes for a CHUNK_MAX_LEN input.
const BASE64_MAX_LEN: usize = CHUNK_MAX_LEN.div_ceil(3) * 4;
const LINE_MAX_LEN: usize = PREFIX.len() + BASE64_MAX_LEN + SUFFIX.len();

/// Formats one chunk as an export line and hands it to `sink`.
///
/// # Panics
///
/// Panics if `chunk` exceeds [`CHUNK_MAX_LEN`]; the export buffer is sized
/// for chunks produced with that bound.
pub fn export_chunk(chunk: &[u8], sink: &mut dyn FnMut(&str)) {
    assert!(chunk.len() <= CHUNK_MAX_LEN);

    let mut line = [0u8; LINE_MAX_LEN];
    line[..PREFIX.len()].copy_from_slice(PREFIX.as_bytes());
    let mut n = PREFIX.len();

    // Cannot fail: the buffer is sized for the largest allowed chunk.
    n += STANDARD
        .encode_slice(chunk, &mut line[n..])
        .unwrap_or_else(|_| unreachable!());

    line[n..n + SUFFIX.len()].copy_from_slice(SUFFIX.as_bytes());
    n += SUFFIX.len();

    // base64 plus the delimiters is always ASCII.
    let line = core::str::from_utf8(&line[..n])
        .unwrap_or_else(|_| unreachable!());
    sink(line);
}

/// Drains every pending chunk through [`export_chunk`]. Returns the number
/// of chunks exported.
pub fn dump_chunks(
    packetizer: &mut Packetizer<'_>,
    sink: &mut dyn FnMut(&str),
) -> usize {
    let mut exported = 0;
    let mut buf = [0u8; CHUNK_MAX_LEN];
    while let Some(written) = packetizer.get_chunk(&mut buf) {
        export_chunk(&buf[..written], sink);
        exported += 1;
    }
    exported
}
