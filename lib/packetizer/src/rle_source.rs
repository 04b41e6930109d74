// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming run-length encoding of a data source.
//!
//! When a source is marked wrappable, the packetizer reads the message
//! through this stream instead: the underlying bytes are pulled, fed
//! through a [`runlen::Encoder`], and handed out at compressed-stream
//! offsets. The encoder is deterministic under any input chunking, so a
//! sizing pass and the later streaming pass produce identical output.
//!
//! Reads must be sequential -- exactly how the chunk transport consumes a
//! message. A read restarting at offset 0 resets the stream (the abort /
//! re-send path); any other seek fails.

use telemetry_api::DataSource;

/// Bytes emitted mid-window that didn't fit; at most one run sequence.
const CARRY_LEN: usize = 4;

pub(crate) struct RleStream {
    src_total: usize,
    encoder: runlen::Encoder,
    src_offset: usize,
    out_offset: usize,
    flushed: bool,
    carry: [u8; CARRY_LEN],
    carry_len: usize,
}

/// Computes the compressed size of the source's current message.
///
/// Returns `None` if the source fails a read, in which case the caller
/// falls back to sending uncompressed.
pub(crate) fn compressed_total(
    source: &mut dyn DataSource,
    src_total: usize,
) -> Option<usize> {
    let mut encoder = runlen::Encoder::new();
    let mut compressed = 0usize;
    let mut count = |chunk: &[u8]| {
        compressed += chunk.len();
        Ok::<(), core::convert::Infallible>(())
    };

    let mut buf = [0u8; 32];
    let mut offset = 0;
    while offset < src_total {
        let take = buf.len().min(src_total - offset);
        if !source.read_msg(offset as u32, &mut buf[..take]) {
            return None;
        }
        let _ = encoder.feed(&buf[..take], &mut count);
        offset += take;
    }
    let _ = encoder.flush(&mut count);
    Some(compressed)
}

impl RleStream {
    pub(crate) fn new(src_total: usize) -> Self {
        Self {
            src_total,
            encoder: runlen::Encoder::new(),
            src_offset: 0,
            out_offset: 0,
            flushed: false,
            carry: [0; CARRY_LEN],
            carry_len: 0,
        }
    }

    fn restart(&mut self) {
        *self = Self::new(self.src_total);
    }

    /// Reads `buf.len()` bytes of the compressed stream at `offset`.
    pub(crate) fn read(
        &mut self,
        source: &mut dyn DataSource,
        offset: u32,
        buf: &mut [u8],
    ) -> bool {
        if offset == 0 && self.out_offset != 0 {
            self.restart();
        }
        if offset as usize != self.out_offset {
            return false;
        }

        let mut written = 0;
        while written < buf.len() {
            // Drain leftovers from the previous window first.
            if self.carry_len != 0 {
                buf[written] = self.carry[0];
                self.carry.rotate_left(1);
                self.carry_len -= 1;
                written += 1;
                continue;
            }

            if self.src_offset >= self.src_total {
                if self.flushed {
                    // Compressed stream exhausted before the window filled;
                    // the caller asked past the promised size.
                    break;
                }
                let carry = &mut self.carry;
                let carry_len = &mut self.carry_len;
                let out = &mut buf[written..];
                let mut taken = 0;
                let _ = self.encoder.flush(|bytes: &[u8]| {
                    stash(bytes, out, &mut taken, carry, carry_len);
                    Ok::<(), core::convert::Infallible>(())
                });
                written += taken;
                self.flushed = true;
                continue;
            }

            // Pull one source byte at a time: a single byte can emit at
            // most one run sequence, which bounds the carry.
            let mut byte = [0u8; 1];
            if !source.read_msg(self.src_offset as u32, &mut byte) {
                return false;
            }
            self.src_offset += 1;

            let carry = &mut self.carry;
            let carry_len = &mut self.carry_len;
            let out = &mut buf[written..];
            let mut taken = 0;
            let _ = self.encoder.feed(&byte, |bytes: &[u8]| {
                stash(bytes, out, &mut taken, carry, carry_len);
                Ok::<(), core::convert::Infallible>(())
            });
            written += taken;
        }

        self.out_offset += written;
        written == buf.len()
    }
}

/// Copies `bytes` into `out` (tracking `taken`), spilling into the carry
/// buffer once the window is full.
fn stash(
    bytes: &[u8],
    out: &mut [u8],
    taken: &mut usize,
    carry: &mut [u8; CARRY_LEN],
    carry_len: &mut usize,
) {
    for &b in bytes {
        if *taken < out.len() {
            out[*taken] = b;
            *taken += 1;
        } else {
            debug_assert!(*carry_len < CARRY_LEN);
            carry[*carry_len] = b;
            *carry_len += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SliceSource(&'static [u8]);

    impl DataSource for SliceSource {
        fn has_more_msgs(&mut self) -> Option<usize> {
            Some(self.0.len())
        }
        fn read_msg(&mut self, offset: u32, buf: &mut [u8]) -> bool {
            let offset = offset as usize;
            if offset + buf.len() > self.0.len() {
                return false;
            }
            buf.copy_from_slice(&self.0[offset..offset + buf.len()]);
            true
        }
        fn mark_msg_read(&mut self) {}
    }

    const INPUT: &[u8] = &[
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 5, 5, 5, 5, 5, 9,
    ];

    fn reference_compressed() -> Vec<u8> {
        let mut out = Vec::new();
        runlen::compress(INPUT, |c| {
            out.extend_from_slice(c);
            Ok::<(), core::convert::Infallible>(())
        })
        .unwrap();
        out
    }

    #[test]
    fn sizing_matches_stream_output() {
        let mut source = SliceSource(INPUT);
        let total = compressed_total(&mut source, INPUT.len()).unwrap();
        assert_eq!(total, reference_compressed().len());
    }

    #[test]
    fn sequential_windows_reproduce_compressed_stream() {
        let expected = reference_compressed();
        for window in [1usize, 2, 3, 5, 64] {
            let mut source = SliceSource(INPUT);
            let mut stream = RleStream::new(INPUT.len());
            let mut out = Vec::new();
            let mut offset = 0;
            while offset < expected.len() {
                let n = window.min(expected.len() - offset);
                let mut buf = vec![0u8; n];
                assert!(stream.read(&mut source, offset as u32, &mut buf));
                out.extend_from_slice(&buf);
                offset += n;
            }
            assert_eq!(out, expected, "window {window}");
        }
    }

    #[test]
    fn restart_from_zero_is_supported() {
        let expected = reference_compressed();
        let mut source = SliceSource(INPUT);
        let mut stream = RleStream::new(INPUT.len());

        let mut buf = vec![0u8; expected.len().min(5)];
        assert!(stream.read(&mut source, 0, &mut buf));

        // Rewind, as after a packetizer abort, and drain fully.
        let mut full = vec![0u8; expected.len()];
        assert!(stream.read(&mut source, 0, &mut full));
        assert_eq!(full, expected);
    }

    #[test]
    fn interior_seeks_are_rejected() {
        let mut source = SliceSource(INPUT);
        let mut stream = RleStream::new(INPUT.len());
        let mut buf = [0u8; 4];
        assert!(stream.read(&mut source, 0, &mut buf));
        assert!(!stream.read(&mut source, 99, &mut buf));
    }
}
