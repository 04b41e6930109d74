// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A very simple Run-Length Encoding (RLE) compression method.
//!
//! This is intended for squeezing transport messages with sections of very
//! low entropy -- zero-filled RAM regions in coredumps, repeated padding in
//! recordings -- before they are chunked for upload. The message-type header
//! of a compressed message carries a flag bit so the receiving side knows to
//! decompress.
//!
//! The encoder is explicitly stateful ([`Encoder`]) because the transport
//! pulls data in windows: input arrives in arbitrary slices across multiple
//! calls, and a run may span any number of them. Feeding the same byte
//! stream through `feed` in different chunkings produces the identical
//! output stream, which is what lets a caller size the compressed message
//! with one pass and then stream it with another.

#![cfg_attr(not(test), no_std)]

/// Internal definition of how long the run count is. Tuning this might
/// improve performance, though its current value seems optimal in practice.
type RunType = u8;

/// The byte used to signal that data is being interrupted for a run. Any
/// value works as long as both sides agree; this one is simply an infrequent
/// byte in the payloads we compress.
const ESC: u8 = 0xBA;

/// Incremental RLE encoder.
///
/// Feed input with [`feed`](Encoder::feed); when the input stream is
/// complete, call [`flush`](Encoder::flush) exactly once to emit the
/// trailing run. Output is handed to a callback in small slices so the
/// caller can count, buffer, or copy without an intermediate allocation.
#[derive(Default)]
pub struct Encoder {
    run: Option<(u8, usize)>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compresses `input`, emitting completed output to `out`.
    ///
    /// Bytes belonging to a run still open at the end of `input` are
    /// retained in the encoder state, not emitted.
    pub fn feed<E>(
        &mut self,
        input: &[u8],
        mut out: impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        for &byte in input {
            if let Some((current_byte, current_len)) = &mut self.run {
                if byte == *current_byte
                    && *current_len < usize::from(RunType::MAX) + 1
                {
                    *current_len += 1;
                    continue;
                }
                let (b, n) = (*current_byte, *current_len);
                generate_run(b, n, &mut out)?;
            }
            self.run = Some((byte, 1));
        }
        Ok(())
    }

    /// Emits the trailing run, if any, and resets the encoder.
    pub fn flush<E>(
        &mut self,
        mut out: impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        if let Some((byte, len)) = self.run.take() {
            generate_run(byte, len, &mut out)?;
        }
        Ok(())
    }
}

/// One-shot compression of a complete input.
///
/// `out` may abort compression by returning `Err`; if it cannot fail,
/// `core::convert::Infallible` is the appropriate error type.
pub fn compress<E>(
    input: &[u8],
    mut out: impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    let mut enc = Encoder::new();
    enc.feed(input, &mut out)?;
    enc.flush(&mut out)
}

/// Returns the compressed size of `input` without producing output.
pub fn compressed_size(input: &[u8]) -> usize {
    let mut n = 0;
    let _ = compress(input, |chunk| {
        n += chunk.len();
        Ok::<(), core::convert::Infallible>(())
    });
    n
}

fn generate_run<E>(
    byte: u8,
    count: usize,
    out: &mut impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    if count < 4 && byte != ESC {
        // A short run of a plain byte is cheaper emitted literally.
        for _ in 0..count {
            out(&[byte])?;
        }
    } else {
        out(&[ESC, byte])?;
        out(&[(count - 1) as RunType])?;
    }
    Ok(())
}

/// State that you're expected to hang on to while decompressing something.
pub struct Decompressor(DState);

impl Decompressor {
    pub fn is_idle(&self) -> bool {
        matches!(self.0, DState::Copying)
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self(DState::Copying)
    }
}

enum DState {
    /// Not in a run; copying bytes and watching for the escape byte.
    Copying,
    /// Producing the given byte N times, where the count holds `N-1`.
    Repeating(u8, RunType),
    /// Saw an escape byte; waiting for the byte to repeat in case the input
    /// was exhausted mid-sequence.
    AwaitingByte,
    /// Saw the escape byte and the repeat byte; waiting for the count.
    AwaitingCount(u8),
}

/// Decompresses a chunk of `input`, writing results to the start of
/// `output`. Returns the prefix of `output` that was written.
///
/// `input` is advanced past the bytes consumed. Decompression stops when
/// either slice is exhausted; call again with more input (or an empty input
/// and a fresh output buffer, until [`Decompressor::is_idle`]) to continue.
pub fn decompress<'a>(
    state: &mut Decompressor,
    input: &mut &[u8],
    output: &'a mut [u8],
) -> &'a [u8] {
    fn take_byte(input: &mut &[u8]) -> Option<u8> {
        let (first, rest) = input.split_first()?;
        *input = rest;
        Some(*first)
    }

    let mut n = 0;
    while n < output.len() {
        match &mut state.0 {
            DState::Repeating(byte, count) => {
                output[n] = *byte;
                n += 1;
                if let Some(new_count) = count.checked_sub(1) {
                    *count = new_count;
                } else {
                    state.0 = DState::Copying;
                }
            }
            DState::Copying => match take_byte(input) {
                Some(ESC) => state.0 = DState::AwaitingByte,
                Some(byte) => {
                    output[n] = byte;
                    n += 1;
                }
                None => break,
            },
            DState::AwaitingByte => match take_byte(input) {
                Some(byte) => state.0 = DState::AwaitingCount(byte),
                None => break,
            },
            DState::AwaitingCount(byte) => match take_byte(input) {
                Some(count) => state.0 = DState::Repeating(*byte, count),
                None => break,
            },
        }
    }

    &output[..n]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn compress_to_vec(input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        compress(input, |chunk| {
            out.extend_from_slice(chunk);
            Ok::<(), core::convert::Infallible>(())
        })
        .unwrap();
        out
    }

    fn decompress_to_vec(mut input: &[u8]) -> Vec<u8> {
        let mut state = Decompressor::default();
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let chunk = decompress(&mut state, &mut input, &mut buf);
            if chunk.is_empty() && input.is_empty() && state.is_idle() {
                break;
            }
            out.extend_from_slice(chunk);
            if input.is_empty() && state.is_idle() {
                break;
            }
        }
        out
    }

    #[test]
    fn short_runs_stay_literal() {
        assert_eq!(compress_to_vec(b"abc"), b"abc");
        assert_eq!(compress_to_vec(b"aabb"), b"aabb");
    }

    #[test]
    fn long_runs_collapse() {
        assert_eq!(compress_to_vec(&[0u8; 10]), vec![ESC, 0, 9]);
        assert_eq!(compress_to_vec(&[7u8; 4]), vec![ESC, 7, 3]);
    }

    #[test]
    fn escape_byte_always_escaped() {
        assert_eq!(compress_to_vec(&[ESC]), vec![ESC, ESC, 0]);
        assert_eq!(compress_to_vec(&[ESC, ESC]), vec![ESC, ESC, 1]);
    }

    #[test]
    fn runs_longer_than_count_split() {
        let compressed = compress_to_vec(&[5u8; 300]);
        assert_eq!(compressed, vec![ESC, 5, 255, ESC, 5, 43]);
        assert_eq!(decompress_to_vec(&compressed), vec![5u8; 300]);
    }

    #[test]
    fn chunked_feed_matches_one_shot() {
        let input: Vec<u8> = (0..64)
            .flat_map(|i| core::iter::repeat(i as u8).take((i % 7) + 1))
            .collect();
        let one_shot = compress_to_vec(&input);

        for chunk_size in [1usize, 2, 3, 5, 16] {
            let mut enc = Encoder::new();
            let mut out = Vec::new();
            for chunk in input.chunks(chunk_size) {
                enc.feed(chunk, |c| {
                    out.extend_from_slice(c);
                    Ok::<(), core::convert::Infallible>(())
                })
                .unwrap();
            }
            enc.flush(|c| {
                out.extend_from_slice(c);
                Ok::<(), core::convert::Infallible>(())
            })
            .unwrap();
            assert_eq!(out, one_shot, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn compressed_size_matches_output() {
        let input = [0u8; 100];
        assert_eq!(compressed_size(&input), compress_to_vec(&input).len());
    }

    proptest! {
        #[test]
        fn roundtrip(input: Vec<u8>) {
            let compressed = compress_to_vec(&input);
            prop_assert_eq!(decompress_to_vec(&compressed), input);
        }

        #[test]
        fn roundtrip_runs(byte: u8, len in 0usize..1000) {
            let input = vec![byte; len];
            let compressed = compress_to_vec(&input);
            prop_assert_eq!(decompress_to_vec(&compressed), input);
        }
    }
}
