// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A streaming encoder for the subset of CBOR (RFC 7049) used on the wire.
//!
//! Everything the device sends to the cloud is a CBOR document, but the
//! documents are produced incrementally into whatever storage happens to back
//! them: a circular RAM buffer, a fixed metadata scratch area, or a transport
//! window that only wants bytes `[offset, offset+len)` of the stream. So
//! instead of encoding into a slice, the [`Encoder`] hands each fragment to a
//! write callback along with its logical offset, and tracks the total logical
//! size itself.
//!
//! Two construction modes:
//!
//! - **Write mode** ([`Encoder::new`]): fragments are delivered to the
//!   callback; once the logical size would exceed the declared capacity,
//!   operations fail with [`NotEnoughSpace`] and nothing further is written.
//! - **Size-only mode** ([`Encoder::size_only`]): no callback, no capacity;
//!   every operation succeeds and merely accumulates the logical size. This
//!   is how callers size backing storage before committing to a write, so an
//!   encode closure must be idempotent -- it will typically run twice.
//!
//! Integer heads always use the minimal width. [`Encoder::join`] splices
//! pre-encoded CBOR into the stream, which is how pre-serialized log payloads
//! and metadata prefixes are embedded without re-encoding.

#![cfg_attr(not(test), no_std)]

/// Error returned when an encode would exceed the encoder's capacity.
///
/// The failed item is suppressed entirely; the stream retains the bytes
/// encoded before the failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NotEnoughSpace;

// https://tools.ietf.org/html/rfc7049#section-2.1
#[derive(Copy, Clone)]
#[repr(u8)]
enum MajorType {
    UnsignedInteger = 0,
    NegativeInteger = 1,
    ByteString = 2,
    TextString = 3,
    Array = 4,
    Map = 5,
    Simple = 7,
}

/// Additional-information value selecting the 8-byte argument encoding.
const AI_EIGHT_BYTES: u8 = 27;

pub struct Encoder<'a> {
    /// `None` in size-only mode.
    out: Option<&'a mut dyn FnMut(usize, &[u8])>,
    /// Logical bytes encoded so far; a failed item never counts.
    encoded: usize,
    max_len: usize,
}

impl<'a> Encoder<'a> {
    /// Creates an encoder delivering fragments to `out`.
    ///
    /// `out` receives `(logical_offset, fragment)` pairs with strictly
    /// increasing, contiguous offsets. `max_len` caps the logical stream
    /// size; an item that would push past it fails and is not delivered.
    pub fn new(max_len: usize, out: &'a mut dyn FnMut(usize, &[u8])) -> Self {
        Self {
            out: Some(out),
            encoded: 0,
            max_len,
        }
    }

    /// Creates an encoder that only counts bytes. All operations succeed.
    pub fn size_only() -> Encoder<'static> {
        Encoder {
            out: None,
            encoded: 0,
            max_len: 0,
        }
    }

    /// Consumes the encoder, returning the logical size of the stream.
    pub fn finish(self) -> usize {
        self.encoded
    }

    /// Logical bytes encoded so far.
    pub fn encoded_size(&self) -> usize {
        self.encoded
    }

    fn push(&mut self, data: &[u8]) -> Result<(), NotEnoughSpace> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.out {
            None => {
                // Size-only mode never fails; capacity is what we're here to
                // discover.
                self.encoded += data.len();
                Ok(())
            }
            Some(out) => {
                if self.encoded + data.len() > self.max_len {
                    return Err(NotEnoughSpace);
                }
                out(self.encoded, data);
                self.encoded += data.len();
                Ok(())
            }
        }
    }

    /// Encodes a type head with minimal-width argument (tiny/1/2/4 bytes).
    fn head(&mut self, major: MajorType, val: u32) -> Result<(), NotEnoughSpace> {
        let mt = (major as u8) << 5;
        let mut tmp = [0u8; 5];
        let len = if val < 24 {
            tmp[0] = mt + val as u8;
            1
        } else if val <= 0xff {
            tmp[0] = mt + 24;
            tmp[1] = val as u8;
            2
        } else if val <= 0xffff {
            tmp[0] = mt + 25;
            tmp[1..3].copy_from_slice(&(val as u16).to_be_bytes());
            3
        } else {
            tmp[0] = mt + 26;
            tmp[1..5].copy_from_slice(&val.to_be_bytes());
            5
        };
        self.push(&tmp[..len])
    }

    fn head64(&mut self, major: MajorType, val: u64) -> Result<(), NotEnoughSpace> {
        let mut tmp = [0u8; 9];
        tmp[0] = ((major as u8) << 5) | AI_EIGHT_BYTES;
        tmp[1..9].copy_from_slice(&val.to_be_bytes());
        self.push(&tmp)
    }

    /// Encodes an unsigned integer (major type 0).
    pub fn unsigned(&mut self, value: u32) -> Result<(), NotEnoughSpace> {
        self.head(MajorType::UnsignedInteger, value)
    }

    /// Encodes a signed integer, choosing major type 0 or 1 by sign.
    pub fn signed(&mut self, value: i32) -> Result<(), NotEnoughSpace> {
        // Logic derived from "Appendix C Pseudocode" of RFC 7049: the sign
        // extension selects the major type, xor folds both signs onto the
        // unsigned magnitude encoding.
        let ui = value >> 31;
        let major = if ui & 1 == 0 {
            MajorType::UnsignedInteger
        } else {
            MajorType::NegativeInteger
        };
        self.head(major, (ui ^ value) as u32)
    }

    /// Encodes a signed integer outside the 32-bit range.
    pub fn long_signed(&mut self, value: i64) -> Result<(), NotEnoughSpace> {
        let ui = value >> 63;
        let major = if ui & 1 == 0 {
            MajorType::UnsignedInteger
        } else {
            MajorType::NegativeInteger
        };
        let magnitude = (ui ^ value) as u64;
        if magnitude <= u32::MAX as u64 {
            self.head(major, magnitude as u32)
        } else {
            self.head64(major, magnitude)
        }
    }

    /// Encodes an IEEE-754 double (major type 7, additional info 27).
    pub fn double(&mut self, value: f64) -> Result<(), NotEnoughSpace> {
        self.head64(MajorType::Simple, value.to_bits())
    }

    /// Encodes a definite-length byte string, head and body.
    pub fn bytes(&mut self, buf: &[u8]) -> Result<(), NotEnoughSpace> {
        self.head(MajorType::ByteString, buf.len() as u32)?;
        self.push(buf)
    }

    /// Encodes only the head of a byte string of `len` bytes; the caller
    /// streams the body via [`join`](Self::join).
    pub fn bytes_begin(&mut self, len: usize) -> Result<(), NotEnoughSpace> {
        self.head(MajorType::ByteString, len as u32)
    }

    /// Encodes a definite-length text string, head and body.
    pub fn str(&mut self, s: &str) -> Result<(), NotEnoughSpace> {
        self.head(MajorType::TextString, s.len() as u32)?;
        self.push(s.as_bytes())
    }

    /// Encodes only the head of a text string of `len` bytes.
    pub fn str_begin(&mut self, len: usize) -> Result<(), NotEnoughSpace> {
        self.head(MajorType::TextString, len as u32)
    }

    /// Encodes the head of a definite-length array of `num_elements`.
    pub fn array_begin(&mut self, num_elements: usize) -> Result<(), NotEnoughSpace> {
        self.head(MajorType::Array, num_elements as u32)
    }

    /// Encodes the head of a definite-length map of `num_pairs`.
    pub fn map_begin(&mut self, num_pairs: usize) -> Result<(), NotEnoughSpace> {
        self.head(MajorType::Map, num_pairs as u32)
    }

    /// Splices raw, already-encoded CBOR into the stream.
    pub fn join(&mut self, cbor: &[u8]) -> Result<(), NotEnoughSpace> {
        self.push(cbor)
    }
}

/// Runs `encode` against a size-only encoder and returns the logical size.
///
/// The closure runs twice in the usual compute-then-write pattern, so it must
/// be free of side effects.
pub fn compute_size(
    mut encode: impl FnMut(&mut Encoder<'_>) -> Result<(), NotEnoughSpace>,
) -> usize {
    let mut e = Encoder::size_only();
    // Can't fail in size-only mode; the closure's own control flow is the
    // only early exit.
    let _ = encode(&mut e);
    e.finish()
}
