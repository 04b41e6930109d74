// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Header construction for sending multiple events in one message.
//!
//! A batched message is simply the concatenated event documents preceded by
//! a CBOR array header carrying the count. A message holding a single event
//! carries no header at all -- the decoder distinguishes the two by the
//! leading major type.

use wirecbor::Encoder;

/// Worst case: array head with a 4-byte count argument.
pub const MAX_HEADER_LEN: usize = 5;

#[derive(Copy, Clone, Default)]
pub struct BatchedHeader {
    pub len: usize,
    pub data: [u8; MAX_HEADER_LEN],
}

/// Builds the header that must lead a message of `num_events` events.
///
/// For `num_events <= 1` the header is empty.
pub fn build_header(num_events: usize) -> BatchedHeader {
    let mut header = BatchedHeader::default();
    if num_events <= 1 {
        return header;
    }

    let mut data = [0u8; MAX_HEADER_LEN];
    let mut write = |offset: usize, bytes: &[u8]| {
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    };
    let mut encoder = Encoder::new(MAX_HEADER_LEN, &mut write);
    // Cannot fail: MAX_HEADER_LEN covers any count head.
    let _ = encoder.array_begin(num_events);
    header.len = encoder.finish();
    header.data = data;
    header
}
