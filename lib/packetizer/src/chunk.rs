// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Splitting one logical message into transport-sized pieces.
//!
//! A message is a byte stream of known total size, read through a callback.
//! The transport tracks a single read offset through the message; each call
//! to [`ChunkTransport::next_chunk`] fills as much of the caller's buffer
//! as remains. The caller never sees partial-message bookkeeping beyond
//! "is there more".

/// The absolute minimum buffer the transport will fill. Anything smaller
/// degenerates into per-byte round trips; callers should really size
/// buffers to their transport MTU.
pub const MIN_CHUNK_BUF_LEN: usize = 9;

pub struct ChunkTransport {
    total_size: u32,
    read_offset: u32,
    /// When true, one logical chunk spans multiple `next_chunk` calls.
    multi_call: bool,
}

impl ChunkTransport {
    pub fn new(total_size: u32, multi_call: bool) -> Self {
        Self {
            total_size,
            read_offset: 0,
            multi_call,
        }
    }

    /// The size of the message when sent as one chunk; lets a caller set a
    /// `Content-Length` before streaming.
    pub fn single_chunk_message_length(&self) -> u32 {
        self.total_size
    }

    pub fn read_offset(&self) -> u32 {
        self.read_offset
    }

    pub fn multi_call(&self) -> bool {
        self.multi_call
    }

    /// Fills `buf` from the message via `read`, advancing the offset.
    ///
    /// Returns `(bytes_written, more_data)`. A buffer below
    /// [`MIN_CHUNK_BUF_LEN`] produces zero bytes and no progress.
    pub fn next_chunk(
        &mut self,
        buf: &mut [u8],
        read: impl FnOnce(u32, &mut [u8]),
    ) -> (usize, bool) {
        let remaining = (self.total_size - self.read_offset) as usize;
        if buf.len() < MIN_CHUNK_BUF_LEN {
            return (0, remaining != 0);
        }

        let n = buf.len().min(remaining);
        read(self.read_offset, &mut buf[..n]);
        self.read_offset += n as u32;
        (n, self.read_offset != self.total_size)
    }
}
