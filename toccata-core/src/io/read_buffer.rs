// Toccata
// Copyright (c) 2019-2022 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

/// A `ReadBuffer` is a growable window of bytes awaiting consumption.
///
/// The window is the region between a begin and an end offset into a backing allocation.
/// Reading new bytes into the buffer advances the end offset, consuming parsed bytes advances
/// the begin offset. When the free space at the tail of the allocation runs out, the window is
/// compacted to offset zero and, if still short, the allocation is grown.
///
/// Compaction moves the data, so any slice previously obtained from [`ReadBuffer::data`] must
/// be re-fetched after calling [`ReadBuffer::reserve`], [`ReadBuffer::move_end`], or
/// [`ReadBuffer::fill_from`]. Offsets relative to the start of [`ReadBuffer::data`] remain
/// stable across those calls as long as [`ReadBuffer::move_start`] is not called.
pub struct ReadBuffer {
    buf: Vec<u8>,
    begin: usize,
    end: usize,
}

impl ReadBuffer {
    /// Instantiate a new `ReadBuffer` with an initial capacity.
    pub fn new(capacity: usize) -> Self {
        ReadBuffer { buf: vec![0u8; capacity], begin: 0, end: 0 }
    }

    /// Gets the window of unconsumed bytes.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.begin..self.end]
    }

    /// Gets the number of unconsumed bytes in the window.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    /// Returns true if the window is empty.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Ensures at least `len` bytes may be appended to the window without reallocation.
    ///
    /// If the tail of the allocation is too short the window is first compacted to offset
    /// zero, and the allocation grown only if the total free space is still insufficient.
    /// Calling `reserve` twice with the same length performs at most one allocation.
    pub fn reserve(&mut self, len: usize) {
        if len <= self.buf.len() - self.end {
            return;
        }

        let size = self.size();

        if len > self.buf.len() - size {
            let new_len = size + len;
            log::debug!("growing read buffer to {} bytes", new_len);
            self.buf.resize(new_len, 0);
        }

        // Compact the window to the front of the allocation. The copy ranges never overlap
        // destructively because copy_within handles overlapping regions.
        self.buf.copy_within(self.begin..self.end, 0);
        self.begin = 0;
        self.end = size;
    }

    /// Advances the start of the window by `len` bytes, consuming them.
    ///
    /// Panics if `len` exceeds the window size.
    pub fn move_start(&mut self, len: usize) {
        assert!(len <= self.size(), "consumed past the end of the read buffer");
        self.begin += len;
    }

    /// Advances the end of the window by `len` bytes, making bytes previously written to
    /// [`ReadBuffer::space`] visible. Implicitly reserves.
    pub fn move_end(&mut self, len: usize) {
        self.reserve(len);
        self.end += len;
    }

    /// Gets the writable tail of the allocation. Bytes written here become part of the
    /// window after a matching [`ReadBuffer::move_end`].
    pub fn space(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.buf[end..]
    }

    /// Reserves `len` bytes, reads once from `src` into the tail, and advances the end of the
    /// window by the number of bytes actually read. Returns that count; zero signals the end
    /// of the source.
    pub fn fill_from(&mut self, src: &mut dyn io::Read, len: usize) -> io::Result<usize> {
        self.reserve(len);
        let count = src.read(&mut self.buf[self.end..self.end + len])?;
        self.end += count;
        Ok(count)
    }

    /// Discards the entire window. Used when the backing source is seeked.
    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::ReadBuffer;
    use std::io::Cursor;

    #[test]
    fn fill_and_consume() {
        let mut buf = ReadBuffer::new(8);
        let mut src = Cursor::new(vec![1u8, 2, 3, 4, 5, 6]);

        assert_eq!(buf.fill_from(&mut src, 4).unwrap(), 4);
        assert_eq!(buf.data(), &[1, 2, 3, 4]);

        buf.move_start(2);
        assert_eq!(buf.data(), &[3, 4]);
        assert_eq!(buf.size(), 2);

        assert_eq!(buf.fill_from(&mut src, 4).unwrap(), 2);
        assert_eq!(buf.data(), &[3, 4, 5, 6]);
    }

    #[test]
    fn reserve_compacts_before_growing() {
        let mut buf = ReadBuffer::new(8);
        let mut src = Cursor::new(vec![0u8; 64]);

        buf.fill_from(&mut src, 8).unwrap();
        buf.move_start(6);

        // Two bytes remain at the tail of an 8 byte allocation. Reserving 6 requires
        // compaction only, not growth.
        buf.reserve(6);
        assert_eq!(buf.size(), 2);
        assert!(buf.space().len() >= 6);
    }

    #[test]
    fn reserve_is_idempotent() {
        let mut buf = ReadBuffer::new(4);
        buf.move_end(4);

        buf.reserve(16);
        let cap = buf.space().len();
        buf.reserve(16);
        assert_eq!(buf.space().len(), cap);
        assert_eq!(buf.size(), 4);
    }

    #[test]
    fn move_end_then_move_start_preserves_size() {
        let mut buf = ReadBuffer::new(16);
        buf.move_end(8);
        let size = buf.size();

        buf.move_start(4);
        buf.move_end(4);
        assert_eq!(buf.size(), size);
    }

    #[test]
    #[should_panic]
    fn move_start_past_end_panics() {
        let mut buf = ReadBuffer::new(4);
        buf.move_end(2);
        buf.move_start(3);
    }

    #[test]
    fn offsets_survive_compaction() {
        let mut buf = ReadBuffer::new(8);
        let mut src = Cursor::new(vec![9u8, 8, 7, 6, 5, 4, 3, 2, 1, 0]);

        buf.fill_from(&mut src, 8).unwrap();
        buf.move_start(5);

        // Offsets into data() must survive the compaction performed by the next fill.
        let before = buf.data()[1];
        buf.fill_from(&mut src, 2).unwrap();
        assert_eq!(buf.data()[1], before);
        assert_eq!(buf.size(), 5);
    }
}
