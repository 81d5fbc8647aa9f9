//! Chunk and byte iteration.
//!
//! Both iterator families borrow the buffer, so any structural mutation is
//! rejected at compile time for as long as an iterator or cursor is live.
//! A [`ByteCursor`] identifies a byte by chunk block and intra-chunk offset
//! rather than by logical position, so stepping and comparison never rescan
//! the buffer from the front.

use std::cmp::Ordering;

use crate::buffer::RawMultiBuf;

/// Iterator over maximal contiguous spans of the top layer.
///
/// Physically adjacent chunks are coalesced into one yielded slice, so a
/// buffer split out of a single allocation iterates as a single span.
/// Zero-length chunks are skipped and never break a coalescing run.
#[derive(Debug)]
pub struct Chunks<'b> {
    buf: &'b RawMultiBuf<'b>,
    /// Entry index of the next unvisited block from the front.
    front: usize,
    /// Entry index one past the last unvisited block.
    back: usize,
}

impl<'b> Chunks<'b> {
    pub(crate) fn new(buf: &'b RawMultiBuf<'b>) -> Self {
        Self {
            buf,
            front: 0,
            back: buf.entry_count(),
        }
    }
}

impl<'b> Iterator for Chunks<'b> {
    type Item = &'b [u8];

    fn next(&mut self) -> Option<&'b [u8]> {
        let depth = self.buf.depth();
        while self.front < self.back {
            let (ptr, len) = self.buf.chunk_span(self.front);
            self.front += depth;
            if len == 0 {
                continue;
            }
            let start = ptr;
            let mut total = len;
            while self.front < self.back {
                let (next_ptr, next_len) = self.buf.chunk_span(self.front);
                if next_len == 0 {
                    self.front += depth;
                    continue;
                }
                // SAFETY: `total` bytes past `start` is one past the end of
                // the span accumulated so far.
                if next_ptr != unsafe { start.add(total) } {
                    break;
                }
                total += next_len;
                self.front += depth;
            }
            // SAFETY: the accumulated range is physically contiguous live
            // chunk memory, borrowed for 'b through the buffer.
            return Some(unsafe { std::slice::from_raw_parts(start, total) });
        }
        None
    }
}

impl DoubleEndedIterator for Chunks<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let depth = self.buf.depth();
        while self.back > self.front {
            self.back -= depth;
            let (ptr, len) = self.buf.chunk_span(self.back);
            if len == 0 {
                continue;
            }
            let mut start = ptr;
            let mut total = len;
            while self.back > self.front {
                let prev = self.back - depth;
                let (prev_ptr, prev_len) = self.buf.chunk_span(prev);
                if prev_len == 0 {
                    self.back = prev;
                    continue;
                }
                // SAFETY: prev_len bytes past prev_ptr is the end of the
                // previous chunk's span.
                if unsafe { prev_ptr.add(prev_len) } != start {
                    break;
                }
                start = prev_ptr;
                total += prev_len;
                self.back = prev;
            }
            // SAFETY: as in `next`.
            return Some(unsafe { std::slice::from_raw_parts(start, total) });
        }
        None
    }
}

/// A stable position within the logical byte sequence.
///
/// Stepping costs at most one chunk-block hop per chunk crossed, and
/// comparing two cursors is a pair of index comparisons. The cursor is
/// normalized: either its offset is strictly inside its chunk's top-layer
/// span, or it is the one-past-the-end cursor.
#[derive(Clone, Copy)]
pub struct ByteCursor<'b> {
    buf: &'b RawMultiBuf<'b>,
    /// Entry index of the current block, or the entry count at the end.
    chunk: usize,
    /// Byte offset within the chunk's top-layer span.
    offset: usize,
}

impl<'b> ByteCursor<'b> {
    pub(crate) fn new_at(buf: &'b RawMultiBuf<'b>, pos: usize) -> Self {
        let raw = buf.seek(pos);
        let mut cursor = Self {
            buf,
            chunk: raw.chunk.get(),
            offset: raw.offset,
        };
        cursor.normalize();
        cursor
    }

    /// Skip zero-length chunks so the cursor either points at a real byte
    /// or sits past the end.
    fn normalize(&mut self) {
        let depth = self.buf.depth();
        while self.chunk < self.buf.entry_count()
            && self.offset >= self.buf.top_len_at(self.chunk)
        {
            self.offset = 0;
            self.chunk += depth;
        }
    }

    /// Whether the cursor is past the last byte.
    #[inline]
    pub fn is_end(&self) -> bool {
        self.chunk >= self.buf.entry_count()
    }

    /// The byte under the cursor, or `None` at the end.
    pub fn byte(&self) -> Option<u8> {
        if self.is_end() {
            return None;
        }
        let (ptr, _) = self.buf.chunk_span(self.chunk);
        // SAFETY: normalization keeps offset inside the chunk span.
        Some(unsafe { *ptr.add(self.offset) })
    }

    /// Step the cursor forward by `n` bytes.
    ///
    /// # Panics
    /// If the step would move past the one-past-the-end position.
    pub fn advance(&mut self, mut n: usize) {
        let depth = self.buf.depth();
        while n > 0 {
            assert!(!self.is_end(), "cursor advanced past the end");
            let avail = self.buf.top_len_at(self.chunk) - self.offset;
            if n < avail {
                self.offset += n;
                return;
            }
            n -= avail;
            self.offset = 0;
            self.chunk += depth;
            self.normalize();
        }
    }

    /// Step the cursor backward by `n` bytes.
    ///
    /// # Panics
    /// If the step would move before the first byte.
    pub fn rewind(&mut self, mut n: usize) {
        let depth = self.buf.depth();
        while n > 0 {
            if self.offset >= n {
                self.offset -= n;
                return;
            }
            n -= self.offset;
            // Find the previous nonzero-length chunk.
            loop {
                assert!(self.chunk >= depth, "cursor rewound past the start");
                self.chunk -= depth;
                let len = self.buf.top_len_at(self.chunk);
                if len > 0 {
                    self.offset = len;
                    break;
                }
            }
        }
    }

    /// Signed byte distance from `other` to `self`: positive when `self`
    /// is ahead of `other`.
    ///
    /// # Panics
    /// If the cursors borrow different buffers.
    pub fn distance(&self, other: &Self) -> isize {
        assert!(
            std::ptr::eq(self.buf, other.buf),
            "cursors into different buffers"
        );
        match self.cmp(other) {
            Ordering::Equal => 0,
            Ordering::Greater => self.bytes_from(other) as isize,
            Ordering::Less => -(other.bytes_from(self) as isize),
        }
    }

    /// Bytes between a trailing cursor `lo` and `self`, with `lo <= self`.
    fn bytes_from(&self, lo: &Self) -> usize {
        let depth = self.buf.depth();
        let mut total = 0;
        let mut chunk = lo.chunk;
        while chunk < self.chunk {
            total += self.buf.top_len_at(chunk);
            chunk += depth;
        }
        total + self.offset - lo.offset
    }
}

impl PartialEq for ByteCursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.chunk == other.chunk && self.offset == other.offset
    }
}

impl Eq for ByteCursor<'_> {}

impl PartialOrd for ByteCursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteCursor<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.chunk, self.offset).cmp(&(other.chunk, other.offset))
    }
}

impl std::fmt::Debug for ByteCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteCursor")
            .field("chunk", &self.chunk)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Iterator over the logical byte sequence, one byte at a time.
#[derive(Debug)]
pub struct Bytes<'b> {
    cursor: ByteCursor<'b>,
}

impl<'b> Bytes<'b> {
    pub(crate) fn new(buf: &'b RawMultiBuf<'b>) -> Self {
        Self {
            cursor: ByteCursor::new_at(buf, 0),
        }
    }
}

impl Iterator for Bytes<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let byte = self.cursor.byte()?;
        self.cursor.advance(1);
        Some(byte)
    }
}
