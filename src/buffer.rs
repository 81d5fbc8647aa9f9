//! Core multi-segment buffer engine.
//!
//! [`RawMultiBuf`] owns the flat entry deque, the block depth, and the
//! memory-ownership context, and implements every structural algorithm:
//! insert, remove, split, layering, release, share, and linear byte
//! copy/scan. The typed façade in [`crate::facade`] wraps this engine and
//! constrains which operations each property combination may reach; the
//! engine itself trusts those constraints.
//!
//! # Failure regimes
//!
//! Metadata-allocation exhaustion is reported through return values
//! (`false` from `try_reserve_*`, `Error::ResourceExhausted` from
//! `remove`/`discard`/`pop_front_fragment`) and leaves the buffer
//! untouched. Everything else that can go wrong is a precondition
//! violation and panics; callers can check `is_removable`, `is_releasable`,
//! and `is_shareable` ahead of time.
//!
//! # Iterator invalidation
//!
//! Chunk and byte iterators borrow the buffer, so the borrow checker
//! statically rejects structural mutation while an iterator is live. Saved
//! byte *offsets* carry no such protection and go stale across mutations.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::entry::{BaseView, ChunkIndex, Entry, LayerView, RawPos};
use crate::error::{Error, Result};
use crate::iter::{ByteCursor, Bytes, Chunks};
use crate::observer::{BufferEvent, BufferObserver};
use crate::raw_alloc::{
    ControlBlock, OwnedBytes, RawDeallocator, SharedBytes, release_block, retain_block,
    same_deallocator,
};

/// Discriminated memory-ownership context for one buffer instance.
///
/// At most one deallocator (exclusive) or one control block (shared) may be
/// associated with a buffer at a time. Unowned chunks carry neither and are
/// never freed by the buffer.
#[derive(Clone, Copy)]
pub(crate) enum MemoryContext<'mem> {
    /// No owned or shared chunks.
    Empty,
    /// Owned chunks are freed through this deallocator.
    Owned(&'mem dyn RawDeallocator),
    /// Shared chunks are governed by this control block; the buffer holds
    /// one counted reference regardless of how many shared chunks it has.
    Shared(NonNull<ControlBlock<'mem>>),
}

impl<'mem> MemoryContext<'mem> {
    fn owned_deallocator(&self) -> &'mem dyn RawDeallocator {
        match self {
            Self::Owned(deallocator) => *deallocator,
            _ => panic!("buffer has no exclusive deallocator context"),
        }
    }

    fn shared_block(&self) -> NonNull<ControlBlock<'mem>> {
        match self {
            Self::Shared(block) => *block,
            _ => panic!("buffer has no shared control block context"),
        }
    }

    fn accepts_deallocator(&self, deallocator: &dyn RawDeallocator) -> bool {
        match self {
            Self::Empty => true,
            Self::Owned(mine) => same_deallocator(*mine, deallocator),
            Self::Shared(_) => false,
        }
    }

    fn accepts_block(&self, block: NonNull<ControlBlock<'mem>>) -> bool {
        match self {
            Self::Empty => true,
            Self::Owned(_) => false,
            Self::Shared(mine) => *mine == block,
        }
    }

    fn compatible_with(&self, other: &MemoryContext<'mem>) -> bool {
        match other {
            Self::Empty => true,
            Self::Owned(deallocator) => self.accepts_deallocator(*deallocator),
            Self::Shared(block) => self.accepts_block(*block),
        }
    }
}

/// A logical byte sequence physically composed of discontiguous chunks,
/// optionally overlaid with view layers.
///
/// Each chunk occupies `depth` consecutive entries in a flat deque; see
/// [`crate::entry`] for the block layout. All positions at this API are
/// logical byte offsets into the top layer.
pub(crate) struct RawMultiBuf<'mem> {
    /// Flat entry storage; length is always a multiple of `depth`.
    entries: VecDeque<Entry>,
    /// Entries per chunk block: 1 data slot + 1 base view + one view per
    /// additional layer. Always >= 2.
    depth: usize,
    /// Ownership context for owned/shared chunk memory.
    memory: MemoryContext<'mem>,
    /// Observer notified synchronously on mutations, if any.
    observer: Option<&'mem dyn BufferObserver>,
    _mem: PhantomData<&'mem [u8]>,
}

impl<'mem> RawMultiBuf<'mem> {
    /// Create an empty buffer: zero entries, depth 2.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            depth: 2,
            memory: MemoryContext::Empty,
            observer: None,
            _mem: PhantomData,
        }
    }

    // ========== Queries ==========

    /// Entries per chunk block.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of view layers, counting the base view as layer 1.
    #[inline]
    pub fn num_layers(&self) -> usize {
        self.depth - 1
    }

    /// Number of chunk blocks.
    #[inline]
    pub fn num_chunks(&self) -> usize {
        self.entries.len() / self.depth
    }

    /// Total entry count, for iterator bounds.
    #[inline]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Total logical byte length: the sum of every chunk's top-layer span.
    pub fn len(&self) -> usize {
        (0..self.num_chunks())
            .map(|n| self.top_len(self.chunk_at(n)))
            .sum()
    }

    /// Whether the logical byte sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of nonzero-length fragments at the top layer.
    pub fn num_fragments(&self) -> usize {
        (0..self.num_chunks())
            .filter(|&n| {
                let c = self.chunk_at(n);
                self.top_len(c) > 0 && self.is_fragment_end(c)
            })
            .count()
    }

    pub fn observer(&self) -> Option<&'mem dyn BufferObserver> {
        self.observer
    }

    pub fn set_observer(&mut self, observer: Option<&'mem dyn BufferObserver>) {
        self.observer = observer;
    }

    // ========== Compatibility ==========

    /// Whether `other`'s ownership context can merge into this buffer's.
    pub fn is_compatible(&self, other: &RawMultiBuf<'mem>) -> bool {
        self.memory.compatible_with(&other.memory)
    }

    /// Whether memory freed by `bytes`' deallocator can be inserted as owned.
    pub fn is_compatible_owned(&self, bytes: &OwnedBytes<'mem>) -> bool {
        self.memory.accepts_deallocator(bytes.deallocator())
    }

    /// Whether memory governed by `bytes`' control block can be inserted as
    /// shared.
    pub fn is_compatible_shared(&self, bytes: &SharedBytes<'mem>) -> bool {
        self.memory.accepts_block(bytes.block_ptr())
    }

    // ========== Reservation ==========

    /// Reserve deque capacity for `n` additional chunks.
    ///
    /// # Returns
    /// `false` without mutating state if the allocation fails.
    pub fn try_reserve_chunks(&mut self, n: usize) -> bool {
        self.entries.try_reserve(n * self.depth).is_ok()
    }

    /// Reserve capacity to insert `other`'s chunks at `pos`, including one
    /// extra chunk if `pos` falls mid-chunk (the target chunk must split).
    pub fn try_reserve_for_insert(&mut self, pos: usize, other: &RawMultiBuf<'mem>) -> bool {
        let extra = usize::from(self.seek(pos).offset != 0);
        self.try_reserve_chunks(other.num_chunks() + extra)
    }

    /// Reserve capacity to append `other`'s chunks.
    pub fn try_reserve_for_push_back(&mut self, other: &RawMultiBuf<'mem>) -> bool {
        self.try_reserve_chunks(other.num_chunks())
    }

    fn assert_reserved(&self, blocks: usize) {
        assert!(
            self.entries.capacity() - self.entries.len() >= blocks * self.depth,
            "insufficient reserved entry capacity; reserve before inserting"
        );
    }

    // ========== Chunk geometry ==========

    #[inline]
    fn chunk_at(&self, n: usize) -> ChunkIndex {
        ChunkIndex::new(n * self.depth, self.depth)
    }

    /// The top-layer span length of a chunk.
    fn top_len(&self, c: ChunkIndex) -> usize {
        if self.depth == 2 {
            self.entries[c.base_slot()].base().length
        } else {
            self.entries[c.top_slot(self.depth)].view().length
        }
    }

    /// Top-layer span length of the block starting at a raw entry index.
    pub(crate) fn top_len_at(&self, index: usize) -> usize {
        self.top_len(ChunkIndex::new(index, self.depth))
    }

    /// Whether a chunk is the last chunk of a fragment. At depth 2 there are
    /// no view slots and every chunk is its own fragment.
    fn is_fragment_end(&self, c: ChunkIndex) -> bool {
        self.depth == 2 || self.entries[c.top_slot(self.depth)].view().boundary
    }

    /// Absolute offset of the top-layer span within the chunk's data, i.e.
    /// the base offset plus every view offset down the chain.
    fn data_offset(&self, c: ChunkIndex) -> usize {
        let mut offset = self.entries[c.base_slot()].base().offset;
        for slot in 2..self.depth {
            offset += self.entries[c.get() + slot].view().offset;
        }
        offset
    }

    /// Start pointer and length of a chunk's top-layer span.
    pub(crate) fn chunk_span(&self, index: usize) -> (*const u8, usize) {
        let c = ChunkIndex::new(index, self.depth);
        let len = self.top_len(c);
        let data = self.entries[c.data_slot()].data();
        // SAFETY: the view invariant keeps offset + len within the backing
        // allocation.
        let ptr = unsafe { data.as_ptr().add(self.data_offset(c)) };
        (ptr as *const u8, len)
    }

    /// The chunk's top-layer bytes.
    fn chunk_slice(&self, c: ChunkIndex) -> &[u8] {
        let (ptr, len) = self.chunk_span(c.get());
        if len == 0 {
            return &[];
        }
        // SAFETY: span lies within a live allocation referenced by the chunk.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    /// Resolve a logical byte position to a chunk block and intra-chunk
    /// offset. A position on a chunk boundary resolves to the following
    /// chunk's start; `pos == len()` resolves past the end.
    pub(crate) fn seek(&self, pos: usize) -> RawPos {
        let mut remaining = pos;
        let mut c = ChunkIndex::zero();
        while c.get() < self.entries.len() {
            let len = self.top_len(c);
            if remaining < len {
                return RawPos { chunk: c, offset: remaining };
            }
            remaining -= len;
            c = c.next(self.depth);
        }
        assert!(remaining == 0, "byte position {pos} out of range");
        RawPos { chunk: c, offset: 0 }
    }

    // ========== Split ==========

    /// Split the chunk at `c` into two blocks at `split_off` bytes into its
    /// top-layer span. Every metadata layer is cut at the same absolute
    /// data position, so both halves keep the view-within-parent invariant.
    ///
    /// Requires one reserved chunk of entry capacity. Both halves keep the
    /// base ownership flags; `clear` and `discard` deduplicate repeated data
    /// pointers before freeing.
    fn split_chunk(&mut self, c: ChunkIndex, split_off: usize) {
        let depth = self.depth;
        let data = self.entries[c.data_slot()].data();
        let base = self.entries[c.base_slot()].base();
        let views: Vec<LayerView> = (2..depth)
            .map(|slot| self.entries[c.get() + slot].view())
            .collect();

        // Absolute [start, end) of each metadata layer in data coordinates.
        // Layer l's start is its parent's start plus its relative offset.
        let mut starts = Vec::with_capacity(depth - 1);
        let mut ends = Vec::with_capacity(depth - 1);
        starts.push(base.offset);
        ends.push(base.offset + base.length);
        for view in &views {
            let start = *starts.last().unwrap() + view.offset;
            starts.push(start);
            ends.push(start + view.length);
        }

        let top = depth - 2;
        let split_at = starts[top] + split_off;
        assert!(
            split_off > 0 && split_at < ends[top],
            "split point is not strictly inside the chunk"
        );

        // Since child spans start at or after their parents, every layer's
        // start is <= split_at, and every layer's end is >= the top layer's
        // end > split_at. The left half keeps its offsets and truncates each
        // layer at split_at; the right half starts each layer at split_at.
        self.entries[c.base_slot()].base_mut().length = split_at - starts[0];
        for (i, slot) in (2..depth).enumerate() {
            let view = self.entries[c.get() + slot].view_mut();
            view.length = split_at - starts[i + 1];
            view.boundary = false;
        }

        let mut at = c.get() + depth;
        self.entries.insert(at, Entry::Data(data));
        at += 1;
        self.entries.insert(
            at,
            Entry::Base(BaseView {
                offset: split_at,
                length: ends[0] - split_at,
                owned: base.owned,
                shared: base.shared,
            }),
        );
        at += 1;
        for (i, view) in views.iter().enumerate() {
            self.entries.insert(
                at,
                Entry::View(LayerView {
                    offset: 0,
                    length: ends[i + 1] - split_at,
                    sealed: view.sealed,
                    boundary: view.boundary,
                }),
            );
            at += 1;
        }
    }

    /// Split the target chunk if `pos` falls mid-chunk and return the entry
    /// index at which new blocks should be inserted.
    fn prepare_insert(&mut self, pos: usize) -> usize {
        let rp = self.seek(pos);
        if rp.offset == 0 {
            rp.chunk.get()
        } else {
            self.split_chunk(rp.chunk, rp.offset);
            rp.chunk.next(self.depth).get()
        }
    }

    // ========== Chunk insertion ==========

    /// Insert one chunk block at a logical position. Synthetic views padding
    /// the block to this buffer's depth span the whole base range and mark
    /// the chunk as its own fragment.
    fn insert_chunk(
        &mut self,
        pos: usize,
        data: NonNull<u8>,
        offset: usize,
        length: usize,
        owned: bool,
        shared: bool,
    ) {
        let extra = usize::from(self.seek(pos).offset != 0);
        self.assert_reserved(1 + extra);

        let mut at = self.prepare_insert(pos);
        self.entries.insert(at, Entry::Data(data));
        at += 1;
        self.entries.insert(
            at,
            Entry::Base(BaseView {
                offset,
                length,
                owned,
                shared,
            }),
        );
        at += 1;
        for _ in 2..self.depth {
            self.entries.insert(
                at,
                Entry::View(LayerView {
                    offset: 0,
                    length,
                    sealed: false,
                    boundary: true,
                }),
            );
            at += 1;
        }
        trace!(pos, length, owned, shared, "inserted chunk");
        self.notify(BufferEvent::BytesAdded, length);
    }

    /// Insert a borrowed chunk: referenced, never freed by the buffer.
    ///
    /// # Safety contract (enforced by the façade)
    /// `data[offset..offset + length]` must stay live for `'mem`, and must
    /// be writable unless the buffer is const-propertied.
    pub fn insert_unowned(&mut self, pos: usize, data: NonNull<u8>, offset: usize, length: usize) {
        self.insert_chunk(pos, data, offset, length, false, false);
    }

    /// Insert an owned chunk, adopting its deallocator as this buffer's
    /// exclusive ownership context.
    ///
    /// # Panics
    /// If the buffer already carries a different deallocator or a shared
    /// control block, or if the subrange exceeds the allocation.
    pub fn insert_owned(
        &mut self,
        pos: usize,
        bytes: OwnedBytes<'mem>,
        offset: usize,
        length: usize,
    ) {
        assert!(
            offset + length <= bytes.len(),
            "chunk subrange exceeds the owned allocation"
        );
        assert!(
            self.is_compatible_owned(&bytes),
            "owned memory from an incompatible deallocator"
        );
        let (data, _, deallocator) = bytes.into_raw();
        if matches!(self.memory, MemoryContext::Empty) {
            self.memory = MemoryContext::Owned(deallocator);
        }
        self.insert_chunk(pos, data, offset, length, true, false);
    }

    /// Insert a shared chunk, retaining its control block as this buffer's
    /// shared ownership context. The buffer holds exactly one counted
    /// reference no matter how many shared chunks it accumulates.
    ///
    /// # Panics
    /// If the buffer already carries a deallocator or a different control
    /// block, or if the subrange exceeds the allocation.
    pub fn insert_shared(
        &mut self,
        pos: usize,
        bytes: &SharedBytes<'mem>,
        offset: usize,
        length: usize,
    ) {
        assert!(
            offset + length <= bytes.len(),
            "chunk subrange exceeds the shared allocation"
        );
        assert!(
            self.is_compatible_shared(bytes),
            "shared memory from an incompatible control block"
        );
        if matches!(self.memory, MemoryContext::Empty) {
            // SAFETY: `bytes` holds a counted reference, so the block is live.
            unsafe { retain_block(bytes.block_ptr()) };
            self.memory = MemoryContext::Shared(bytes.block_ptr());
        }
        self.insert_chunk(pos, bytes.as_ptr(), offset, length, false, true);
    }

    // ========== Buffer insertion ==========

    /// Merge another buffer's chunks into this one at `pos`, draining the
    /// source. Chunks from a shallower source are padded with synthetic
    /// full-span views marked as fragment ends.
    ///
    /// # Panics
    /// If the ownership contexts conflict, the source is deeper than this
    /// buffer, or capacity was not reserved via `try_reserve_for_insert`.
    pub fn insert_buf(&mut self, pos: usize, mut other: RawMultiBuf<'mem>) {
        assert!(
            self.is_compatible(&other),
            "buffers have conflicting ownership contexts"
        );
        assert!(
            other.depth <= self.depth,
            "source buffer has more layers than the destination"
        );

        let moved = other.len();
        let src_chunks = other.num_chunks();
        let extra = usize::from(self.seek(pos).offset != 0);
        self.assert_reserved(src_chunks + extra);

        let src_depth = other.depth;
        let mut at = self.prepare_insert(pos);
        while !other.entries.is_empty() {
            for _ in 0..src_depth {
                let entry = other.entries.pop_front().unwrap();
                self.entries.insert(at, entry);
                at += 1;
            }
            let top_entry = &self.entries[at - 1];
            let top_len = if src_depth == 2 {
                top_entry.base().length
            } else {
                top_entry.view().length
            };
            for _ in src_depth..self.depth {
                self.entries.insert(
                    at,
                    Entry::View(LayerView {
                        offset: 0,
                        length: top_len,
                        sealed: false,
                        boundary: true,
                    }),
                );
                at += 1;
            }
        }

        self.adopt_context(&mut other);
        trace!(pos, moved, src_chunks, "inserted buffer");
        other.notify(BufferEvent::BytesRemoved, moved);
        other.observer = None;
        self.notify(BufferEvent::BytesAdded, moved);
    }

    /// Merge `other`'s ownership context into this buffer's after its
    /// chunks have been moved over.
    fn adopt_context(&mut self, other: &mut RawMultiBuf<'mem>) {
        let theirs = std::mem::replace(&mut other.memory, MemoryContext::Empty);
        match (self.memory, theirs) {
            (_, MemoryContext::Empty) => {}
            (MemoryContext::Empty, ctx) => self.memory = ctx,
            (MemoryContext::Owned(_), MemoryContext::Owned(_)) => {
                // Same deallocator (checked by is_compatible); one context
                // reference suffices.
            }
            (MemoryContext::Shared(mine), MemoryContext::Shared(moved)) => {
                debug_assert_eq!(mine, moved);
                // Both buffers held a counted reference; only one survives.
                // SAFETY: this buffer still holds its own reference.
                unsafe { release_block(moved) };
            }
            _ => unreachable!("contexts were checked compatible before insert"),
        }
    }

    // ========== Removal ==========

    /// Whether `[pos, pos + len)` can be extracted without dividing the
    /// deallocation right for one allocation across two buffers, which
    /// would leave both trying to free it. Two cases are rejected: an
    /// endpoint inside an owned chunk, and a range that separates owned
    /// chunks sharing one data pointer (an earlier mid-chunk split leaves
    /// such siblings, possibly non-adjacent). Unowned and shared chunks
    /// split freely.
    pub fn is_removable(&self, pos: usize, len: usize) -> bool {
        if pos + len > self.len() {
            return false;
        }
        let start = self.seek(pos);
        let end = self.seek(pos + len);
        for rp in [start, end] {
            if rp.offset != 0 && self.entries[rp.chunk.base_slot()].base().owned {
                return false;
            }
        }

        // Owned chunks are now known to sit fully inside or fully outside
        // the range; a partially-covered endpoint chunk is unowned and can
        // be ignored here.
        let from = if start.offset != 0 {
            start.chunk.get() + self.depth
        } else {
            start.chunk.get()
        };
        let to = end.chunk.get();
        let mut inside = from;
        while inside < to {
            if self.entries[inside + 1].base().owned {
                let ptr = self.entries[inside].data();
                let mut outside = 0;
                while outside < self.entries.len() {
                    if (outside < from || outside >= to)
                        && self.entries[outside + 1].base().owned
                        && self.entries[outside].data() == ptr
                    {
                        return false;
                    }
                    outside += self.depth;
                }
            }
            inside += self.depth;
        }
        true
    }

    /// Extract `[pos, pos + len)` into a new buffer, leaving this one
    /// without that range. The new buffer keeps this buffer's depth and
    /// layer structure and shares its ownership context.
    ///
    /// # Returns
    /// `Error::ResourceExhausted` if metadata for the new buffer cannot be
    /// allocated; this buffer is unmodified on that path.
    ///
    /// # Panics
    /// If the range is out of bounds or fails `is_removable`.
    pub fn remove(&mut self, pos: usize, len: usize) -> Result<RawMultiBuf<'mem>> {
        assert!(pos + len <= self.len(), "remove range out of bounds");
        assert!(
            self.is_removable(pos, len),
            "remove range divides an owned allocation"
        );

        let depth = self.depth;
        let start = self.seek(pos);
        let end = self.seek(pos + len);
        let moved_blocks =
            (end.chunk.get() - start.chunk.get()) / depth + usize::from(end.offset != 0);
        let splits = usize::from(start.offset != 0) + usize::from(end.offset != 0);

        self.entries.try_reserve(splits * depth).map_err(Error::from)?;
        let mut extracted = VecDeque::new();
        extracted
            .try_reserve(moved_blocks * depth)
            .map_err(Error::from)?;

        // No allocation failure is possible past this point.
        let from = if start.offset != 0 {
            self.split_chunk(start.chunk, start.offset);
            start.chunk.get() + depth
        } else {
            start.chunk.get()
        };
        // Re-resolve the end: a start split shifts subsequent blocks.
        let end = self.seek(pos + len);
        let to = if end.offset != 0 {
            self.split_chunk(end.chunk, end.offset);
            end.chunk.get() + depth
        } else {
            end.chunk.get()
        };
        extracted.extend(self.entries.drain(from..to));

        trace!(pos, len, moved_blocks, "removed range into new buffer");
        self.notify(BufferEvent::BytesRemoved, len);
        Ok(RawMultiBuf {
            entries: extracted,
            depth,
            memory: self.share_context(),
            observer: None,
            _mem: PhantomData,
        })
    }

    /// Duplicate the ownership context for a buffer that will hold some of
    /// this buffer's chunks, retaining the control block if shared.
    fn share_context(&self) -> MemoryContext<'mem> {
        if let MemoryContext::Shared(block) = self.memory {
            // SAFETY: this buffer holds a counted reference.
            unsafe { retain_block(block) };
        }
        self.memory
    }

    /// Remove exactly one fragment from the front: the run of chunks up to
    /// and including the first nonzero-length chunk marking a fragment end.
    /// Zero-length chunks never terminate the run.
    pub fn pop_front_fragment(&mut self) -> Result<RawMultiBuf<'mem>> {
        let mut len = 0;
        for n in 0..self.num_chunks() {
            let c = self.chunk_at(n);
            let chunk_len = self.top_len(c);
            len += chunk_len;
            if chunk_len > 0 && self.is_fragment_end(c) {
                break;
            }
        }
        self.remove(0, len)
    }

    /// Drop `[pos, pos + len)`, freeing fully-discarded owned chunks
    /// immediately. Unlike `remove`, nothing is handed off, so owned chunks
    /// may be split at the endpoints.
    ///
    /// # Returns
    /// The byte offset of the position following the discarded range (which
    /// equals `pos` after the removal), or `Error::ResourceExhausted` with
    /// the buffer unmodified.
    pub fn discard(&mut self, pos: usize, len: usize) -> Result<usize> {
        assert!(pos + len <= self.len(), "discard range out of bounds");

        let depth = self.depth;
        let start = self.seek(pos);
        let end = self.seek(pos + len);
        let splits = usize::from(start.offset != 0) + usize::from(end.offset != 0);
        self.entries.try_reserve(splits * depth).map_err(Error::from)?;

        let from = if start.offset != 0 {
            self.split_chunk(start.chunk, start.offset);
            start.chunk.get() + depth
        } else {
            start.chunk.get()
        };
        let end = self.seek(pos + len);
        let to = if end.offset != 0 {
            self.split_chunk(end.chunk, end.offset);
            end.chunk.get() + depth
        } else {
            end.chunk.get()
        };
        let dropped: Vec<Entry> = self.entries.drain(from..to).collect();

        // Free owned chunks whose data pointer appears nowhere else: not in
        // a later discarded block (split siblings) and not in the entries
        // still held by this buffer.
        let blocks = dropped.len() / depth;
        for b in 0..blocks {
            if !dropped[b * depth + 1].base().owned {
                continue;
            }
            let ptr = dropped[b * depth].data();
            let dup_later = (b + 1..blocks).any(|j| dropped[j * depth].data() == ptr);
            let still_referenced = (0..self.num_chunks())
                .any(|n| self.entries[self.chunk_at(n).data_slot()].data() == ptr);
            if !dup_later && !still_referenced {
                self.memory.owned_deallocator().deallocate(ptr);
            }
        }

        trace!(pos, len, "discarded range");
        self.notify(BufferEvent::BytesRemoved, len);
        Ok(pos)
    }

    // ========== Release / Share ==========

    /// Whether the chunk starting at `pos` is owned and can be released.
    pub fn is_releasable(&self, pos: usize) -> bool {
        let rp = self.seek(pos);
        rp.offset == 0
            && rp.chunk.get() < self.entries.len()
            && self.entries[rp.chunk.base_slot()].base().owned
    }

    /// Remove the owned chunk starting at `pos` and return a unique handle
    /// to its memory without freeing it. The handle's length is the known
    /// extent of the base view (allocation start through view end).
    ///
    /// # Panics
    /// If `pos` is not a chunk start or the chunk is not owned.
    pub fn release(&mut self, pos: usize) -> OwnedBytes<'mem> {
        let rp = self.seek(pos);
        assert!(
            rp.offset == 0 && rp.chunk.get() < self.entries.len(),
            "release position is not a chunk start"
        );
        let base = self.entries[rp.chunk.base_slot()].base();
        assert!(base.owned, "chunk at position is not owned");

        let data = self.entries[rp.chunk.data_slot()].data();
        let released = self.top_len(rp.chunk);
        let from = rp.chunk.get();
        self.entries.drain(from..from + self.depth);
        self.notify(BufferEvent::BytesRemoved, released);

        let deallocator = self.memory.owned_deallocator();
        // SAFETY: the owned flag certifies this buffer held the sole
        // deallocation right, which transfers to the returned handle.
        unsafe { OwnedBytes::from_raw(data, base.offset + base.length, deallocator) }
    }

    /// Whether the chunk starting at `pos` is shared (and not owned).
    pub fn is_shareable(&self, pos: usize) -> bool {
        let rp = self.seek(pos);
        if rp.offset != 0 || rp.chunk.get() >= self.entries.len() {
            return false;
        }
        let base = self.entries[rp.chunk.base_slot()].base();
        base.shared && !base.owned
    }

    /// Take an additional counted reference to the shared chunk starting at
    /// `pos`. The chunk stays in the buffer.
    ///
    /// # Panics
    /// If the chunk is not shareable.
    pub fn share(&self, pos: usize) -> SharedBytes<'mem> {
        assert!(self.is_shareable(pos), "chunk at position is not shareable");
        let block = self.memory.shared_block();
        // SAFETY: the buffer's context holds a counted reference; the new
        // handle gets its own.
        unsafe {
            retain_block(block);
            SharedBytes::from_retained(block)
        }
    }

    // ========== Linear byte access ==========

    /// Copy bytes starting at logical `offset` into `dst` until either is
    /// exhausted.
    ///
    /// # Returns
    /// The number of bytes copied.
    pub fn copy_to(&self, dst: &mut [u8], offset: usize) -> usize {
        let mut skip = offset;
        let mut written = 0;
        for n in 0..self.num_chunks() {
            if written == dst.len() {
                break;
            }
            let chunk = self.chunk_slice(self.chunk_at(n));
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let avail = &chunk[skip..];
            skip = 0;
            let count = avail.len().min(dst.len() - written);
            dst[written..written + count].copy_from_slice(&avail[..count]);
            written += count;
        }
        written
    }

    /// Copy bytes from `src` into the buffer starting at logical `offset`
    /// until either is exhausted.
    ///
    /// Reachable only through non-const façades, whose insertion rules
    /// guarantee every chunk references writable memory.
    ///
    /// # Returns
    /// The number of bytes written.
    pub fn copy_from(&mut self, src: &[u8], offset: usize) -> usize {
        let mut skip = offset;
        let mut read = 0;
        for n in 0..self.num_chunks() {
            if read == src.len() {
                break;
            }
            let c = self.chunk_at(n);
            let len = self.top_len(c);
            if skip >= len {
                skip -= len;
                continue;
            }
            let count = (len - skip).min(src.len() - read);
            let data = self.entries[c.data_slot()].data();
            // SAFETY: the span stays within the chunk's allocation, and the
            // non-const façade contract makes it writable. `src` is a
            // separate borrow and cannot overlap a &mut-reachable chunk.
            unsafe {
                let dst = data.as_ptr().add(self.data_offset(c) + skip);
                std::ptr::copy_nonoverlapping(src.as_ptr().add(read), dst, count);
            }
            read += count;
            skip = 0;
        }
        read
    }

    /// Return a view of up to `copy_buf.len()` bytes starting at `offset`.
    ///
    /// If the requested range lies within one physically contiguous run of
    /// chunks, the returned span points directly into chunk memory and
    /// `copy_buf` is untouched; otherwise the bytes are copied into
    /// `copy_buf` and a prefix of it is returned. Returns an empty span if
    /// `offset >= len()`.
    pub fn get<'r>(&'r self, copy_buf: &'r mut [u8], offset: usize) -> &'r [u8] {
        let total = self.len();
        if offset >= total {
            return &[];
        }
        let want = copy_buf.len().min(total - offset);
        if want == 0 {
            return &[];
        }

        let rp = self.seek(offset);
        let (chunk_ptr, chunk_len) = self.chunk_span(rp.chunk.get());
        // SAFETY: rp.offset < chunk_len, so the pointer stays in the span.
        let start = unsafe { chunk_ptr.add(rp.offset) };
        let mut run = chunk_len - rp.offset;
        let mut c = rp.chunk.next(self.depth);
        while run < want && c.get() < self.entries.len() {
            let (ptr, len) = self.chunk_span(c.get());
            c = c.next(self.depth);
            if len == 0 {
                continue;
            }
            // SAFETY: run bytes past start is the end of the previous span.
            if ptr != unsafe { start.add(run) } {
                break;
            }
            run += len;
        }
        if run >= want {
            // SAFETY: `want` bytes starting at `start` were just verified to
            // be physically contiguous live chunk memory.
            return unsafe { std::slice::from_raw_parts(start, want) };
        }
        let written = self.copy_to(&mut copy_buf[..want], offset);
        &copy_buf[..written]
    }

    // ========== Clear ==========

    /// Remove everything: free owned chunks (deduplicating repeated data
    /// pointers from earlier splits), release the ownership context, drop
    /// all layers, and detach the observer after a final notification.
    ///
    /// Calling `clear` twice is safe; the second call is a no-op on an
    /// already-empty buffer.
    pub fn clear(&mut self) {
        let total = self.len();
        let chunks = self.num_chunks();
        for n in 0..chunks {
            let c = self.chunk_at(n);
            if !self.entries[c.base_slot()].base().owned {
                continue;
            }
            let ptr = self.entries[c.data_slot()].data();
            // A pointer shared with a later owned chunk is freed at its last
            // occurrence.
            let dup_later = (n + 1..chunks).any(|j| {
                let cj = self.chunk_at(j);
                self.entries[cj.base_slot()].base().owned
                    && self.entries[cj.data_slot()].data() == ptr
            });
            if !dup_later {
                self.memory.owned_deallocator().deallocate(ptr);
            }
        }
        if let MemoryContext::Shared(block) = self.memory {
            // SAFETY: the context holds one counted reference.
            unsafe { release_block(block) };
        }
        self.memory = MemoryContext::Empty;
        self.entries.clear();
        self.depth = 2;
        debug!(bytes = total, "cleared buffer");
        self.notify(BufferEvent::BytesRemoved, total);
        self.observer = None;
    }

    // ========== Layers ==========

    /// Overlay a new top layer spanning `[offset, offset + length)` of the
    /// current top-layer byte sequence, distributed across chunks. The last
    /// chunk's new view marks the fragment end, collapsing all previous
    /// fragments into one. Length clamps to the bytes available past
    /// `offset`.
    ///
    /// # Returns
    /// `false` without mutating state if entry reservation fails.
    pub fn add_layer(&mut self, offset: usize, length: usize) -> bool {
        let chunks = self.num_chunks();
        if self.entries.try_reserve(chunks).is_err() {
            return false;
        }
        let parent_lens: Vec<usize> =
            (0..chunks).map(|n| self.top_len(self.chunk_at(n))).collect();
        let views = distribute_layer(&parent_lens, offset, length);
        let layer_len: usize = views.iter().map(|&(_, len)| len).sum();

        let old_depth = self.depth;
        for n in (0..chunks).rev() {
            let (view_offset, view_len) = views[n];
            self.entries.insert(
                n * old_depth + old_depth,
                Entry::View(LayerView {
                    offset: view_offset,
                    length: view_len,
                    sealed: false,
                    boundary: n == chunks - 1,
                }),
            );
        }
        self.depth = old_depth + 1;
        debug!(offset, length = layer_len, depth = self.depth, "added layer");
        self.notify(BufferEvent::LayerAdded, layer_len);
        true
    }

    /// Whether the top layer is sealed against resize and pop.
    pub fn is_top_layer_sealed(&self) -> bool {
        self.depth >= 3
            && self.num_chunks() > 0
            && (0..self.num_chunks())
                .all(|n| self.entries[self.chunk_at(n).top_slot(self.depth)].view().sealed)
    }

    /// Forbid resizing or removing the top layer.
    ///
    /// # Panics
    /// If there is no layer above the base view.
    pub fn seal_top_layer(&mut self) {
        self.set_top_seal(true);
    }

    /// Re-permit resizing and removing the top layer.
    pub fn unseal_top_layer(&mut self) {
        self.set_top_seal(false);
    }

    fn set_top_seal(&mut self, sealed: bool) {
        assert!(self.depth >= 3, "no sealable layer above the base view");
        for n in 0..self.num_chunks() {
            let slot = self.chunk_at(n).top_slot(self.depth);
            self.entries[slot].view_mut().sealed = sealed;
        }
    }

    /// Length of the layer directly below the top, per chunk.
    fn parent_len(&self, c: ChunkIndex) -> usize {
        let slot = self.depth - 2;
        if slot == 1 {
            self.entries[c.base_slot()].base().length
        } else {
            self.entries[c.get() + slot].view().length
        }
    }

    /// Redistribute the top layer over `[offset, offset + length)` of the
    /// layer below it, in place.
    ///
    /// # Returns
    /// `false` if the top layer is sealed.
    ///
    /// # Panics
    /// If there is no layer above the base view.
    pub fn resize_top_layer(&mut self, offset: usize, length: usize) -> bool {
        assert!(self.depth >= 3, "no resizable layer above the base view");
        if self.is_top_layer_sealed() {
            return false;
        }
        let chunks = self.num_chunks();
        let parent_lens: Vec<usize> =
            (0..chunks).map(|n| self.parent_len(self.chunk_at(n))).collect();
        let views = distribute_layer(&parent_lens, offset, length);
        for n in 0..chunks {
            let slot = self.chunk_at(n).top_slot(self.depth);
            let view = self.entries[slot].view_mut();
            view.offset = views[n].0;
            view.length = views[n].1;
        }
        true
    }

    /// Shrink the top layer to its first `length` bytes, keeping each
    /// chunk's view start.
    ///
    /// # Returns
    /// `false` if the top layer is sealed.
    pub fn truncate_top_layer(&mut self, length: usize) -> bool {
        assert!(self.depth >= 3, "no resizable layer above the base view");
        if self.is_top_layer_sealed() {
            return false;
        }
        let mut remaining = length;
        for n in 0..self.num_chunks() {
            let slot = self.chunk_at(n).top_slot(self.depth);
            let view = self.entries[slot].view_mut();
            let keep = view.length.min(remaining);
            view.length = keep;
            remaining -= keep;
        }
        true
    }

    /// Remove the top layer from every chunk, restoring the layer below as
    /// the visible byte sequence.
    ///
    /// # Returns
    /// `false` if the top layer is sealed.
    ///
    /// # Panics
    /// If only the base view remains.
    pub fn pop_layer(&mut self) -> bool {
        assert!(self.num_layers() > 1, "cannot pop the base view layer");
        if self.is_top_layer_sealed() {
            return false;
        }
        let old_depth = self.depth;
        for n in (0..self.num_chunks()).rev() {
            self.entries.remove(n * old_depth + old_depth - 1);
        }
        self.depth = old_depth - 1;
        let restored = self.len();
        debug!(depth = self.depth, restored, "popped layer");
        self.notify(BufferEvent::LayerRemoved, restored);
        true
    }

    // ========== Iteration ==========

    /// Iterate maximal physically contiguous spans of the top layer.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks::new(self)
    }

    /// Iterate the logical byte sequence front to back.
    pub fn bytes(&self) -> Bytes<'_> {
        Bytes::new(self)
    }

    /// A cursor at logical position `pos`; `pos == len()` yields the
    /// one-past-the-end cursor.
    pub fn byte_cursor(&self, pos: usize) -> ByteCursor<'_> {
        ByteCursor::new_at(self, pos)
    }

    // ========== Observer ==========

    fn notify(&self, event: BufferEvent, count: usize) {
        if let Some(observer) = self.observer {
            observer.notify(event, count);
        }
    }
}

/// Distribute a `[offset, offset + length)` span of a layer's total byte
/// sequence across per-chunk parent spans, front to back. Chunks shorter
/// than the remaining offset yield zero-length views and carry the
/// remainder forward; length clamps to the bytes available.
fn distribute_layer(parent_lens: &[usize], offset: usize, length: usize) -> Vec<(usize, usize)> {
    let mut rem_offset = offset;
    let mut rem_len = length;
    parent_lens
        .iter()
        .map(|&parent| {
            let view_offset = rem_offset.min(parent);
            rem_offset -= view_offset;
            let view_len = rem_len.min(parent - view_offset);
            rem_len -= view_len;
            (view_offset, view_len)
        })
        .collect()
}

impl Default for RawMultiBuf<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RawMultiBuf<'_> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for RawMultiBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMultiBuf")
            .field("chunks", &self.num_chunks())
            .field("layers", &self.num_layers())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_alloc::{BumpAllocator, RawAllocator};
    use std::alloc::Layout;
    use std::cell::Cell;

    fn nn(bytes: &mut [u8]) -> NonNull<u8> {
        NonNull::new(bytes.as_mut_ptr()).unwrap()
    }

    fn push_slice<'m>(buf: &mut RawMultiBuf<'m>, bytes: &'m mut [u8]) {
        let len = bytes.len();
        let pos = buf.len();
        assert!(buf.try_reserve_chunks(1));
        buf.insert_unowned(pos, nn(bytes), 0, len);
    }

    #[test]
    fn test_new_is_empty() {
        let buf = RawMultiBuf::new();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.num_layers(), 1);
        assert_eq!(buf.num_chunks(), 0);
    }

    #[test]
    fn test_push_and_size_additivity() {
        let mut a = [1u8; 4];
        let mut b = [2u8; 8];
        let mut c = [3u8; 16];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        assert_eq!(buf.len(), 4);
        push_slice(&mut buf, &mut b);
        assert_eq!(buf.len(), 12);
        push_slice(&mut buf, &mut c);
        assert_eq!(buf.len(), 28);
        assert_eq!(buf.num_fragments(), 3);
    }

    #[test]
    fn test_copy_to_spans_chunks() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        a.copy_from_slice(&[1, 2, 3, 4]);
        b.copy_from_slice(&[5, 6, 7, 8]);
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        push_slice(&mut buf, &mut b);

        let mut out = [0u8; 8];
        assert_eq!(buf.copy_to(&mut out, 0), 8);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);

        let mut tail = [0u8; 3];
        assert_eq!(buf.copy_to(&mut tail, 3), 3);
        assert_eq!(tail, [4, 5, 6]);

        let mut past = [0u8; 2];
        assert_eq!(buf.copy_to(&mut past, 8), 0);
    }

    #[test]
    fn test_copy_from_writes_through() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        push_slice(&mut buf, &mut b);

        assert_eq!(buf.copy_from(&[9, 9, 9, 9, 9, 9], 1), 6);
        let mut out = [0u8; 8];
        buf.copy_to(&mut out, 0);
        assert_eq!(out, [0, 9, 9, 9, 9, 9, 9, 0]);
    }

    #[test]
    fn test_insert_mid_chunk_splits() {
        let mut a = [1u8; 8];
        let mut b = [2u8; 4];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);

        assert!(buf.try_reserve_chunks(2)); // new chunk plus the split
        buf.insert_unowned(4, nn(&mut b), 0, 4);

        assert_eq!(buf.len(), 12);
        assert_eq!(buf.num_chunks(), 3);
        let mut out = [0u8; 12];
        buf.copy_to(&mut out, 0);
        assert_eq!(out, [1, 1, 1, 1, 2, 2, 2, 2, 1, 1, 1, 1]);
    }

    #[test]
    fn test_remove_and_insert_round_trip() {
        let mut a = [1u8; 4];
        let mut b = [2u8; 8];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        push_slice(&mut buf, &mut b);

        let mut before = [0u8; 12];
        buf.copy_to(&mut before, 0);

        let removed = buf.remove(2, 6).unwrap();
        assert_eq!(removed.len(), 6);
        assert_eq!(buf.len(), 6);

        assert!(buf.try_reserve_for_insert(2, &removed));
        buf.insert_buf(2, removed);
        assert_eq!(buf.len(), 12);
        let mut after = [0u8; 12];
        buf.copy_to(&mut after, 0);
        assert_eq!(before, after);
    }

    #[test]
    fn test_remove_whole_chunks() {
        let mut a = [1u8; 4];
        let mut b = [2u8; 4];
        let mut c = [3u8; 4];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        push_slice(&mut buf, &mut b);
        push_slice(&mut buf, &mut c);

        let mid = buf.remove(4, 4).unwrap();
        assert_eq!(mid.len(), 4);
        let mut out = [0u8; 8];
        buf.copy_to(&mut out, 0);
        assert_eq!(out, [1, 1, 1, 1, 3, 3, 3, 3]);
    }

    #[test]
    fn test_get_zero_copy_within_chunk() {
        let mut a = [7u8; 16];
        let mut buf = RawMultiBuf::new();
        let base = a.as_ptr() as usize;
        push_slice(&mut buf, &mut a);

        let mut tmp = [0u8; 8];
        let span = buf.get(&mut tmp, 4);
        assert_eq!(span.len(), 8);
        assert_eq!(span.as_ptr() as usize, base + 4);
    }

    #[test]
    fn test_get_copies_across_non_adjacent_chunks() {
        // Chunks in reversed physical order can never coalesce.
        let mut region = [0u8; 16];
        region[..8].copy_from_slice(&[1u8; 8]);
        region[8..].copy_from_slice(&[2u8; 8]);
        let (left, right) = region.split_at_mut(8);
        let left_ptr = NonNull::new(left.as_mut_ptr()).unwrap();
        let right_ptr = NonNull::new(right.as_mut_ptr()).unwrap();

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(2));
        buf.insert_unowned(0, right_ptr, 0, 8);
        buf.insert_unowned(8, left_ptr, 0, 8);

        let mut tmp = [0u8; 16];
        let tmp_base = tmp.as_ptr() as usize;
        let span = buf.get(&mut tmp, 0);
        assert_eq!(span.len(), 16);
        assert_eq!(span.as_ptr() as usize, tmp_base);
        assert_eq!(&span[..8], &[2u8; 8]);
        assert_eq!(&span[8..], &[1u8; 8]);
    }

    #[test]
    fn test_get_zero_copy_across_adjacent_chunks() {
        // Two chunks carved from one allocation are physically adjacent.
        let mut region = [0u8; 64];
        let base = region.as_ptr() as usize;
        let (left, right) = region.split_at_mut(32);
        let left_ptr = NonNull::new(left.as_mut_ptr()).unwrap();
        let right_ptr = NonNull::new(right.as_mut_ptr()).unwrap();

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(2));
        buf.insert_unowned(0, left_ptr, 0, 32);
        buf.insert_unowned(32, right_ptr, 0, 32);

        let mut tmp = [0u8; 48];
        let span = buf.get(&mut tmp, 8);
        assert_eq!(span.len(), 48);
        assert_eq!(span.as_ptr() as usize, base + 8);
    }

    #[test]
    fn test_add_layer_distribution() {
        let mut a = [1u8; 4];
        let mut b = [2u8; 8];
        let mut c = [3u8; 16];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        push_slice(&mut buf, &mut b);
        push_slice(&mut buf, &mut c);

        assert!(buf.add_layer(2, 12));
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.num_layers(), 2);
        assert_eq!(buf.num_fragments(), 1);

        let mut out = [0u8; 12];
        buf.copy_to(&mut out, 0);
        assert_eq!(out, [1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 3, 3]);

        assert!(buf.pop_layer());
        assert_eq!(buf.len(), 28);
        assert_eq!(buf.num_fragments(), 3);
    }

    #[test]
    fn test_add_layer_clamps_length() {
        let mut a = [1u8; 8];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        assert!(buf.add_layer(6, 100));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_pop_front_fragment_consumes_layered_whole() {
        let mut a = [1u8; 4];
        let mut b = [2u8; 8];
        let mut c = [3u8; 16];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        push_slice(&mut buf, &mut b);
        push_slice(&mut buf, &mut c);
        assert!(buf.add_layer(2, 12));

        let frag = buf.pop_front_fragment().unwrap();
        assert_eq!(frag.len(), 12);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pop_front_fragment_unlayered_takes_one_chunk() {
        let mut a = [1u8; 4];
        let mut b = [2u8; 8];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        push_slice(&mut buf, &mut b);

        let frag = buf.pop_front_fragment().unwrap();
        assert_eq!(frag.len(), 4);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.num_fragments(), 1);
    }

    #[test]
    fn test_seal_blocks_resize_and_pop() {
        let mut a = [1u8; 8];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        assert!(buf.add_layer(0, 8));

        buf.seal_top_layer();
        assert!(buf.is_top_layer_sealed());
        assert!(!buf.resize_top_layer(0, 4));
        assert!(!buf.truncate_top_layer(4));
        assert!(!buf.pop_layer());
        assert_eq!(buf.num_layers(), 2);

        buf.unseal_top_layer();
        assert!(buf.truncate_top_layer(4));
        assert_eq!(buf.len(), 4);
        assert!(buf.pop_layer());
        assert_eq!(buf.num_layers(), 1);
    }

    #[test]
    fn test_resize_top_layer_redistributes() {
        let mut a = [1u8; 4];
        let mut b = [2u8; 8];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        push_slice(&mut buf, &mut b);
        assert!(buf.add_layer(0, 12));
        assert!(buf.resize_top_layer(2, 6));
        assert_eq!(buf.len(), 6);
        let mut out = [0u8; 6];
        buf.copy_to(&mut out, 0);
        assert_eq!(out, [1, 1, 2, 2, 2, 2]);
    }

    #[test]
    #[should_panic(expected = "cannot pop the base view")]
    fn test_pop_base_layer_panics() {
        let mut buf = RawMultiBuf::new();
        buf.pop_layer();
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut a = [1u8; 4];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        assert!(buf.add_layer(0, 4));

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.num_layers(), 1);

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.num_layers(), 1);
    }

    struct CountingBump<'r> {
        inner: BumpAllocator<'r>,
        frees: Cell<usize>,
    }

    impl<'r> CountingBump<'r> {
        fn new(region: &'r mut [u8]) -> Self {
            Self {
                inner: BumpAllocator::new(region),
                frees: Cell::new(0),
            }
        }
    }

    impl RawDeallocator for CountingBump<'_> {
        fn deallocate(&self, ptr: NonNull<u8>) {
            self.frees.set(self.frees.get() + 1);
            self.inner.deallocate(ptr);
        }
    }

    impl RawAllocator for CountingBump<'_> {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            self.inner.allocate(layout)
        }
    }

    #[test]
    fn test_owned_chunk_freed_on_clear() {
        let mut region = [0u8; 64];
        let alloc = CountingBump::new(&mut region);
        let bytes = OwnedBytes::allocate(&alloc, 16).unwrap();

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(1));
        let len = bytes.len();
        buf.insert_owned(0, bytes, 0, len);
        assert_eq!(buf.len(), 16);
        assert!(buf.is_releasable(0));

        buf.clear();
        assert_eq!(alloc.frees.get(), 1);
    }

    #[test]
    fn test_split_owned_chunk_freed_once() {
        let mut region = [0u8; 64];
        let alloc = CountingBump::new(&mut region);
        let bytes = OwnedBytes::allocate(&alloc, 16).unwrap();
        let mut filler = [9u8; 4];

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(1));
        buf.insert_owned(0, bytes, 0, 16);
        // Mid-chunk insert splits the owned chunk into two entries sharing
        // one data pointer.
        assert!(buf.try_reserve_chunks(2));
        buf.insert_unowned(8, nn(&mut filler), 0, 4);
        assert_eq!(buf.num_chunks(), 3);

        buf.clear();
        assert_eq!(alloc.frees.get(), 1);
    }

    #[test]
    fn test_release_transfers_ownership() {
        let mut region = [0u8; 64];
        let alloc = CountingBump::new(&mut region);
        let bytes = OwnedBytes::allocate(&alloc, 16).unwrap();

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(1));
        buf.insert_owned(0, bytes, 0, 16);

        let released = buf.release(0);
        assert_eq!(released.len(), 16);
        assert_eq!(alloc.frees.get(), 0);
        assert!(buf.is_empty());

        drop(released);
        assert_eq!(alloc.frees.get(), 1);
    }

    #[test]
    #[should_panic(expected = "not owned")]
    fn test_release_unowned_panics() {
        let mut a = [1u8; 4];
        let mut buf = RawMultiBuf::new();
        push_slice(&mut buf, &mut a);
        buf.release(0);
    }

    #[test]
    fn test_shared_chunk_refcount_balance() {
        let mut region = [0u8; 64];
        let alloc = CountingBump::new(&mut region);
        let shared = SharedBytes::new(OwnedBytes::allocate(&alloc, 16).unwrap());

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(2));
        buf.insert_shared(0, &shared, 0, 8);
        buf.insert_shared(8, &shared, 8, 8);
        // Handle + one buffer context reference.
        assert_eq!(shared.control_block().ref_count(), 2);

        assert!(buf.is_shareable(0));
        assert!(!buf.is_releasable(0));
        let extra = buf.share(0);
        assert_eq!(shared.control_block().ref_count(), 3);
        drop(extra);

        buf.clear();
        assert_eq!(shared.control_block().ref_count(), 1);
        assert_eq!(alloc.frees.get(), 0);
        drop(shared);
        assert_eq!(alloc.frees.get(), 1);
    }

    #[test]
    fn test_is_removable_rejects_owned_mid_chunk() {
        let mut region = [0u8; 64];
        let alloc = CountingBump::new(&mut region);
        let bytes = OwnedBytes::allocate(&alloc, 16).unwrap();

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(1));
        buf.insert_owned(0, bytes, 0, 16);

        assert!(!buf.is_removable(4, 8));
        assert!(buf.is_removable(0, 16));
    }

    #[test]
    fn test_is_removable_rejects_separating_split_owned_chunk() {
        let mut region = [0u8; 64];
        let alloc = CountingBump::new(&mut region);
        let bytes = OwnedBytes::allocate(&alloc, 16).unwrap();
        let mut filler = [7u8; 4];

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(1));
        buf.insert_owned(0, bytes, 0, 16);
        // Mid-chunk insert leaves two owned chunks over one allocation.
        assert!(buf.try_reserve_chunks(2));
        buf.insert_unowned(8, nn(&mut filler), 0, 4);
        assert_eq!(buf.num_chunks(), 3);

        // Extracting either half alone would leave two buffers freeing
        // the same allocation.
        assert!(!buf.is_removable(0, 8));
        assert!(!buf.is_removable(12, 8));
        // The unowned filler splits freely, and a range covering both
        // halves keeps the allocation in one buffer.
        assert!(buf.is_removable(8, 4));
        assert!(buf.is_removable(0, 20));

        let taken = buf.remove(0, 20).unwrap();
        drop(taken);
        buf.clear();
        assert_eq!(alloc.frees.get(), 1);
    }

    #[test]
    fn test_discard_frees_fully_dropped_owned_chunk() {
        let mut region = [0u8; 64];
        let alloc = CountingBump::new(&mut region);
        let bytes = OwnedBytes::allocate(&alloc, 16).unwrap();
        let mut tail = [5u8; 4];

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(2));
        buf.insert_owned(0, bytes, 0, 16);
        buf.insert_unowned(16, nn(&mut tail), 0, 4);

        let after = buf.discard(0, 16).unwrap();
        assert_eq!(after, 0);
        assert_eq!(alloc.frees.get(), 1);
        assert_eq!(buf.len(), 4);

        buf.clear();
        assert_eq!(alloc.frees.get(), 1);
    }

    #[test]
    fn test_discard_partial_owned_chunk_defers_free() {
        let mut region = [0u8; 64];
        let alloc = CountingBump::new(&mut region);
        let bytes = OwnedBytes::allocate(&alloc, 16).unwrap();

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(1));
        buf.insert_owned(0, bytes, 0, 16);

        // Discarding half splits the chunk; the surviving half still
        // references the allocation, so nothing is freed yet.
        buf.discard(0, 8).unwrap();
        assert_eq!(alloc.frees.get(), 0);
        assert_eq!(buf.len(), 8);

        buf.clear();
        assert_eq!(alloc.frees.get(), 1);
    }

    #[test]
    fn test_incompatible_deallocators_rejected() {
        let mut region_a = [0u8; 32];
        let mut region_b = [0u8; 32];
        let alloc_a = CountingBump::new(&mut region_a);
        let alloc_b = CountingBump::new(&mut region_b);
        let bytes_a = OwnedBytes::allocate(&alloc_a, 8).unwrap();
        let bytes_b = OwnedBytes::allocate(&alloc_b, 8).unwrap();

        let mut buf = RawMultiBuf::new();
        assert!(buf.try_reserve_chunks(2));
        buf.insert_owned(0, bytes_a, 0, 8);
        assert!(!buf.is_compatible_owned(&bytes_b));
        drop(bytes_b);
    }

    struct EventLog {
        events: std::cell::RefCell<Vec<(BufferEvent, usize)>>,
    }

    impl EventLog {
        fn new() -> Self {
            Self {
                events: std::cell::RefCell::new(Vec::new()),
            }
        }
    }

    impl BufferObserver for EventLog {
        fn notify(&self, event: BufferEvent, count: usize) {
            self.events.borrow_mut().push((event, count));
        }
    }

    #[test]
    fn test_observer_sees_mutations() {
        let log = EventLog::new();
        let mut a = [1u8; 4];
        let mut buf = RawMultiBuf::new();
        buf.set_observer(Some(&log));

        push_slice(&mut buf, &mut a);
        assert!(buf.add_layer(0, 4));
        assert!(buf.pop_layer());
        buf.clear();

        let events = log.events.borrow();
        assert_eq!(
            *events,
            vec![
                (BufferEvent::BytesAdded, 4),
                (BufferEvent::LayerAdded, 4),
                (BufferEvent::LayerRemoved, 4),
                (BufferEvent::BytesRemoved, 4),
            ]
        );
    }

    #[test]
    fn test_observer_detached_by_clear() {
        let log = EventLog::new();
        let mut buf = RawMultiBuf::new();
        buf.set_observer(Some(&log));
        buf.clear();
        assert_eq!(log.events.borrow().len(), 1);
        buf.clear();
        // Second clear has no observer to notify.
        assert_eq!(log.events.borrow().len(), 1);
    }

    #[test]
    fn test_insert_buf_into_deeper_destination() {
        let mut a = [1u8; 8];
        let mut b = [2u8; 4];
        let mut dst = RawMultiBuf::new();
        push_slice(&mut dst, &mut a);
        assert!(dst.add_layer(0, 8));

        let mut src = RawMultiBuf::new();
        push_slice(&mut src, &mut b);

        assert!(dst.try_reserve_for_push_back(&src));
        let at = dst.len();
        dst.insert_buf(at, src);

        assert_eq!(dst.len(), 12);
        assert_eq!(dst.num_fragments(), 2);
        let mut out = [0u8; 12];
        dst.copy_to(&mut out, 0);
        assert_eq!(out, [1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_distribute_layer_carries_remainder() {
        assert_eq!(
            distribute_layer(&[4, 8, 16], 2, 12),
            vec![(2, 2), (0, 8), (0, 2)]
        );
        // Offset longer than the first chunk carries into the second.
        assert_eq!(
            distribute_layer(&[4, 8], 6, 4),
            vec![(4, 0), (2, 4)]
        );
        // Length clamps to what is available.
        assert_eq!(distribute_layer(&[4], 0, 100), vec![(0, 4)]);
    }
}
