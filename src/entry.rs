//! Entry metadata for chunk bookkeeping.
//!
//! Each physical chunk is described by `depth` consecutive entries in a flat
//! deque. Keeping the metadata in a strided array-of-sums (instead of a
//! per-chunk allocation) keeps the hot paths cache-friendly and makes layer
//! insertion a simple entry-shift.
//!
//! # Block Layout
//!
//! ```text
//! +-------------+
//! |    Data     |  slot 0 - pointer to the start of the backing memory
//! +-------------+           (never offset; always the true allocation start)
//! |    Base     |  slot 1 - {offset, length, owned, shared}
//! +-------------+           span of slot-0 memory visible at layer 1
//! |    View     |  slot 2 - {offset, length, sealed, boundary}
//! +-------------+           subspan of the layer directly below
//! |    ...      |  slots 3..depth-1, one per additional layer
//! +-------------+
//! ```
//!
//! `depth >= 2` always: layer 0 is the data pointer, layer 1 the base view.
//! An empty buffer has `depth == 2` and zero entries.

use std::ptr::NonNull;

/// The span of backing memory visible at the lowest layer, plus ownership
/// flags for that memory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BaseView {
    /// Start of the visible span, relative to the data pointer.
    pub offset: usize,
    /// Length of the visible span in bytes.
    pub length: usize,
    /// The buffer holds the sole deallocation right for this memory.
    pub owned: bool,
    /// Deallocation is governed by a shared control block.
    pub shared: bool,
}

/// One layer's subspan of the layer directly below it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayerView {
    /// Start of the subspan, relative to the parent layer's span.
    pub offset: usize,
    /// Length of the subspan in bytes.
    pub length: usize,
    /// Resizing or removing this layer is forbidden.
    pub sealed: bool,
    /// This chunk is the last chunk of a fragment at this layer.
    pub boundary: bool,
}

/// The atomic metadata unit stored in the entry deque.
///
/// Accessors assert the variant: reading the wrong slot kind is a logic bug
/// in the engine's index arithmetic, not a recoverable condition.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Entry {
    /// Slot 0 of a chunk block.
    Data(NonNull<u8>),
    /// Slot 1 of a chunk block.
    Base(BaseView),
    /// Slots 2..depth-1 of a chunk block.
    View(LayerView),
}

impl Entry {
    pub fn data(&self) -> NonNull<u8> {
        match self {
            Self::Data(ptr) => *ptr,
            other => panic!("entry is not a data slot: {other:?}"),
        }
    }

    pub fn base(&self) -> BaseView {
        match self {
            Self::Base(view) => *view,
            other => panic!("entry is not a base-view slot: {other:?}"),
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseView {
        match self {
            Self::Base(view) => view,
            other => panic!("entry is not a base-view slot: {other:?}"),
        }
    }

    pub fn view(&self) -> LayerView {
        match self {
            Self::View(view) => *view,
            other => panic!("entry is not a view slot: {other:?}"),
        }
    }

    pub fn view_mut(&mut self) -> &mut LayerView {
        match self {
            Self::View(view) => view,
            other => panic!("entry is not a view slot: {other:?}"),
        }
    }
}

/// Index of a chunk block within the entry deque.
///
/// Always a multiple of `depth`, or equal to the deque length for the
/// past-the-end position. Using a dedicated type keeps the stride arithmetic
/// in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ChunkIndex(usize);

impl ChunkIndex {
    pub fn new(index: usize, depth: usize) -> Self {
        debug_assert!(index % depth == 0, "chunk index {index} not a multiple of {depth}");
        Self(index)
    }

    /// The first chunk block.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Raw entry index of slot 0.
    #[inline]
    pub fn get(self) -> usize {
        self.0
    }

    /// Entry index of the data slot.
    #[inline]
    pub fn data_slot(self) -> usize {
        self.0
    }

    /// Entry index of the base-view slot.
    #[inline]
    pub fn base_slot(self) -> usize {
        self.0 + 1
    }

    /// Entry index of the top-layer slot for the given depth.
    #[inline]
    pub fn top_slot(self, depth: usize) -> usize {
        self.0 + depth - 1
    }

    /// The next chunk block.
    #[inline]
    pub fn next(self, depth: usize) -> Self {
        Self(self.0 + depth)
    }
}

/// A resolved logical position: a chunk block plus a byte offset within
/// that chunk's top-layer span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawPos {
    pub chunk: ChunkIndex,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_entry() -> Entry {
        Entry::Data(NonNull::dangling())
    }

    #[test]
    fn test_accessors_match_variant() {
        let base = Entry::Base(BaseView {
            offset: 4,
            length: 8,
            owned: true,
            shared: false,
        });
        assert_eq!(base.base().offset, 4);
        assert_eq!(base.base().length, 8);
        assert!(base.base().owned);

        let view = Entry::View(LayerView {
            offset: 1,
            length: 2,
            sealed: false,
            boundary: true,
        });
        assert_eq!(view.view().length, 2);
        assert!(view.view().boundary);

        assert!(data_entry().data().as_ptr() as usize != 0);
    }

    #[test]
    #[should_panic(expected = "not a base-view slot")]
    fn test_base_accessor_panics_on_data() {
        data_entry().base();
    }

    #[test]
    #[should_panic(expected = "not a view slot")]
    fn test_view_accessor_panics_on_base() {
        Entry::Base(BaseView {
            offset: 0,
            length: 0,
            owned: false,
            shared: false,
        })
        .view();
    }

    #[test]
    fn test_chunk_index_stride() {
        let depth = 3;
        let c = ChunkIndex::zero();
        assert_eq!(c.data_slot(), 0);
        assert_eq!(c.base_slot(), 1);
        assert_eq!(c.top_slot(depth), 2);

        let n = c.next(depth);
        assert_eq!(n.get(), 3);
        assert_eq!(n.top_slot(depth), 5);
    }
}
