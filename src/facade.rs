//! Compile-time propertied buffer types.
//!
//! [`MultiBuf`] is a zero-cost wrapper over the core engine whose three
//! const parameters gate which operations exist on a given type:
//!
//! - `CONST` - the buffer may reference read-only memory; byte-writing
//!   operations (`copy_from`, inserting `&mut` slices) do not exist
//! - `LAYERABLE` - view-layer operations exist
//! - `OBSERVABLE` - an observer may be attached
//!
//! Illegal operations are absent from the type rather than checked at
//! runtime, so misuse is a compile error. Structural mutation (insert,
//! remove, layering) is available on const buffers too; `CONST` governs
//! only byte mutability.
//!
//! A façade can be reinterpreted as a differently-propertied façade over
//! the same engine without copying. Byte-write access can only be given
//! up, never regained, and giving it up consumes the buffer: a const
//! façade may hold read-only memory, so no writable handle to the same
//! engine may survive the conversion.

use std::fmt;
use std::ptr::NonNull;

use crate::buffer::RawMultiBuf;
use crate::error::Result;
use crate::iter::{ByteCursor, Bytes, Chunks};
use crate::observer::BufferObserver;
use crate::raw_alloc::{OwnedBytes, SharedBytes};

/// A layered multi-segment buffer with compile-time property gating.
///
/// See the [module docs](self) for the meaning of the const parameters.
#[repr(transparent)]
pub struct MultiBuf<'mem, const CONST: bool, const LAYERABLE: bool, const OBSERVABLE: bool> {
    raw: RawMultiBuf<'mem>,
}

/// Writable buffer without layers or observation.
pub type Buf<'mem> = MultiBuf<'mem, false, false, false>;
/// Buffer over read-only memory, without layers or observation.
pub type ConstBuf<'mem> = MultiBuf<'mem, true, false, false>;
/// Writable buffer with view layers.
pub type LayeredBuf<'mem> = MultiBuf<'mem, false, true, false>;
/// Buffer over read-only memory, with view layers.
pub type LayeredConstBuf<'mem> = MultiBuf<'mem, true, true, false>;
/// Writable buffer with view layers and an observer slot.
pub type ObservedBuf<'mem> = MultiBuf<'mem, false, true, true>;

impl<'mem, const CONST: bool, const LAYERABLE: bool, const OBSERVABLE: bool>
    MultiBuf<'mem, CONST, LAYERABLE, OBSERVABLE>
{
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            raw: RawMultiBuf::new(),
        }
    }

    // ========== Queries ==========

    /// Total logical byte length of the top layer.
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the logical byte sequence is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Number of chunks, including zero-length ones.
    #[inline]
    pub fn num_chunks(&self) -> usize {
        self.raw.num_chunks()
    }

    /// Number of view layers, counting the base view as layer 1.
    #[inline]
    pub fn num_layers(&self) -> usize {
        self.raw.num_layers()
    }

    /// Number of nonzero-length fragments at the top layer.
    #[inline]
    pub fn num_fragments(&self) -> usize {
        self.raw.num_fragments()
    }

    // ========== Reservation ==========

    /// Reserve metadata capacity for `n` additional chunks.
    ///
    /// # Returns
    /// `false` without mutating state if the allocation fails.
    pub fn try_reserve_chunks(&mut self, n: usize) -> bool {
        self.raw.try_reserve_chunks(n)
    }

    /// Reserve metadata capacity for inserting `source` at `pos`.
    pub fn try_reserve_for_insert<const L2: bool, const O2: bool>(
        &mut self,
        pos: usize,
        source: &MultiBuf<'mem, CONST, L2, O2>,
    ) -> bool {
        self.raw.try_reserve_for_insert(pos, &source.raw)
    }

    /// Reserve metadata capacity for appending `source`.
    pub fn try_reserve_for_push_back<const L2: bool, const O2: bool>(
        &mut self,
        source: &MultiBuf<'mem, CONST, L2, O2>,
    ) -> bool {
        self.raw.try_reserve_for_push_back(&source.raw)
    }

    // ========== Structural mutation ==========

    /// Merge `source` into this buffer at `pos`, consuming it. The source
    /// must have the same byte-mutability property and no more layers than
    /// this buffer.
    ///
    /// # Panics
    /// If ownership contexts conflict or capacity was not reserved.
    pub fn insert<const L2: bool, const O2: bool>(
        &mut self,
        pos: usize,
        source: MultiBuf<'mem, CONST, L2, O2>,
    ) {
        self.raw.insert_buf(pos, source.raw);
    }

    /// Append `source`, consuming it.
    pub fn push_back<const L2: bool, const O2: bool>(
        &mut self,
        source: MultiBuf<'mem, CONST, L2, O2>,
    ) {
        let pos = self.len();
        self.insert(pos, source);
    }

    /// Insert an owned chunk covering `bytes[offset..offset + length]`.
    ///
    /// # Panics
    /// If the buffer already has an incompatible ownership context, the
    /// subrange exceeds the allocation, or capacity was not reserved.
    pub fn insert_owned(&mut self, pos: usize, bytes: OwnedBytes<'mem>, offset: usize, length: usize) {
        self.raw.insert_owned(pos, bytes, offset, length);
    }

    /// Append an owned chunk covering the whole allocation.
    pub fn push_back_owned(&mut self, bytes: OwnedBytes<'mem>) {
        let pos = self.len();
        let length = bytes.len();
        self.raw.insert_owned(pos, bytes, 0, length);
    }

    /// Insert a shared chunk covering `bytes[offset..offset + length]`.
    ///
    /// # Panics
    /// If the buffer already has an incompatible ownership context, the
    /// subrange exceeds the allocation, or capacity was not reserved.
    pub fn insert_shared(
        &mut self,
        pos: usize,
        bytes: &SharedBytes<'mem>,
        offset: usize,
        length: usize,
    ) {
        self.raw.insert_shared(pos, bytes, offset, length);
    }

    /// Append a shared chunk covering the whole allocation.
    pub fn push_back_shared(&mut self, bytes: &SharedBytes<'mem>) {
        let pos = self.len();
        let length = bytes.len();
        self.raw.insert_shared(pos, bytes, 0, length);
    }

    /// Whether `[pos, pos + len)` can be removed without dividing an owned
    /// allocation between two buffers.
    pub fn is_removable(&self, pos: usize, len: usize) -> bool {
        self.raw.is_removable(pos, len)
    }

    /// Extract `[pos, pos + len)` into a new buffer with the same
    /// properties, sharing this buffer's ownership context.
    ///
    /// # Panics
    /// If the range is out of bounds or fails [`Self::is_removable`].
    pub fn remove(&mut self, pos: usize, len: usize) -> Result<Self> {
        Ok(Self {
            raw: self.raw.remove(pos, len)?,
        })
    }

    /// Remove the first fragment into a new buffer.
    pub fn pop_front_fragment(&mut self) -> Result<Self> {
        Ok(Self {
            raw: self.raw.pop_front_fragment()?,
        })
    }

    /// Drop `[pos, pos + len)`, freeing fully-dropped owned chunks.
    ///
    /// # Returns
    /// The byte offset following the discarded range.
    pub fn discard(&mut self, pos: usize, len: usize) -> Result<usize> {
        self.raw.discard(pos, len)
    }

    /// Remove everything and release all owned and shared memory. Safe to
    /// call repeatedly.
    pub fn clear(&mut self) {
        self.raw.clear();
    }

    // ========== Ownership transfer ==========

    /// Whether the chunk starting at `pos` is owned.
    pub fn is_releasable(&self, pos: usize) -> bool {
        self.raw.is_releasable(pos)
    }

    /// Remove the owned chunk starting at `pos`, returning its memory
    /// without freeing it.
    ///
    /// # Panics
    /// If `pos` is not the start of an owned chunk.
    pub fn release(&mut self, pos: usize) -> OwnedBytes<'mem> {
        self.raw.release(pos)
    }

    /// Whether the chunk starting at `pos` is shared.
    pub fn is_shareable(&self, pos: usize) -> bool {
        self.raw.is_shareable(pos)
    }

    /// Take an additional counted handle to the shared chunk starting at
    /// `pos`; the chunk stays in the buffer.
    ///
    /// # Panics
    /// If the chunk is not shared.
    pub fn share(&self, pos: usize) -> SharedBytes<'mem> {
        self.raw.share(pos)
    }

    /// Whether `other`'s ownership context can merge into this buffer's.
    pub fn is_compatible<const L2: bool, const O2: bool>(
        &self,
        other: &MultiBuf<'mem, CONST, L2, O2>,
    ) -> bool {
        self.raw.is_compatible(&other.raw)
    }

    /// Whether `bytes` can be inserted as an owned chunk.
    pub fn is_compatible_owned(&self, bytes: &OwnedBytes<'mem>) -> bool {
        self.raw.is_compatible_owned(bytes)
    }

    /// Whether `bytes` can be inserted as a shared chunk.
    pub fn is_compatible_shared(&self, bytes: &SharedBytes<'mem>) -> bool {
        self.raw.is_compatible_shared(bytes)
    }

    // ========== Byte access ==========

    /// Copy bytes starting at logical `offset` into `dst`; returns the
    /// count copied.
    pub fn copy_to(&self, dst: &mut [u8], offset: usize) -> usize {
        self.raw.copy_to(dst, offset)
    }

    /// View up to `copy_buf.len()` bytes at `offset`: zero-copy into chunk
    /// memory when the range is physically contiguous, otherwise copied
    /// into `copy_buf`.
    pub fn get<'r>(&'r self, copy_buf: &'r mut [u8], offset: usize) -> &'r [u8] {
        self.raw.get(copy_buf, offset)
    }

    /// Iterate maximal physically contiguous spans of the top layer.
    pub fn chunks(&self) -> Chunks<'_> {
        self.raw.chunks()
    }

    /// Iterate the logical byte sequence front to back.
    pub fn bytes(&self) -> Bytes<'_> {
        self.raw.bytes()
    }

    /// A cursor at logical position `pos`.
    pub fn byte_cursor(&self, pos: usize) -> ByteCursor<'_> {
        self.raw.byte_cursor(pos)
    }

    // ========== Property conversion ==========

    /// View this buffer through a façade that forbids byte writes.
    pub fn as_const(&self) -> &MultiBuf<'mem, true, LAYERABLE, OBSERVABLE> {
        // SAFETY: repr(transparent) over the same engine; dropping write
        // access never enables an operation the source type forbids.
        unsafe { &*(self as *const Self).cast() }
    }

    /// Consume this buffer, forbidding byte writes from here on.
    ///
    /// Consuming matters: a const façade may reference shared `&[u8]`
    /// memory, which is sound only while no writable handle to the same
    /// engine exists. A temporary const reborrow of a writable buffer
    /// would let read-only memory in and then write through it, so the
    /// writable buffer must be given up for good.
    pub fn into_const(self) -> MultiBuf<'mem, true, LAYERABLE, OBSERVABLE> {
        MultiBuf { raw: self.raw }
    }

    /// View this buffer through a façade with different layer/observer
    /// properties. Byte mutability cannot change this way.
    pub fn as_propertied<const L2: bool, const O2: bool>(
        &mut self,
    ) -> &mut MultiBuf<'mem, CONST, L2, O2> {
        // SAFETY: repr(transparent) over the same engine; layer and
        // observer operations are property-gated API surface, not memory
        // capabilities.
        unsafe { &mut *(self as *mut Self).cast() }
    }

    /// Consume this buffer, rebinding its layer/observer properties.
    pub fn into_propertied<const L2: bool, const O2: bool>(self) -> MultiBuf<'mem, CONST, L2, O2> {
        MultiBuf { raw: self.raw }
    }
}

impl<'mem, const LAYERABLE: bool, const OBSERVABLE: bool>
    MultiBuf<'mem, false, LAYERABLE, OBSERVABLE>
{
    /// Insert a borrowed writable chunk. The buffer references the slice
    /// for `'mem` and never frees it.
    ///
    /// # Panics
    /// If capacity was not reserved.
    pub fn insert_slice(&mut self, pos: usize, slice: &'mem mut [u8]) {
        let len = slice.len();
        // SAFETY: slice pointers are never null.
        let ptr = unsafe { NonNull::new_unchecked(slice.as_mut_ptr()) };
        self.raw.insert_unowned(pos, ptr, 0, len);
    }

    /// Append a borrowed writable chunk.
    pub fn push_back_slice(&mut self, slice: &'mem mut [u8]) {
        let pos = self.len();
        self.insert_slice(pos, slice);
    }

    /// Copy bytes from `src` into the buffer starting at logical `offset`;
    /// returns the count written.
    pub fn copy_from(&mut self, src: &[u8], offset: usize) -> usize {
        self.raw.copy_from(src, offset)
    }
}

impl<'mem, const LAYERABLE: bool, const OBSERVABLE: bool>
    MultiBuf<'mem, true, LAYERABLE, OBSERVABLE>
{
    /// Insert a borrowed read-only chunk. The buffer references the slice
    /// for `'mem` and never frees or writes it.
    ///
    /// # Panics
    /// If capacity was not reserved.
    pub fn insert_slice(&mut self, pos: usize, slice: &'mem [u8]) {
        let len = slice.len();
        // SAFETY: slice pointers are never null. The pointer is only read
        // through: no byte-writing operation exists on a const façade, and
        // const-to-writable conversion is not offered.
        let ptr = unsafe { NonNull::new_unchecked(slice.as_ptr().cast_mut()) };
        self.raw.insert_unowned(pos, ptr, 0, len);
    }

    /// Append a borrowed read-only chunk.
    pub fn push_back_slice(&mut self, slice: &'mem [u8]) {
        let pos = self.len();
        self.insert_slice(pos, slice);
    }
}

impl<'mem, const CONST: bool, const OBSERVABLE: bool> MultiBuf<'mem, CONST, true, OBSERVABLE> {
    /// Overlay a new top layer over `[offset, offset + length)` of the
    /// current byte sequence; length clamps to the bytes available.
    ///
    /// # Returns
    /// `false` without mutating state if metadata reservation fails.
    pub fn add_layer(&mut self, offset: usize, length: usize) -> bool {
        self.raw.add_layer(offset, length)
    }

    /// Remove the top layer, restoring the one below.
    ///
    /// # Returns
    /// `false` if the top layer is sealed.
    ///
    /// # Panics
    /// If only the base view remains.
    pub fn pop_layer(&mut self) -> bool {
        self.raw.pop_layer()
    }

    /// Redistribute the top layer over `[offset, offset + length)` of the
    /// layer below.
    ///
    /// # Returns
    /// `false` if the top layer is sealed.
    pub fn resize_top_layer(&mut self, offset: usize, length: usize) -> bool {
        self.raw.resize_top_layer(offset, length)
    }

    /// Shrink the top layer to its first `length` bytes.
    ///
    /// # Returns
    /// `false` if the top layer is sealed.
    pub fn truncate_top_layer(&mut self, length: usize) -> bool {
        self.raw.truncate_top_layer(length)
    }

    /// Forbid resizing or removing the top layer.
    pub fn seal_top_layer(&mut self) {
        self.raw.seal_top_layer();
    }

    /// Re-permit resizing and removing the top layer.
    pub fn unseal_top_layer(&mut self) {
        self.raw.unseal_top_layer();
    }

    /// Whether the top layer is sealed.
    pub fn is_top_layer_sealed(&self) -> bool {
        self.raw.is_top_layer_sealed()
    }
}

impl<'mem, const CONST: bool, const LAYERABLE: bool> MultiBuf<'mem, CONST, LAYERABLE, true> {
    /// Attach or replace the observer notified on every mutation. `clear`
    /// detaches the observer after its final notification.
    pub fn set_observer(&mut self, observer: Option<&'mem dyn BufferObserver>) {
        self.raw.set_observer(observer);
    }

    /// The currently attached observer, if any.
    pub fn observer(&self) -> Option<&'mem dyn BufferObserver> {
        self.raw.observer()
    }
}

impl<const CONST: bool, const LAYERABLE: bool, const OBSERVABLE: bool> Default
    for MultiBuf<'_, CONST, LAYERABLE, OBSERVABLE>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const CONST: bool, const LAYERABLE: bool, const OBSERVABLE: bool> fmt::Debug
    for MultiBuf<'_, CONST, LAYERABLE, OBSERVABLE>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiBuf")
            .field("const", &CONST)
            .field("layerable", &LAYERABLE)
            .field("observable", &OBSERVABLE)
            .field("chunks", &self.num_chunks())
            .field("layers", &self.num_layers())
            .field("len", &self.len())
            .finish()
    }
}
