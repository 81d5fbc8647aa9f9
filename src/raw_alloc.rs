//! Raw allocation contract and memory-ownership handles.
//!
//! The buffer engine never allocates chunk memory itself. It consumes memory
//! through three handle shapes, all built on the same two-method contract:
//!
//! - [`OwnedBytes`] - a unique handle; the holder has the sole right to free
//! - [`SharedBytes`] / [`ControlBlock`] - reference-counted sharing between
//!   buffers and standalone handles
//! - plain borrowed slices - referenced but never freed by the buffer
//!
//! [`BumpAllocator`] is the canonical allocator for embedded-style usage: a
//! bump pointer over a caller-provided region, where `deallocate` is a no-op
//! and exhaustion reports `None` rather than panicking.

use std::alloc::Layout;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

/// Frees raw byte buffers previously obtained from the paired allocator.
pub trait RawDeallocator {
    /// Free the allocation starting at `ptr`.
    ///
    /// `ptr` must be the true allocation start, exactly as returned by the
    /// paired `allocate` call.
    fn deallocate(&self, ptr: NonNull<u8>);
}

/// Allocates raw byte buffers.
pub trait RawAllocator: RawDeallocator {
    /// Allocate memory for `layout`.
    ///
    /// # Returns
    /// A pointer aligned to `layout.align()`, or `None` on exhaustion.
    /// Exhaustion is a normal, recoverable outcome.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;
}

/// Compare two deallocator references by identity.
///
/// Two handles are compatible only if they were issued by the same
/// deallocator instance; comparing data addresses is how a buffer detects
/// attempts to mix memory from different deallocators.
#[inline]
pub(crate) fn same_deallocator(a: &dyn RawDeallocator, b: &dyn RawDeallocator) -> bool {
    std::ptr::eq(
        a as *const dyn RawDeallocator as *const u8,
        b as *const dyn RawDeallocator as *const u8,
    )
}

/// Bump-pointer allocator over a caller-provided memory region.
///
/// Allocation advances a cursor; `deallocate` is a no-op, so freed memory is
/// never reclaimed until the allocator itself is dropped and the region
/// borrow ends. This is intentional: the allocator exists to give tests and
/// embedded callers a deterministic, zero-dependency source of chunk memory.
pub struct BumpAllocator<'region> {
    base: NonNull<u8>,
    capacity: usize,
    next: Cell<usize>,
    _region: PhantomData<&'region mut [u8]>,
}

impl<'region> BumpAllocator<'region> {
    /// Create an allocator serving allocations out of `region`.
    ///
    /// The region's alignment bounds the alignments this allocator can
    /// satisfy; requests that cannot be aligned within the region fail.
    pub fn new(region: &'region mut [u8]) -> Self {
        let capacity = region.len();
        // SAFETY: a slice pointer is non-null.
        let base = unsafe { NonNull::new_unchecked(region.as_mut_ptr()) };
        Self {
            base,
            capacity,
            next: Cell::new(0),
            _region: PhantomData,
        }
    }

    /// Total size of the backing region in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed so far, including alignment padding.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.next.get()
    }
}

impl fmt::Debug for BumpAllocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BumpAllocator")
            .field("capacity", &self.capacity)
            .field("allocated", &self.next.get())
            .finish()
    }
}

impl RawDeallocator for BumpAllocator<'_> {
    fn deallocate(&self, _ptr: NonNull<u8>) {
        // Bump allocation does not reclaim. The next allocate call sees the
        // same cursor.
    }
}

impl RawAllocator for BumpAllocator<'_> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let base_addr = self.base.as_ptr() as usize;
        let cursor = base_addr.checked_add(self.next.get())?;
        let aligned = cursor.checked_add(layout.align() - 1)? & !(layout.align() - 1);
        let start = aligned - base_addr;
        let end = start.checked_add(layout.size())?;
        if end > self.capacity {
            return None;
        }
        self.next.set(end);
        // SAFETY: start < capacity, so the offset pointer stays inside the
        // borrowed region and is non-null.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }
}

/// A unique owning handle to a raw allocation.
///
/// Holds the pointer, the known extent in bytes, and the deallocator that
/// must free it. Dropping the handle frees the memory; [`OwnedBytes::into_raw`]
/// transfers ownership out without freeing.
pub struct OwnedBytes<'mem> {
    ptr: NonNull<u8>,
    len: usize,
    deallocator: &'mem dyn RawDeallocator,
}

impl<'mem> OwnedBytes<'mem> {
    /// Take ownership of a raw allocation.
    ///
    /// # Safety
    /// `ptr` must be the start of a live allocation of at least `len` bytes
    /// issued by `deallocator`'s paired allocator, and no other handle may
    /// own it.
    pub unsafe fn from_raw(
        ptr: NonNull<u8>,
        len: usize,
        deallocator: &'mem dyn RawDeallocator,
    ) -> Self {
        Self {
            ptr,
            len,
            deallocator,
        }
    }

    /// Allocate `len` uninitialized bytes from `allocator`.
    ///
    /// Returns `None` if the allocator is exhausted or `len` is zero.
    pub fn allocate<A: RawAllocator>(allocator: &'mem A, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::array::<u8>(len).ok()?;
        let ptr = allocator.allocate(layout)?;
        // SAFETY: fresh allocation of `len` bytes from `allocator`.
        Some(unsafe { Self::from_raw(ptr, len, allocator) })
    }

    /// The allocation start.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Known extent of the allocation in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the handle covers zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read access to the owned bytes.
    ///
    /// The bytes may be uninitialized if the allocation was never written;
    /// callers obtaining memory through [`OwnedBytes::allocate`] should write
    /// before reading.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: exclusive ownership of a live allocation of `len` bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Write access to the owned bytes.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: exclusive ownership of a live allocation of `len` bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The deallocator responsible for this allocation.
    #[inline]
    pub fn deallocator(&self) -> &'mem dyn RawDeallocator {
        self.deallocator
    }

    /// Transfer ownership out without freeing.
    pub fn into_raw(self) -> (NonNull<u8>, usize, &'mem dyn RawDeallocator) {
        let parts = (self.ptr, self.len, self.deallocator);
        std::mem::forget(self);
        parts
    }
}

impl Drop for OwnedBytes<'_> {
    fn drop(&mut self) {
        self.deallocator.deallocate(self.ptr);
    }
}

impl fmt::Debug for OwnedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBytes")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Reference-count bookkeeping for one shared allocation.
///
/// The count tracks holders: standalone [`SharedBytes`] handles plus every
/// buffer whose ownership context references this block. The last holder to
/// decrement frees the data and the block itself.
pub struct ControlBlock<'mem> {
    refs: AtomicUsize,
    data: NonNull<u8>,
    len: usize,
    deallocator: &'mem dyn RawDeallocator,
}

impl<'mem> ControlBlock<'mem> {
    /// Add a holder.
    #[inline]
    pub fn increment_shared(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a holder.
    ///
    /// # Returns
    /// `true` if this was the last holder and the allocation must be freed.
    #[inline]
    pub fn decrement_shared(&self) -> bool {
        if self.refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// Current holder count.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Start of the shared allocation.
    #[inline]
    pub fn data(&self) -> NonNull<u8> {
        self.data
    }

    /// Extent of the shared allocation in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the shared allocation covers zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The deallocator that frees the shared allocation.
    #[inline]
    pub fn deallocator(&self) -> &'mem dyn RawDeallocator {
        self.deallocator
    }
}

impl fmt::Debug for ControlBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("refs", &self.ref_count())
            .field("data", &self.data)
            .field("len", &self.len)
            .finish()
    }
}

/// Increment the holder count of a raw control-block pointer.
///
/// # Safety
/// `block` must point to a live control block (holder count >= 1).
pub(crate) unsafe fn retain_block(block: NonNull<ControlBlock<'_>>) {
    unsafe { block.as_ref() }.increment_shared();
}

/// Decrement the holder count of a raw control-block pointer, freeing the
/// data and the block itself if this was the last holder.
///
/// # Safety
/// `block` must point to a live control block, and the caller must hold one
/// of the counted references.
pub(crate) unsafe fn release_block(block: NonNull<ControlBlock<'_>>) {
    let (last, data, deallocator) = {
        let cb = unsafe { block.as_ref() };
        (cb.decrement_shared(), cb.data(), cb.deallocator())
    };
    if last {
        // Free the block before the data: the block was boxed by
        // SharedBytes::new and nothing references it once the count is zero.
        drop(unsafe { Box::from_raw(block.as_ptr()) });
        deallocator.deallocate(data);
    }
}

/// A reference-counted handle to a shared allocation.
///
/// Created from an [`OwnedBytes`] handle, which surrenders its unique
/// ownership to a heap-allocated [`ControlBlock`]. Cloning increments the
/// holder count; dropping decrements it and frees the allocation when the
/// count reaches zero.
pub struct SharedBytes<'mem> {
    block: NonNull<ControlBlock<'mem>>,
    _marker: PhantomData<&'mem ()>,
}

impl<'mem> SharedBytes<'mem> {
    /// Convert a unique allocation into a shared one.
    pub fn new(bytes: OwnedBytes<'mem>) -> Self {
        let (ptr, len, deallocator) = bytes.into_raw();
        let block = Box::new(ControlBlock {
            refs: AtomicUsize::new(1),
            data: ptr,
            len,
            deallocator,
        });
        Self {
            // SAFETY: Box::into_raw never returns null.
            block: unsafe { NonNull::new_unchecked(Box::into_raw(block)) },
            _marker: PhantomData,
        }
    }

    /// Wrap an already-retained control block.
    ///
    /// # Safety
    /// `block` must be live and the caller must have incremented the holder
    /// count on the new handle's behalf.
    pub(crate) unsafe fn from_retained(block: NonNull<ControlBlock<'mem>>) -> Self {
        Self {
            block,
            _marker: PhantomData,
        }
    }

    /// Start of the shared allocation.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.control_block().data()
    }

    /// Extent of the shared allocation in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.control_block().len()
    }

    /// Whether the shared allocation covers zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The control block governing this allocation.
    #[inline]
    pub fn control_block(&self) -> &ControlBlock<'mem> {
        // SAFETY: this handle holds a counted reference, so the block is live.
        unsafe { self.block.as_ref() }
    }

    /// Raw pointer to the control block, for buffer context bookkeeping.
    #[inline]
    pub(crate) fn block_ptr(&self) -> NonNull<ControlBlock<'mem>> {
        self.block
    }
}

impl Clone for SharedBytes<'_> {
    fn clone(&self) -> Self {
        self.control_block().increment_shared();
        Self {
            block: self.block,
            _marker: PhantomData,
        }
    }
}

impl Drop for SharedBytes<'_> {
    fn drop(&mut self) {
        // SAFETY: this handle holds one counted reference.
        unsafe { release_block(self.block) };
    }
}

impl fmt::Debug for SharedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBytes")
            .field("data", &self.as_ptr())
            .field("len", &self.len())
            .field("refs", &self.control_block().ref_count())
            .finish()
    }
}
