//! Observer call contract for buffer mutations.
//!
//! An observer registered on an observable buffer is notified synchronously,
//! inline with the mutating call. Notifications are never batched or
//! deferred; delivery beyond the `notify` call is the observer's business.

/// Events reported to a [`BufferObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEvent {
    /// Bytes were added to the buffer. The value is the byte count.
    BytesAdded,
    /// Bytes were removed from the buffer. The value is the byte count.
    BytesRemoved,
    /// A layer was added. The value is the byte length of the new top layer.
    LayerAdded,
    /// A layer was removed. The value is the byte length of the new top layer.
    LayerRemoved,
}

/// Receives notifications about buffer mutations.
///
/// Implementations must not mutate the buffer from within `notify`; the
/// call happens while the mutating operation is still on the stack.
pub trait BufferObserver {
    /// Report a mutation event and its associated byte count.
    fn notify(&self, event: BufferEvent, byte_count: usize);
}
