//! Layered multi-segment byte buffers over caller-provided memory.
//!
//! A [`MultiBuf`] presents one logical byte sequence physically composed of
//! discontiguous chunks - owned, shared, or borrowed - without copying them
//! into place. View layers narrow the visible sequence to nested subspans,
//! and fragment markers group chunks into units that can be popped off the
//! front wholesale. Splitting, merging, and layering are pure metadata
//! operations on a flat entry deque; chunk bytes are only touched by the
//! explicit copy calls.
//!
//! ```text
//!                 MultiBuf<CONST, LAYERABLE, OBSERVABLE>
//!                    (compile-time property gating)
//!                                  |
//!                                  v
//!  +---------------------- core engine -----------------------+
//!  |  entry deque: [Data|Base|View..] [Data|Base|View..] ...   |
//!  |  depth, ownership context, observer                       |
//!  +------------------------------------------------------------+
//!     |                |                  |
//!     v                v                  v
//!  chunk memory    OwnedBytes /       BufferObserver
//!  (borrowed)      SharedBytes
//! ```
//!
//! The crate never allocates chunk memory itself. Callers bring memory as
//! borrowed slices, as unique [`OwnedBytes`] handles backed by a
//! [`RawAllocator`], or as reference-counted [`SharedBytes`] handles; the
//! buffer tracks which of the three regimes applies to each chunk and frees
//! accordingly on [`MultiBuf::clear`] or drop.
//!
//! Metadata growth is explicit: reserve entry capacity with the
//! `try_reserve_*` methods before structural inserts. Exhaustion is reported
//! by return value and never partially applies an operation.
//!
//! # Example
//!
//! ```
//! use fragbuf::LayeredBuf;
//!
//! let mut head = [0u8; 4];
//! let mut body = [0u8; 8];
//!
//! let mut buf = LayeredBuf::new();
//! assert!(buf.try_reserve_chunks(2));
//! buf.push_back_slice(&mut head);
//! buf.push_back_slice(&mut body);
//! assert_eq!(buf.len(), 12);
//! assert_eq!(buf.num_fragments(), 2);
//!
//! // Narrow the visible sequence to bytes 2..10 of the whole.
//! assert!(buf.add_layer(2, 8));
//! assert_eq!(buf.len(), 8);
//! assert_eq!(buf.num_fragments(), 1);
//!
//! buf.copy_from(b"fragment", 0);
//! let mut tmp = [0u8; 8];
//! assert_eq!(buf.get(&mut tmp, 0), b"fragment");
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod buffer;
mod entry;
mod error;
mod facade;
mod iter;
mod observer;
mod raw_alloc;

pub use error::{Error, Result};
pub use facade::{Buf, ConstBuf, LayeredBuf, LayeredConstBuf, MultiBuf, ObservedBuf};
pub use iter::{ByteCursor, Bytes, Chunks};
pub use observer::{BufferEvent, BufferObserver};
pub use raw_alloc::{
    BumpAllocator, ControlBlock, OwnedBytes, RawAllocator, RawDeallocator, SharedBytes,
};
