//! Buffer Cache Module
//!
//! The narrow block-store contract large buffers are built on.
//!
//! ## Responsibilities
//! - Hand out fresh writable blocks (`allocate`)
//! - Acquire existing blocks, in-line or through a completion callback
//! - Expose block bytes for reading and writing
//! - Take handles back exactly once (`release` consumes the handle)
//!
//! Disk I/O, eviction and transaction semantics live behind this contract.
//! `memory` provides a complete in-memory implementation.

pub mod memory;

pub use memory::{CompletionMode, MemoryBlock, MemoryCache, MemoryTransaction};

use crate::error::Result;

/// Identifier of a block in the cache
pub type BlockId = u32;

/// Access mode a block (or a whole large buffer) is held with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Completion handle for an acquire that could not be served in-line.
/// The store invokes it exactly once, possibly from another thread.
pub type AcquireCallback<B> = Box<dyn FnOnce(B) + Send + 'static>;

/// An acquired block, exclusively owned until released
pub trait BlockHandle: Send + 'static {
    /// Id of the block this handle refers to
    fn block_id(&self) -> BlockId;

    /// Read-only view of the whole block
    fn data(&self) -> &[u8];

    /// Mutable view of the whole block (marks it dirty)
    fn data_mut(&mut self) -> &mut [u8];

    /// Tombstone the block; it is freed when the handle is released
    fn mark_deleted(&mut self);

    /// Return the handle to the cache
    fn release(self);
}

/// The transaction a large buffer acquires and allocates blocks through
pub trait Transaction: Send + Sync + 'static {
    type Block: BlockHandle;

    /// Fixed block size of the underlying cache
    fn block_size(&self) -> usize;

    /// Allocate a fresh, writable block
    fn allocate(&self) -> Result<Self::Block>;

    /// Acquire an existing block.
    ///
    /// Returns `Some` when the block is available immediately, in which case
    /// `on_ready` is dropped unused. Otherwise returns `None` and calls
    /// `on_ready` later with the block.
    fn acquire(
        &self,
        id: BlockId,
        access: Access,
        on_ready: AcquireCallback<Self::Block>,
    ) -> Option<Self::Block>;
}
