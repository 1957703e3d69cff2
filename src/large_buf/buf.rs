//! Large buffer
//!
//! Owns the index block and every segment block of one blob while it is
//! loaded, and implements the resize operations on top of the geometry
//! engine.
//!
//! ## Ownership
//! `bufs[i]` is the handle for `index.blocks[i]`. Resizes that shift the
//! segment list (prepend/unprepend) rotate both vectors together, so each
//! handle has exactly one slot and is released exactly once.
//!
//! ## Concurrency
//! Single owner. A `LargeBuf` is driven by the one transaction that loaded
//! it; no operation here takes a lock.
//!
//! The buffer only holds a weak reference to that transaction. Pending
//! completions parked in the transaction own the loading buffer, so a
//! strong reference would keep both alive after the caller lets go.

use std::sync::{Arc, Weak};
use std::thread;

use crate::buffer_cache::{Access, BlockHandle, BlockId, Transaction};
use crate::config::Config;
use crate::error::{LargeBufError, Result};

use super::geometry::Geometry;
use super::layout::{
    has_segment_magic, max_segments_for_block_size, stamp_segment, IndexRecord,
    SEGMENT_HEADER_SIZE,
};
use super::loader;
use super::LargeBufState;

/// Called once a `LargeBuf` has acquired its index and every segment
pub type AvailableCallback<T> = Box<dyn FnOnce(LargeBuf<T>) + Send + 'static>;

/// A value stored out of line across an index block and segment blocks
pub struct LargeBuf<T: Transaction> {
    txn: Weak<T>,
    state: LargeBufState,
    access: Access,

    /// Logical length in bytes
    size: u32,

    index_block_id: Option<BlockId>,
    /// In-memory copy of the index block, written through on every change
    index: IndexRecord,
    index_buf: Option<T::Block>,
    /// Segment handles, aligned with `index.blocks`
    bufs: Vec<T::Block>,

    /// Payload bytes per segment block
    segment_capacity: u32,
    max_segments: usize,
    max_in_node_value_size: u32,
}

impl<T: Transaction> LargeBuf<T> {
    /// Create an unloaded buffer bound to `txn`.
    ///
    /// The caller keeps `txn` alive for as long as the buffer is used.
    pub fn new(txn: &Arc<T>, config: &Config) -> Self {
        let block_size = txn.block_size();
        assert!(
            block_size > SEGMENT_HEADER_SIZE,
            "block size {} leaves no segment payload",
            block_size
        );

        let max_segments = max_segments_for_block_size(block_size)
            .min(config.segment_limit.unwrap_or(usize::MAX));

        Self {
            txn: Arc::downgrade(txn),
            state: LargeBufState::NotLoaded,
            access: Access::Read,
            size: 0,
            index_block_id: None,
            index: IndexRecord::default(),
            index_buf: None,
            bufs: Vec::new(),
            segment_capacity: (block_size - SEGMENT_HEADER_SIZE) as u32,
            max_segments,
            max_in_node_value_size: config.max_in_node_value_size,
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Allocate a brand-new buffer of `size` bytes for writing.
    ///
    /// Completes synchronously. On failure nothing stays allocated and the
    /// buffer is back in `NotLoaded`.
    pub fn allocate(&mut self, size: u32) -> Result<()> {
        assert_eq!(self.state, LargeBufState::NotLoaded, "allocate on a used large buf");
        assert!(
            size > self.max_in_node_value_size,
            "value of {} bytes belongs in the node",
            size
        );

        let num_segments = Geometry::segment_count_for(size, self.segment_capacity);
        self.check_capacity(num_segments)?;

        self.state = LargeBufState::Loading;
        self.access = Access::Write;
        self.size = size;

        let index_buf = match self.transaction().allocate() {
            Ok(block) => block,
            Err(e) => {
                self.state = LargeBufState::NotLoaded;
                return Err(e);
            }
        };
        let segments = match self.allocate_segments(num_segments) {
            Ok(segments) => segments,
            Err(e) => {
                discard(index_buf);
                self.state = LargeBufState::NotLoaded;
                return Err(e);
            }
        };

        self.index_block_id = Some(index_buf.block_id());
        self.index = IndexRecord {
            first_block_offset: 0,
            blocks: segments.iter().map(|block| block.block_id()).collect(),
        };
        self.index_buf = Some(index_buf);
        self.bufs = segments;
        self.write_index();
        self.state = LargeBufState::Loaded;

        tracing::debug!(
            "Allocated large buf {} ({} bytes, {} segments)",
            self.index_block_id(),
            size,
            num_segments
        );
        Ok(())
    }

    /// Acquire an existing buffer whose index lives in `index_block_id`.
    ///
    /// `on_available` runs exactly once, after the index and every segment
    /// are held. It may run before this call returns (every block was
    /// available in-line) or later on whatever thread the block store
    /// completes from. If the block store abandons the acquisition, every
    /// handle acquired so far is released and `on_available` never runs.
    pub fn acquire<F>(self, index_block_id: BlockId, size: u32, access: Access, on_available: F)
    where
        F: FnOnce(LargeBuf<T>) + Send + 'static,
    {
        loader::start(self, index_block_id, size, access, Box::new(on_available));
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Grow the tail by `extra_size` bytes.
    ///
    /// Spare room in the last segment is used first; new segments are only
    /// allocated for what does not fit.
    pub fn append(&mut self, extra_size: u32) -> Result<()> {
        self.assert_writable();
        if extra_size == 0 {
            return Ok(());
        }

        let new_size = self.checked_size(extra_size)?;
        let needed = Geometry::segments_spanned(
            new_size,
            self.index.first_block_offset,
            self.segment_capacity,
        );
        self.check_capacity(needed)?;

        let fresh = self.allocate_segments(needed - self.num_segments())?;
        for block in fresh {
            self.index.blocks.push(block.block_id());
            self.bufs.push(block);
        }
        self.size = new_size;
        self.write_index();

        tracing::debug!("Appended {} bytes: {:?}", extra_size, self.geometry());
        Ok(())
    }

    /// Grow the head by `extra_size` bytes.
    ///
    /// Dead space at the front of segment 0 is used first; the rest goes into
    /// new leading segments. Existing segments are never rewritten.
    pub fn prepend(&mut self, extra_size: u32) -> Result<()> {
        self.assert_writable();
        if extra_size == 0 {
            return Ok(());
        }

        let new_size = self.checked_size(extra_size)?;
        let fbo = self.index.first_block_offset;
        let new_segs = if extra_size > fbo {
            (extra_size - fbo).div_ceil(self.segment_capacity) as usize
        } else {
            0
        };
        self.check_capacity(self.num_segments() + new_segs)?;

        let fresh = self.allocate_segments(new_segs)?;
        let fresh_ids: Vec<BlockId> = fresh.iter().map(|block| block.block_id()).collect();

        self.bufs.extend(fresh);
        self.bufs.rotate_right(new_segs);
        self.index.blocks.extend(fresh_ids);
        self.index.blocks.rotate_right(new_segs);

        // Committed overshoot minus what was asked for
        self.index.first_block_offset =
            (fbo as u64 + new_segs as u64 * self.segment_capacity as u64 - extra_size as u64) as u32;
        self.size = new_size;
        self.write_index();

        debug_assert!(self.geometry().is_consistent());
        tracing::debug!("Prepended {} bytes: {:?}", extra_size, self.geometry());
        Ok(())
    }

    /// Shrink the tail by `extra_size` bytes, freeing segments that become
    /// empty. `extra_size` must be less than the current size.
    pub fn unappend(&mut self, extra_size: u32) {
        self.assert_writable();
        assert!(
            extra_size < self.size,
            "cannot unappend {} of {} bytes",
            extra_size,
            self.size
        );
        if extra_size == 0 {
            return;
        }

        let new_size = self.size - extra_size;
        let geometry = self.geometry();
        let mut last_ix = geometry.position_to_segment_index(new_size);
        // A full last segment maps its end onto the next segment's start
        if geometry.position_to_segment_offset(new_size) == 0 {
            last_ix -= 1;
        }
        let new_num_segments = last_ix + 1;

        for block in self.bufs.drain(new_num_segments..) {
            discard(block);
        }
        self.index.blocks.truncate(new_num_segments);
        self.size = new_size;
        self.write_index();

        debug_assert!(self.geometry().is_consistent());
        tracing::debug!("Unappended {} bytes: {:?}", extra_size, self.geometry());
    }

    /// Shrink the head by `extra_size` bytes, freeing leading segments that
    /// become empty. `extra_size` must be less than the current size.
    pub fn unprepend(&mut self, extra_size: u32) {
        self.assert_writable();
        assert!(
            extra_size < self.size,
            "cannot unprepend {} of {} bytes",
            extra_size,
            self.size
        );
        if extra_size == 0 {
            return;
        }

        let tail = self.geometry().tail_block_offset();
        let num_segments = self.num_segments();

        // New logical start, counted from the front of the first block
        let start = self.index.first_block_offset as u64 + extra_size as u64;
        let dead = (start / self.segment_capacity as u64) as usize;
        let new_fbo = (start % self.segment_capacity as u64) as u32;

        self.bufs.rotate_left(dead);
        for block in self.bufs.drain(num_segments - dead..) {
            discard(block);
        }
        self.index.blocks.rotate_left(dead);
        self.index.blocks.truncate(num_segments - dead);

        self.index.first_block_offset = new_fbo;
        self.size -= extra_size;
        self.write_index();

        assert_eq!(
            self.geometry().tail_block_offset(),
            tail,
            "unprepend moved the tail: {:?}",
            self.geometry()
        );
        tracing::debug!("Unprepended {} bytes: {:?}", extra_size, self.geometry());
    }

    /// Copy `data` into `[pos, pos + data.len())`, crossing segments as needed
    pub fn fill_at(&mut self, pos: u32, data: &[u8]) {
        self.assert_writable();
        assert!(
            pos as u64 + data.len() as u64 <= self.size as u64,
            "fill of {} bytes at {} overruns {} byte buffer",
            data.len(),
            pos,
            self.size
        );

        let geometry = self.geometry();
        let mut ix = geometry.position_to_segment_index(pos);
        let mut offset = geometry.position_to_segment_offset(pos) as usize;
        let mut remaining = data;

        while !remaining.is_empty() {
            let segment = self.segment_mut(ix);
            let n = (segment.len() - offset).min(remaining.len());
            segment[offset..offset + n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            offset = 0;
            ix += 1;
        }
    }

    /// Copy `[pos, pos + out.len())` into `out`, crossing segments as needed
    pub fn read_at(&self, pos: u32, out: &mut [u8]) {
        assert!(
            pos as u64 + out.len() as u64 <= self.size as u64,
            "read of {} bytes at {} overruns {} byte buffer",
            out.len(),
            pos,
            self.size
        );

        let geometry = self.geometry();
        let mut ix = geometry.position_to_segment_index(pos);
        let mut offset = geometry.position_to_segment_offset(pos) as usize;
        let mut filled = 0;

        while filled < out.len() {
            let segment = self.segment(ix);
            let n = (segment.len() - offset).min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&segment[offset..offset + n]);
            filled += n;
            offset = 0;
            ix += 1;
        }
    }

    // =========================================================================
    // Segment Access
    // =========================================================================

    /// Live payload of segment `ix`
    pub fn segment(&self, ix: usize) -> &[u8] {
        assert_eq!(self.state, LargeBufState::Loaded, "segment read while {:?}", self.state);
        let (start, len) = self.segment_bounds(ix);
        &self.bufs[ix].data()[start..start + len]
    }

    /// Writable live payload of segment `ix`; restamps the segment magic
    pub fn segment_mut(&mut self, ix: usize) -> &mut [u8] {
        self.assert_writable();
        let (start, len) = self.segment_bounds(ix);
        let data = self.bufs[ix].data_mut();
        stamp_segment(data);
        &mut data[start..start + len]
    }

    fn segment_bounds(&self, ix: usize) -> (usize, usize) {
        let len = self.geometry().segment_byte_length(ix) as usize;
        let start = if ix == 0 {
            SEGMENT_HEADER_SIZE + self.index.first_block_offset as usize
        } else {
            SEGMENT_HEADER_SIZE
        };
        (start, len)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Tombstone the index and every segment. Handles stay held until
    /// `release`.
    pub fn mark_deleted(&mut self) {
        assert_eq!(self.state, LargeBufState::Loaded, "mark_deleted while {:?}", self.state);
        if let Some(index_buf) = self.index_buf.as_mut() {
            index_buf.mark_deleted();
        }
        for block in &mut self.bufs {
            block.mark_deleted();
        }
        self.state = LargeBufState::Deleted;
        tracing::debug!("Deleted large buf {}", self.index_block_id());
    }

    /// Return every held block to the transaction
    pub fn release(&mut self) {
        assert!(
            matches!(self.state, LargeBufState::Loaded | LargeBufState::Deleted),
            "release while {:?}",
            self.state
        );
        if let Some(index_buf) = self.index_buf.take() {
            index_buf.release();
        }
        for block in self.bufs.drain(..) {
            block.release();
        }
        self.state = LargeBufState::Released;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> LargeBufState {
        self.state
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// The transaction this buffer belongs to.
    ///
    /// Panics once that transaction has been dropped.
    pub fn transaction(&self) -> Arc<T> {
        match self.txn.upgrade() {
            Some(txn) => txn,
            None => panic!("large buf used after its transaction ended"),
        }
    }

    /// The transaction, if it is still alive
    pub(super) fn live_transaction(&self) -> Option<Arc<T>> {
        self.txn.upgrade()
    }

    pub fn index_block_id(&self) -> BlockId {
        assert!(
            matches!(
                self.state,
                LargeBufState::Loading | LargeBufState::Loaded | LargeBufState::Deleted
            ),
            "index block id read while {:?}",
            self.state
        );
        match self.index_block_id {
            Some(id) => id,
            None => panic!("large buf has no index block"),
        }
    }

    pub fn num_segments(&self) -> usize {
        self.index.num_segments()
    }

    pub fn first_block_offset(&self) -> u32 {
        self.index.first_block_offset
    }

    /// Segment block ids in logical order
    pub fn segment_block_ids(&self) -> &[BlockId] {
        &self.index.blocks
    }

    /// Payload bytes per segment block
    pub fn segment_capacity(&self) -> u32 {
        self.segment_capacity
    }

    /// Most segments this buffer may span
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            size: self.size,
            first_block_offset: self.index.first_block_offset,
            num_segments: self.index.num_segments(),
            segment_capacity: self.segment_capacity,
        }
    }

    // =========================================================================
    // Loading (driven by the loader)
    // =========================================================================

    pub(super) fn begin_loading(&mut self, index_block_id: BlockId, size: u32, access: Access) {
        assert_eq!(self.state, LargeBufState::NotLoaded, "acquire on a used large buf");
        assert!(
            size > self.max_in_node_value_size,
            "value of {} bytes belongs in the node",
            size
        );

        self.index_block_id = Some(index_block_id);
        self.size = size;
        self.access = access;
        self.state = LargeBufState::Loading;
    }

    /// Take ownership of the index block and return the segment ids to load
    pub(super) fn attach_index(&mut self, block: T::Block) -> Vec<BlockId> {
        assert_eq!(self.state, LargeBufState::Loading, "index delivered while {:?}", self.state);
        assert!(self.index_buf.is_none(), "index block delivered twice");
        assert_eq!(
            Some(block.block_id()),
            self.index_block_id,
            "index delivered for the wrong block"
        );

        let index = match IndexRecord::decode(block.data()) {
            Some(index) => index,
            None => panic!("block {} is not a large buf index", block.block_id()),
        };
        let geometry = Geometry {
            size: self.size,
            first_block_offset: index.first_block_offset,
            num_segments: index.num_segments(),
            segment_capacity: self.segment_capacity,
        };
        assert!(
            geometry.is_consistent(),
            "index block {} disagrees with size {}: {:?}",
            block.block_id(),
            self.size,
            geometry
        );
        assert!(index.num_segments() <= self.max_segments);

        self.index = index;
        self.index_buf = Some(block);
        if self.access == Access::Write {
            self.write_index();
        }
        self.index.blocks.clone()
    }

    pub(super) fn check_segment(&self, ix: usize, block: &T::Block) {
        assert_eq!(self.state, LargeBufState::Loading, "segment delivered while {:?}", self.state);
        assert!(
            self.index_buf
                .as_ref()
                .is_some_and(|index_buf| Some(index_buf.block_id()) == self.index_block_id),
            "segment delivered before the index"
        );
        assert!(ix < self.num_segments(), "segment {} out of range", ix);
        assert_eq!(
            block.block_id(),
            self.index.blocks[ix],
            "segment {} delivered for the wrong block",
            ix
        );
        assert!(
            has_segment_magic(block.data()),
            "block {} is not a large buf segment",
            block.block_id()
        );
    }

    pub(super) fn finish_loading(&mut self, segments: Vec<T::Block>) {
        assert_eq!(segments.len(), self.num_segments());
        self.bufs = segments;
        self.state = LargeBufState::Loaded;
    }

    /// Release whatever a cancelled acquisition managed to hold
    pub(super) fn abandon_loading(&mut self, segments: impl IntoIterator<Item = T::Block>) {
        assert_eq!(self.state, LargeBufState::Loading);
        if let Some(index_buf) = self.index_buf.take() {
            index_buf.release();
        }
        for block in segments {
            block.release();
        }
        self.state = LargeBufState::Released;
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn assert_writable(&self) {
        assert_eq!(self.state, LargeBufState::Loaded, "mutation while {:?}", self.state);
        assert_eq!(self.access, Access::Write, "mutation of a read-only large buf");
    }

    fn check_capacity(&self, requested: usize) -> Result<()> {
        if requested > self.max_segments {
            return Err(LargeBufError::CapacityExceeded {
                requested,
                limit: self.max_segments,
            });
        }
        Ok(())
    }

    fn checked_size(&self, extra_size: u32) -> Result<u32> {
        self.size
            .checked_add(extra_size)
            .ok_or(LargeBufError::SizeOverflow {
                size: self.size as u64 + extra_size as u64,
            })
    }

    /// Allocate `count` segment blocks, all or nothing
    fn allocate_segments(&self, count: usize) -> Result<Vec<T::Block>> {
        let txn = self.transaction();
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            match txn.allocate() {
                Ok(mut block) => {
                    stamp_segment(block.data_mut());
                    segments.push(block);
                }
                Err(e) => {
                    tracing::warn!("Segment allocation failed after {} of {}: {}", segments.len(), count, e);
                    for block in segments {
                        discard(block);
                    }
                    return Err(e);
                }
            }
        }
        Ok(segments)
    }

    fn write_index(&mut self) {
        let index = &self.index;
        match self.index_buf.as_mut() {
            Some(block) => {
                assert_eq!(Some(block.block_id()), self.index_block_id);
                index.encode(block.data_mut());
            }
            None => panic!("index write while {:?}", self.state),
        }
    }
}

impl<T: Transaction> Drop for LargeBuf<T> {
    fn drop(&mut self) {
        if !thread::panicking() {
            assert!(
                matches!(self.state, LargeBufState::NotLoaded | LargeBufState::Released),
                "large buf dropped while {:?}",
                self.state
            );
        }
    }
}

/// Tombstone and release a block this buffer no longer needs
fn discard<B: BlockHandle>(mut block: B) {
    block.mark_deleted();
    block.release();
}
