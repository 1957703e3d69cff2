//! Acquisition state machine
//!
//! Loads the index block, then every segment block, through the
//! transaction's acquire calls. Each call may complete in-line or later
//! through its callback, in any order and from any thread. A counting
//! barrier joins them and hands the loaded buffer to the caller once.
//!
//! ```text
//! start ──acquire(index)──► index_acquired ──acquire(seg i)──► segment_acquired
//!                                                                   │
//!                                              acquired == expected ▼
//!                                                          on_available(buf)
//! ```
//!
//! The buffer lives inside the barrier until the last segment arrives, so
//! nothing can observe or resize it mid-load. `expected` is fixed when the
//! index arrives and the completion callback is taken out of its slot under
//! the lock, which makes completion exactly-once even when the final
//! segment resolves in-line inside the dispatch loop.
//!
//! If the transaction ends while the load is in flight, its parked
//! completions are dropped. The barrier goes with them and its `Drop`
//! releases every handle gathered so far.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer_cache::{Access, BlockHandle, BlockId, Transaction};

use super::buf::{AvailableCallback, LargeBuf};

/// Fan-in barrier shared by every outstanding acquire of one load
struct FanIn<T: Transaction> {
    state: Mutex<FanInState<T>>,
}

struct FanInState<T: Transaction> {
    /// The loading buffer and its completion callback, taken on completion
    pending: Option<(LargeBuf<T>, AvailableCallback<T>)>,
    /// Segment handles by index, filled in any order
    segments: Vec<Option<T::Block>>,
    expected: usize,
    acquired: usize,
}

/// Begin loading `buf` from `index_block_id`
pub(super) fn start<T: Transaction>(
    mut buf: LargeBuf<T>,
    index_block_id: BlockId,
    size: u32,
    access: Access,
    on_available: AvailableCallback<T>,
) {
    buf.begin_loading(index_block_id, size, access);
    tracing::debug!("Acquiring large buf {} ({} bytes, {:?})", index_block_id, size, access);

    let txn = buf.transaction();
    let barrier = Arc::new(FanIn {
        state: Mutex::new(FanInState {
            pending: Some((buf, on_available)),
            segments: Vec::new(),
            expected: 0,
            acquired: 0,
        }),
    });

    let deferred = Arc::clone(&barrier);
    let immediate = txn.acquire(
        index_block_id,
        access,
        Box::new(move |block| deferred.index_acquired(block)),
    );
    if let Some(block) = immediate {
        barrier.index_acquired(block);
    }
}

impl<T: Transaction> FanIn<T> {
    fn index_acquired(self: &Arc<Self>, block: T::Block) {
        let (txn, access, segment_ids) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let buf = match state.pending.as_mut() {
                Some((buf, _)) => buf,
                None => panic!("index delivered after loading finished"),
            };

            let txn = match buf.live_transaction() {
                Some(txn) => txn,
                None => {
                    tracing::debug!("Index {} delivered after its transaction ended", block.block_id());
                    block.release();
                    return;
                }
            };
            let segment_ids = buf.attach_index(block);
            let access = buf.access();

            state.expected = segment_ids.len();
            state.segments = (0..segment_ids.len()).map(|_| None).collect();
            (txn, access, segment_ids)
        };
        tracing::trace!("Index acquired, loading {} segments", segment_ids.len());

        // The lock is not held here: in-line completions re-enter
        // segment_acquired from inside this loop.
        for (ix, id) in segment_ids.into_iter().enumerate() {
            let deferred = Arc::clone(self);
            let immediate = txn.acquire(
                id,
                access,
                Box::new(move |block| deferred.segment_acquired(block, ix)),
            );
            if let Some(block) = immediate {
                self.segment_acquired(block, ix);
            }
        }
    }

    fn segment_acquired(&self, block: T::Block, ix: usize) {
        let ready = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let buf = match state.pending.as_ref() {
                Some((buf, _)) => buf,
                None => panic!("segment {} delivered after loading finished", ix),
            };
            buf.check_segment(ix, &block);
            assert!(state.segments[ix].is_none(), "segment {} delivered twice", ix);

            state.segments[ix] = Some(block);
            state.acquired += 1;
            tracing::trace!("Segment {} acquired ({}/{})", ix, state.acquired, state.expected);

            if state.acquired == state.expected {
                state.pending.take().map(|(mut buf, on_available)| {
                    buf.finish_loading(state.segments.drain(..).flatten().collect());
                    (buf, on_available)
                })
            } else {
                None
            }
        };

        if let Some((buf, on_available)) = ready {
            tracing::debug!(
                "Large buf {} loaded ({} segments)",
                buf.index_block_id(),
                buf.num_segments()
            );
            on_available(buf);
        }
    }
}

impl<T: Transaction> Drop for FanInState<T> {
    fn drop(&mut self) {
        // Every outstanding completion was dropped without firing
        if let Some((mut buf, _)) = self.pending.take() {
            tracing::warn!(
                "Abandoning acquisition of large buf {} with {}/{} segments held",
                buf.index_block_id(),
                self.acquired,
                self.expected
            );
            buf.abandon_loading(self.segments.drain(..).flatten());
        }
    }
}
