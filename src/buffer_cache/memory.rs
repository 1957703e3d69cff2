//! In-memory block store
//!
//! A complete `Transaction` implementation backed by a `HashMap` of blocks.
//! Handles copy the block out on acquire and write it back on release, so a
//! handle behaves like a pinned cache buffer.
//!
//! Completion timing is selectable per transaction (`CompletionMode`), which
//! lets callers drive in-line, parked and cross-thread completions.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{LargeBufError, Result};

use super::{Access, AcquireCallback, BlockHandle, BlockId, Transaction};

// =============================================================================
// Cache
// =============================================================================

/// Shared block storage
pub struct MemoryCache {
    block_size: usize,
    max_blocks: Option<usize>,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    /// Block id → committed block bytes
    blocks: HashMap<BlockId, Vec<u8>>,
    next_id: BlockId,
    /// Handles handed out and not yet released
    outstanding: usize,
}

/// On-disk image of a cache (bincode encoded)
#[derive(Serialize, Deserialize)]
struct CacheImage {
    block_size: usize,
    next_id: BlockId,
    blocks: Vec<(BlockId, Vec<u8>)>,
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self::with_blocks(config, HashMap::new(), 1)))
    }

    fn with_blocks(config: &Config, blocks: HashMap<BlockId, Vec<u8>>, next_id: BlockId) -> Self {
        Self {
            block_size: config.block_size,
            max_blocks: config.max_blocks,
            inner: Mutex::new(CacheInner {
                blocks,
                next_id,
                outstanding: 0,
            }),
        }
    }

    /// Load a cache previously written with `save_image`.
    ///
    /// The image's block size must match `config.block_size`.
    pub fn load_image(path: &Path, config: &Config) -> Result<Arc<Self>> {
        config.validate()?;
        let bytes = fs::read(path)?;
        let image: CacheImage = bincode::deserialize(&bytes)?;
        if image.block_size != config.block_size {
            return Err(LargeBufError::Config(format!(
                "image block size {} does not match configured {}",
                image.block_size, config.block_size
            )));
        }
        let blocks = image.blocks.into_iter().collect();
        Ok(Arc::new(Self::with_blocks(config, blocks, image.next_id)))
    }

    /// Write every committed block to `path`
    pub fn save_image(&self, path: &Path) -> Result<()> {
        let image = {
            let inner = self.inner.lock();
            let mut blocks: Vec<(BlockId, Vec<u8>)> = inner
                .blocks
                .iter()
                .map(|(id, data)| (*id, data.clone()))
                .collect();
            blocks.sort_by_key(|(id, _)| *id);
            CacheImage {
                block_size: self.block_size,
                next_id: inner.next_id,
                blocks,
            }
        };
        fs::write(path, bincode::serialize(&image)?)?;
        tracing::debug!("Saved {} blocks to {}", image.blocks.len(), path.display());
        Ok(())
    }

    /// Start a transaction against this cache
    pub fn begin(self: &Arc<Self>, mode: CompletionMode) -> Arc<MemoryTransaction> {
        let worker = match mode {
            CompletionMode::Background => {
                let (tx, rx) = channel::unbounded::<ParkedAcquire>();
                thread::spawn(move || {
                    for parked in rx {
                        parked.deliver();
                    }
                });
                Some(tx)
            }
            _ => None,
        };

        Arc::new(MemoryTransaction {
            cache: Arc::clone(self),
            mode,
            requests: AtomicUsize::new(0),
            parked: Mutex::new(VecDeque::new()),
            worker,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of committed blocks
    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.inner.lock().blocks.contains_key(&id)
    }

    /// Copy of a block's committed bytes
    pub fn read_block(&self, id: BlockId) -> Option<Vec<u8>> {
        self.inner.lock().blocks.get(&id).cloned()
    }

    /// Handles handed out and not yet released
    pub fn outstanding_handles(&self) -> usize {
        self.inner.lock().outstanding
    }

    fn allocate_block(self: &Arc<Self>) -> Result<MemoryBlock> {
        let mut inner = self.inner.lock();
        if let Some(max) = self.max_blocks {
            if inner.blocks.len() >= max {
                return Err(LargeBufError::BlockStoreExhausted(format!(
                    "all {} blocks in use",
                    max
                )));
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.blocks.insert(id, vec![0u8; self.block_size]);
        inner.outstanding += 1;
        tracing::trace!("Allocated block {}", id);

        Ok(MemoryBlock {
            id,
            access: Access::Write,
            data: vec![0u8; self.block_size],
            dirty: true,
            deleted: false,
            cache: Arc::clone(self),
        })
    }

    fn checkout(self: &Arc<Self>, id: BlockId, access: Access) -> MemoryBlock {
        let mut inner = self.inner.lock();
        let data = match inner.blocks.get(&id) {
            Some(data) => data.clone(),
            None => panic!("acquire of unknown block {}", id),
        };
        inner.outstanding += 1;

        MemoryBlock {
            id,
            access,
            data,
            dirty: false,
            deleted: false,
            cache: Arc::clone(self),
        }
    }

    fn check_in(&self, block: MemoryBlock) {
        let mut inner = self.inner.lock();
        inner.outstanding -= 1;
        if block.deleted {
            inner.blocks.remove(&block.id);
            tracing::trace!("Freed block {}", block.id);
        } else if block.dirty {
            inner.blocks.insert(block.id, block.data);
        }
    }
}

// =============================================================================
// Block Handle
// =============================================================================

/// A checked-out copy of one block
pub struct MemoryBlock {
    id: BlockId,
    access: Access,
    data: Vec<u8>,
    dirty: bool,
    deleted: bool,
    cache: Arc<MemoryCache>,
}

impl MemoryBlock {
    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl BlockHandle for MemoryBlock {
    fn block_id(&self) -> BlockId {
        self.id
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        assert_eq!(
            self.access,
            Access::Write,
            "write through read-only handle for block {}",
            self.id
        );
        self.dirty = true;
        &mut self.data
    }

    fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn release(self) {
        let cache = Arc::clone(&self.cache);
        cache.check_in(self);
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// When acquires complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Every acquire returns its block in-line
    Immediate,

    /// Acquires are parked until drained with `deliver_*`
    Deferred,

    /// Every `n`th acquire is parked, the rest complete in-line
    DeferEvery(usize),

    /// Acquires complete on a worker thread
    Background,
}

struct ParkedAcquire {
    block: MemoryBlock,
    on_ready: AcquireCallback<MemoryBlock>,
}

impl ParkedAcquire {
    fn deliver(self) {
        (self.on_ready)(self.block)
    }
}

/// A transaction over a `MemoryCache`
pub struct MemoryTransaction {
    cache: Arc<MemoryCache>,
    mode: CompletionMode,
    /// Acquire requests seen so far (drives `DeferEvery`)
    requests: AtomicUsize,
    parked: Mutex<VecDeque<ParkedAcquire>>,
    worker: Option<Sender<ParkedAcquire>>,
}

impl MemoryTransaction {
    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// Number of parked completions
    pub fn pending(&self) -> usize {
        self.parked.lock().len()
    }

    /// Deliver the oldest parked completion
    pub fn deliver_next(&self) -> bool {
        let next = self.parked.lock().pop_front();
        match next {
            Some(parked) => {
                parked.deliver();
                true
            }
            None => false,
        }
    }

    /// Deliver the newest parked completion
    pub fn deliver_latest(&self) -> bool {
        let latest = self.parked.lock().pop_back();
        match latest {
            Some(parked) => {
                parked.deliver();
                true
            }
            None => false,
        }
    }

    /// Deliver parked completions until none remain, including any parked
    /// by the callbacks themselves. Returns how many were delivered.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        while self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    /// Drop every parked completion without calling it, releasing the
    /// blocks it would have delivered. Models a transaction abort; dropping
    /// the transaction does the same.
    pub fn abort_pending(&self) -> usize {
        let parked: Vec<ParkedAcquire> = self.parked.lock().drain(..).collect();
        let count = parked.len();
        for ParkedAcquire { block, on_ready } in parked {
            drop(on_ready);
            block.release();
        }
        if count > 0 {
            tracing::debug!("Aborted {} parked acquires", count);
        }
        count
    }

    fn park(&self, parked: ParkedAcquire) {
        tracing::trace!("Parked acquire of block {}", parked.block.id);
        self.parked.lock().push_back(parked);
    }
}

impl Transaction for MemoryTransaction {
    type Block = MemoryBlock;

    fn block_size(&self) -> usize {
        self.cache.block_size
    }

    fn allocate(&self) -> Result<MemoryBlock> {
        self.cache.allocate_block()
    }

    fn acquire(
        &self,
        id: BlockId,
        access: Access,
        on_ready: AcquireCallback<MemoryBlock>,
    ) -> Option<MemoryBlock> {
        let block = self.cache.checkout(id, access);
        let request = self.requests.fetch_add(1, Ordering::SeqCst) + 1;

        match self.mode {
            CompletionMode::Immediate => Some(block),
            CompletionMode::Deferred => {
                self.park(ParkedAcquire { block, on_ready });
                None
            }
            CompletionMode::DeferEvery(n) if n > 0 && request % n == 0 => {
                self.park(ParkedAcquire { block, on_ready });
                None
            }
            CompletionMode::DeferEvery(_) => Some(block),
            CompletionMode::Background => {
                let parked = ParkedAcquire { block, on_ready };
                match &self.worker {
                    Some(worker) => match worker.send(parked) {
                        Ok(()) => None,
                        Err(err) => Some(err.into_inner().block),
                    },
                    None => Some(parked.block),
                }
            }
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // Parked completions never fire once the transaction is gone
        let aborted = self.abort_pending();
        if aborted > 0 {
            tracing::warn!("Transaction dropped with {} parked acquires", aborted);
        }
    }
}
