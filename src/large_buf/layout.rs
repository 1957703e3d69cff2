//! Persisted records
//!
//! ## Index block (little endian)
//! ```text
//! ┌────────────┬──────────────────┬─────────────────┬──────────────┬────────────────┐
//! │ Magic (4)  │ FirstBlockOff u32│ NumSegments u16 │ Reserved (2) │ BlockId u32 ...│
//! │  "lind"    │                  │                 │              │ × NumSegments  │
//! └────────────┴──────────────────┴─────────────────┴──────────────┴────────────────┘
//! ```
//!
//! ## Segment block
//! ```text
//! ┌────────────┬──────────────────────────────────┐
//! │ Magic (4)  │ Payload (block size − 4)         │
//! │  "lseg"    │                                  │
//! └────────────┴──────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut};

use crate::buffer_cache::BlockId;
use crate::error::{LargeBufError, Result};

use super::geometry::Geometry;

/// Magic bytes identifying a large buffer index block
pub const INDEX_MAGIC: &[u8; 4] = b"lind";

/// Magic bytes identifying a large buffer segment block
pub const SEGMENT_MAGIC: &[u8; 4] = b"lseg";

/// Index header: Magic (4) + FirstBlockOffset (4) + NumSegments (2) + Reserved (2)
pub const INDEX_HEADER_SIZE: usize = 12;

/// Segment header: Magic (4)
pub const SEGMENT_HEADER_SIZE: usize = 4;

const BLOCK_ID_SIZE: usize = std::mem::size_of::<BlockId>();

/// How many segment ids an index block of `block_size` bytes can hold
pub fn max_segments_for_block_size(block_size: usize) -> usize {
    (block_size.saturating_sub(INDEX_HEADER_SIZE) / BLOCK_ID_SIZE).min(u16::MAX as usize)
}

/// Decoded contents of an index block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRecord {
    /// Unused bytes at the start of segment 0
    pub first_block_offset: u32,
    /// Segment block ids in logical order
    pub blocks: Vec<BlockId>,
}

impl IndexRecord {
    pub fn num_segments(&self) -> usize {
        self.blocks.len()
    }

    /// Decode an index block. Returns `None` if the magic is wrong or the
    /// segment list does not fit in the block.
    pub fn decode(block: &[u8]) -> Option<Self> {
        if block.len() < INDEX_HEADER_SIZE || &block[..4] != INDEX_MAGIC {
            return None;
        }

        let mut buf = &block[4..];
        let first_block_offset = buf.get_u32_le();
        let num_segments = buf.get_u16_le() as usize;
        buf.advance(2);

        if buf.remaining() < num_segments * BLOCK_ID_SIZE {
            return None;
        }
        let blocks = (0..num_segments).map(|_| buf.get_u32_le()).collect();

        Some(Self {
            first_block_offset,
            blocks,
        })
    }

    /// Decode an index block that must describe a value of `size` bytes.
    /// The segment capacity follows from the block length.
    pub fn decode_for_size(block: &[u8], size: u32) -> Result<Self> {
        let record = Self::decode(block).ok_or_else(|| {
            LargeBufError::InvalidBlob("block is not a large buf index".to_string())
        })?;

        let geometry = Geometry {
            size,
            first_block_offset: record.first_block_offset,
            num_segments: record.num_segments(),
            segment_capacity: (block.len() - SEGMENT_HEADER_SIZE) as u32,
        };
        if !geometry.is_consistent() {
            return Err(LargeBufError::InvalidBlob(format!(
                "index with {} segments at offset {} cannot hold {} bytes",
                geometry.num_segments, geometry.first_block_offset, size
            )));
        }
        Ok(record)
    }

    /// Encode into the front of an index block, stamping the magic
    pub fn encode(&self, block: &mut [u8]) {
        assert!(
            self.blocks.len() <= max_segments_for_block_size(block.len()),
            "index of {} segments does not fit a {} byte block",
            self.blocks.len(),
            block.len()
        );

        let mut buf = block;
        buf.put_slice(INDEX_MAGIC);
        buf.put_u32_le(self.first_block_offset);
        buf.put_u16_le(self.blocks.len() as u16);
        buf.put_u16_le(0);
        for id in &self.blocks {
            buf.put_u32_le(*id);
        }
    }
}

/// Whether a segment block carries the segment magic
pub fn has_segment_magic(block: &[u8]) -> bool {
    block.len() >= SEGMENT_HEADER_SIZE && &block[..SEGMENT_HEADER_SIZE] == SEGMENT_MAGIC
}

/// Stamp the segment magic at the front of a segment block
pub fn stamp_segment(block: &mut [u8]) {
    block[..SEGMENT_HEADER_SIZE].copy_from_slice(SEGMENT_MAGIC);
}
