//! Geometry engine
//!
//! Pure position arithmetic over a segmented byte range. Segment `i` covers
//! block-relative bytes `[i * cap, (i + 1) * cap)`; the logical value starts
//! `first_block_offset` bytes into segment 0 and ends `size` bytes later.
//!
//! Offsets returned for segment 0 are relative to its live start, so they
//! never include `first_block_offset`.

/// Shape of one large buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Logical length in bytes
    pub size: u32,
    /// Dead bytes at the front of segment 0
    pub first_block_offset: u32,
    /// Live segments
    pub num_segments: usize,
    /// Payload bytes per segment block (block size minus segment header)
    pub segment_capacity: u32,
}

impl Geometry {
    /// Segments needed for `size` bytes starting at offset 0
    pub fn segment_count_for(size: u32, segment_capacity: u32) -> usize {
        Self::segments_spanned(size, 0, segment_capacity)
    }

    /// Segments needed for `size` bytes starting `first_block_offset` bytes
    /// into segment 0
    pub fn segments_spanned(size: u32, first_block_offset: u32, segment_capacity: u32) -> usize {
        assert!(segment_capacity > 0);
        let end = size as u64 + first_block_offset as u64;
        end.div_ceil(segment_capacity as u64) as usize
    }

    /// Geometry of a freshly allocated buffer
    pub fn for_new(size: u32, segment_capacity: u32) -> Self {
        Self {
            size,
            first_block_offset: 0,
            num_segments: Self::segment_count_for(size, segment_capacity),
            segment_capacity,
        }
    }

    /// Whether `num_segments` is exactly what `size` and the offset require
    pub fn is_consistent(&self) -> bool {
        self.first_block_offset < self.segment_capacity
            && self.num_segments
                == Self::segments_spanned(self.size, self.first_block_offset, self.segment_capacity)
    }

    /// Live bytes in segment 0
    fn head_len(&self) -> u32 {
        self.segment_capacity - self.first_block_offset
    }

    /// Segment holding byte `pos`. `pos == size` may yield `num_segments`
    /// as a one-past-the-end sentinel.
    pub fn position_to_segment_index(&self, pos: u32) -> usize {
        let ix = if pos < self.head_len() {
            0
        } else {
            ((pos as u64 + self.first_block_offset as u64) / self.segment_capacity as u64) as usize
        };
        assert!(
            ix <= self.num_segments,
            "position {} maps to segment {} of {}",
            pos,
            ix,
            self.num_segments
        );
        ix
    }

    /// Offset of byte `pos` within its segment's live payload
    pub fn position_to_segment_offset(&self, pos: u32) -> u32 {
        let offset = if pos < self.head_len() {
            pos
        } else {
            ((pos as u64 + self.first_block_offset as u64) % self.segment_capacity as u64) as u32
        };
        assert!(offset < self.segment_capacity);
        offset
    }

    /// Offset of the logical end within the last segment block, counting
    /// segment 0's dead space. Zero means the last segment is exactly full.
    pub fn tail_block_offset(&self) -> u32 {
        ((self.size as u64 + self.first_block_offset as u64) % self.segment_capacity as u64) as u32
    }

    /// Live payload length of segment `ix`. Never zero.
    pub fn segment_byte_length(&self, ix: usize) -> u32 {
        assert!(
            ix < self.num_segments,
            "segment {} out of range ({} segments)",
            ix,
            self.num_segments
        );

        let len = if self.num_segments == 1 {
            self.size
        } else if ix == self.num_segments - 1 {
            // Whatever is left past the full blocks, wrapping 0 to a full block
            ((self.size as u64 + self.first_block_offset as u64 - 1) % self.segment_capacity as u64
                + 1) as u32
        } else if ix == 0 {
            self.head_len()
        } else {
            self.segment_capacity
        };

        assert!(len <= self.size);
        len
    }

    /// Whether `[pos, pos + len)` lies within the value
    pub fn contains_range(&self, pos: u32, len: u32) -> bool {
        pos as u64 + len as u64 <= self.size as u64
    }

    /// Bytes that fit without another segment
    pub fn spare_capacity(&self) -> u32 {
        (self.num_segments as u64 * self.segment_capacity as u64
            - self.first_block_offset as u64
            - self.size as u64) as u32
    }
}
