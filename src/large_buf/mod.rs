//! Large Buffer Module
//!
//! Values too large for a node, spread over an index block and an ordered
//! run of segment blocks.
//!
//! ## Layout
//! ```text
//!  index block                         segment blocks
//! ┌──────┬─────┬──────┬────┬────────┐   ┌──────┬──────────────────────┐
//! │"lind"│ fbo │nsegs │rsvd│ ids... │──►│"lseg"│ dead (fbo) │ payload │ seg 0
//! └──────┴─────┴──────┴────┴────────┘   ├──────┼──────────────────────┤
//!                                       │"lseg"│ payload              │ seg 1..n-1
//!                                       └──────┴──────────────────────┘
//! ```
//!
//! `first_block_offset` (fbo) is dead space at the front of segment 0. It
//! lets `prepend` add bytes by allocating new leading segments instead of
//! shifting every existing byte.
//!
//! ## Lifecycle
//! ```text
//! NotLoaded ──allocate/acquire──► Loading ──► Loaded ──► Deleted ──► Released
//!                                               └───────────────────► Released
//! ```

mod buf;
mod geometry;
mod layout;
mod loader;

pub use buf::LargeBuf;
pub use geometry::Geometry;
pub use layout::{
    has_segment_magic, max_segments_for_block_size, IndexRecord, INDEX_HEADER_SIZE, INDEX_MAGIC,
    SEGMENT_HEADER_SIZE, SEGMENT_MAGIC,
};

/// Where a large buffer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargeBufState {
    /// Constructed, holds no blocks
    NotLoaded,

    /// Index and segments are being acquired
    Loading,

    /// Every block is held; reads and mutations are allowed
    Loaded,

    /// Every block is tombstoned but still held
    Deleted,

    /// Every block has been returned; terminal
    Released,
}
