//! # largebuf
//!
//! Out-of-line storage for values too large for a single cache block:
//! - An index block listing the value's segment blocks in order
//! - Segment blocks holding contiguous slices of the value
//! - Cheap prepend through dead space at the front of the first segment
//! - Asynchronous loading with exactly-once completion
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         LargeBuf                             │
//! │        allocate / append / prepend / fill_at / read_at       │
//! │                 unappend / unprepend / release               │
//! └──────────┬─────────────────────┬────────────────────────────┘
//!            │                     │
//!            ▼                     ▼
//!   ┌─────────────────┐   ┌─────────────────┐
//!   │    Geometry     │   │     Loader      │
//!   │ (position math) │   │  (fan-in of     │
//!   └─────────────────┘   │   acquires)     │
//!                         └────────┬────────┘
//!                                  │
//!                                  ▼
//!                         ┌─────────────────┐
//!                         │  Buffer Cache   │
//!                         │  (Transaction)  │
//!                         └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod buffer_cache;
pub mod large_buf;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LargeBufError, Result};
pub use config::Config;
pub use buffer_cache::{Access, BlockHandle, BlockId, Transaction};
pub use large_buf::{Geometry, LargeBuf, LargeBufState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of largebuf
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
