//! Configuration for largebuf
//!
//! Centralized configuration with sensible defaults.

use crate::error::{LargeBufError, Result};
use crate::large_buf::{INDEX_HEADER_SIZE, SEGMENT_HEADER_SIZE};

/// Main configuration for the block cache and the large buffers built on it
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Block Cache Configuration
    // -------------------------------------------------------------------------
    /// Size of every cache block in bytes (fixed for the cache's lifetime)
    pub block_size: usize,

    /// Maximum number of live blocks the in-memory cache will hand out.
    /// `None` means unbounded.
    pub max_blocks: Option<usize>,

    // -------------------------------------------------------------------------
    // Large Buffer Configuration
    // -------------------------------------------------------------------------
    /// Values at or under this size stay in the node and never become blobs
    pub max_in_node_value_size: u32,

    /// Optional cap on segments per blob, below what the index block can hold
    pub segment_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_blocks: None,
            max_in_node_value_size: 250,
            segment_limit: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that a block can hold an index header plus one id, and a
    /// segment header plus at least one payload byte.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < INDEX_HEADER_SIZE + 4 {
            return Err(LargeBufError::Config(format!(
                "block size {} cannot hold an index record",
                self.block_size
            )));
        }
        if self.block_size <= SEGMENT_HEADER_SIZE {
            return Err(LargeBufError::Config(format!(
                "block size {} leaves no room for segment payload",
                self.block_size
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(LargeBufError::Config(format!(
                "block size {} does not fit a u32 offset",
                self.block_size
            )));
        }
        if self.segment_limit == Some(0) {
            return Err(LargeBufError::Config(
                "segment limit must allow at least one segment".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the cache block size (in bytes)
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Bound the number of live blocks in the in-memory cache
    pub fn max_blocks(mut self, count: usize) -> Self {
        self.config.max_blocks = Some(count);
        self
    }

    /// Set the in-node value threshold (in bytes)
    pub fn max_in_node_value_size(mut self, size: u32) -> Self {
        self.config.max_in_node_value_size = size;
        self
    }

    /// Cap the number of segments a single blob may span
    pub fn segment_limit(mut self, limit: usize) -> Self {
        self.config.segment_limit = Some(limit);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
