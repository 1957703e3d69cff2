//! Error types for largebuf
//!
//! Recoverable failures only. Invariant violations (wrong lifecycle state,
//! block id mismatches, corrupted records) panic instead of returning here.

use thiserror::Error;

/// Result type alias using LargeBufError
pub type Result<T> = std::result::Result<T, LargeBufError>;

/// Unified error type for largebuf operations
#[derive(Debug, Error)]
pub enum LargeBufError {
    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    #[error("Segment capacity exceeded: {requested} segments requested, limit is {limit}")]
    CapacityExceeded { requested: usize, limit: usize },

    #[error("Value size {size} exceeds the u32 length limit")]
    SizeOverflow { size: u64 },

    #[error("Block store exhausted: {0}")]
    BlockStoreExhausted(String),

    // -------------------------------------------------------------------------
    // Request Errors
    // -------------------------------------------------------------------------
    #[error("Invalid large buf: {0}")]
    InvalidBlob(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for LargeBufError {
    fn from(err: bincode::Error) -> Self {
        LargeBufError::Serialization(err.to_string())
    }
}
