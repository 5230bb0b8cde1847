//! Error types for bucket operations.

use thiserror::Error;

/// Errors that can occur during bucket operations.
#[derive(Debug, Error)]
pub enum BucketError {
    /// Bucket serialization error.
    #[error("bucket serialization error: {0}")]
    Serialization(String),

    /// Writer contract violation: out-of-order input, meta record after
    /// data, non-soroban entry in a hot archive bucket, or a protocol
    /// version precondition failure. The iterator that produced this is
    /// unusable and its temporary file has been discarded.
    #[error("bucket protocol violation: {0}")]
    ProtocolViolation(String),

    /// Bucket merge error.
    #[error("bucket merge error: {0}")]
    Merge(String),

    /// Bloom filter construction error.
    #[error("bloom filter error: {0}")]
    BloomFilter(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
