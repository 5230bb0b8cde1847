//! Shared primitives for the meridian bucket storage core.
//!
//! This crate carries the pieces of the node that more than one subsystem
//! needs: the 32-byte content hash type, protocol-version gating helpers,
//! the XDR record-mark file streams that define the on-disk wire format,
//! and the bucket index tuning knobs.

pub mod config;
pub mod protocol;
pub mod types;
pub mod xdr_stream;

pub use config::BucketIndexConfig;
pub use types::Hash256;
pub use xdr_stream::{XdrInputFileStream, XdrOutputFileStream};
