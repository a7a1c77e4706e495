// StreamBlob - Rust Implementation
// A page-backed blob storage engine with stable record ids

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;

// Re-exports for convenience
pub use crate::config::{BackendKind, ReclaimPolicy, StorageConfig};
pub use error::{Error, Result};
pub use storage::{BlobStorage, PagedStorage, RecordId, StorageStats};

/// Crate version, reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// StreamBlob error types
pub mod error {
    use crate::storage::blob::RecordId;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Record not found: {0}")]
        NotFound(RecordId),

        #[error("Corrupted data: {0}")]
        CorruptedData(String),

        #[error("Capacity exceeded: {0}")]
        CapacityExceeded(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}
