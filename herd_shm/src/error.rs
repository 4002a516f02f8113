//! Error types for shared cell operations

use thiserror::Error;

/// Errors that can occur while creating or mapping a shared cell
#[derive(Error, Debug)]
pub enum ShmError {
    /// Backing file creation failed
    #[error("failed to create cell backing file {path}: {source}")]
    Create {
        /// Backing file path
        path: String,
        /// Source IO error
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping failed
    #[error("failed to map shared cell: {source}")]
    Map {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Mapping is not word-aligned
    #[error("shared cell mapping at {address:#x} is not word-aligned")]
    Alignment {
        /// Mapping base address
        address: usize,
    },
}

/// Result type for shared cell operations
pub type ShmResult<T> = Result<T, ShmError>;
