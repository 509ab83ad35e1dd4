//! Error types for the container library.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::PageId;

/// Result type alias for container operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating on a btree file
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying file, with the offending path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file's magic marker did not match
    #[error("{} is not a btree file", path.display())]
    NotABtree { path: PathBuf },

    /// The caller-supplied signature does not match the file's
    #[error("signature mismatch on {}: file has {found:#x}, expected {expected:#x}", path.display())]
    SignatureMismatch {
        path: PathBuf,
        found: u64,
        expected: u64,
    },

    /// The requested endianness differs from the file's stored tag
    #[error("endianness mismatch on {}", path.display())]
    EndiannessMismatch { path: PathBuf },

    /// Set/map or unique/multi flags differ from the file's
    #[error("container kind mismatch on {}: {detail}", path.display())]
    KindMismatch { path: PathBuf, detail: &'static str },

    /// Key or mapped size differs and the type is not declared variable
    #[error("{what} size mismatch on {}: file has {found}, expected {expected}", path.display())]
    SizeMismatch {
        path: PathBuf,
        what: &'static str,
        found: u32,
        expected: u32,
    },

    /// On-disk major version is not supported by this build
    #[error("version mismatch on {}: file is {found_major}.{found_minor}, supported major is {expected_major}", path.display())]
    VersionMismatch {
        path: PathBuf,
        found_major: u16,
        found_minor: u16,
        expected_major: u16,
    },

    /// Page id out of range on read (e.g. file truncated)
    #[error("invalid page id {id} (file has {page_count} pages)")]
    InvalidPageId { id: PageId, page_count: u32 },

    /// Mutation attempted on a read-only container
    #[error("mutation attempted on read-only container")]
    ReadOnly,

    /// Operation attempted on a closed container
    #[error("operation attempted on closed container")]
    Closed,

    /// Incompatible open flags, page size below minimum, or similar
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Wrap an I/O error with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid-argument error with a message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
