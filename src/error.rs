//! Error kinds shared across the filesystem core.

use std::io;
use thiserror::Error;

/// A specialized result type for filesystem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the filesystem core.
#[derive(Error, Debug)]
pub enum Error {
    /// Permission denied.
    #[error("permission denied")]
    Access,
    /// A seek was attempted off the I/O unit grid.
    #[error("illegal seek")]
    Seek,
    /// The operation expected a file but found a directory.
    #[error("is a directory")]
    IsDir,
    /// A bitmap is saturated or a file outgrew its block array.
    #[error("no space left on device")]
    NoSpace,
    /// The name already exists in the directory.
    #[error("file exists")]
    Exists,
    /// Path resolution or dentry removal found no such entry.
    #[error("no such file or directory")]
    NotFound,
    /// The operation is not supported by this filesystem.
    #[error("operation not supported")]
    Unsupported,
    /// The driver failed a transfer.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Invalid argument, such as dropping the root inode.
    #[error("invalid argument")]
    Inval,
}

impl Error {
    /// Returns the errno the hosting daemon should surface for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Access => libc::EACCES,
            Self::Seek => libc::ESPIPE,
            Self::IsDir => libc::EISDIR,
            Self::NoSpace => libc::ENOSPC,
            Self::Exists => libc::EEXIST,
            Self::NotFound => libc::ENOENT,
            Self::Unsupported => libc::ENXIO,
            Self::Io(_) => libc::EIO,
            Self::Inval => libc::EINVAL,
        }
    }
}
