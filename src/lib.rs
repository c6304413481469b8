//! Core engine of NewFS, a small educational filesystem.
//!
//! The engine persists a hierarchical directory tree onto a fixed-size
//! block device. A hosting daemon mounts a device with [`NewFs::mount`],
//! resolves paths with [`NewFs::lookup`], mutates the in-memory tree
//! through the inode and dentry operations, and flattens everything back
//! to disk with [`NewFs::sync_inode`] or on [`NewFs::umount`].
//!
//! On disk the device is split into five regions: one super block, one
//! inode-bitmap block, one data-bitmap block, a 585-block inode table and
//! a 3508-block data region. One logical block covers two driver I/O
//! units. A device without the filesystem signature is formatted on
//! mount.
//!
//! The core is single-threaded; the hosting daemon serializes operations.

pub mod bitmap;
pub mod driver;
pub mod error;
pub mod fs;
pub mod layout;
pub mod tree;
mod util;

pub use error::Error;
pub use error::Result;
pub use fs::Lookup;
pub use fs::MountOptions;
pub use fs::NewFs;
pub use layout::FileType;
pub use tree::DentryId;
