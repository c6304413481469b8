//! On-disk format: region geometry and record layouts.
//!
//! The device is split into five contiguous regions of logical blocks,
//! where one block covers two driver I/O units:
//!
//! ```text
//! [ super | inode bitmap | data bitmap | inode table (585) | data (3508) ]
//! ```
//!
//! All record fields are host-endian and naturally aligned; a volume
//! formatted by one build mounts under another on the same architecture.

use crate::error::Error;
use crate::error::Result;
use std::mem;

/// The filesystem's signature.
pub const MAGIC: u32 = 0x52415453;
/// Byte offset of the super block.
pub const SUPER_OFFSET: u64 = 0;
/// Inode number of the root directory.
pub const ROOT_INO: u32 = 0;

/// Maximum file name length, including padding.
pub const MAX_NAME_LEN: usize = 128;
/// Number of data blocks a single file can own.
pub const DATA_PER_FILE: usize = 6;

/// Blocks taken by the super region.
pub const SUPER_BLKS: u32 = 1;
/// Blocks taken by the inode bitmap.
pub const INODE_MAP_BLKS: u32 = 1;
/// Blocks taken by the data bitmap.
pub const DATA_MAP_BLKS: u32 = 1;
/// Blocks taken by the inode table, one inode record per block.
pub const INODE_BLKS: u32 = 585;
/// Blocks in the data region.
pub const DATA_BLKS: u32 = 3508;

/// The type tag of a file.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// A regular file backed by up to six data blocks.
    Regular = 0,
    /// A directory holding dentry records in its data blocks.
    Directory = 1,
    /// A symbolic link. The tag exists on disk but the core never creates one.
    Symlink = 2,
}

impl FileType {
    /// Decodes the on-disk tag.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Regular),
            1 => Ok(Self::Directory),
            2 => Ok(Self::Symlink),
            _ => Err(Error::Inval),
        }
    }
}

/// The super block record at offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DiskSuper {
    /// Must be [`MAGIC`].
    pub magic: u32,
    /// Usage counter carried across mounts.
    pub usage: u32,
    /// Number of inode slots.
    pub max_ino: u32,
    /// Number of data blocks.
    pub max_dno: u32,
    /// Blocks in the inode bitmap.
    pub inode_map_blks: u32,
    /// Byte offset of the inode bitmap.
    pub inode_map_off: u32,
    /// Blocks in the data bitmap.
    pub data_map_blks: u32,
    /// Byte offset of the data bitmap.
    pub data_map_off: u32,
    /// Byte offset of the inode table.
    pub inode_off: u32,
    /// Byte offset of the data region.
    pub data_off: u32,
}

/// An inode record in the inode table.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DiskInode {
    /// Inode number, equal to the record's index in the table.
    pub ino: u32,
    /// File size in bytes.
    pub size: u32,
    /// Number of directory entries; meaningful for directories only.
    pub dir_cnt: u32,
    /// File type tag.
    pub ftype: u32,
    /// Indices of the owned data blocks, packed from the front.
    pub blocks: [u32; DATA_PER_FILE],
    /// Number of live entries in `blocks`.
    pub allocated: u32,
}

/// A directory entry record inside a directory's data blocks.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DiskDentry {
    /// File name, zero-padded.
    pub name: [u8; MAX_NAME_LEN],
    /// File type tag.
    pub ftype: u32,
    /// Inode number of the entry.
    pub ino: u32,
}

impl DiskSuper {
    /// A record with every field zeroed, ready to be read into.
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

impl DiskInode {
    /// A record with every field zeroed, ready to be read into.
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

impl DiskDentry {
    /// A record with every field zeroed, ready to be read into.
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }

    /// Copies `name` into the record, truncating past [`MAX_NAME_LEN`].
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_NAME_LEN);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    /// The entry's name up to the first padding byte.
    pub fn name(&self) -> String {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_NAME_LEN);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }
}

/// Byte offsets and limits of the five on-disk regions.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Logical block size in bytes.
    pub block_size: usize,
    /// Number of inode slots.
    pub max_ino: u32,
    /// Number of data blocks.
    pub max_dno: u32,
    /// Blocks in the inode bitmap.
    pub inode_map_blks: u32,
    /// Blocks in the data bitmap.
    pub data_map_blks: u32,
    /// Byte offset of the inode bitmap.
    pub inode_map_off: u64,
    /// Byte offset of the data bitmap.
    pub data_map_off: u64,
    /// Byte offset of the inode table.
    pub inode_off: u64,
    /// Byte offset of the data region.
    pub data_off: u64,
}

impl Layout {
    /// The layout a fresh format produces for the given block size.
    pub fn format(block_size: usize) -> Self {
        let blk = block_size as u64;
        let inode_map_off = SUPER_OFFSET + u64::from(SUPER_BLKS) * blk;
        let data_map_off = inode_map_off + u64::from(INODE_MAP_BLKS) * blk;
        let inode_off = data_map_off + u64::from(DATA_MAP_BLKS) * blk;
        let data_off = inode_off + u64::from(INODE_BLKS) * blk;
        Self {
            block_size,
            max_ino: INODE_BLKS,
            max_dno: DATA_BLKS,
            inode_map_blks: INODE_MAP_BLKS,
            data_map_blks: DATA_MAP_BLKS,
            inode_map_off,
            data_map_off,
            inode_off,
            data_off,
        }
    }

    /// The layout described by an existing super block.
    pub fn from_super(sb: &DiskSuper, block_size: usize) -> Self {
        Self {
            block_size,
            max_ino: sb.max_ino,
            max_dno: sb.max_dno,
            inode_map_blks: sb.inode_map_blks,
            data_map_blks: sb.data_map_blks,
            inode_map_off: u64::from(sb.inode_map_off),
            data_map_off: u64::from(sb.data_map_off),
            inode_off: u64::from(sb.inode_off),
            data_off: u64::from(sb.data_off),
        }
    }

    /// Builds the super block record describing this layout.
    pub fn to_super(&self, usage: u32) -> DiskSuper {
        DiskSuper {
            magic: MAGIC,
            usage,
            max_ino: self.max_ino,
            max_dno: self.max_dno,
            inode_map_blks: self.inode_map_blks,
            inode_map_off: self.inode_map_off as u32,
            data_map_blks: self.data_map_blks,
            data_map_off: self.data_map_off as u32,
            inode_off: self.inode_off as u32,
            data_off: self.data_off as u32,
        }
    }

    /// Byte offset of the inode record `ino`.
    pub fn inode_offset(&self, ino: u32) -> u64 {
        self.inode_off + u64::from(ino) * self.block_size as u64
    }

    /// Byte offset of the data block `dno`.
    pub fn data_offset(&self, dno: u32) -> u64 {
        self.data_off + u64::from(dno) * self.block_size as u64
    }

    /// Directory entry records fitting in one block.
    pub fn dentries_per_block(&self) -> usize {
        self.block_size / mem::size_of::<DiskDentry>()
    }
}
