//! The filesystem engine.
//!
//! A [`NewFs`] handle owns the device, the two bitmap allocators and the
//! in-memory tree. Mounting loads (or formats) the device and materializes
//! the root directory; every other operation mutates the in-memory tree
//! and is flattened back to disk by [`NewFs::sync_inode`] or on
//! [`NewFs::umount`].

use crate::bitmap::Bitmap;
use crate::driver::Disk;
use crate::driver::Driver;
use crate::driver::FileDriver;
use crate::error::Error;
use crate::error::Result;
use crate::layout::DiskDentry;
use crate::layout::DiskInode;
use crate::layout::DiskSuper;
use crate::layout::FileType;
use crate::layout::Layout;
use crate::layout::DATA_PER_FILE;
use crate::layout::MAGIC;
use crate::layout::ROOT_INO;
use crate::layout::SUPER_OFFSET;
use crate::tree::Dentry;
use crate::tree::DentryArena;
use crate::tree::DentryId;
use crate::tree::Inode;
use crate::util::reinterpret;
use crate::util::reinterpret_mut;
use log::debug;
use log::info;
use log::warn;
use std::mem;
use std::path::PathBuf;

/// Mount configuration handed over by the hosting daemon.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Path of the device to mount.
    pub device: PathBuf,
}

/// Outcome of a path resolution.
#[derive(Debug, Clone, Copy)]
pub struct Lookup {
    /// The resolved dentry on a hit; the last directory walked on a miss.
    pub dentry: DentryId,
    /// Whether the full path resolved to an entry.
    pub found: bool,
    /// Whether the path named the root itself.
    pub is_root: bool,
}

/// A mounted filesystem.
pub struct NewFs {
    disk: Disk,
    layout: Layout,
    usage: u32,
    inode_map: Bitmap,
    data_map: Bitmap,
    arena: DentryArena,
    root: DentryId,
    mounted: bool,
}

impl NewFs {
    /// Mounts the device named by `options`, formatting it first when no
    /// filesystem signature is found.
    pub fn mount(options: &MountOptions) -> Result<Self> {
        let driver = FileDriver::open(&options.device)?;
        Self::mount_driver(Box::new(driver))
    }

    /// Mounts the device behind an already opened driver.
    pub fn mount_driver(driver: Box<dyn Driver>) -> Result<Self> {
        let mut disk = Disk::new(driver);
        let block_size = disk.block_size();

        let mut super_rec = DiskSuper::zeroed();
        disk.read(SUPER_OFFSET, reinterpret_mut(&mut super_rec))?;

        let format = super_rec.magic != MAGIC;
        let (layout, usage) = if format {
            info!("mount: no filesystem signature, formatting");
            (Layout::format(block_size), 0)
        } else {
            (Layout::from_super(&super_rec, block_size), super_rec.usage)
        };

        let need = layout.data_off + u64::from(layout.max_dno) * block_size as u64;
        if disk.size() < need {
            warn!(
                "mount: device is {} bytes but the geometry needs {}",
                disk.size(),
                need
            );
        }

        let mut inode_map = Bitmap::new(
            layout.inode_map_blks as usize * block_size,
            layout.max_ino as usize,
        );
        let mut data_map = Bitmap::new(
            layout.data_map_blks as usize * block_size,
            layout.max_dno as usize,
        );
        if !format {
            // A fresh format keeps the zeroed maps instead of reading
            // whatever bytes the device held.
            disk.read(layout.inode_map_off, inode_map.bytes_mut())?;
            disk.read(layout.data_map_off, data_map.bytes_mut())?;
        }

        let mut arena = DentryArena::new();
        let root = arena.insert(Dentry::new("/", FileType::Directory));

        let mut fs = Self {
            disk,
            layout,
            usage,
            inode_map,
            data_map,
            arena,
            root,
            mounted: false,
        };
        if format {
            fs.alloc_inode(root)?;
            fs.sync_inode(root)?;
        }
        fs.read_inode(root, ROOT_INO)?;
        fs.mounted = true;
        debug!(
            "mount: block size {block_size}, {} inode slots, {} data blocks",
            fs.layout.max_ino, fs.layout.max_dno
        );
        Ok(fs)
    }

    /// Syncs the whole tree and writes back the super block and both
    /// bitmaps. A no-op when the filesystem is not mounted.
    ///
    /// The device itself is released when the handle is dropped.
    pub fn umount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.sync_inode(self.root)?;

        let super_rec = self.layout.to_super(self.usage);
        self.disk.write(SUPER_OFFSET, reinterpret(&super_rec))?;
        self.disk
            .write(self.layout.inode_map_off, self.inode_map.bytes())?;
        self.disk
            .write(self.layout.data_map_off, self.data_map.bytes())?;

        self.mounted = false;
        debug!("umount: tree synced, super block and bitmaps written");
        Ok(())
    }

    /// The root directory dentry.
    pub fn root(&self) -> DentryId {
        self.root
    }

    /// Borrows a dentry by id.
    pub fn dentry(&self, id: DentryId) -> &Dentry {
        self.arena.get(id)
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Logical block size of the mounted device.
    pub fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    /// Raw byte-range access to the underlying device.
    pub fn disk(&mut self) -> &mut Disk {
        &mut self.disk
    }

    /// The inode allocation bitmap.
    pub fn inode_map(&self) -> &Bitmap {
        &self.inode_map
    }

    /// The data block allocation bitmap.
    pub fn data_map(&self) -> &Bitmap {
        &self.data_map
    }

    /// Creates an unlinked dentry; link it with [`NewFs::alloc_dentry`].
    pub fn new_dentry(&mut self, name: &str, ftype: FileType) -> DentryId {
        self.arena.insert(Dentry::new(name, ftype))
    }

    /// Allocates an inode number and attaches a fresh inode to `id`.
    ///
    /// Regular files get their six block-sized data buffers up front; the
    /// on-disk data blocks are only claimed when data is written.
    pub fn alloc_inode(&mut self, id: DentryId) -> Result<u32> {
        let ino = self.inode_map.allocate().ok_or(Error::NoSpace)?;
        let block_size = self.disk.block_size();

        let mut inode = Inode::new(ino);
        if self.arena.get(id).is_regular() {
            inode.data = vec![vec![0u8; block_size]; DATA_PER_FILE];
        }
        let dentry = self.arena.get_mut(id);
        dentry.ino = Some(ino);
        dentry.inode = Some(inode);
        Ok(ino)
    }

    /// Links `child` at the front of the directory `dir`'s entry list.
    ///
    /// Every `dentries_per_block`-th entry claims one more data block for
    /// the directory from the data bitmap.
    pub fn alloc_dentry(&mut self, dir: DentryId, child: DentryId) -> Result<()> {
        let per_block = self.layout.dentries_per_block();
        let (dir_cnt, allocated) = {
            let inode = self.arena.get(dir).inode.as_ref().ok_or(Error::Inval)?;
            (inode.dir_cnt as usize, inode.allocated as usize)
        };
        if dir_cnt % per_block == 0 {
            if allocated == DATA_PER_FILE {
                return Err(Error::NoSpace);
            }
            let dno = self.data_map.allocate().ok_or(Error::NoSpace)?;
            let inode = self.inode_mut(dir)?;
            inode.blocks[allocated] = dno;
            inode.allocated += 1;
        }

        let inode = self.inode_mut(dir)?;
        inode.children.insert(0, child);
        inode.dir_cnt += 1;
        inode.size += mem::size_of::<DiskDentry>() as u32;
        self.arena.get_mut(child).parent = Some(dir);
        Ok(())
    }

    /// Unlinks `child` from the directory `dir` and releases its slot.
    ///
    /// The directory keeps its data blocks even when the removed entry was
    /// the last one in a block.
    pub fn drop_dentry(&mut self, dir: DentryId, child: DentryId) -> Result<()> {
        let inode = self.inode_mut(dir)?;
        let pos = inode
            .children
            .iter()
            .position(|&c| c == child)
            .ok_or(Error::NotFound)?;
        inode.children.remove(pos);
        inode.dir_cnt -= 1;
        self.arena.remove(child);
        Ok(())
    }

    /// Releases the inode attached to `id`.
    ///
    /// Directories are emptied recursively: each child's inode is dropped
    /// and its dentry unlinked. Inode bitmap bits are cleared; data bitmap
    /// bits are not returned. Dropping the root is refused.
    pub fn drop_inode(&mut self, id: DentryId) -> Result<()> {
        if id == self.root {
            return Err(Error::Inval);
        }
        self.materialize(id)?;

        let ino = self.arena.get(id).ino.ok_or(Error::Inval)?;
        if self.arena.get(id).is_dir() {
            let children = self
                .arena
                .get(id)
                .inode
                .as_ref()
                .map(|inode| inode.children.clone())
                .unwrap_or_default();
            for child in children {
                self.drop_inode(child)?;
                self.drop_dentry(id, child)?;
            }
            self.inode_map.free(ino);
        } else {
            self.inode_map.free(ino);
            self.arena.get_mut(id).inode = None;
        }
        Ok(())
    }

    /// Materializes the inode record `ino` behind the dentry `id`.
    ///
    /// Directories get exactly `dir_cnt` child dentries rebuilt from their
    /// data blocks, left lazy themselves; regular files get their buffers
    /// loaded. A second call on a materialized dentry is a no-op.
    pub fn read_inode(&mut self, id: DentryId, ino: u32) -> Result<()> {
        if self.arena.get(id).inode.is_some() {
            return Ok(());
        }

        let mut rec = DiskInode::zeroed();
        self.disk
            .read(self.layout.inode_offset(ino), reinterpret_mut(&mut rec))?;
        let ftype = FileType::from_raw(rec.ftype)?;
        let block_size = self.disk.block_size();
        let allocated = (rec.allocated as usize).min(DATA_PER_FILE);

        let mut inode = Inode::new(rec.ino);
        inode.size = rec.size;
        inode.blocks = rec.blocks;
        inode.allocated = allocated as u32;

        match ftype {
            FileType::Directory => {
                inode.dir_cnt = rec.dir_cnt;
                let per_block = self.layout.dentries_per_block();
                let dentry_size = mem::size_of::<DiskDentry>();
                let mut remaining = rec.dir_cnt as usize;
                let mut blk = 0;
                while remaining > 0 && blk < allocated {
                    let count = per_block.min(remaining);
                    let mut buf = vec![0u8; count * dentry_size];
                    self.disk
                        .read(self.layout.data_offset(rec.blocks[blk]), &mut buf)?;
                    for chunk in buf.chunks_exact(dentry_size) {
                        let mut drec = DiskDentry::zeroed();
                        reinterpret_mut(&mut drec).copy_from_slice(chunk);
                        let child = self.arena.insert(Dentry {
                            name: drec.name(),
                            ftype: FileType::from_raw(drec.ftype)?,
                            ino: Some(drec.ino),
                            parent: Some(id),
                            inode: None,
                        });
                        inode.children.insert(0, child);
                    }
                    remaining -= count;
                    blk += 1;
                }
            }
            FileType::Regular => {
                inode.data = vec![vec![0u8; block_size]; DATA_PER_FILE];
                for i in 0..allocated {
                    let off = self.layout.data_offset(rec.blocks[i]);
                    self.disk.read(off, &mut inode.data[i])?;
                }
            }
            FileType::Symlink => {}
        }

        let dentry = self.arena.get_mut(id);
        dentry.ino = Some(ino);
        dentry.inode = Some(inode);
        Ok(())
    }

    /// Writes the inode record behind `id` and its payload back to disk.
    ///
    /// Directories pack their children into dentry records across their
    /// data blocks in list order, then recurse into every materialized
    /// child. Regular files write each allocated data buffer to its
    /// recorded block.
    pub fn sync_inode(&mut self, id: DentryId) -> Result<()> {
        let ftype = self.arena.get(id).ftype;
        let rec = {
            let inode = self.arena.get(id).inode.as_ref().ok_or(Error::Inval)?;
            DiskInode {
                ino: inode.ino,
                size: inode.size,
                dir_cnt: inode.dir_cnt,
                ftype: ftype as u32,
                blocks: inode.blocks,
                allocated: inode.allocated,
            }
        };
        self.disk
            .write(self.layout.inode_offset(rec.ino), reinterpret(&rec))?;

        match ftype {
            FileType::Directory => {
                let (children, blocks, allocated) = {
                    let inode = self.arena.get(id).inode.as_ref().ok_or(Error::Inval)?;
                    (
                        inode.children.clone(),
                        inode.blocks,
                        inode.allocated as usize,
                    )
                };
                let per_block = self.layout.dentries_per_block();
                let dentry_size = mem::size_of::<DiskDentry>();
                let mut next = 0;
                for blk in 0..allocated {
                    if next >= children.len() {
                        break;
                    }
                    let count = per_block.min(children.len() - next);
                    let mut buf = vec![0u8; count * dentry_size];
                    for (k, &child) in children[next..next + count].iter().enumerate() {
                        let dentry = self.arena.get(child);
                        let mut drec = DiskDentry::zeroed();
                        drec.set_name(&dentry.name);
                        drec.ftype = dentry.ftype as u32;
                        drec.ino = dentry.ino.ok_or(Error::Inval)?;
                        buf[k * dentry_size..(k + 1) * dentry_size]
                            .copy_from_slice(reinterpret(&drec));
                    }
                    self.disk
                        .write(self.layout.data_offset(blocks[blk]), &buf)?;
                    next += count;
                }
                for &child in &children {
                    if self.arena.get(child).inode.is_some() {
                        self.sync_inode(child)?;
                    }
                }
            }
            FileType::Regular => {
                let dentry = self.arena.get(id);
                let inode = dentry.inode.as_ref().ok_or(Error::Inval)?;
                for i in 0..inode.allocated as usize {
                    let off = self.layout.data_offset(inode.blocks[i]);
                    self.disk.write(off, &inode.data[i])?;
                }
            }
            FileType::Symlink => {}
        }
        Ok(())
    }

    /// The `index`-th child of the directory `dir`, in list order.
    pub fn get_dentry(&self, dir: DentryId, index: usize) -> Option<DentryId> {
        self.arena
            .get(dir)
            .inode
            .as_ref()?
            .children
            .get(index)
            .copied()
    }

    /// Resolves a slash-separated absolute path against the tree,
    /// materializing inodes along the way.
    ///
    /// On a miss the last directory walked is returned with
    /// `found == false`; a path descending through a regular file returns
    /// that file's dentry, also with `found == false`.
    pub fn lookup(&mut self, path: &str) -> Result<Lookup> {
        let tokens: Vec<&str> = path.split('/').filter(|t| !t.is_empty()).collect();
        if tokens.is_empty() {
            return Ok(Lookup {
                dentry: self.root,
                found: true,
                is_root: true,
            });
        }

        let total = tokens.len();
        let mut cursor = self.root;
        let mut result = Lookup {
            dentry: self.root,
            found: false,
            is_root: false,
        };
        for (i, &token) in tokens.iter().enumerate() {
            self.materialize(cursor)?;
            let dentry = self.arena.get(cursor);
            if !dentry.is_dir() {
                result.dentry = cursor;
                break;
            }
            let inode = dentry.inode.as_ref().ok_or(Error::Inval)?;
            let hit = inode
                .children
                .iter()
                .copied()
                .find(|&c| self.arena.get(c).name == token);
            match hit {
                None => {
                    result.dentry = cursor;
                    break;
                }
                Some(child) if i + 1 == total => {
                    result.dentry = child;
                    result.found = true;
                    break;
                }
                Some(child) => cursor = child,
            }
        }

        self.materialize(result.dentry)?;
        Ok(result)
    }

    /// Copies `data` into the file's buffers at byte `offset`, claiming
    /// data blocks for newly covered block indices.
    ///
    /// Returns the number of bytes written. Fails with
    /// [`Error::NoSpace`] when the range reaches past the sixth block.
    pub fn write_file(&mut self, id: DentryId, offset: usize, data: &[u8]) -> Result<usize> {
        self.materialize(id)?;
        match self.arena.get(id).ftype {
            FileType::Directory => return Err(Error::IsDir),
            FileType::Symlink => return Err(Error::Unsupported),
            FileType::Regular => {}
        }
        if data.is_empty() {
            return Ok(0);
        }

        let block_size = self.disk.block_size();
        let end = offset + data.len();
        if end > DATA_PER_FILE * block_size {
            return Err(Error::NoSpace);
        }

        // Blocks back the file as a prefix: covering byte `end - 1` means
        // covering every block index up to its block.
        let last = (end - 1) / block_size;
        let allocated = {
            let inode = self.arena.get(id).inode.as_ref().ok_or(Error::Inval)?;
            inode.allocated as usize
        };
        if last + 1 > allocated {
            let mut fresh = Vec::new();
            for _ in allocated..=last {
                fresh.push(self.data_map.allocate().ok_or(Error::NoSpace)?);
            }
            let inode = self.inode_mut(id)?;
            for (k, dno) in fresh.into_iter().enumerate() {
                inode.blocks[allocated + k] = dno;
            }
            inode.allocated = (last + 1) as u32;
        }

        let inode = self.inode_mut(id)?;
        let mut done = 0;
        let mut pos = offset;
        while done < data.len() {
            let blk = pos / block_size;
            let off = pos % block_size;
            let n = (data.len() - done).min(block_size - off);
            inode.data[blk][off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
            pos += n;
        }
        if end as u32 > inode.size {
            inode.size = end as u32;
        }
        Ok(data.len())
    }

    /// Copies file bytes at `offset` into `buf`, clamped to the file size.
    ///
    /// Returns the number of bytes read.
    pub fn read_file(&mut self, id: DentryId, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.materialize(id)?;
        let dentry = self.arena.get(id);
        match dentry.ftype {
            FileType::Directory => return Err(Error::IsDir),
            FileType::Symlink => return Err(Error::Unsupported),
            FileType::Regular => {}
        }
        let inode = dentry.inode.as_ref().ok_or(Error::Inval)?;
        let block_size = self.disk.block_size();
        let size = (inode.size as usize).min(DATA_PER_FILE * block_size);
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }

        let n = buf.len().min(size - offset);
        let mut done = 0;
        let mut pos = offset;
        while done < n {
            let blk = pos / block_size;
            let off = pos % block_size;
            let take = (n - done).min(block_size - off);
            buf[done..done + take].copy_from_slice(&inode.data[blk][off..off + take]);
            done += take;
            pos += take;
        }
        Ok(n)
    }

    /// Loads the inode behind `id` when it is not there yet.
    fn materialize(&mut self, id: DentryId) -> Result<()> {
        if self.arena.get(id).inode.is_some() {
            return Ok(());
        }
        let ino = self.arena.get(id).ino.ok_or(Error::Inval)?;
        self.read_inode(id, ino)
    }

    fn inode_mut(&mut self, id: DentryId) -> Result<&mut Inode> {
        self.arena.get_mut(id).inode.as_mut().ok_or(Error::Inval)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::NamedTempFile;

    const DEVICE_SIZE: u64 = 4 * 1024 * 1024;

    fn new_device() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(DEVICE_SIZE).unwrap();
        file
    }

    fn mount(device: &NamedTempFile) -> NewFs {
        NewFs::mount(&MountOptions {
            device: device.path().to_path_buf(),
        })
        .unwrap()
    }

    fn create(fs: &mut NewFs, parent: DentryId, name: &str, ftype: FileType) -> DentryId {
        let dentry = fs.new_dentry(name, ftype);
        fs.alloc_inode(dentry).unwrap();
        fs.alloc_dentry(parent, dentry).unwrap();
        dentry
    }

    #[test]
    fn format_mount_umount_remount() {
        let device = new_device();

        let mut fs = mount(&device);
        assert!(fs.is_mounted());
        assert_eq!(fs.block_size(), 1024);
        let hit = fs.lookup("/").unwrap();
        assert!(hit.found);
        assert!(hit.is_root);
        assert_eq!(hit.dentry, fs.root());
        assert_eq!(fs.dentry(fs.root()).inode.as_ref().unwrap().dir_cnt, 0);
        // Only the root inode is allocated, no data blocks yet.
        assert_eq!(fs.inode_map().count_ones(), 1);
        assert_eq!(fs.data_map().count_ones(), 0);
        fs.umount().unwrap();
        assert!(!fs.is_mounted());
        fs.umount().unwrap();

        let mut fs = mount(&device);
        let hit = fs.lookup("/").unwrap();
        assert!(hit.found);
        assert!(hit.is_root);
        assert_eq!(fs.dentry(fs.root()).inode.as_ref().unwrap().dir_cnt, 0);
        assert_eq!(fs.inode_map().count_ones(), 1);
    }

    #[test]
    fn super_block_bytes_after_umount() {
        let device = new_device();
        let mut fs = mount(&device);
        fs.umount().unwrap();

        let bytes = std::fs::read(device.path()).unwrap();
        let word = |i: usize| u32::from_ne_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(0), MAGIC);
        assert_eq!(word(1), 0); // usage
        assert_eq!(word(2), 585); // inode slots
        assert_eq!(word(3), 3508); // data blocks
        assert_eq!(word(4), 1); // inode bitmap blocks
        assert_eq!(word(5), 1024); // inode bitmap offset
        assert_eq!(word(6), 1); // data bitmap blocks
        assert_eq!(word(7), 2048); // data bitmap offset
        assert_eq!(word(8), 3072); // inode table offset
        assert_eq!(word(9), 3072 + 585 * 1024); // data region offset
    }

    #[test]
    fn inode_record_sits_at_its_numbered_slot() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let dir = create(&mut fs, root, "a", FileType::Directory);
        let ino = fs.dentry(dir).ino.unwrap();
        assert_eq!(ino, 1);
        assert!(fs.inode_map().is_set(ino));
        fs.umount().unwrap();

        let bytes = std::fs::read(device.path()).unwrap();
        let off = 3072 + ino as usize * 1024;
        let word = |at: usize| u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(word(off), ino);
        assert_eq!(word(off + 12), FileType::Directory as u32);
    }

    #[test]
    fn mkdir_create_lookup_roundtrip() {
        let device = new_device();

        let mut fs = mount(&device);
        let root = fs.root();
        let a = create(&mut fs, root, "a", FileType::Directory);
        let b = create(&mut fs, a, "b", FileType::Directory);
        create(&mut fs, b, "c", FileType::Regular);

        let hit = fs.lookup("/a/b/c").unwrap();
        assert!(hit.found);
        assert!(!hit.is_root);
        assert_eq!(fs.dentry(hit.dentry).ftype, FileType::Regular);
        assert_eq!(fs.dentry(hit.dentry).inode.as_ref().unwrap().size, 0);
        fs.umount().unwrap();

        let mut fs = mount(&device);
        let hit = fs.lookup("/a/b/c").unwrap();
        assert!(hit.found);
        assert_eq!(fs.dentry(hit.dentry).ftype, FileType::Regular);
        assert_eq!(fs.dentry(hit.dentry).inode.as_ref().unwrap().size, 0);
    }

    #[test]
    fn file_data_survives_remount() {
        let device = new_device();

        let mut fs = mount(&device);
        let root = fs.root();
        let a = create(&mut fs, root, "a", FileType::Directory);
        let b = create(&mut fs, a, "b", FileType::Directory);
        let c = create(&mut fs, b, "c", FileType::Regular);

        // One data block per directory that received its first entry.
        assert_eq!(fs.data_map().count_ones(), 3);
        assert_eq!(fs.write_file(c, 0, b"hello").unwrap(), 5);
        assert_eq!(fs.data_map().count_ones(), 4);
        assert_eq!(fs.dentry(c).inode.as_ref().unwrap().allocated, 1);
        fs.umount().unwrap();

        let mut fs = mount(&device);
        let hit = fs.lookup("/a/b/c").unwrap();
        assert!(hit.found);
        let inode = fs.dentry(hit.dentry).inode.as_ref().unwrap();
        assert_eq!(inode.size, 5);
        assert_eq!(inode.allocated, 1);
        assert_eq!(&inode.data[0][..5], b"hello");
        assert!(inode.data[0][5..].iter().all(|&b| b == 0));
        assert_eq!(fs.data_map().count_ones(), 4);

        let mut buf = [0u8; 16];
        assert_eq!(fs.read_file(hit.dentry, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn sparse_write_allocates_a_prefix_of_blocks() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let f = create(&mut fs, root, "f", FileType::Regular);

        fs.write_file(f, 2000, b"tail").unwrap();
        let inode = fs.dentry(f).inode.as_ref().unwrap();
        assert_eq!(inode.allocated, 2);
        assert_eq!(inode.size, 2004);

        let mut buf = [1u8; 8];
        assert_eq!(fs.read_file(f, 0, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0u8; 8]);
        let mut buf = [0u8; 4];
        fs.read_file(f, 2000, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn write_past_the_sixth_block_is_refused() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let f = create(&mut fs, root, "f", FileType::Regular);

        let block = fs.block_size();
        assert!(fs.write_file(f, 0, &vec![7u8; 6 * block]).is_ok());
        assert!(matches!(
            fs.write_file(f, 6 * block, b"x"),
            Err(Error::NoSpace)
        ));
        assert_eq!(fs.dentry(f).inode.as_ref().unwrap().allocated, 6);
    }

    #[test]
    fn directory_grows_a_block_every_seventh_entry() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();

        for i in 0..7 {
            create(&mut fs, root, &format!("f{i}"), FileType::Regular);
        }
        assert_eq!(fs.dentry(root).inode.as_ref().unwrap().allocated, 1);
        assert_eq!(fs.data_map().count_ones(), 1);

        create(&mut fs, root, "f7", FileType::Regular);
        assert_eq!(fs.dentry(root).inode.as_ref().unwrap().allocated, 2);
        assert_eq!(fs.data_map().count_ones(), 2);

        create(&mut fs, root, "f8", FileType::Regular);
        assert_eq!(fs.dentry(root).inode.as_ref().unwrap().allocated, 2);
        assert_eq!(fs.data_map().count_ones(), 2);
        fs.umount().unwrap();

        let mut fs = mount(&device);
        let root = fs.root();
        assert_eq!(fs.dentry(root).inode.as_ref().unwrap().dir_cnt, 9);
        for i in 0..9 {
            assert!(fs.lookup(&format!("/f{i}")).unwrap().found);
        }
    }

    #[test]
    fn directory_capacity_is_six_blocks_of_entries() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let dir = create(&mut fs, root, "d", FileType::Directory);

        for i in 0..42 {
            create(&mut fs, dir, &format!("e{i}"), FileType::Regular);
        }
        assert_eq!(fs.dentry(dir).inode.as_ref().unwrap().allocated, 6);

        let extra = fs.new_dentry("e42", FileType::Regular);
        fs.alloc_inode(extra).unwrap();
        assert!(matches!(fs.alloc_dentry(dir, extra), Err(Error::NoSpace)));
        assert_eq!(fs.dentry(dir).inode.as_ref().unwrap().dir_cnt, 42);
    }

    #[test]
    fn lookup_miss_returns_the_last_directory() {
        let device = new_device();
        let mut fs = mount(&device);

        let hit = fs.lookup("/nope").unwrap();
        assert!(!hit.found);
        assert!(!hit.is_root);
        assert_eq!(hit.dentry, fs.root());

        let root = fs.root();
        let a = create(&mut fs, root, "a", FileType::Directory);
        let hit = fs.lookup("/a/missing").unwrap();
        assert!(!hit.found);
        assert_eq!(hit.dentry, a);
    }

    #[test]
    fn lookup_through_a_regular_file_stops_at_the_file() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let f = create(&mut fs, root, "f", FileType::Regular);

        let hit = fs.lookup("/f/inner").unwrap();
        assert!(!hit.found);
        assert_eq!(hit.dentry, f);
    }

    #[test]
    fn lookup_ignores_repeated_and_trailing_slashes() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let a = create(&mut fs, root, "a", FileType::Directory);

        let hit = fs.lookup("//a//").unwrap();
        assert!(hit.found);
        assert_eq!(hit.dentry, a);
    }

    #[test]
    fn names_match_exactly_not_by_prefix() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        create(&mut fs, root, "abc", FileType::Regular);

        assert!(!fs.lookup("/ab").unwrap().found);
        assert!(!fs.lookup("/abcd").unwrap().found);
        assert!(fs.lookup("/abc").unwrap().found);
    }

    #[test]
    fn inode_allocation_stops_at_the_ceiling() {
        let device = new_device();
        let mut fs = mount(&device);

        // The root holds inode 0; claim the remaining 584 slots.
        for i in 0..584 {
            let dentry = fs.new_dentry(&format!("n{i}"), FileType::Regular);
            fs.alloc_inode(dentry).unwrap();
        }
        assert_eq!(fs.inode_map().count_ones(), 585);

        let overflow = fs.new_dentry("overflow", FileType::Regular);
        assert!(matches!(fs.alloc_inode(overflow), Err(Error::NoSpace)));
        assert_eq!(fs.inode_map().count_ones(), 585);
    }

    #[test]
    fn dropping_the_root_is_refused() {
        let device = new_device();
        let mut fs = mount(&device);
        assert!(matches!(fs.drop_inode(fs.root()), Err(Error::Inval)));
        assert!(fs.inode_map().is_set(ROOT_INO));
    }

    #[test]
    fn unlink_frees_the_inode_but_not_the_data_blocks() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let f = create(&mut fs, root, "f", FileType::Regular);
        fs.write_file(f, 0, b"data").unwrap();
        assert_eq!(fs.inode_map().count_ones(), 2);
        let data_bits = fs.data_map().count_ones();

        fs.drop_inode(f).unwrap();
        fs.drop_dentry(root, f).unwrap();
        assert_eq!(fs.inode_map().count_ones(), 1);
        assert_eq!(fs.data_map().count_ones(), data_bits);
        assert!(!fs.lookup("/f").unwrap().found);
        assert_eq!(fs.dentry(root).inode.as_ref().unwrap().dir_cnt, 0);
        fs.umount().unwrap();

        let mut fs = mount(&device);
        assert!(!fs.lookup("/f").unwrap().found);
        assert_eq!(fs.dentry(fs.root()).inode.as_ref().unwrap().dir_cnt, 0);
    }

    #[test]
    fn dropping_a_directory_reclaims_the_whole_subtree() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let d = create(&mut fs, root, "d", FileType::Directory);
        let x = create(&mut fs, d, "x", FileType::Regular);
        fs.write_file(x, 0, b"payload").unwrap();
        assert_eq!(fs.inode_map().count_ones(), 3);
        let data_bits = fs.data_map().count_ones();

        fs.drop_inode(d).unwrap();
        fs.drop_dentry(root, d).unwrap();
        assert_eq!(fs.inode_map().count_ones(), 1);
        // Data blocks are never returned to the bitmap.
        assert_eq!(fs.data_map().count_ones(), data_bits);
        fs.umount().unwrap();

        let fs = mount(&device);
        assert_eq!(fs.dentry(fs.root()).inode.as_ref().unwrap().dir_cnt, 0);
        assert_eq!(fs.inode_map().count_ones(), 1);
    }

    #[test]
    fn drop_dentry_requires_the_actual_parent() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let a = create(&mut fs, root, "a", FileType::Directory);
        let root = fs.root();
        let b = create(&mut fs, root, "b", FileType::Regular);

        // `b` is the root's child, not `a`'s.
        assert!(matches!(fs.drop_dentry(a, b), Err(Error::NotFound)));
    }

    #[test]
    fn entry_count_matches_children_after_reload() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        for name in ["a", "b", "c"] {
            create(&mut fs, root, name, FileType::Regular);
        }
        fs.umount().unwrap();

        let fs = mount(&device);
        let root = fs.root();
        let inode = fs.dentry(root).inode.as_ref().unwrap();
        assert_eq!(inode.dir_cnt, 3);
        assert_eq!(inode.children.len(), 3);
        assert!(fs.get_dentry(root, 2).is_some());
        assert!(fs.get_dentry(root, 3).is_none());
    }

    #[test]
    fn child_order_reverses_across_a_sync_cycle() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        for name in ["a", "b", "c"] {
            create(&mut fs, root, name, FileType::Regular);
        }
        // Entries are prepended: the newest comes first.
        let first = fs.get_dentry(root, 0).unwrap();
        assert_eq!(fs.dentry(first).name, "c");
        fs.umount().unwrap();

        let fs = mount(&device);
        let root = fs.root();
        let first = fs.get_dentry(root, 0).unwrap();
        assert_eq!(fs.dentry(first).name, "a");
    }

    #[test]
    fn children_stay_lazy_until_resolved() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let a = create(&mut fs, root, "a", FileType::Directory);
        create(&mut fs, a, "b", FileType::Regular);
        fs.umount().unwrap();

        let mut fs = mount(&device);
        let a = fs.get_dentry(fs.root(), 0).unwrap();
        assert!(fs.dentry(a).inode.is_none());

        let hit = fs.lookup("/a/b").unwrap();
        assert!(hit.found);
        assert!(fs.dentry(a).inode.is_some());
        assert!(fs.dentry(hit.dentry).inode.is_some());
    }

    #[test]
    fn file_operations_reject_directories() {
        let device = new_device();
        let mut fs = mount(&device);
        let root = fs.root();
        let d = create(&mut fs, root, "d", FileType::Directory);

        assert!(matches!(fs.write_file(d, 0, b"x"), Err(Error::IsDir)));
        let mut buf = [0u8; 4];
        assert!(matches!(fs.read_file(d, 0, &mut buf), Err(Error::IsDir)));
    }
}
