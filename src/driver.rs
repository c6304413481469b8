//! Block device access.
//!
//! A device is reached through a four-call contract: seek to an aligned
//! byte offset, then transfer one I/O unit at a time, plus queries for the
//! device size and the unit size. [`Disk`] sits on top and turns arbitrary
//! byte ranges into aligned transfers.

use crate::error::Error;
use crate::error::Result;
use crate::util::round_down;
use crate::util::round_up;
use std::ffi::c_long;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);
/// ioctl command: Get logical sector size in bytes.
const BLKSSZGET: c_long = ioc!(0, 0x12, 104, 0);

/// I/O unit size assumed when a regular file stands in for a device.
pub const DEFAULT_IO_SIZE: usize = 512;

/// The block device contract consumed by the filesystem.
///
/// Transfers move exactly one I/O unit; the cursor advances by one unit on
/// each transfer. Offsets passed to [`Driver::seek`] must be multiples of
/// the unit size. The device is released when the driver is dropped.
pub trait Driver {
    /// Total device size in bytes.
    fn size(&self) -> u64;

    /// Size of one transfer unit in bytes.
    fn io_size(&self) -> usize;

    /// Moves the cursor to the absolute byte offset `offset`.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Reads exactly one I/O unit into `buf`.
    fn read_unit(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Writes exactly one I/O unit from `buf`.
    fn write_unit(&mut self, buf: &[u8]) -> Result<()>;
}

/// A driver backed by a device node or a regular file.
pub struct FileDriver {
    file: File,
    size: u64,
    io_size: usize,
}

impl FileDriver {
    /// Opens the device at `path`.
    ///
    /// Block and character devices are queried through ioctls for their
    /// size and sector size; a regular file stands in with its length and
    /// a [`DEFAULT_IO_SIZE`] unit.
    pub fn open(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let file_type = metadata.file_type();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        if file_type.is_block_device() || file_type.is_char_device() {
            let mut size: u64 = 0;
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
            if ret < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let mut sector: libc::c_int = 0;
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut sector) };
            if ret < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self {
                file,
                size,
                io_size: sector as usize,
            })
        } else if file_type.is_file() {
            Ok(Self {
                file,
                size: metadata.len(),
                io_size: DEFAULT_IO_SIZE,
            })
        } else {
            Err(Error::Unsupported)
        }
    }
}

impl Driver for FileDriver {
    fn size(&self) -> u64 {
        self.size
    }

    fn io_size(&self) -> usize {
        self.io_size
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset % self.io_size as u64 != 0 {
            return Err(Error::Seek);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read_unit(&mut self, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.io_size);
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_unit(&mut self, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.io_size);
        self.file.write_all(buf)?;
        Ok(())
    }
}

/// Byte-range access over a unit-granular driver.
///
/// One logical block covers two driver I/O units. Reads fetch the covering
/// block-aligned range and slice the window out of it; writes first read
/// the covering range, splice the payload in at its bias, and write the
/// range back, so sub-block writes preserve neighboring bytes.
pub struct Disk {
    driver: Box<dyn Driver>,
    block_size: usize,
}

impl Disk {
    pub fn new(driver: Box<dyn Driver>) -> Self {
        let block_size = 2 * driver.io_size();
        Self { driver, block_size }
    }

    /// Logical block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total device size in bytes.
    pub fn size(&self) -> u64 {
        self.driver.size()
    }

    /// Reads `out.len()` bytes starting at byte `offset`.
    pub fn read(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        let aligned = round_down(offset, self.block_size as u64);
        let bias = (offset - aligned) as usize;
        let len = round_up((bias + out.len()) as u64, self.block_size as u64) as usize;

        let mut buf = vec![0u8; len];
        self.driver.seek(aligned)?;
        let io_size = self.driver.io_size();
        for unit in buf.chunks_mut(io_size) {
            self.driver.read_unit(unit)?;
        }
        out.copy_from_slice(&buf[bias..bias + out.len()]);
        Ok(())
    }

    /// Writes `data` at byte `offset`, preserving the rest of the covering
    /// aligned range.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let aligned = round_down(offset, self.block_size as u64);
        let bias = (offset - aligned) as usize;
        let len = round_up((bias + data.len()) as u64, self.block_size as u64) as usize;

        let mut buf = vec![0u8; len];
        self.read(aligned, &mut buf)?;
        buf[bias..bias + data.len()].copy_from_slice(data);

        self.driver.seek(aligned)?;
        let io_size = self.driver.io_size();
        for unit in buf.chunks(io_size) {
            self.driver.write_unit(unit)?;
        }
        Ok(())
    }
}
