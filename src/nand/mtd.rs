//! NAND controller implementation over the Linux MTD subsystem.
//!
//! Operations are carried out synchronously on the submitter's thread and
//! completed before `queue` returns, which satisfies the protocol's
//! completion contract.

use super::{NandCommand, NandController, NandInfo, NandOperation, PageIo};
use crate::{BadBlockError, Result};

use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::{Path, PathBuf};

/// NAND controller that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    info: NandInfo,
}

impl MtdNand {
    /// Open an MTD NAND. `target` is either a device path ("/dev/mtd0") or a
    /// partition name to resolve through `/proc/mtd`.
    pub fn open(target: &str) -> Result<Self> {
        let path = if target.starts_with('/') {
            PathBuf::from(target)
        } else {
            resolve_named(target)?
        };

        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_error)?;

        let raw = unsafe {
            let mut raw = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), raw.as_mut_ptr()).map_err(errno_error)?;
            raw.assume_init()
        };
        let info = geometry(&raw)?;

        Ok(Self { file, info })
    }

    /// Byte offset of a page, validated against the device
    fn page_base(&self, page: u32) -> Result<u64> {
        if page >= self.info.num_blocks * self.info.pages_per_block {
            return Err(BadBlockError::InvalidArgs);
        }
        Ok(u64::from(page) * self.info.page_size as u64)
    }

    fn read_page(&self, io: &PageIo) -> Result<()> {
        let base = self.page_base(io.page)?;

        let mut data = io.data.lock().unwrap();
        let begin = io.data_offset * self.info.page_size;
        let out = data
            .get_mut(begin..begin + self.info.page_size)
            .ok_or(BadBlockError::InvalidArgs)?;
        self.file.read_exact_at(out, base).map_err(io_error)?;
        drop(data);

        let mut oob = io.oob.lock().unwrap();
        let out = oob
            .get_mut(io.oob_offset..)
            .ok_or(BadBlockError::InvalidArgs)?;
        let length = std::cmp::min(out.len(), self.info.oob_size);
        let mut request = ioctl::mtd_oob_buf {
            start: base as u32,
            length: length as u32,
            ptr: out.as_mut_ptr(),
        };
        unsafe {
            ioctl::memreadoob(self.file.as_raw_fd(), &mut request).map_err(errno_error)?;
        }

        Ok(())
    }

    fn write_page(&self, io: &PageIo) -> Result<()> {
        let base = self.page_base(io.page)?;

        let data = io.data.lock().unwrap();
        let begin = io.data_offset * self.info.page_size;
        let content = data
            .get(begin..begin + self.info.page_size)
            .ok_or(BadBlockError::InvalidArgs)?;
        self.file.write_all_at(content, base).map_err(io_error)?;
        drop(data);

        let oob = io.oob.lock().unwrap();
        let content = oob
            .get(io.oob_offset..)
            .ok_or(BadBlockError::InvalidArgs)?;
        let length = std::cmp::min(content.len(), self.info.oob_size);
        let mut request = ioctl::mtd_oob_buf {
            start: base as u32,
            length: length as u32,
            ptr: content.as_ptr() as *mut u8,
        };
        unsafe {
            ioctl::memwriteoob(self.file.as_raw_fd(), &mut request).map_err(errno_error)?;
        }

        Ok(())
    }

    fn erase(&self, first_block: u32, num_blocks: u32) -> Result<()> {
        let block_size = self.info.pages_per_block * self.info.page_size as u32;
        for block in first_block..first_block + num_blocks {
            if block >= self.info.num_blocks {
                return Err(BadBlockError::InvalidArgs);
            }
            let erase_info = ioctl::erase_info_user {
                start: block_size * block,
                length: block_size,
            };
            unsafe {
                ioctl::memerase(self.file.as_raw_fd(), &erase_info).map_err(errno_error)?;
            }
        }

        Ok(())
    }
}

/// Find the /dev node for a named partition. `/proc/mtd` lines look like
/// `mtd0: 00800000 00020000 "bootloader"`.
fn resolve_named(name: &str) -> Result<PathBuf> {
    let proc_mtd = std::fs::read_to_string("/proc/mtd").map_err(io_error)?;
    let quoted = format!("\"{name}\"");

    proc_mtd
        .lines()
        .find_map(|line| {
            let (dev, description) = line.split_once(':')?;
            description
                .contains(&quoted)
                .then(|| Path::new("/dev").join(dev))
        })
        .ok_or_else(|| {
            io_error(io::Error::new(
                io::ErrorKind::NotFound,
                format!("MTD device {name} could not be found"),
            ))
        })
}

/// Derive page/block geometry from the raw MTD description
fn geometry(raw: &ioctl::mtd_info_user) -> Result<NandInfo> {
    if raw.erasesize == 0
        || raw.writesize == 0
        || raw.size % raw.erasesize != 0
        || raw.erasesize % raw.writesize != 0
    {
        return Err(BadBlockError::NotSupported);
    }

    Ok(NandInfo {
        num_blocks: raw.size / raw.erasesize,
        pages_per_block: raw.erasesize / raw.writesize,
        page_size: raw.writesize as usize,
        oob_size: raw.oobsize as usize,
    })
}

fn io_error(source: std::io::Error) -> BadBlockError {
    BadBlockError::Io { source }
}

fn errno_error(errno: nix::errno::Errno) -> BadBlockError {
    BadBlockError::Io {
        source: errno.into(),
    }
}

impl NandController for MtdNand {
    fn query(&self) -> NandInfo {
        self.info
    }

    fn queue(&self, op: NandOperation) {
        let result = match &op.command {
            NandCommand::Erase {
                first_block,
                num_blocks,
            } => self.erase(*first_block, *num_blocks),
            NandCommand::ReadPage(io) => self.read_page(io),
            NandCommand::WritePage(io) => self.write_page(io),
        };

        let _ = op.completion.send(result);
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[repr(C)]
    pub struct mtd_oob_buf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(memwriteoob, MTD_IOC_MAGIC, 3, mtd_oob_buf);
    ioctl_readwrite!(memreadoob, MTD_IOC_MAGIC, 4, mtd_oob_buf);
}
