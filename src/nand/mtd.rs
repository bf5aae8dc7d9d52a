//! [`RawNand`] implementation over the Linux MTD subsystem.
//!
//! Pages are addressed through the `/dev/mtdX` character device: main-area
//! reads use plain `pread`, out-of-band data uses the OOB ioctls, and page
//! programs go through `MEMWRITE` so data and spare land in a single program
//! cycle (two separate writes to the same page would violate NAND program
//! rules).

use super::{NandGeometry, PageUtil, RawNand};
use crate::error::{FtlError, Result, Violation};

use log::warn;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    geom: NandGeometry,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let geom = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, geom })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        anyhow::bail!("MTD device {name} could not be found");
    }

    fn check_page(&self, page: u32) -> Result<u64> {
        if page >= self.geom.page_count() {
            return Err(Violation::PageOutOfRange(page).into());
        }
        Ok(page as u64 * self.geom.bytes_per_page as u64)
    }

    fn check_block(&self, block: u32) -> Result<u64> {
        if block >= self.geom.blocks {
            return Err(Violation::BlockOutOfRange(block).into());
        }
        Ok(block as u64 * self.geom.block_size() as u64)
    }
}

/// Translate an I/O error at `addr`, distinguishing uncorrectable-ECC reads.
fn io_error(e: std::io::Error, addr: u64, page: u32) -> FtlError {
    if e.raw_os_error() == Some(nix::errno::Errno::EBADMSG as i32) {
        FtlError::Ecc { page }
    } else {
        warn!("mtd i/o failure at {addr:#x}: {e}");
        FtlError::Io { addr }
    }
}

fn errno_error(e: nix::errno::Errno, addr: u64, page: u32) -> FtlError {
    io_error(std::io::Error::from(e), addr, page)
}

impl RawNand for MtdNand {
    fn geometry(&self) -> NandGeometry {
        self.geom
    }

    fn read_id(&mut self) -> Result<Vec<u8>> {
        // The MTD layer hides the vendor ID bytes behind its own probe.
        Err(FtlError::Unsupported("mtd does not expose the raw chip id"))
    }

    fn is_bad(&mut self, block: u32) -> Result<bool> {
        let addr = self.check_block(block)?;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &addr) }
            .map_err(|e| errno_error(e, addr, block * self.geom.pages_per_block))?;
        Ok(bad != 0)
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        let addr = self.check_block(block)?;
        unsafe { ioctl::memsetbadblock(self.file.as_raw_fd(), &addr) }
            .map_err(|e| errno_error(e, addr, block * self.geom.pages_per_block))?;
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        let addr = self.check_block(block)?;
        let erase_info = ioctl::erase_info_user {
            start: addr as u32,
            length: self.geom.block_size() as u32,
        };
        unsafe { ioctl::memerase(self.file.as_raw_fd(), &erase_info) }
            .map_err(|e| errno_error(e, addr, block * self.geom.pages_per_block))?;
        Ok(())
    }

    fn program_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()> {
        let addr = self.check_page(page)?;
        if data.len() != self.geom.bytes_per_page || spare.len() != self.geom.spare_per_page {
            return Err(FtlError::Misaligned);
        }

        if spare.is_erased() {
            // No spare content; a plain page write keeps us compatible with
            // mtd drivers that reject MEMWRITE.
            self.file
                .write_all_at(data, addr)
                .map_err(|e| io_error(e, addr, page))?;
            return Ok(());
        }

        let req = ioctl::mtd_write_req {
            start: addr,
            len: data.len() as u64,
            ooblen: spare.len() as u64,
            usr_data: data.as_ptr() as u64,
            usr_oob: spare.as_ptr() as u64,
            mode: ioctl::MTD_OPS_PLACE_OOB,
            padding: [0; 7],
        };
        unsafe { ioctl::memwrite(self.file.as_raw_fd(), &req) }
            .map_err(|e| errno_error(e, addr, page))?;
        Ok(())
    }

    fn read_page(&mut self, page: u32, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        let addr = self.check_page(page)?;
        if data.len() != self.geom.bytes_per_page || spare.len() != self.geom.spare_per_page {
            return Err(FtlError::Misaligned);
        }

        self.file
            .read_exact_at(data, addr)
            .map_err(|e| io_error(e, addr, page))?;

        let mut oob = ioctl::mtd_oob_buf {
            start: addr as u32,
            length: spare.len() as u32,
            ptr: spare.as_mut_ptr(),
        };
        unsafe { ioctl::memreadoob(self.file.as_raw_fd(), &mut oob) }
            .map_err(|e| errno_error(e, addr, page))?;
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandGeometry;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// Raw OOB layout, as the spare bytes sit on the chip.
    pub const MTD_OPS_PLACE_OOB: u8 = 0;

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

    impl TryInto<NandGeometry> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<NandGeometry> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let geom = NandGeometry {
                blocks: self.size / self.erasesize,
                pages_per_block: self.erasesize / self.writesize,
                bytes_per_page: self.writesize as usize,
                spare_per_page: self.oobsize as usize,
            };
            geom.check()?;

            Ok(geom)
        }
    }

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
    ioctl_readwrite!(memreadoob, MTD_IOC_MAGIC, 4, mtd_oob_buf);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_write_ptr!(memwrite, MTD_IOC_MAGIC, 23, mtd_write_req);
}
