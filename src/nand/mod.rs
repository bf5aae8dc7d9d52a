//! Abstractions and code to access raw SPI-NAND flash.
//!
//! Everything above this module addresses the chip through [`RawNand`]; the
//! physical transport (SPI/QSPI controller, ioctl layer, simulator) lives
//! behind it. Implementations report failures as [`FtlError::Io`], with
//! uncorrectable reads distinguished as [`FtlError::Ecc`].

use std::io::{Read, Write};
use std::str::FromStr;

use crate::error::{FtlError, Result, Violation};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s holding page or spare contents.
pub trait PageUtil {
    /// Does this buffer contain the all-1s (erased) bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device.
///
/// Page and block sizes must be powers of two; the translation layers rely on
/// shift/mask arithmetic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandGeometry {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    /// Out-of-band (spare) bytes available per page for metadata.
    pub spare_per_page: usize,
}

impl NandGeometry {
    /// Bytes in one erase block.
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }

    /// Total pages on the device.
    pub fn page_count(&self) -> u32 {
        self.blocks * self.pages_per_block
    }

    /// Total main-area bytes on the device.
    pub fn total_bytes(&self) -> u64 {
        self.block_size() as u64 * self.blocks as u64
    }

    /// log2 of the page size.
    pub fn page_shift(&self) -> u32 {
        self.bytes_per_page.trailing_zeros()
    }

    /// log2 of the block size.
    pub fn block_shift(&self) -> u32 {
        self.page_shift() + self.pages_per_block.trailing_zeros()
    }

    /// Mask extracting the intra-block byte offset.
    pub fn block_mask(&self) -> u64 {
        (self.block_size() - 1) as u64
    }

    /// Page address of page `page` within block `block`.
    pub fn page_addr(&self, block: u32, page: u32) -> u32 {
        block * self.pages_per_block + page
    }

    /// Split a page address into (block, page-within-block).
    pub fn split(&self, page: u32) -> (u32, u32) {
        (page / self.pages_per_block, page % self.pages_per_block)
    }

    /// Reject geometries the shift-based translation layers cannot handle.
    pub fn check(&self) -> Result<()> {
        if self.blocks == 0
            || !self.bytes_per_page.is_power_of_two()
            || !self.pages_per_block.is_power_of_two()
        {
            return Err(FtlError::Unsupported(
                "page size and pages-per-block must be nonzero powers of two",
            ));
        }
        Ok(())
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES" or "BLOCKSxPAGESxBYTESxSPARE"
impl FromStr for NandGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = s.split('x').collect();
        let [blocks, pages_per_block, bytes_per_page, spare] = match fields[..] {
            [b, p, s] => [b, p, s, "64"],
            [b, p, s, o] => [b, p, s, o],
            _ => anyhow::bail!("expected #x#x#[x#]"),
        };

        Ok(NandGeometry {
            blocks: blocks.parse()?,
            pages_per_block: pages_per_block.parse()?,
            bytes_per_page: bytes_per_page.parse()?,
            spare_per_page: spare.parse()?,
        })
    }
}

/// Represents a raw NAND flash device: the narrow interface the translation
/// layers consume.
///
/// `data` buffers are always exactly one page; `spare` buffers are exactly
/// `spare_per_page` bytes. An all-0xFF spare on program may be skipped by the
/// implementation (programming the erased pattern is a no-op).
pub trait RawNand {
    /// Get the layout of the NAND.
    fn geometry(&self) -> NandGeometry;

    /// Read the chip identification bytes.
    fn read_id(&mut self) -> Result<Vec<u8>>;

    /// Is this block marked bad (factory or runtime)?
    fn is_bad(&mut self, block: u32) -> Result<bool>;

    /// Mark this block bad at the hardware level.
    fn mark_bad(&mut self, block: u32) -> Result<()>;

    /// Erase a block, making all of its pages writable again.
    fn erase_block(&mut self, block: u32) -> Result<()>;

    /// Program one page (main data plus spare) in a single operation.
    fn program_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()>;

    /// Read one page's main data and spare area.
    ///
    /// Returns [`FtlError::Ecc`] if the data could not be corrected.
    fn read_page(&mut self, page: u32, data: &mut [u8], spare: &mut [u8]) -> Result<()>;
}

impl<N: RawNand + ?Sized> RawNand for &mut N {
    fn geometry(&self) -> NandGeometry {
        (**self).geometry()
    }
    fn read_id(&mut self) -> Result<Vec<u8>> {
        (**self).read_id()
    }
    fn is_bad(&mut self, block: u32) -> Result<bool> {
        (**self).is_bad(block)
    }
    fn mark_bad(&mut self, block: u32) -> Result<()> {
        (**self).mark_bad(block)
    }
    fn erase_block(&mut self, block: u32) -> Result<()> {
        (**self).erase_block(block)
    }
    fn program_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()> {
        (**self).program_page(page, data, spare)
    }
    fn read_page(&mut self, page: u32, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        (**self).read_page(page, data, spare)
    }
}

/// Operation counters kept by [`SimNand`], for tests and bring-up statistics.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SimStats {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
    pub bad_checks: u64,
}

/// A simulated in-memory NAND flash, for testing purposes.
///
/// Beyond the plain storage model it detects page reprogramming without an
/// intervening erase, and offers fault-injection hooks so error paths can be
/// exercised deterministically.
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    geom: NandGeometry,
    stats: SimStats,
}

#[derive(Debug, Clone, Default)]
struct SimBlock {
    /// One entry per page; `None` means erased.
    pages: Vec<Option<SimPage>>,
    marked_bad: bool,
    /// Injected fault: every program into this block fails.
    fail_program: bool,
    /// Injected fault: the next erase of this block fails (one-shot).
    fail_erase: bool,
}

#[derive(Debug, Clone)]
struct SimPage {
    data: Box<[u8]>,
    spare: Box<[u8]>,
    /// Injected fault: reads of this page report uncorrectable ECC.
    ecc_broken: bool,
}

impl SimNand {
    /// Create an erased SimNand with the specified geometry.
    pub fn new(geom: NandGeometry) -> Self {
        let blocks = vec![
            SimBlock {
                pages: vec![None; geom.pages_per_block as usize],
                ..Default::default()
            };
            geom.blocks as usize
        ];

        Self {
            blocks: blocks.into_boxed_slice(),
            geom,
            stats: SimStats::default(),
        }
    }

    /// Operation counters accumulated so far.
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Mark a block factory-bad before handing the device to the stack.
    pub fn set_factory_bad(&mut self, block: u32) {
        self.blocks[block as usize].marked_bad = true;
    }

    /// Fault injection: make every program into `block` fail.
    pub fn break_programs(&mut self, block: u32) {
        self.blocks[block as usize].fail_program = true;
    }

    /// Fault injection: make the next erase of `block` fail.
    pub fn break_next_erase(&mut self, block: u32) {
        self.blocks[block as usize].fail_erase = true;
    }

    /// Fault injection: reads of `page` report uncorrectable ECC from now on.
    /// The page must have been programmed.
    pub fn break_page_ecc(&mut self, page: u32) {
        let (block, pg) = self.geom.split(page);
        if let Some(Some(p)) = self.blocks[block as usize].pages.get_mut(pg as usize) {
            p.ecc_broken = true;
        }
    }

    /// Initialize the NAND contents (data and spare, page-interleaved) from a
    /// type implementing `Read`. Clears bad-block marks and faults.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut data = vec![0u8; self.geom.bytes_per_page];
        let mut spare = vec![0u8; self.geom.spare_per_page];

        for block in self.blocks.iter_mut() {
            *block = SimBlock {
                pages: Vec::with_capacity(self.geom.pages_per_block as usize),
                ..Default::default()
            };
            for _ in 0..self.geom.pages_per_block {
                read.read_exact(&mut data)?;
                read.read_exact(&mut spare)?;
                let page = if data.is_erased() && spare.is_erased() {
                    None
                } else {
                    Some(SimPage {
                        data: data.clone().into_boxed_slice(),
                        spare: spare.clone().into_boxed_slice(),
                        ecc_broken: false,
                    })
                };
                block.pages.push(page);
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream
    /// (such as a File), in the same page-interleaved layout `load` reads.
    /// Pages of bad blocks are written as 0xBD filler.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let erased_data = vec![0xFFu8; self.geom.bytes_per_page];
        let erased_spare = vec![0xFFu8; self.geom.spare_per_page];
        let bad_data = vec![0xBDu8; self.geom.bytes_per_page];
        let bad_spare = vec![0xBDu8; self.geom.spare_per_page];

        for block in self.blocks.iter() {
            for page in block.pages.iter() {
                let (data, spare): (&[u8], &[u8]) = if block.marked_bad {
                    (&bad_data, &bad_spare)
                } else {
                    match page {
                        Some(p) => (&p.data, &p.spare),
                        None => (&erased_data, &erased_spare),
                    }
                };
                write.write_all(data)?;
                write.write_all(spare)?;
            }
        }

        Ok(())
    }

    fn block_mut(&mut self, block: u32) -> Result<&mut SimBlock> {
        self.blocks
            .get_mut(block as usize)
            .ok_or(FtlError::Protocol(Violation::BlockOutOfRange(block)))
    }

    fn page_byte_addr(&self, page: u32) -> u64 {
        page as u64 * self.geom.bytes_per_page as u64
    }
}

impl RawNand for SimNand {
    fn geometry(&self) -> NandGeometry {
        self.geom
    }

    fn read_id(&mut self) -> Result<Vec<u8>> {
        Ok(vec![0xEF, 0xAA, 0x21])
    }

    fn is_bad(&mut self, block: u32) -> Result<bool> {
        self.stats.bad_checks += 1;
        Ok(self.block_mut(block)?.marked_bad)
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        self.block_mut(block)?.marked_bad = true;
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        self.stats.erases += 1;
        let pages = self.geom.pages_per_block as usize;
        let addr = self.page_byte_addr(block.saturating_mul(self.geom.pages_per_block));
        let blk = self.block_mut(block)?;
        if std::mem::take(&mut blk.fail_erase) {
            return Err(FtlError::Io { addr });
        }
        blk.pages.clear();
        blk.pages.resize(pages, None);
        Ok(())
    }

    fn program_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()> {
        self.stats.programs += 1;
        let geom = self.geom;
        let (block, pg) = geom.split(page);
        let addr = self.page_byte_addr(page);
        if data.len() != geom.bytes_per_page || spare.len() != geom.spare_per_page {
            return Err(FtlError::Misaligned);
        }
        let blk = self.block_mut(block)?;
        if blk.fail_program {
            return Err(FtlError::Io { addr });
        }
        let slot = blk
            .pages
            .get_mut(pg as usize)
            .ok_or(FtlError::Protocol(Violation::PageOutOfRange(page)))?;
        // Real NAND cannot rewrite a page in place; catch attempts to do so.
        if slot.is_some() {
            return Err(FtlError::Io { addr });
        }
        if !data.is_erased() || !spare.is_erased() {
            *slot = Some(SimPage {
                data: data.into(),
                spare: spare.into(),
                ecc_broken: false,
            });
        }
        Ok(())
    }

    fn read_page(&mut self, page: u32, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        self.stats.reads += 1;
        let geom = self.geom;
        let (block, pg) = geom.split(page);
        if data.len() != geom.bytes_per_page || spare.len() != geom.spare_per_page {
            return Err(FtlError::Misaligned);
        }
        let blk = self
            .blocks
            .get(block as usize)
            .ok_or(FtlError::Protocol(Violation::BlockOutOfRange(block)))?;
        let slot = blk
            .pages
            .get(pg as usize)
            .ok_or(FtlError::Protocol(Violation::PageOutOfRange(page)))?;
        match slot {
            Some(p) if p.ecc_broken => Err(FtlError::Ecc { page }),
            Some(p) => {
                data.copy_from_slice(&p.data);
                spare.copy_from_slice(&p.spare);
                Ok(())
            }
            None => {
                data.fill(0xFF);
                spare.fill(0xFF);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) const TEST_GEOMETRY: NandGeometry = NandGeometry {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    spare_per_page: 32,
};
