//! The wear-leveling half of the stack.
//!
//! [`PageStore`] wraps the raw adapter with the page-level discipline the
//! sector map relies on: a memoized bad-block cache, per-block program
//! cursors enforcing strictly forward page programming, and failure
//! classification (bad-block-class on program/erase trouble,
//! ECC-class on unreadable data). [`map::SectorMap`] builds the
//! log-structured logical-to-physical mapping on top of these primitives.

use log::{error, warn};

use crate::error::{FtlError, Result, Violation};
use crate::nand::{NandGeometry, PageUtil, RawNand};

pub mod map;
pub mod meta;

/// Cached bad-block state of one physical block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BlockMark {
    /// Not yet queried from the adapter.
    Unknown,
    Good,
    /// Retired; must never be erased or programmed again.
    Worn,
}

#[derive(Debug, Copy, Clone)]
struct BlockState {
    mark: BlockMark,
    /// Lowest page index not yet programmed since the last erase.
    next_page: u32,
}

/// Page-level access to the NAND with wear-path bookkeeping.
pub struct PageStore<N: RawNand> {
    nand: N,
    geom: NandGeometry,
    blocks: Box<[BlockState]>,
    /// Scratch for [`PageStore::copy`] and offset reads, one page + spare.
    scratch_data: Vec<u8>,
    scratch_spare: Vec<u8>,
}

impl<N: RawNand> PageStore<N> {
    /// Wrap an adapter, allocating the per-block state array and the one-page
    /// copy scratch buffer.
    pub fn new(nand: N) -> Result<Self> {
        let geom = nand.geometry();
        geom.check()?;
        if geom.spare_per_page < meta::META_BYTES {
            return Err(FtlError::Unsupported("spare area too small for metadata"));
        }

        Ok(Self {
            nand,
            geom,
            blocks: vec![
                BlockState {
                    mark: BlockMark::Unknown,
                    next_page: 0,
                };
                geom.blocks as usize
            ]
            .into_boxed_slice(),
            scratch_data: vec![0u8; geom.bytes_per_page],
            scratch_spare: vec![0u8; geom.spare_per_page],
        })
    }

    pub fn geometry(&self) -> NandGeometry {
        self.geom
    }

    /// Raw adapter access for the byte-addressed path and device queries.
    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    /// Lowest unprogrammed page index of `block` (as currently known).
    pub(crate) fn next_page(&self, block: u32) -> u32 {
        self.blocks[block as usize].next_page
    }

    /// Record the program cursor discovered by a resume scan.
    pub(crate) fn set_next_page(&mut self, block: u32, next_page: u32) {
        self.blocks[block as usize].next_page = next_page;
    }

    fn state(&self, block: u32) -> Result<BlockState> {
        self.blocks
            .get(block as usize)
            .copied()
            .ok_or(Violation::BlockOutOfRange(block).into())
    }

    /// Is this block bad? The adapter is queried at most once per block; the
    /// answer is cached until the block is explicitly re-marked.
    pub fn is_bad(&mut self, block: u32) -> bool {
        let state = match self.state(block) {
            Ok(s) => s,
            Err(e) => {
                error!("bad-block query out of range: {e}");
                return true;
            }
        };
        let mark = match state.mark {
            BlockMark::Unknown => match self.nand.is_bad(block) {
                Ok(false) => BlockMark::Good,
                Ok(true) => BlockMark::Worn,
                Err(e) => {
                    // Unreadable marker: assume the worst.
                    warn!("bad-block query for blk[{block}] failed: {e}");
                    BlockMark::Worn
                }
            },
            known => known,
        };
        self.blocks[block as usize].mark = mark;
        mark == BlockMark::Worn
    }

    /// Retire a block. The in-memory state goes to worn unconditionally; a
    /// failure to persist the marker is logged but does not resurrect the
    /// block, since over-reporting bad blocks beats reusing a failing one.
    pub fn mark_bad(&mut self, block: u32) {
        match self.blocks.get_mut(block as usize) {
            Some(state) => state.mark = BlockMark::Worn,
            None => {
                error!("mark-bad out of range: blk[{block}]");
                return;
            }
        }
        if let Err(e) = self.nand.mark_bad(block) {
            warn!("hardware bad-block mark for blk[{block}] failed: {e}");
        }
    }

    /// Erase a block and reset its program cursor.
    ///
    /// Erasing an out-of-range or retired block is a protocol violation; an
    /// adapter failure retires the block class-wise ([`FtlError::BadBlock`])
    /// without touching the worn cache.
    pub fn erase(&mut self, block: u32) -> Result<()> {
        if self.state(block)?.mark == BlockMark::Worn {
            return Err(Violation::WornBlock(block).into());
        }
        match self.nand.erase_block(block) {
            Ok(()) => {
                self.blocks[block as usize].next_page = 0;
                Ok(())
            }
            Err(e) => {
                error!("erase of blk[{block}] failed: {e}");
                Err(FtlError::BadBlock { block })
            }
        }
    }

    /// Program one page.
    ///
    /// The target block must be in range and not worn, and `page` must not
    /// precede the block's program cursor: NAND cannot reprogram a page
    /// without an erase, so going backwards is a logic bug, not a transient
    /// fault. On success the cursor advances past `page`. An adapter failure
    /// is signalled as [`FtlError::BadBlock`] so the map layer can retire the
    /// block rather than treat it as a generic I/O error.
    pub fn program(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()> {
        let (block, pg) = self.geom.split(page);
        let state = self.state(block)?;
        if state.mark == BlockMark::Worn {
            return Err(Violation::WornBlock(block).into());
        }
        if pg < state.next_page {
            return Err(Violation::ProgramOrder {
                block,
                page: pg,
                next: state.next_page,
            }
            .into());
        }
        if data.len() != self.geom.bytes_per_page || spare.len() != self.geom.spare_per_page {
            return Err(FtlError::Misaligned);
        }

        // Whether the program sticks or not, the page is no longer erased.
        self.blocks[block as usize].next_page = pg + 1;

        match self.nand.program_page(page, data, spare) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("program of page {page} (blk[{block}]) failed: {e}");
                Err(FtlError::BadBlock { block })
            }
        }
    }

    /// Read `length` bytes at byte column `offset` within a page.
    ///
    /// Out-of-range pages and reads crossing the page boundary are protocol
    /// violations. Uncorrectable data comes back as [`FtlError::Ecc`]; the
    /// map layer treats that as potentially-recoverable garbage, not
    /// necessarily physical damage.
    pub fn read(&mut self, page: u32, offset: usize, length: usize, out: &mut [u8]) -> Result<()> {
        let (block, _) = self.geom.split(page);
        self.state(block)?;
        if offset + length > self.geom.bytes_per_page || length > out.len() {
            return Err(Violation::ReadBounds { offset, length }.into());
        }

        if offset == 0 && length == self.geom.bytes_per_page {
            return self
                .nand
                .read_page(page, &mut out[..length], &mut self.scratch_spare);
        }

        self.nand
            .read_page(page, &mut self.scratch_data, &mut self.scratch_spare)?;
        out[..length].copy_from_slice(&self.scratch_data[offset..offset + length]);
        Ok(())
    }

    /// Read a page's spare area into `out`.
    pub fn read_spare(&mut self, page: u32, out: &mut [u8]) -> Result<()> {
        let (block, _) = self.geom.split(page);
        self.state(block)?;
        if out.len() != self.geom.spare_per_page {
            return Err(Violation::ReadBounds {
                offset: 0,
                length: out.len(),
            }
            .into());
        }
        self.nand.read_page(page, &mut self.scratch_data, out)
    }

    /// Is this page still erased?
    ///
    /// For a block whose cursor is untouched since startup the first page is
    /// probed on the hardware (erased spare pattern and no ECC complaint);
    /// everywhere else the cached cursor answers without I/O.
    pub fn is_free(&mut self, page: u32) -> bool {
        let (block, pg) = self.geom.split(page);
        let state = match self.state(block) {
            Ok(s) => s,
            Err(e) => {
                error!("free query out of range: {e}");
                return false;
            }
        };

        if state.next_page == 0 && pg == 0 {
            let mut spare = std::mem::take(&mut self.scratch_spare);
            let free = match self.read_spare(page, &mut spare) {
                Ok(()) => spare.is_erased(),
                // ECC failure or transport trouble: the page holds something.
                Err(_) => false,
            };
            self.scratch_spare = spare;
            return free;
        }

        pg >= state.next_page
    }

    /// Copy one page to another location through the scratch buffer,
    /// spare included.
    ///
    /// A failure in either half aborts the copy; the individual guarantees of
    /// [`PageStore::read`] and [`PageStore::program`] are all that holds.
    pub fn copy(&mut self, src: u32, dst: u32) -> Result<()> {
        let mut data = std::mem::take(&mut self.scratch_data);
        let mut spare = std::mem::take(&mut self.scratch_spare);

        let result = self
            .nand
            .read_page(src, &mut data, &mut spare)
            .and_then(|()| self.program(dst, &data, &spare));

        self.scratch_data = data;
        self.scratch_spare = spare;
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{SimNand, TEST_GEOMETRY};

    fn store() -> PageStore<SimNand> {
        PageStore::new(SimNand::new(TEST_GEOMETRY)).unwrap()
    }

    fn page_data(fill: u8) -> (Vec<u8>, Vec<u8>) {
        (
            vec![fill; TEST_GEOMETRY.bytes_per_page],
            vec![fill; TEST_GEOMETRY.spare_per_page],
        )
    }

    #[test]
    fn test_forward_programming_enforced() {
        let mut store = store();
        let (data, spare) = page_data(0x3C);

        // Programming page 5 succeeds and moves the cursor to 6...
        store.program(5, &data, &spare).unwrap();
        assert_eq!(store.next_page(0), 6);

        // ...after which page 3 of the same block is refused.
        assert!(matches!(
            store.program(3, &data, &spare),
            Err(FtlError::Protocol(Violation::ProgramOrder {
                block: 0,
                page: 3,
                next: 6
            }))
        ));

        // An erase resets the cursor and makes page 3 legal again.
        store.erase(0).unwrap();
        store.program(3, &data, &spare).unwrap();
        assert_eq!(store.next_page(0), 4);
    }

    #[test]
    fn test_out_of_range_is_protocol_violation() {
        let mut store = store();
        let (data, spare) = page_data(0);
        let beyond = TEST_GEOMETRY.page_count();

        assert!(matches!(
            store.program(beyond, &data, &spare),
            Err(FtlError::Protocol(Violation::BlockOutOfRange(_)))
        ));
        assert!(matches!(
            store.erase(TEST_GEOMETRY.blocks),
            Err(FtlError::Protocol(_))
        ));
        let mut out = vec![0u8; TEST_GEOMETRY.bytes_per_page];
        assert!(matches!(
            store.read(beyond, 0, 16, &mut out),
            Err(FtlError::Protocol(_))
        ));
    }

    #[test]
    fn test_worn_block_is_refused() {
        let mut store = store();
        let (data, spare) = page_data(0x77);

        store.mark_bad(2);
        assert!(store.is_bad(2));

        let page = TEST_GEOMETRY.page_addr(2, 0);
        assert!(matches!(
            store.program(page, &data, &spare),
            Err(FtlError::Protocol(Violation::WornBlock(2)))
        ));
        assert!(matches!(
            store.erase(2),
            Err(FtlError::Protocol(Violation::WornBlock(2)))
        ));
    }

    #[test]
    fn test_is_bad_memoized() {
        let mut store = PageStore::new(SimNand::new(TEST_GEOMETRY)).unwrap();

        assert!(!store.is_bad(1));
        assert!(!store.is_bad(1));
        assert!(!store.is_bad(1));
        // One hardware query despite three calls.
        assert_eq!(store.nand_mut().stats().bad_checks, 1);
    }

    #[test]
    fn test_program_failure_is_bad_block_class() {
        let mut store = PageStore::new(SimNand::new(TEST_GEOMETRY)).unwrap();
        store.nand_mut().break_programs(1);
        let (data, spare) = page_data(0x55);

        let page = TEST_GEOMETRY.page_addr(1, 0);
        assert!(matches!(
            store.program(page, &data, &spare),
            Err(FtlError::BadBlock { block: 1 })
        ));
        // The attempted page is consumed even though the program failed.
        assert_eq!(store.next_page(1), 1);
    }

    #[test]
    fn test_erase_failure_is_bad_block_class() {
        let mut store = PageStore::new(SimNand::new(TEST_GEOMETRY)).unwrap();
        store.nand_mut().break_next_erase(3);
        assert!(matches!(
            store.erase(3),
            Err(FtlError::BadBlock { block: 3 })
        ));
    }

    #[test]
    fn test_read_bounds_and_windows() {
        let mut store = store();
        let (mut data, spare) = page_data(0);
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        store.program(0, &data, &spare).unwrap();

        let mut out = vec![0u8; 8];
        store.read(0, 16, 8, &mut out).unwrap();
        assert_eq!(out, data[16..24]);

        assert!(matches!(
            store.read(0, TEST_GEOMETRY.bytes_per_page - 4, 8, &mut out),
            Err(FtlError::Protocol(Violation::ReadBounds { .. }))
        ));
    }

    #[test]
    fn test_is_free_probes_then_caches() {
        let mut store = store();
        let (data, spare) = page_data(0x42);

        // Fresh block: first page answered by probing the hardware.
        assert!(store.is_free(0));

        store.program(0, &data, &spare).unwrap();
        store.program(1, &data, &spare).unwrap();

        let reads_before = store.nand_mut().stats().reads;
        assert!(!store.is_free(0));
        assert!(!store.is_free(1));
        assert!(store.is_free(2));
        // All three answered from the cached cursor.
        assert_eq!(store.nand_mut().stats().reads, reads_before);
    }

    #[test]
    fn test_is_free_sees_preexisting_data() {
        // Simulate a restart: the NAND keeps its content, the store's
        // in-memory cursors start over.
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data = vec![0x10u8; TEST_GEOMETRY.bytes_per_page];
        let spare = vec![0x20u8; TEST_GEOMETRY.spare_per_page];
        nand.program_page(TEST_GEOMETRY.page_addr(1, 0), &data, &spare)
            .unwrap();

        let mut store = PageStore::new(nand).unwrap();
        assert!(!store.is_free(TEST_GEOMETRY.page_addr(1, 0)));
        assert!(store.is_free(TEST_GEOMETRY.page_addr(0, 0)));
    }

    #[test]
    fn test_copy_moves_data_and_spare() {
        let mut store = store();
        let data = vec![0xABu8; TEST_GEOMETRY.bytes_per_page];
        let spare = vec![0xCDu8; TEST_GEOMETRY.spare_per_page];
        store.program(7, &data, &spare).unwrap();

        let dst = TEST_GEOMETRY.page_addr(4, 0);
        store.copy(7, dst).unwrap();

        let mut out = vec![0u8; TEST_GEOMETRY.bytes_per_page];
        store.read(dst, 0, TEST_GEOMETRY.bytes_per_page, &mut out).unwrap();
        assert_eq!(out, data);

        let mut sout = vec![0u8; TEST_GEOMETRY.spare_per_page];
        store.read_spare(dst, &mut sout).unwrap();
        assert_eq!(sout, spare);
        assert_eq!(store.next_page(4), 1);
    }

    #[test]
    fn test_copy_from_broken_page_has_no_side_effects() {
        let mut store = store();
        let (data, spare) = page_data(0x61);
        store.program(0, &data, &spare).unwrap();
        store.nand_mut().break_page_ecc(0);

        let dst = TEST_GEOMETRY.page_addr(5, 0);
        assert!(matches!(
            store.copy(0, dst),
            Err(FtlError::Ecc { page: 0 })
        ));
        // The destination cursor is untouched: nothing was programmed.
        assert_eq!(store.next_page(5), 0);
    }
}
