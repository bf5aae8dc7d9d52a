//! The minimal byte-addressed FTL.
//!
//! No caching, no write-combining, no wear-leveling: linear byte offsets are
//! pushed through the bad-block remap table one page (or block) at a time and
//! handed straight to the adapter. This is deliberately the smallest viable
//! translation for partitions that tolerate direct, un-leveled access, such
//! as read-mostly firmware images.
//!
//! Writes append into previously erased blocks; there is no rollback. When a
//! page in the middle of a transfer fails, everything before it stays
//! written, and the caller learns only that the transfer as a whole failed.

use log::error;

use crate::error::{FtlError, Result};
use crate::nand::RawNand;
use crate::remap::RemapTable;

/// Read `buf.len()` bytes starting at logical byte offset `from`.
///
/// `from` and the buffer length must be page-aligned. The first failing page
/// read aborts the transfer: hardware trouble comes back as [`FtlError::Io`],
/// an uncorrectable page as [`FtlError::Ecc`].
pub fn read<N: RawNand>(
    nand: &mut N,
    map: &RemapTable,
    from: u64,
    buf: &mut [u8],
) -> Result<()> {
    let geom = nand.geometry();
    let page_size = geom.bytes_per_page as u64;
    if from % page_size != 0 || buf.len() as u64 % page_size != 0 {
        return Err(FtlError::Misaligned);
    }

    let mut spare = vec![0u8; geom.spare_per_page];
    for (i, chunk) in buf.chunks_mut(geom.bytes_per_page).enumerate() {
        let addr = from + i as u64 * page_size;
        let page = (map.physical_offset(&geom, addr)? >> geom.page_shift()) as u32;
        match nand.read_page(page, chunk, &mut spare) {
            Ok(()) => (),
            Err(e @ FtlError::Ecc { .. }) => {
                error!("uncorrectable read at byte {addr:#x}");
                return Err(e);
            }
            Err(e) => {
                error!("read failed at byte {addr:#x}: {e}");
                return Err(FtlError::Io { addr });
            }
        }
    }

    Ok(())
}

/// Program `buf.len()` bytes starting at logical byte offset `to`.
///
/// Same alignment and iteration contract as [`read`]; the target pages must
/// have been erased beforehand.
pub fn write<N: RawNand>(nand: &mut N, map: &RemapTable, to: u64, buf: &[u8]) -> Result<()> {
    let geom = nand.geometry();
    let page_size = geom.bytes_per_page as u64;
    if to % page_size != 0 || buf.len() as u64 % page_size != 0 {
        return Err(FtlError::Misaligned);
    }

    let spare = vec![0xFFu8; geom.spare_per_page];
    for (i, chunk) in buf.chunks(geom.bytes_per_page).enumerate() {
        let addr = to + i as u64 * page_size;
        let page = (map.physical_offset(&geom, addr)? >> geom.page_shift()) as u32;
        if let Err(e) = nand.program_page(page, chunk, &spare) {
            error!("write failed at byte {addr:#x}: {e}");
            return Err(FtlError::Io { addr });
        }
    }

    Ok(())
}

/// Erase `len` bytes of logical address space starting at `addr`.
///
/// Both must be block-aligned. Erasure stops at the first failing block;
/// earlier blocks stay erased.
pub fn erase<N: RawNand>(nand: &mut N, map: &RemapTable, addr: u64, len: u64) -> Result<()> {
    let geom = nand.geometry();
    let block_size = geom.block_size() as u64;
    if addr % block_size != 0 || len % block_size != 0 {
        return Err(FtlError::Misaligned);
    }

    let mut addr = addr;
    let mut remaining = len;
    while remaining > 0 {
        let block = (map.physical_offset(&geom, addr)? >> geom.block_shift()) as u32;
        if let Err(e) = nand.erase_block(block) {
            error!("erase failed at byte {addr:#x}: {e}");
            return Err(FtlError::Io { addr });
        }
        addr += block_size;
        remaining -= block_size;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandGeometry, PageUtil, SimNand};

    const GEOM: NandGeometry = NandGeometry {
        blocks: 32,
        pages_per_block: 16,
        bytes_per_page: 512,
        spare_per_page: 16,
    };

    fn mapped(nand: &mut SimNand) -> RemapTable {
        let mut table = RemapTable::new(GEOM.blocks);
        table.build(nand, 0, GEOM.blocks).unwrap();
        table
    }

    #[test]
    fn test_write_then_read_one_page() {
        let mut nand = SimNand::new(GEOM);
        let table = mapped(&mut nand);

        let page: Vec<u8> = (0..GEOM.bytes_per_page).map(|i| i as u8).collect();
        let offset = 3 * GEOM.bytes_per_page as u64;

        write(&mut nand, &table, offset, &page).unwrap();

        let mut back = vec![0u8; GEOM.bytes_per_page];
        read(&mut nand, &table, offset, &mut back).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn test_misaligned_length_makes_no_adapter_calls() {
        let mut nand = SimNand::new(GEOM);
        let table = mapped(&mut nand);
        let before = nand.stats();

        let buf = vec![0u8; GEOM.bytes_per_page + 1];
        assert!(matches!(
            write(&mut nand, &table, 0, &buf),
            Err(FtlError::Misaligned)
        ));
        assert!(matches!(
            write(&mut nand, &table, 7, &buf[..GEOM.bytes_per_page]),
            Err(FtlError::Misaligned)
        ));
        let mut out = vec![0u8; 100];
        assert!(matches!(
            read(&mut nand, &table, 0, &mut out),
            Err(FtlError::Misaligned)
        ));

        assert_eq!(nand.stats(), before);
    }

    #[test]
    fn test_write_lands_past_bad_block() {
        let mut nand = SimNand::new(GEOM);
        nand.set_factory_bad(1);
        let table = mapped(&mut nand);

        // Logical block 1 remaps to physical block 2.
        let offset = GEOM.block_size() as u64;
        let page = vec![0xC3u8; GEOM.bytes_per_page];
        write(&mut nand, &table, offset, &page).unwrap();

        let phys_page = GEOM.page_addr(2, 0);
        let mut data = vec![0u8; GEOM.bytes_per_page];
        let mut spare = vec![0u8; GEOM.spare_per_page];
        crate::nand::RawNand::read_page(&mut nand, phys_page, &mut data, &mut spare).unwrap();
        assert_eq!(data, page);
    }

    #[test]
    fn test_erase_alignment_and_effect() {
        let mut nand = SimNand::new(GEOM);
        let table = mapped(&mut nand);
        let bs = GEOM.block_size() as u64;

        let page = vec![0x42u8; GEOM.bytes_per_page];
        write(&mut nand, &table, bs, &page).unwrap();

        assert!(matches!(
            erase(&mut nand, &table, bs, 100),
            Err(FtlError::Misaligned)
        ));
        assert!(matches!(
            erase(&mut nand, &table, 5, bs),
            Err(FtlError::Misaligned)
        ));

        erase(&mut nand, &table, bs, bs).unwrap();
        let mut back = vec![0u8; GEOM.bytes_per_page];
        read(&mut nand, &table, bs, &mut back).unwrap();
        assert!(back.is_erased());
    }

    #[test]
    fn test_read_distinguishes_ecc() {
        let mut nand = SimNand::new(GEOM);
        let table = mapped(&mut nand);

        let page = vec![0x99u8; GEOM.bytes_per_page];
        write(&mut nand, &table, 0, &page).unwrap();
        nand.break_page_ecc(0);

        let mut back = vec![0u8; GEOM.bytes_per_page];
        assert!(matches!(
            read(&mut nand, &table, 0, &mut back),
            Err(FtlError::Ecc { page: 0 })
        ));
    }

    #[test]
    fn test_write_failure_reports_io() {
        let mut nand = SimNand::new(GEOM);
        nand.break_programs(0);
        let table = mapped(&mut nand);

        let page = vec![0x10u8; GEOM.bytes_per_page];
        assert!(matches!(
            write(&mut nand, &table, 0, &page),
            Err(FtlError::Io { addr: 0 })
        ));
    }
}
