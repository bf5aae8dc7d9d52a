//! Logical-to-physical block remapping around bad blocks.
//!
//! Partitions that use the simple byte-addressed I/O path cannot tolerate a
//! bad block in the middle of their address range. The remap table gives each
//! logical block of a partition span the next good physical block, shifting
//! later logical blocks past any bad ones. The table covers the whole device
//! but is resolved lazily, one partition span at a time; a span is scanned
//! once and never rescanned.
//!
//! Spans handed to [`RemapTable::build`] must be disjoint. Overlapping spans
//! are not guarded against and leave the table in an unspecified state.

use log::warn;

use crate::error::{FtlError, Result, Violation};
use crate::nand::{NandGeometry, RawNand};

/// Resolution state of one logical block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapEntry {
    /// Not part of any span built so far.
    Unknown,
    /// The span ran out of good physical blocks before this logical block.
    Shift,
    /// Resolved to a physical block index.
    Phys(u32),
}

/// The per-device bad-block remap table.
#[derive(Debug)]
pub struct RemapTable {
    entries: Box<[MapEntry]>,
}

impl RemapTable {
    /// Create an unresolved table covering `total_blocks` logical blocks.
    pub fn new(total_blocks: u32) -> Self {
        Self {
            entries: vec![MapEntry::Unknown; total_blocks as usize].into_boxed_slice(),
        }
    }

    /// Resolve the logical span `[block_start, block_start + block_count)`.
    ///
    /// Walks the same physical span, skipping blocks the adapter reports bad,
    /// and assigns each logical slot the next good physical block; logical
    /// slots left over when the span is exhausted are marked [`MapEntry::Shift`].
    /// Returns the number of bad blocks encountered. Building an
    /// already-resolved span is a no-op returning 0.
    pub fn build<N: RawNand>(
        &mut self,
        nand: &mut N,
        block_start: u32,
        block_count: u32,
    ) -> Result<u32> {
        let total = self.entries.len() as u32;
        if block_start >= total {
            warn!("remap span begin [{block_start}] overflows the device");
            return Err(FtlError::OutOfRange);
        }
        let count = block_count.min(total - block_start);

        if self.entries[block_start as usize] != MapEntry::Unknown {
            return Ok(0);
        }

        let mut bad = 0;
        let mut phys = 0; // physical cursor, relative to block_start
        for logical in 0..count {
            let entry = &mut self.entries[(block_start + logical) as usize];
            *entry = MapEntry::Shift;
            while phys < count {
                let candidate = block_start + phys;
                phys += 1;
                let is_bad = nand.is_bad(candidate).unwrap_or_else(|e| {
                    // An unreadable bad-block marker is treated as bad.
                    warn!("bad-block query for blk[{candidate}] failed: {e}");
                    true
                });
                if is_bad {
                    warn!("blk[{candidate}] is bad block");
                    bad += 1;
                } else {
                    *entry = MapEntry::Phys(candidate);
                    break;
                }
            }
        }

        Ok(bad)
    }

    /// Look up the entry for a logical block.
    pub fn entry(&self, block: u32) -> MapEntry {
        self.entries
            .get(block as usize)
            .copied()
            .unwrap_or(MapEntry::Unknown)
    }

    /// Translate a logical byte offset into a physical byte offset.
    ///
    /// Pure shift/mask arithmetic; no I/O. The offset must fall inside a span
    /// previously resolved by [`RemapTable::build`], otherwise this is a
    /// protocol violation.
    pub fn physical_offset(&self, geom: &NandGeometry, offset: u64) -> Result<u64> {
        let shift = geom.block_shift();
        let logical = (offset >> shift) as u32;
        match self.entry(logical) {
            MapEntry::Phys(phys) => Ok(((phys as u64) << shift) + (offset & geom.block_mask())),
            _ => Err(Violation::Unmapped(logical).into()),
        }
    }
}
