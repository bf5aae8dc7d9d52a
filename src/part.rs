//! Partition descriptors and the partition table.
//!
//! A table is an ordered list of named spans. `Raw` partitions byte-address
//! the chip through the bad-block remap table and suit read-mostly firmware
//! data; `Leveled` partitions are sector devices carved out of the
//! wear-leveled pool's logical space. The table is validated once, at
//! registration.

use std::str::FromStr;

use crate::error::{FtlError, Result};
use crate::nand::NandGeometry;
use crate::wear::map::BlockRange;

/// Which translation path a partition's I/O takes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionKind {
    /// Byte-addressed through the remap table; offsets are device addresses.
    Raw,
    /// Sector-addressed through the wear-leveling map; offsets address the
    /// pool's logical byte space.
    Leveled,
}

/// Access capability of a partition (and of an opened handle).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(&self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }

    /// Can a handle opened with `self` be granted on a partition allowing
    /// `allowed`?
    pub fn within(&self, allowed: Access) -> bool {
        (!self.readable() || allowed.readable()) && (!self.writable() || allowed.writable())
    }
}

/// One entry of the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    /// Byte offset; device address space for `Raw`, pool logical space for
    /// `Leveled`.
    pub offset: u64,
    /// Byte size.
    pub size: u64,
    pub kind: PartitionKind,
    pub access: Access,
}

impl PartitionEntry {
    fn end(&self) -> u64 {
        self.offset + self.size
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Parse strings like "name:offset:size:kind:access", e.g.
/// "boot:0:0x100000:raw:ro" or "data:0:0x400000:ftl:rw". Numbers may be
/// decimal or 0x-prefixed hex.
impl FromStr for PartitionEntry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [name, offset, size, kind, access]: [&str; 5] = s
            .split(':')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected name:offset:size:kind:access"))?;

        let parse_num = |v: &str| -> anyhow::Result<u64> {
            Ok(match v.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16)?,
                None => v.parse()?,
            })
        };

        let kind = match kind {
            "raw" => PartitionKind::Raw,
            "ftl" => PartitionKind::Leveled,
            other => anyhow::bail!("unknown partition kind {other:?}"),
        };
        let access = match access {
            "ro" => Access::ReadOnly,
            "wo" => Access::WriteOnly,
            "rw" => Access::ReadWrite,
            other => anyhow::bail!("unknown access flags {other:?}"),
        };

        Ok(PartitionEntry {
            name: name.to_string(),
            offset: parse_num(offset)?,
            size: parse_num(size)?,
            kind,
            access,
        })
    }
}

/// The ordered partition table of one device.
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    pub fn new(entries: Vec<PartitionEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Check the table against a device layout.
    ///
    /// Raw partitions must be block-aligned, stay on the device, and keep
    /// clear of the wear-leveled pool; leveled partitions must be
    /// page-aligned and fit the pool's upper bound (the exact capacity is
    /// enforced after the pool is resumed). All names must be unique, spans
    /// of the same kind must not overlap.
    pub fn validate(&self, geom: &NandGeometry, pool: Option<BlockRange>) -> Result<()> {
        let block_size = geom.block_size() as u64;
        let page_size = geom.bytes_per_page as u64;

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name.is_empty() || entry.size == 0 {
                return Err(FtlError::Unsupported("empty partition name or size"));
            }
            if self.entries[..i].iter().any(|e| e.name == entry.name) {
                return Err(FtlError::Unsupported("duplicate partition name"));
            }
            if self.entries[..i]
                .iter()
                .any(|e| e.kind == entry.kind && e.overlaps(entry))
            {
                return Err(FtlError::Unsupported("overlapping partitions"));
            }

            match entry.kind {
                PartitionKind::Raw => {
                    if entry.offset % block_size != 0 || entry.size % block_size != 0 {
                        return Err(FtlError::Misaligned);
                    }
                    if entry.end() > geom.total_bytes() {
                        return Err(FtlError::OutOfRange);
                    }
                    if let Some(pool) = pool {
                        let pool_start = (pool.start as u64) << geom.block_shift();
                        let pool_end = (pool.end() as u64) << geom.block_shift();
                        if entry.offset < pool_end && pool_start < entry.end() {
                            return Err(FtlError::Unsupported(
                                "raw partition intersects the wear-leveled pool",
                            ));
                        }
                    }
                }
                PartitionKind::Leveled => {
                    let Some(pool) = pool else {
                        return Err(FtlError::Unsupported(
                            "leveled partition without a configured pool",
                        ));
                    };
                    if entry.offset % page_size != 0 || entry.size % page_size != 0 {
                        return Err(FtlError::Misaligned);
                    }
                    let pool_bytes = pool.count as u64 * block_size;
                    if entry.end() > pool_bytes {
                        return Err(FtlError::OutOfRange);
                    }
                }
            }
        }

        Ok(())
    }
}

impl FromIterator<PartitionEntry> for PartitionTable {
    fn from_iter<T: IntoIterator<Item = PartitionEntry>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
