//! The block-device partition shim.
//!
//! [`Storage`] is the context object tying the stack together: it owns the
//! adapter (inside the [`PageStore`]), the remap table, the sector map, and
//! the single mutex that serializes every NAND-level operation, since the SPI
//! transport and the chip's internal state machine cannot tolerate concurrent
//! access. The lock is held for the duration of one page/block operation and
//! re-acquired per sector, so one partition's long transfer cannot starve the
//! rest forever. Acquisition never times out; NAND operations are
//! bounded-latency by the chip specification.
//!
//! Partitions are exposed as [`PartitionHandle`]s with sector-granular read
//! and write. Transfers that run off the end of the partition are cut short:
//! the returned count is the number of sectors actually moved, and the caller
//! is expected to compare it against the request.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, info, warn};

use crate::error::{FtlError, Result};
use crate::mini;
use crate::nand::{NandGeometry, RawNand};
use crate::part::{Access, PartitionEntry, PartitionKind, PartitionTable};
use crate::remap::RemapTable;
use crate::wear::map::{BlockRange, SectorMap, DEFAULT_GC_RATIO};
use crate::wear::PageStore;

/// Tunables for [`Storage::register`].
#[derive(Debug, Copy, Clone)]
pub struct StorageOptions {
    /// Garbage-collection ratio for the wear-leveled pool: one block in this
    /// many is held in reserve.
    pub gc_ratio: u8,
    /// Physical block span of the wear-leveled pool. Required when the table
    /// contains leveled partitions.
    pub pool: Option<BlockRange>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            gc_ratio: DEFAULT_GC_RATIO,
            pool: None,
        }
    }
}

/// Geometry reported to block-device consumers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockGeometry {
    pub bytes_per_sector: usize,
    pub sector_count: u64,
    pub block_size: usize,
}

struct StorageInner<N: RawNand> {
    store: PageStore<N>,
    remap: RemapTable,
    map: Option<SectorMap>,
}

/// A registered NAND device with its partition table.
pub struct Storage<N: RawNand> {
    geom: NandGeometry,
    table: PartitionTable,
    inner: Mutex<StorageInner<N>>,
}

impl<N: RawNand> Storage<N> {
    /// Bring a device up: validate the partition table, build the remap table
    /// for every raw partition span, resume the wear-leveled pool from its
    /// on-flash metadata, and force a sync to prove the pool consistent.
    /// Any failure abandons registration.
    pub fn register(
        nand: N,
        table: PartitionTable,
        options: StorageOptions,
    ) -> Result<Arc<Self>> {
        let geom = nand.geometry();
        geom.check()?;
        table.validate(&geom, options.pool)?;

        let mut store = PageStore::new(nand)?;

        let mut remap = RemapTable::new(geom.blocks);
        for entry in table.entries() {
            if entry.kind != PartitionKind::Raw {
                continue;
            }
            let block_start = (entry.offset >> geom.block_shift()) as u32;
            let block_count = (entry.size >> geom.block_shift()) as u32;
            let bad = remap.build(store.nand_mut(), block_start, block_count)?;
            if bad > 0 {
                info!(
                    "partition {:?}: remapped around {bad} bad block(s)",
                    entry.name
                );
            }
        }

        let wants_pool = table
            .entries()
            .iter()
            .any(|e| e.kind == PartitionKind::Leveled);
        let map = if wants_pool {
            // validate() has already insisted on a pool.
            let pool = options
                .pool
                .ok_or(FtlError::Unsupported("leveled partition without a pool"))?;
            let mut map = SectorMap::resume(&mut store, pool, options.gc_ratio)?;

            let sector_size = geom.bytes_per_page as u64;
            let leveled_end = table
                .entries()
                .iter()
                .filter(|e| e.kind == PartitionKind::Leveled)
                .map(|e| e.offset + e.size)
                .max()
                .unwrap_or(0);
            if leveled_end > map.capacity() as u64 * sector_size {
                error!(
                    "leveled partitions need {leveled_end} bytes but the pool provides {}",
                    map.capacity() as u64 * sector_size
                );
                return Err(FtlError::Full);
            }

            map.sync(&mut store)?;
            Some(map)
        } else {
            None
        };

        Ok(Arc::new(Self {
            geom,
            table,
            inner: Mutex::new(StorageInner { store, remap, map }),
        }))
    }

    /// The physical geometry of the underlying device.
    pub fn geometry(&self) -> NandGeometry {
        self.geom
    }

    /// The registered partition table.
    pub fn partitions(&self) -> &PartitionTable {
        &self.table
    }

    /// Open the partition registered under `name` with the requested access.
    pub fn open(self: &Arc<Self>, name: &str, access: Access) -> Result<PartitionHandle<N>> {
        let entry = self
            .table
            .find(name)
            .ok_or_else(|| FtlError::UnknownPartition(name.to_string()))?
            .clone();
        if !access.within(entry.access) {
            return Err(FtlError::NoAccess);
        }

        Ok(PartitionHandle {
            storage: Arc::clone(self),
            sector_base: (entry.offset / self.geom.bytes_per_page as u64) as u32,
            entry,
            access,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StorageInner<N>> {
        // A poisoning panic cannot leave a half-applied NAND operation behind
        // at this layer, so the lock stays usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An open partition, closed by dropping the handle.
pub struct PartitionHandle<N: RawNand> {
    storage: Arc<Storage<N>>,
    entry: PartitionEntry,
    access: Access,
    /// First pool sector of a leveled partition.
    sector_base: u32,
}

impl<N: RawNand> PartitionHandle<N> {
    /// The partition's name.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Sector geometry, as a block-device `control` query would report it.
    pub fn geometry(&self) -> BlockGeometry {
        let geom = self.storage.geom;
        BlockGeometry {
            bytes_per_sector: geom.bytes_per_page,
            sector_count: self.entry.size / geom.bytes_per_page as u64,
            block_size: geom.block_size(),
        }
    }

    /// Read whole sectors starting at `start_sector`.
    ///
    /// Returns the number of sectors actually transferred; a count short of
    /// the request means a bound or hardware failure stopped the transfer.
    pub fn read(&self, start_sector: u64, buf: &mut [u8]) -> Result<u64> {
        if !self.access.readable() {
            return Err(FtlError::NoAccess);
        }
        let sector_size = self.storage.geom.bytes_per_page;
        if buf.len() % sector_size != 0 {
            return Err(FtlError::Misaligned);
        }

        let mut done = 0;
        for chunk in buf.chunks_mut(sector_size) {
            let sector = start_sector + done;
            if (sector + 1) * sector_size as u64 > self.entry.size {
                error!(
                    "read past the end of partition {:?} (sector {sector})",
                    self.entry.name
                );
                break;
            }

            let mut inner = self.storage.lock();
            let StorageInner { store, remap, map } = &mut *inner;
            let result = match self.entry.kind {
                PartitionKind::Raw => {
                    let offset = self.entry.offset + sector * sector_size as u64;
                    mini::read(store.nand_mut(), remap, offset, chunk)
                }
                PartitionKind::Leveled => {
                    let map = map.as_mut().ok_or(FtlError::Unsupported("no pool"))?;
                    map.read(store, self.sector_base + sector as u32, chunk)
                }
            };
            drop(inner);

            if let Err(e) = result {
                error!(
                    "read of {:?} sector {sector} failed: {e}",
                    self.entry.name
                );
                break;
            }
            done += 1;
        }

        Ok(done)
    }

    /// Write whole sectors starting at `start_sector`.
    ///
    /// On the wear-leveled path every sector is followed by a map sync while
    /// the lock is still held, trading throughput for durability at each
    /// sector boundary. Returns the number of sectors actually written.
    pub fn write(&self, start_sector: u64, buf: &[u8]) -> Result<u64> {
        if !self.access.writable() {
            return Err(FtlError::NoAccess);
        }
        let sector_size = self.storage.geom.bytes_per_page;
        if buf.len() % sector_size != 0 {
            return Err(FtlError::Misaligned);
        }

        let mut done = 0;
        for chunk in buf.chunks(sector_size) {
            let sector = start_sector + done;
            if (sector + 1) * sector_size as u64 > self.entry.size {
                error!(
                    "write past the end of partition {:?} (sector {sector})",
                    self.entry.name
                );
                break;
            }

            let mut inner = self.storage.lock();
            let StorageInner { store, remap, map } = &mut *inner;
            let result = match self.entry.kind {
                PartitionKind::Raw => {
                    let offset = self.entry.offset + sector * sector_size as u64;
                    mini::write(store.nand_mut(), remap, offset, chunk)
                }
                PartitionKind::Leveled => {
                    let map = map.as_mut().ok_or(FtlError::Unsupported("no pool"))?;
                    map.write(store, self.sector_base + sector as u32, chunk)
                        .and_then(|()| map.sync(store))
                }
            };
            drop(inner);

            if let Err(e) = result {
                error!(
                    "write of {:?} sector {sector} failed: {e}",
                    self.entry.name
                );
                break;
            }
            done += 1;
        }

        Ok(done)
    }

    /// Erase a byte range of a raw partition (block-aligned, partition-
    /// relative). Leveled partitions have no erase; use [`Self::trim`].
    pub fn erase(&self, offset: u64, len: u64) -> Result<()> {
        if !self.access.writable() {
            return Err(FtlError::NoAccess);
        }
        if self.entry.kind != PartitionKind::Raw {
            return Err(FtlError::Unsupported("erase applies to raw partitions"));
        }
        if offset + len > self.entry.size {
            return Err(FtlError::OutOfRange);
        }

        let mut inner = self.storage.lock();
        let StorageInner { store, remap, .. } = &mut *inner;
        mini::erase(store.nand_mut(), remap, self.entry.offset + offset, len)
    }

    /// Drop the mappings of a sector range of a leveled partition; the
    /// sectors read back as erased until rewritten.
    pub fn trim(&self, start_sector: u64, count: u64) -> Result<()> {
        if !self.access.writable() {
            return Err(FtlError::NoAccess);
        }
        if self.entry.kind != PartitionKind::Leveled {
            return Err(FtlError::Unsupported("trim applies to leveled partitions"));
        }
        let sector_size = self.storage.geom.bytes_per_page as u64;
        if (start_sector + count) * sector_size > self.entry.size {
            return Err(FtlError::OutOfRange);
        }

        for i in 0..count {
            let mut inner = self.storage.lock();
            let map = inner
                .map
                .as_mut()
                .ok_or(FtlError::Unsupported("no pool"))?;
            if let Err(e) = map.trim(self.sector_base + (start_sector + i) as u32) {
                warn!("trim of {:?} failed: {e}", self.entry.name);
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{PageUtil, SimNand};
    use crate::part::PartitionEntry;

    const GEOM: NandGeometry = NandGeometry {
        blocks: 32,
        pages_per_block: 4,
        bytes_per_page: 128,
        spare_per_page: 32,
    };

    const POOL: BlockRange = BlockRange { start: 8, count: 24 };

    fn table() -> PartitionTable {
        [
            "boot:0:0x1000:raw:rw",       // blocks 0..8
            "data:0:0x1000:ftl:rw",       // 32 pool sectors
            "keys:0x1000:0x400:ftl:ro",   // 8 pool sectors, read-only
        ]
        .iter()
        .map(|s| s.parse::<PartitionEntry>().unwrap())
        .collect()
    }

    fn options() -> StorageOptions {
        StorageOptions {
            pool: Some(POOL),
            ..Default::default()
        }
    }

    fn sector(fill: u8) -> Vec<u8> {
        vec![fill; GEOM.bytes_per_page]
    }

    #[test]
    fn test_register_and_geometry() {
        let storage = Storage::register(SimNand::new(GEOM), table(), options()).unwrap();
        let data = storage.open("data", Access::ReadWrite).unwrap();

        assert_eq!(
            data.geometry(),
            BlockGeometry {
                bytes_per_sector: 128,
                sector_count: 32,
                block_size: 512,
            }
        );

        assert!(matches!(
            storage.open("missing", Access::ReadOnly),
            Err(FtlError::UnknownPartition(_))
        ));
    }

    #[test]
    fn test_leveled_write_read() {
        let storage = Storage::register(SimNand::new(GEOM), table(), options()).unwrap();
        let data = storage.open("data", Access::ReadWrite).unwrap();

        let mut buf = Vec::new();
        for i in 0..4u8 {
            buf.extend(sector(0x30 + i));
        }
        assert_eq!(data.write(2, &buf).unwrap(), 4);

        let mut back = vec![0u8; buf.len()];
        assert_eq!(data.read(2, &mut back).unwrap(), 4);
        assert_eq!(back, buf);

        // Untouched sectors read as erased.
        let mut one = sector(0);
        assert_eq!(data.read(0, &mut one).unwrap(), 1);
        assert!(one.is_erased());
    }

    #[test]
    fn test_short_transfer_at_partition_bound() {
        let storage = Storage::register(SimNand::new(GEOM), table(), options()).unwrap();
        let data = storage.open("data", Access::ReadWrite).unwrap();
        let total = data.geometry().sector_count;

        // A two-sector write starting at the last valid sector moves exactly
        // one sector, and the sector past the bound is never touched.
        let mut buf = sector(0xA1);
        buf.extend(sector(0xA2));
        assert_eq!(data.write(total - 1, &buf).unwrap(), 1);

        let mut back = sector(0);
        assert_eq!(data.read(total - 1, &mut back).unwrap(), 1);
        assert_eq!(back, sector(0xA1));

        // Same short-count honesty on reads.
        let mut two = vec![0u8; 2 * GEOM.bytes_per_page];
        assert_eq!(data.read(total - 1, &mut two).unwrap(), 1);

        // Entirely out of range: zero sectors.
        assert_eq!(data.write(total, &sector(0xA3)).unwrap(), 0);
    }

    #[test]
    fn test_capability_checks() {
        let storage = Storage::register(SimNand::new(GEOM), table(), options()).unwrap();

        // The partition allows less than the open asks for.
        assert!(matches!(
            storage.open("keys", Access::ReadWrite),
            Err(FtlError::NoAccess)
        ));

        let keys = storage.open("keys", Access::ReadOnly).unwrap();
        assert!(matches!(
            keys.write(0, &sector(1)),
            Err(FtlError::NoAccess)
        ));
        assert!(keys.trim(0, 1).is_err());

        let mut buf = sector(0);
        assert_eq!(keys.read(0, &mut buf).unwrap(), 1);
    }

    #[test]
    fn test_raw_partition_io() {
        let storage = Storage::register(SimNand::new(GEOM), table(), options()).unwrap();
        let boot = storage.open("boot", Access::ReadWrite).unwrap();

        let payload = sector(0x5C);
        assert_eq!(boot.write(1, &payload).unwrap(), 1);

        let mut back = sector(0);
        assert_eq!(boot.read(1, &mut back).unwrap(), 1);
        assert_eq!(back, payload);

        // Raw partitions erase in place; the data is gone afterwards.
        boot.erase(0, GEOM.block_size() as u64).unwrap();
        assert_eq!(boot.read(1, &mut back).unwrap(), 1);
        assert!(back.is_erased());

        assert!(boot.trim(0, 1).is_err());
        assert!(boot.erase(0, 64).is_err()); // misaligned length
    }

    #[test]
    fn test_raw_partition_skips_bad_blocks() {
        let mut nand = SimNand::new(GEOM);
        nand.set_factory_bad(1);
        let storage = Storage::register(nand, table(), options()).unwrap();
        let boot = storage.open("boot", Access::ReadWrite).unwrap();

        // Logical block 1 of the partition lives on physical block 2.
        let sectors_per_block = GEOM.pages_per_block as u64;
        let payload = sector(0x6D);
        assert_eq!(boot.write(sectors_per_block, &payload).unwrap(), 1);

        let mut back = sector(0);
        assert_eq!(boot.read(sectors_per_block, &mut back).unwrap(), 1);
        assert_eq!(back, payload);
    }

    #[test]
    fn test_leveled_survives_reregistration() {
        let mut sim = SimNand::new(GEOM);
        {
            let storage = Storage::register(&mut sim, table(), options()).unwrap();
            let data = storage.open("data", Access::ReadWrite).unwrap();
            data.write(7, &sector(0x99)).unwrap();
        }

        let storage = Storage::register(&mut sim, table(), options()).unwrap();
        let data = storage.open("data", Access::ReadOnly).unwrap();
        let mut back = sector(0);
        assert_eq!(data.read(7, &mut back).unwrap(), 1);
        assert_eq!(back, sector(0x99));
    }

    #[test]
    fn test_trim_drops_sectors() {
        let storage = Storage::register(SimNand::new(GEOM), table(), options()).unwrap();
        let data = storage.open("data", Access::ReadWrite).unwrap();

        data.write(3, &sector(0x42)).unwrap();
        data.trim(3, 1).unwrap();

        let mut back = sector(0);
        assert_eq!(data.read(3, &mut back).unwrap(), 1);
        assert!(back.is_erased());
    }

    #[test]
    fn test_register_rejects_oversized_leveled_layout() {
        // A pool of 8 blocks with ratio 4 reserves 2, leaving 24 sectors;
        // a 32-sector partition fits the pool's span but not its capacity.
        let small_pool = BlockRange { start: 8, count: 8 };
        let table: PartitionTable = ["data:0:0x1000:ftl:rw"]
            .iter()
            .map(|s| s.parse::<PartitionEntry>().unwrap())
            .collect();
        let result = Storage::register(
            SimNand::new(GEOM),
            table,
            StorageOptions {
                pool: Some(small_pool),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(FtlError::Full)));
    }
}
