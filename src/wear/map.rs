//! The log-structured sector map.
//!
//! Logical sectors (one page each) are appended to a rotating head block,
//! tagged with a [`PageMeta`] header in the spare area. The in-RAM mapping is
//! nothing more than a replay of those headers: resume scans the pool, keeps
//! the highest sequence number per sector, and picks up exactly where an
//! unclean shutdown left off. Garbage collection compacts blocks whose pages
//! have mostly been superseded, and blocks that fail to program or erase are
//! evacuated and retired on the spot.
//!
//! The pool is a contiguous physical block range handed to [`SectorMap::resume`];
//! a configured fraction of it (the reserve, derived from the GC ratio) is
//! withheld from the advertised capacity so collection always has room to
//! breathe.

use log::{debug, error, warn};

use super::meta::PageMeta;
use super::PageStore;
use crate::error::{FtlError, Result};
use crate::nand::{NandGeometry, PageUtil, RawNand};

/// Default garbage-collection ratio: one block in this many is reserved.
pub const DEFAULT_GC_RATIO: u8 = 4;

/// A contiguous span of physical erase blocks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u32,
    pub count: u32,
}

impl BlockRange {
    pub fn end(&self) -> u32 {
        self.start + self.count
    }

    pub fn contains(&self, block: u32) -> bool {
        (self.start..self.end()).contains(&block)
    }
}

/// Log-structured logical-sector to physical-page mapping over a block pool.
pub struct SectorMap {
    geom: NandGeometry,
    region: BlockRange,
    /// Blocks withheld from capacity so GC always has somewhere to go.
    reserve: u32,
    /// Advertised sector count, fixed at resume time.
    capacity: u32,
    /// Logical sector → physical page.
    l2p: Box<[Option<u32>]>,
    /// Live (currently mapped) pages per pool block.
    live: Box<[u32]>,
    /// Block currently accepting programs.
    head: Option<u32>,
    /// Rotation point for free-block claims, spreading erases over the pool.
    cursor: u32,
    /// Next sequence number to issue.
    seq: u64,
    /// Most recently programmed page, revalidated by [`SectorMap::sync`].
    last_page: Option<u32>,
    spare_buf: Vec<u8>,
}

impl SectorMap {
    /// Build the map by replaying the pool's on-flash metadata.
    ///
    /// This is the crash-recovery step: whatever state the previous run left
    /// behind (including a torn final program) is re-derived from the page
    /// headers. Fails with [`FtlError::Full`] if bad blocks have eaten into
    /// the reserve.
    pub fn resume<N: RawNand>(
        store: &mut PageStore<N>,
        region: BlockRange,
        gc_ratio: u8,
    ) -> Result<Self> {
        let geom = store.geometry();
        if region.count == 0 || region.end() > geom.blocks {
            return Err(FtlError::OutOfRange);
        }
        let gc_ratio = gc_ratio.max(1);
        let ppb = geom.pages_per_block;

        let sectors = region.count as usize * ppb as usize;
        let mut l2p = vec![None; sectors].into_boxed_slice();
        let mut seqs = vec![0u64; sectors];
        let mut live = vec![0u32; region.count as usize].into_boxed_slice();
        let mut spare = vec![0u8; geom.spare_per_page];

        let mut good = 0u32;
        let mut top: Option<(u64, u32)> = None; // (seq, page)

        for block in region.start..region.end() {
            if store.is_bad(block) {
                continue;
            }
            good += 1;
            let rel = (block - region.start) as usize;

            let mut next_page = 0;
            for pg in 0..ppb {
                let page = geom.page_addr(block, pg);
                match store.read_spare(page, &mut spare) {
                    Ok(()) if spare.is_erased() => break,
                    Ok(()) => {
                        next_page = pg + 1;
                        let Some(meta) = PageMeta::decode(&spare) else {
                            // Torn or foreign page: consumed, holds nothing.
                            continue;
                        };
                        let sector = meta.sector as usize;
                        if sector >= l2p.len() {
                            warn!("page {page} claims out-of-pool sector {sector}");
                            continue;
                        }
                        // Highest sequence wins. Equal sequences only occur
                        // for identical copies, so the tie-break is free.
                        if l2p[sector].is_none() || meta.seq >= seqs[sector] {
                            if let Some(old) = l2p[sector] {
                                let (ob, _) = geom.split(old);
                                live[(ob - region.start) as usize] -= 1;
                            }
                            l2p[sector] = Some(page);
                            seqs[sector] = meta.seq;
                            live[rel] += 1;
                        }
                        if top.map_or(true, |(s, _)| meta.seq >= s) {
                            top = Some((meta.seq, page));
                        }
                    }
                    Err(e) => {
                        // Unreadable spare: the page is consumed and dead.
                        debug!("spare of page {page} unreadable during resume: {e}");
                        next_page = pg + 1;
                    }
                }
            }
            store.set_next_page(block, next_page);
        }

        let reserve = (region.count / gc_ratio as u32).max(2);
        if good <= reserve {
            error!(
                "pool of {} blocks has only {good} good ones (reserve {reserve})",
                region.count
            );
            return Err(FtlError::Full);
        }
        let capacity = ((good - reserve) * ppb).min(sectors as u32);

        let (seq, head, cursor, last_page) = match top {
            Some((seq, page)) => {
                let (block, _) = geom.split(page);
                let head = (store.next_page(block) < ppb).then_some(block);
                (seq + 1, head, block - region.start, Some(page))
            }
            None => (0, None, 0, None),
        };

        Ok(Self {
            geom,
            region,
            reserve,
            capacity,
            l2p,
            live,
            head,
            cursor,
            seq,
            last_page,
            spare_buf: spare,
        })
    }

    /// Advertised number of sectors.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Read one sector. Unwritten sectors read as the erased pattern.
    pub fn read<N: RawNand>(
        &mut self,
        store: &mut PageStore<N>,
        sector: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        if sector >= self.capacity {
            return Err(FtlError::OutOfRange);
        }
        if buf.len() != self.geom.bytes_per_page {
            return Err(FtlError::Misaligned);
        }
        match self.l2p[sector as usize] {
            Some(page) => store.read(page, 0, self.geom.bytes_per_page, buf),
            None => {
                buf.fill(0xFF);
                Ok(())
            }
        }
    }

    /// Write one sector, allocating forward at the head block.
    ///
    /// Blocks that refuse the program are evacuated and retired, and the
    /// write is retried elsewhere until it lands or the pool is exhausted.
    pub fn write<N: RawNand>(
        &mut self,
        store: &mut PageStore<N>,
        sector: u32,
        buf: &[u8],
    ) -> Result<()> {
        if sector >= self.capacity {
            return Err(FtlError::OutOfRange);
        }
        if buf.len() != self.geom.bytes_per_page {
            return Err(FtlError::Misaligned);
        }

        loop {
            let block = self.ensure_head(store)?;
            let page = self.geom.page_addr(block, store.next_page(block));
            PageMeta::new(sector, self.seq).encode(&mut self.spare_buf)?;
            match store.program(page, buf, &self.spare_buf) {
                Ok(()) => {
                    self.map_sector(sector, Some(page));
                    self.seq += 1;
                    self.last_page = Some(page);
                    return Ok(());
                }
                Err(FtlError::BadBlock { block: bad }) => {
                    warn!("blk[{bad}] refused a program; retiring it");
                    self.retire(store, bad)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop a sector's mapping. A later read returns the erased pattern.
    pub fn trim(&mut self, sector: u32) -> Result<()> {
        if sector >= self.capacity {
            return Err(FtlError::OutOfRange);
        }
        self.map_sector(sector, None);
        Ok(())
    }

    /// Re-read the most recently programmed page header and confirm it still
    /// decodes. Called after every shim write, and once at registration where
    /// a failure is fatal to the device.
    pub fn sync<N: RawNand>(&mut self, store: &mut PageStore<N>) -> Result<()> {
        let Some(page) = self.last_page else {
            return Ok(());
        };
        let mut spare = std::mem::take(&mut self.spare_buf);
        let result = store.read_spare(page, &mut spare);
        self.spare_buf = spare;

        match result {
            Ok(()) if PageMeta::decode(&self.spare_buf).is_some() => Ok(()),
            Ok(()) => {
                error!("metadata of page {page} no longer decodes");
                Err(FtlError::CorruptMeta)
            }
            Err(e) => {
                error!("metadata of page {page} unreadable: {e}");
                Err(FtlError::CorruptMeta)
            }
        }
    }

    /// Update `l2p` and the per-block live counts.
    fn map_sector(&mut self, sector: u32, page: Option<u32>) {
        let slot = &mut self.l2p[sector as usize];
        if let Some(old) = slot.take() {
            let (block, _) = self.geom.split(old);
            self.live[(block - self.region.start) as usize] -= 1;
        }
        if let Some(new) = page {
            let (block, _) = self.geom.split(new);
            self.live[(block - self.region.start) as usize] += 1;
            *slot = Some(new);
        }
    }

    /// The sector currently stored at `page`, if its mapping is live.
    fn live_sector_at<N: RawNand>(
        &mut self,
        store: &mut PageStore<N>,
        page: u32,
    ) -> Option<u32> {
        let mut spare = std::mem::take(&mut self.spare_buf);
        let result = store.read_spare(page, &mut spare);
        self.spare_buf = spare;
        if let Err(e) = result {
            warn!("spare of page {page} unreadable during rescue: {e}");
            return None;
        }
        let meta = PageMeta::decode(&self.spare_buf)?;
        (self.l2p.get(meta.sector as usize).copied().flatten() == Some(page))
            .then_some(meta.sector)
    }

    /// Return the block the next program goes to, collecting garbage and
    /// claiming a fresh block as needed.
    fn ensure_head<N: RawNand>(&mut self, store: &mut PageStore<N>) -> Result<u32> {
        loop {
            if let Some(block) = self.head {
                if store.next_page(block) < self.geom.pages_per_block {
                    return Ok(block);
                }
                self.head = None;
            }
            self.collect_garbage(store)?;
            if self.head.is_none() {
                let block = self.claim_free_block(store, None)?;
                self.head = Some(block);
            }
        }
    }

    /// Count reusable (good, no live data, non-head) blocks in the pool.
    fn free_blocks<N: RawNand>(&mut self, store: &mut PageStore<N>) -> u32 {
        let mut free = 0;
        for rel in 0..self.region.count {
            let block = self.region.start + rel;
            if Some(block) == self.head || self.live[rel as usize] != 0 {
                continue;
            }
            if !store.is_bad(block) {
                free += 1;
            }
        }
        free
    }

    /// Run garbage collection until the reserve is satisfied or there is
    /// nothing left to collect.
    fn collect_garbage<N: RawNand>(&mut self, store: &mut PageStore<N>) -> Result<()> {
        while self.free_blocks(store) <= self.reserve {
            if !self.gc_once(store)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Compact the block with the fewest live pages; returns false when no
    /// block is worth collecting.
    fn gc_once<N: RawNand>(&mut self, store: &mut PageStore<N>) -> Result<bool> {
        let mut victim: Option<(u32, u32)> = None; // (block, live)
        for rel in 0..self.region.count {
            let block = self.region.start + rel;
            let live = self.live[rel as usize];
            // Only blocks with superseded pages gain us anything.
            if Some(block) == self.head || live >= store.next_page(block) {
                continue;
            }
            if store.is_bad(block) {
                continue;
            }
            if victim.map_or(true, |(_, l)| live < l) {
                victim = Some((block, live));
            }
        }
        let Some((block, live)) = victim else {
            return Ok(false);
        };

        debug!("collecting blk[{block}] ({live} live pages)");
        self.evacuate(store, block)?;
        match store.erase(block) {
            Ok(()) => (),
            Err(FtlError::BadBlock { .. }) => store.mark_bad(block),
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    /// Evacuate a failing block and mark it bad. Destinations that fail in
    /// turn are queued up and rescued the same way.
    fn retire<N: RawNand>(&mut self, store: &mut PageStore<N>, block: u32) -> Result<()> {
        let mut pending = vec![block];
        while let Some(bad) = pending.pop() {
            if self.head == Some(bad) {
                self.head = None;
            }
            store.mark_bad(bad);
            self.evacuate_retiring(store, bad, &mut pending)?;
        }
        Ok(())
    }

    /// Move every live page out of `block` via the page-copy primitive.
    fn evacuate<N: RawNand>(&mut self, store: &mut PageStore<N>, block: u32) -> Result<()> {
        let mut pending = Vec::new();
        self.evacuate_retiring(store, block, &mut pending)?;
        for bad in pending {
            self.retire(store, bad)?;
        }
        Ok(())
    }

    fn evacuate_retiring<N: RawNand>(
        &mut self,
        store: &mut PageStore<N>,
        block: u32,
        pending: &mut Vec<u32>,
    ) -> Result<()> {
        for pg in 0..store.next_page(block) {
            let src = self.geom.page_addr(block, pg);
            let Some(sector) = self.live_sector_at(store, src) else {
                continue;
            };

            loop {
                let dst_block = match self.copy_target(store, block) {
                    Ok(b) => b,
                    Err(FtlError::Full) => {
                        error!("no space to rescue sector {sector}; mapping dropped");
                        self.map_sector(sector, None);
                        break;
                    }
                    Err(e) => return Err(e),
                };
                let dst = self.geom.page_addr(dst_block, store.next_page(dst_block));
                match store.copy(src, dst) {
                    Ok(()) => {
                        // The copy carries the original header, so the moved
                        // page keeps its sequence number.
                        self.map_sector(sector, Some(dst));
                        self.last_page = Some(dst);
                        break;
                    }
                    Err(FtlError::BadBlock { block: failed }) => {
                        warn!("rescue destination blk[{failed}] failed too");
                        if self.head == Some(failed) {
                            self.head = None;
                        }
                        store.mark_bad(failed);
                        if !pending.contains(&failed) {
                            pending.push(failed);
                        }
                    }
                    Err(FtlError::Ecc { .. }) => {
                        error!("sector {sector} unreadable during rescue; mapping dropped");
                        self.map_sector(sector, None);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Pick (or keep) a destination block for page copies.
    fn copy_target<N: RawNand>(
        &mut self,
        store: &mut PageStore<N>,
        exclude: u32,
    ) -> Result<u32> {
        if let Some(block) = self.head {
            if store.next_page(block) < self.geom.pages_per_block {
                return Ok(block);
            }
            self.head = None;
        }
        let block = self.claim_free_block(store, Some(exclude))?;
        self.head = Some(block);
        Ok(block)
    }

    /// Claim an erased block from the pool, erasing stale dead blocks on the
    /// way; rotates through the pool so erases spread evenly.
    fn claim_free_block<N: RawNand>(
        &mut self,
        store: &mut PageStore<N>,
        exclude: Option<u32>,
    ) -> Result<u32> {
        let n = self.region.count;
        for i in 0..n {
            let rel = (self.cursor + i) % n;
            let block = self.region.start + rel;
            if Some(block) == exclude || Some(block) == self.head {
                continue;
            }
            if self.live[rel as usize] != 0 || store.is_bad(block) {
                continue;
            }

            if store.next_page(block) == 0 && store.is_free(self.geom.page_addr(block, 0)) {
                self.cursor = (rel + 1) % n;
                return Ok(block);
            }
            // Stale content with nothing live in it; erase and reuse.
            match store.erase(block) {
                Ok(()) => {
                    self.cursor = (rel + 1) % n;
                    return Ok(block);
                }
                Err(FtlError::BadBlock { .. }) => {
                    store.mark_bad(block);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(FtlError::Full)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::SimNand;

    const GEOM: NandGeometry = NandGeometry {
        blocks: 16,
        pages_per_block: 4,
        bytes_per_page: 64,
        spare_per_page: 32,
    };

    const POOL: BlockRange = BlockRange { start: 0, count: 16 };

    fn pattern(sector: u32, round: u8) -> Vec<u8> {
        (0..GEOM.bytes_per_page)
            .map(|i| (i as u8) ^ (sector as u8) ^ round.rotate_left(3))
            .collect()
    }

    fn fresh(sim: &mut SimNand) -> (PageStore<&mut SimNand>, SectorMap) {
        let mut store = PageStore::new(sim).unwrap();
        let map = SectorMap::resume(&mut store, POOL, DEFAULT_GC_RATIO).unwrap();
        (store, map)
    }

    #[test]
    fn test_capacity_reserves_blocks() {
        let mut sim = SimNand::new(GEOM);
        let (_, map) = fresh(&mut sim);
        // 16 blocks, ratio 4 -> 4 reserved, 12 * 4 pages advertised.
        assert_eq!(map.capacity(), 48);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut sim = SimNand::new(GEOM);
        let (mut store, mut map) = fresh(&mut sim);

        for sector in [0u32, 1, 7, 40] {
            map.write(&mut store, sector, &pattern(sector, 0)).unwrap();
        }

        let mut buf = vec![0u8; GEOM.bytes_per_page];
        for sector in [0u32, 1, 7, 40] {
            map.read(&mut store, sector, &mut buf).unwrap();
            assert_eq!(buf, pattern(sector, 0));
        }

        // Never-written sectors read as the erased pattern.
        map.read(&mut store, 30, &mut buf).unwrap();
        assert!(buf.is_erased());

        assert!(matches!(
            map.read(&mut store, map.capacity(), &mut buf),
            Err(FtlError::OutOfRange)
        ));
    }

    #[test]
    fn test_overwrite_takes_latest() {
        let mut sim = SimNand::new(GEOM);
        let (mut store, mut map) = fresh(&mut sim);

        map.write(&mut store, 3, &pattern(3, 0)).unwrap();
        map.write(&mut store, 3, &pattern(3, 1)).unwrap();

        let mut buf = vec![0u8; GEOM.bytes_per_page];
        map.read(&mut store, 3, &mut buf).unwrap();
        assert_eq!(buf, pattern(3, 1));
    }

    #[test]
    fn test_trim_unmaps() {
        let mut sim = SimNand::new(GEOM);
        let (mut store, mut map) = fresh(&mut sim);

        map.write(&mut store, 5, &pattern(5, 0)).unwrap();
        map.trim(5).unwrap();

        let mut buf = vec![0u8; GEOM.bytes_per_page];
        map.read(&mut store, 5, &mut buf).unwrap();
        assert!(buf.is_erased());
    }

    #[test]
    fn test_gc_keeps_data_intact() {
        let mut sim = SimNand::new(GEOM);
        let (mut store, mut map) = fresh(&mut sim);

        // 10 sectors rewritten 10 times = 100 programs on a 64-page device;
        // garbage collection must reclaim superseded pages along the way.
        let mut last = [0u8; 10];
        for round in 0..10u8 {
            for sector in 0..10u32 {
                map.write(&mut store, sector, &pattern(sector, round))
                    .unwrap();
                last[sector as usize] = round;
            }
        }

        let mut buf = vec![0u8; GEOM.bytes_per_page];
        for sector in 0..10u32 {
            map.read(&mut store, sector, &mut buf).unwrap();
            assert_eq!(buf, pattern(sector, last[sector as usize]));
        }
        assert!(store.nand_mut().stats().erases > 0);
    }

    #[test]
    fn test_resume_rebuilds_mapping() {
        let mut sim = SimNand::new(GEOM);
        {
            let (mut store, mut map) = fresh(&mut sim);
            for sector in 0..8u32 {
                map.write(&mut store, sector, &pattern(sector, 0)).unwrap();
            }
            map.write(&mut store, 2, &pattern(2, 9)).unwrap();
        }

        // "Reboot": fresh store and map over the same chip contents.
        let (mut store, mut map) = fresh(&mut sim);
        let mut buf = vec![0u8; GEOM.bytes_per_page];
        for sector in 0..8u32 {
            let round = if sector == 2 { 9 } else { 0 };
            map.read(&mut store, sector, &mut buf).unwrap();
            assert_eq!(buf, pattern(sector, round));
        }

        // New writes continue after the old log rather than colliding.
        map.write(&mut store, 1, &pattern(1, 5)).unwrap();
        map.read(&mut store, 1, &mut buf).unwrap();
        assert_eq!(buf, pattern(1, 5));
    }

    #[test]
    fn test_resume_skips_torn_page() {
        let mut sim = SimNand::new(GEOM);
        {
            let (mut store, mut map) = fresh(&mut sim);
            map.write(&mut store, 0, &pattern(0, 0)).unwrap();
            map.write(&mut store, 1, &pattern(1, 0)).unwrap();
        }

        // Simulate a program interrupted by power loss: data present, header
        // garbage. It must be treated as consumed but dead.
        let torn_data = vec![0xABu8; GEOM.bytes_per_page];
        let torn_spare = vec![0x13u8; GEOM.spare_per_page];
        sim.program_page(2, &torn_data, &torn_spare).unwrap();

        let (mut store, mut map) = fresh(&mut sim);
        let mut buf = vec![0u8; GEOM.bytes_per_page];
        map.read(&mut store, 0, &mut buf).unwrap();
        assert_eq!(buf, pattern(0, 0));
        map.read(&mut store, 1, &mut buf).unwrap();
        assert_eq!(buf, pattern(1, 0));

        // The torn page is never handed out again.
        map.write(&mut store, 2, &pattern(2, 1)).unwrap();
        map.read(&mut store, 2, &mut buf).unwrap();
        assert_eq!(buf, pattern(2, 1));
    }

    #[test]
    fn test_resume_excludes_bad_blocks_from_capacity() {
        let mut sim = SimNand::new(GEOM);
        sim.set_factory_bad(0);
        sim.set_factory_bad(9);
        let (_, map) = fresh(&mut sim);
        // 14 good blocks minus the 4-block reserve.
        assert_eq!(map.capacity(), 40);
    }

    #[test]
    fn test_program_failure_relocates_and_retires() {
        let mut sim = SimNand::new(GEOM);
        sim.break_programs(0);
        let (mut store, mut map) = fresh(&mut sim);

        // The first claim lands on block 0, which refuses the program; the
        // write must end up elsewhere and block 0 must be retired.
        map.write(&mut store, 0, &pattern(0, 0)).unwrap();

        let mut buf = vec![0u8; GEOM.bytes_per_page];
        map.read(&mut store, 0, &mut buf).unwrap();
        assert_eq!(buf, pattern(0, 0));
        assert!(store.is_bad(0));
    }

    #[test]
    fn test_sync_validates_last_program() {
        let mut sim = SimNand::new(GEOM);
        let (mut store, mut map) = fresh(&mut sim);

        // Nothing written yet: sync is trivially clean.
        map.sync(&mut store).unwrap();

        map.write(&mut store, 4, &pattern(4, 0)).unwrap();
        map.sync(&mut store).unwrap();

        // Corrupt the page the head points at; sync must notice.
        store.nand_mut().break_page_ecc(0);
        assert!(matches!(
            map.sync(&mut store),
            Err(FtlError::CorruptMeta)
        ));
    }

    #[test]
    fn test_pool_offset_respected() {
        let mut sim = SimNand::new(GEOM);
        let pool = BlockRange { start: 4, count: 12 };
        let mut store = PageStore::new(&mut sim).unwrap();
        let mut map = SectorMap::resume(&mut store, pool, DEFAULT_GC_RATIO).unwrap();

        for sector in 0..6u32 {
            map.write(&mut store, sector, &pattern(sector, 2)).unwrap();
        }

        // Blocks below the pool stay untouched.
        for block in 0..4 {
            assert_eq!(store.next_page(block), 0);
            assert!(store.is_free(GEOM.page_addr(block, 0)));
        }

        let mut buf = vec![0u8; GEOM.bytes_per_page];
        map.read(&mut store, 3, &mut buf).unwrap();
        assert_eq!(buf, pattern(3, 2));
    }

    #[test]
    fn test_pool_must_fit_device() {
        let mut sim = SimNand::new(GEOM);
        let mut store = PageStore::new(&mut sim).unwrap();
        let pool = BlockRange { start: 8, count: 16 };
        assert!(matches!(
            SectorMap::resume(&mut store, pool, DEFAULT_GC_RATIO),
            Err(FtlError::OutOfRange)
        ));
    }
}
