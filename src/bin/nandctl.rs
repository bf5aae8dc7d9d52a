//! Bring-up tool for SPI-NAND devices.
//!
//! Exercises the raw device (write/read/erase/erase-all/stress) and the full
//! wear-leveling stack (ftl-stress) against either a real Linux MTD device or
//! a file-backed simulated NAND, so a new board or a driver change can be
//! checked without any filesystem on top.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

#[cfg(target_os = "linux")]
use spinand_ftl::nand::mtd::MtdNand;
use spinand_ftl::{
    blockdev::{Storage, StorageOptions},
    nand::{NandGeometry, PageUtil, RawNand, SimNand},
    part::{Access, PartitionEntry, PartitionKind, PartitionTable},
    wear::map::BlockRange,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate (BLOCKSxPAGESxBYTES[xSPARE])
    #[clap(long)]
    sim_layout: Option<NandGeometry>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(geom) = self.sim_layout {
            let mut sim = SimNand::new(geom);
            if let Some(path) = self.sim_path.as_ref().filter(|p| p.exists()) {
                sim.load(&mut File::open(path)?)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the chip identification bytes
    Id,

    /// Program a test pattern into a page range
    Write { page: u32, count: u32 },

    /// Read a page range back, dumping the head of each page
    Read { page: u32, count: u32 },

    /// Erase one block
    Erase { block: u32 },

    /// Erase every good block on the device
    EraseAll,

    /// Whole-device program/readback stress on the raw path
    Stress {
        #[clap(default_value_t = 1)]
        loops: u32,
    },

    /// Random sector workload through the wear-leveling stack
    FtlStress {
        /// Number of sector writes to issue
        #[clap(default_value_t = 1000)]
        writes: u64,

        /// First block of the wear-leveled pool
        #[clap(long, default_value_t = 0)]
        pool_start: u32,

        /// Pool size in blocks (default: the rest of the device)
        #[clap(long)]
        pool_blocks: Option<u32>,
    },
}

/// Print the first bytes of a buffer, spinand-test style.
fn dump_head(tag: &str, page: u32, bytes: &[u8]) {
    let head: Vec<String> = bytes.iter().take(16).map(|b| format!("{b:02x}")).collect();
    println!("{tag} page {page}: {}", head.join(" "));
}

fn pattern_byte(page: u32, i: usize, salt: u32) -> u8 {
    (i as u8) ^ (page as u8) ^ (salt as u8).rotate_left(5)
}

fn erase_all<N: RawNand>(nand: &mut N) -> Result<u32> {
    let geom = nand.geometry();
    let rpt = howudoin::new()
        .label("Erasing blocks")
        .set_len(u64::from(geom.blocks));

    let mut skipped = 0;
    for block in 0..geom.blocks {
        if nand.is_bad(block)? {
            skipped += 1;
        } else {
            nand.erase_block(block)?;
        }
        rpt.inc();
    }
    rpt.close();

    if skipped > 0 {
        println!("skipped {skipped} bad block(s)");
    }
    Ok(skipped)
}

fn raw_stress<N: RawNand>(nand: &mut N, loops: u32) -> Result<()> {
    let geom = nand.geometry();
    let mut data = vec![0u8; geom.bytes_per_page];
    let mut spare = vec![0u8; geom.spare_per_page];
    let erased_spare = vec![0xFFu8; geom.spare_per_page];

    for salt in 0..loops {
        erase_all(nand)?;

        let rpt = howudoin::new()
            .label("Programming blocks")
            .set_len(u64::from(geom.blocks));
        for block in 0..geom.blocks {
            if !nand.is_bad(block)? {
                for pg in 0..geom.pages_per_block {
                    let page = geom.page_addr(block, pg);
                    for (i, b) in data.iter_mut().enumerate() {
                        *b = pattern_byte(page, i, salt);
                    }
                    nand.program_page(page, &data, &erased_spare)?;
                }
            }
            rpt.inc();
        }
        rpt.close();

        let rpt = howudoin::new()
            .label("Verifying blocks")
            .set_len(u64::from(geom.blocks));
        for block in 0..geom.blocks {
            if !nand.is_bad(block)? {
                for pg in 0..geom.pages_per_block {
                    let page = geom.page_addr(block, pg);
                    nand.read_page(page, &mut data, &mut spare)?;
                    for (i, &b) in data.iter().enumerate() {
                        let want = pattern_byte(page, i, salt);
                        anyhow::ensure!(
                            b == want,
                            "mismatch at page {page} + {i:#x}: wrote {want:#04x}, read {b:#04x}"
                        );
                    }
                }
            }
            rpt.inc();
        }
        rpt.close();

        println!("stress pass {}/{loops} clean", salt + 1);
    }

    Ok(())
}

fn ftl_stress<N: RawNand>(
    nand: &mut N,
    writes: u64,
    pool_start: u32,
    pool_blocks: Option<u32>,
) -> Result<()> {
    let geom = nand.geometry();
    anyhow::ensure!(pool_start < geom.blocks, "pool starts past the device");
    let pool = BlockRange {
        start: pool_start,
        count: pool_blocks.unwrap_or(geom.blocks - pool_start),
    };

    // Half the pool as advertised space leaves the map room to collect even
    // on a worn device.
    let size = pool.count as u64 / 2 * geom.block_size() as u64;
    let table: PartitionTable = [PartitionEntry {
        name: "stress".to_string(),
        offset: 0,
        size,
        kind: PartitionKind::Leveled,
        access: Access::ReadWrite,
    }]
    .into_iter()
    .collect();

    let storage = Storage::register(
        &mut *nand,
        table,
        StorageOptions {
            pool: Some(pool),
            ..Default::default()
        },
    )?;
    let dev = storage.open("stress", Access::ReadWrite)?;
    let dev_geom = dev.geometry();
    println!(
        "stress device: {} sectors of {} bytes",
        dev_geom.sector_count, dev_geom.bytes_per_sector
    );

    let mut rng = SmallRng::seed_from_u64(0x51AB_F1A5);
    let mut shadow: HashMap<u64, u64> = HashMap::new();
    let mut buf = vec![0u8; dev_geom.bytes_per_sector];
    let mut verified = 0u64;

    let fill = |seed: u64, buf: &mut [u8]| SmallRng::seed_from_u64(seed).fill(buf);

    let rpt = howudoin::new().label("Writing sectors").set_len(writes);
    let start = Instant::now();
    for _ in 0..writes {
        let sector = rng.gen_range(0..dev_geom.sector_count);
        let seed = rng.gen();
        fill(seed, &mut buf);
        anyhow::ensure!(dev.write(sector, &buf)? == 1, "short write at {sector}");
        shadow.insert(sector, seed);

        // Spot-check a sector we believe in while the log churns.
        if rng.gen_ratio(1, 4) {
            let (&sector, &seed) = shadow
                .iter()
                .nth(rng.gen_range(0..shadow.len()))
                .unwrap();
            anyhow::ensure!(dev.read(sector, &mut buf)? == 1, "short read at {sector}");
            let mut want = vec![0u8; buf.len()];
            fill(seed, &mut want);
            anyhow::ensure!(buf == want, "readback mismatch at sector {sector}");
            verified += 1;
        }
        rpt.inc();
    }
    rpt.close();

    let rpt = howudoin::new()
        .label("Verifying sectors")
        .set_len(shadow.len() as u64);
    let mut want = vec![0u8; dev_geom.bytes_per_sector];
    for (&sector, &seed) in &shadow {
        anyhow::ensure!(dev.read(sector, &mut buf)? == 1, "short read at {sector}");
        fill(seed, &mut want);
        anyhow::ensure!(buf == want, "final mismatch at sector {sector}");
        verified += 1;
        rpt.inc();
    }
    rpt.close();

    println!(
        "{writes} writes over {} sectors, {verified} verifications, {:.1?} elapsed",
        shadow.len(),
        start.elapsed()
    );
    Ok(())
}

fn run<N: RawNand>(nand: &mut N, command: Command) -> Result<()> {
    let geom = nand.geometry();

    match command {
        Command::Id => match nand.read_id() {
            Ok(id) => {
                let hex: Vec<String> = id.iter().map(|b| format!("{b:02x}")).collect();
                println!("chip id: {}", hex.join(" "));
            }
            Err(e) => println!("chip id unavailable: {e}"),
        },

        Command::Write { page, count } => {
            anyhow::ensure!(
                page + count <= geom.page_count(),
                "write runs past the last page ({})",
                geom.page_count()
            );
            let mut data = vec![0u8; geom.bytes_per_page];
            let spare = vec![0xFFu8; geom.spare_per_page];

            let start = Instant::now();
            for p in page..page + count {
                for (i, b) in data.iter_mut().enumerate() {
                    *b = pattern_byte(p, i, 0);
                }
                nand.program_page(p, &data, &spare)?;
            }
            let elapsed = start.elapsed();
            println!(
                "programmed {count} page(s) in {elapsed:.1?} ({:.0} KiB/s)",
                (count as usize * geom.bytes_per_page) as f64 / 1024.0 / elapsed.as_secs_f64()
            );
        }

        Command::Read { page, count } => {
            anyhow::ensure!(
                page + count <= geom.page_count(),
                "read runs past the last page ({})",
                geom.page_count()
            );
            let mut data = vec![0u8; geom.bytes_per_page];
            let mut spare = vec![0u8; geom.spare_per_page];

            for p in page..page + count {
                match nand.read_page(p, &mut data, &mut spare) {
                    Ok(()) if data.is_erased() => println!("read page {p}: erased"),
                    Ok(()) => dump_head("read", p, &data),
                    Err(e) => println!("read page {p}: {e}"),
                }
            }
        }

        Command::Erase { block } => {
            anyhow::ensure!(block < geom.blocks, "block {block} out of range");
            let start = Instant::now();
            nand.erase_block(block)?;
            println!("erased block {block} in {:.1?}", start.elapsed());
        }

        Command::EraseAll => {
            erase_all(nand)?;
            println!("erase all finished");
        }

        Command::Stress { loops } => raw_stress(nand, loops)?,

        Command::FtlStress {
            writes,
            pool_start,
            pool_blocks,
        } => ftl_stress(nand, writes, pool_start, pool_blocks)?,
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[clap(about, version)]
struct Cli {
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let cli = Cli::parse();
    let mut nand = cli.nand.open()?;

    match &mut nand {
        NandImpl::Sim(n) => run(n, cli.command)?,

        #[cfg(target_os = "linux")]
        NandImpl::Mtd(n) => run(n, cli.command)?,
    }

    cli.nand.cleanup(nand)?;
    Ok(())
}
