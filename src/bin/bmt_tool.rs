//! A tool for inspecting and maintaining the bad-block remapping tables on a NAND device.
//!
//! It works against a NAND image file just as well as against a real MTD device, which makes it
//! handy for poking at images pulled off of a board.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing::Level;

use std::fs::File;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nand_bmt::nand::mtd::MtdNand;
use nand_bmt::{
    bmt::{attach, Bmt, OobRemap},
    config::{BmtConfig, RemapRange},
    error::Result as FlashResult,
    nand::{Flash, FlashLayout, SimNand},
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

    /// Path to the NAND image (page data followed by OOB, for every page) to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTESxOOB
    #[clap(long)]
    sim_layout: Option<FlashLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            return Ok(NandImpl::Sim(sim));
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(name) = &self.mtd_name {
                return Ok(NandImpl::Mtd(MtdNand::open_named(name)?));
            } else if let Some(dev) = &self.mtd_dev {
                return Ok(NandImpl::Mtd(MtdNand::open(dev)?));
            }
        }

        bail!("no NAND device given")
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

impl Flash for NandImpl {
    fn layout(&self) -> FlashLayout {
        match self {
            Self::Sim(nand) => nand.layout(),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.layout(),
        }
    }

    fn read_page(
        &mut self,
        block: u32,
        page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> FlashResult<u32> {
        match self {
            Self::Sim(nand) => nand.read_page(block, page, data, oob),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.read_page(block, page, data, oob),
        }
    }

    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> FlashResult<()> {
        match self {
            Self::Sim(nand) => nand.write_page(block, page, data, oob),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.write_page(block, page, data, oob),
        }
    }

    fn urgent_write(&mut self, addr: u64, data: &[u8]) -> FlashResult<()> {
        match self {
            Self::Sim(nand) => nand.urgent_write(addr, data),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.urgent_write(addr, data),
        }
    }

    fn erase(&mut self, block: u32) -> FlashResult<()> {
        match self {
            Self::Sim(nand) => nand.erase(block),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.erase(block),
        }
    }

    fn is_bad(&mut self, block: u32) -> FlashResult<bool> {
        match self {
            Self::Sim(nand) => nand.is_bad(block),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.is_bad(block),
        }
    }

    fn mark_bad(&mut self, block: u32) -> FlashResult<()> {
        match self {
            Self::Sim(nand) => nand.mark_bad(block),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.mark_bad(block),
        }
    }
}

#[derive(Args, Debug)]
struct RemapOptions {
    /// Pass all I/O straight through to the device instead of remapping
    #[clap(long)]
    no_remap: bool,

    /// Byte range of the device eligible for remapping, as START-END (may be repeated)
    #[clap(long = "range")]
    ranges: Vec<RemapRange>,

    /// Relocate blocks whose reads needed this many bitflips corrected; 0 never does
    #[clap(long, default_value_t = 0)]
    bitflip_threshold: u32,
}

impl From<&RemapOptions> for BmtConfig {
    fn from(value: &RemapOptions) -> Self {
        BmtConfig {
            enabled: !value.no_remap,
            ranges: value.ranges.clone(),
            bitflip_threshold: value.bitflip_threshold,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the pool geometry and where the tables are stored.
    ///
    /// Like every command that attaches, this rebuilds and stores the tables if none are found.
    Info,

    /// Print every entry of both tables (rebuilding them first if none are found)
    Tables,

    /// Print each block's bad status and remap metadata; this is a read-only operation
    Scan,

    /// Rebuild both tables from the metadata in OOB, and store them
    Rebuild,

    /// Retire a logical block, moving it onto a spare
    MarkBad {
        /// The logical block to retire
        block: u32,
    },

    /// Read a page through the remapper, and dump it
    Read {
        /// The logical block to read from
        block: u32,

        /// The page within that block
        page: u32,
    },
}

impl Command {
    fn execute(self, nand: NandImpl, config: BmtConfig) -> Result<NandImpl> {
        let nand = match self {
            Command::Info => {
                let attached = attach(nand, config)?;
                match attached.bmt() {
                    Some(bmt) => print_info(bmt),
                    None => println!("Remapping disabled"),
                }
                attached.into_inner()
            }

            Command::Tables => {
                let attached = attach(nand, config)?;
                match attached.bmt() {
                    Some(bmt) => print_tables(bmt),
                    None => println!("Remapping disabled"),
                }
                attached.into_inner()
            }

            Command::Scan => {
                let mut nand = nand;
                scan(&mut nand)?;
                nand
            }

            Command::Rebuild => {
                let mut attached = attach(nand, config)?;
                match attached.bmt_mut() {
                    Some(bmt) => {
                        bmt.rebuild()?;
                        print_info(bmt);
                    }
                    None => println!("Remapping disabled; nothing rebuilt"),
                }
                attached.into_inner()
            }

            Command::MarkBad { block } => {
                let mut attached = attach(nand, config)?;
                attached.mark_bad(block)?;
                if let Some(bmt) = attached.bmt() {
                    println!("Block {block} now served by {}", bmt.resolve(block)?);
                }
                attached.into_inner()
            }

            Command::Read { block, page } => {
                let mut attached = attach(nand, config)?;
                let layout = attached.layout();
                let mut data = vec![0; layout.bytes_per_page];
                let mut oob = vec![0; layout.oob_bytes];

                let bitflips = attached.read_page(block, page, &mut data, &mut oob)?;
                println!("Bitflips corrected: {bitflips}");
                hexdump(&data);
                println!("OOB:");
                hexdump(&oob);

                attached.into_inner()
            }
        };

        Ok(nand)
    }
}

fn print_info<F: Flash>(bmt: &Bmt<F>) {
    let geometry = bmt.geometry();
    let show = |block: Option<u32>| block.map_or("(none)".to_string(), |b| b.to_string());

    println!("Total blocks:  {}", geometry.total_blocks);
    println!("System blocks: {}", geometry.system_blocks);
    println!("Pool blocks:   {}", geometry.pool_blocks);
    println!("Capacity:      {}", bmt.capacity());
    println!("BBT block:     {}", show(bmt.bbt_block()));
    println!("BMT block:     {}", show(bmt.bmt_block()));
    println!("Bad blocks:    {}", bmt.bad_blocks().len());
    println!("Remapped:      {}", bmt.remap_table().len());
}

fn print_tables<F: Flash>(bmt: &Bmt<F>) {
    println!("BBT ({} entries):", bmt.bad_blocks().len());
    for block in bmt.bad_blocks().entries() {
        println!("{block:5}");
    }
    println!("BMT ({} entries):", bmt.remap_table().len());
    for entry in bmt.remap_table().entries() {
        println!("{:5} => {:5}", entry.from, entry.to);
    }
}

fn scan<F: Flash>(nand: &mut F) -> Result<()> {
    let blocks = nand.layout().blocks;
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(blocks));

    let mut status = Vec::with_capacity(blocks as usize);
    for block in 0..blocks {
        let bad = nand.is_bad(block)?;
        let mut oob = [0xFF; 4];
        let meta = nand
            .read_page(block, 0, &mut [], &mut oob)
            .map(|_| OobRemap::decode(&oob));
        status.push((block, bad, meta));
        rpt.inc();
    }

    rpt.close();

    for (block, bad, meta) in status {
        let bad = if bad { "bad" } else { "ok" };
        match meta {
            Ok(meta) => println!("{block:5} => {bad:3} {meta:?}"),
            Err(e) => println!("{block:5} => {bad:3} ({e})"),
        }
    }

    Ok(())
}

fn hexdump(bytes: &[u8]) {
    for (i, line) in bytes.chunks(16).enumerate() {
        let hex: Vec<_> = line.iter().map(|x| format!("{x:02x}")).collect();
        println!("{:06x}: {}", i * 16, hex.join(" "));
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// How remapping is configured
    #[clap(flatten)]
    remap: RemapOptions,

    /// Log every per-block decision
    #[clap(short, long)]
    verbose: bool,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let nand = args.cmd.execute(nand, BmtConfig::from(&args.remap))?;
    args.nand.cleanup(nand)?;
    Ok(())
}
