//! This module implements bad-block remapping on top of a raw [Flash] device.
//!
//! The tail of the device is held back as a reserved pool; everything in front of it is the
//! system region that callers address through logical block numbers:
//!
//! ```text
//! 0                                   system_blocks                        total_blocks
//! +-----------------------------------+----------------------------------------+
//! |  system region (logical blocks)   | BBT -> spares ...           ... <- BMT |
//! +-----------------------------------+----------------------------------------+
//! ```
//!
//! Factory-bad system blocks are listed in the raw-bad-block table (BBT) and skipped when logical
//! numbers are assigned. A system block that fails later is relocated to a spare from the pool,
//! and the block-remap table (BMT) records where it went. Both tables live in page 0 of a pool
//! block each, and every relocated block carries its logical number in its OOB area (see
//! [oob]), so the tables can be rebuilt if both stored copies are ever lost.
//!
//! [Bmt] implements [Flash] itself, taking logical block numbers and absorbing media errors by
//! relocating the failing block and retrying.

mod geometry;
pub mod oob;
mod persist;
mod pool;
mod remap;
mod shim;
pub mod tables;

use tracing::info;

use crate::config::BmtConfig;
use crate::error::Result;
use crate::nand::{Flash, FlashLayout};

pub use geometry::{Geometry, GoodBlockIndex};
pub use oob::OobRemap;
pub use tables::{BadBlockTable, MapEntry, RemapTable};

/// Most entries either table can hold
pub const MAX_TABLE_SIZE: usize = 250;

/// Share of the device, in percent, that the pool should hold in good blocks
pub const POOL_GOOD_PERCENT: u32 = 8;

/// Share of the device, in percent, that may be scanned while looking for those good blocks
pub const POOL_SCAN_PERCENT: u32 = 10;

/// Attempts made by a relocation, and by each shim operation, before giving up
pub const RETRY_LIMIT: usize = 10;

/// Which way a scan over the pool walks
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// From `system_blocks` toward the end of the device
    Forward,
    /// From the end of the device toward `system_blocks`
    Backward,
}

impl Direction {
    fn step(self, block: u32) -> Option<u32> {
        match self {
            Direction::Forward => block.checked_add(1),
            Direction::Backward => block.checked_sub(1),
        }
    }
}

/// One remapping session over an attached flash device
#[derive(Debug)]
pub struct Bmt<F: Flash> {
    flash: F,
    layout: FlashLayout,
    geometry: Geometry,
    config: BmtConfig,

    bbt: BadBlockTable,
    remap: RemapTable,
    pbbt: GoodBlockIndex,

    /// Pool blocks currently holding the stored tables
    bbt_block: Option<u32>,
    bmt_block: Option<u32>,

    page_buf: Vec<u8>,
    oob_buf: Vec<u8>,
}

impl<F: Flash> Bmt<F> {
    /// Take over `flash`: carve out the pool, then load the stored tables or rebuild them.
    pub fn attach(mut flash: F, config: BmtConfig) -> Result<Self> {
        let layout = flash.layout();
        let geometry = Geometry::probe(&mut flash)?;

        let bbt = BadBlockTable::default();
        let pbbt = GoodBlockIndex::new(geometry.system_blocks, &bbt);
        let mut bmt = Self {
            flash,
            layout,
            geometry,
            config,
            bbt,
            remap: RemapTable::default(),
            pbbt,
            bbt_block: None,
            bmt_block: None,
            page_buf: vec![0xFF; layout.bytes_per_page],
            oob_buf: vec![0xFF; layout.oob_bytes],
        };
        bmt.load_tables()?;

        info!(
            system_blocks = geometry.system_blocks,
            pool_blocks = geometry.pool_blocks,
            capacity = bmt.capacity(),
            bad = bmt.bbt.len(),
            remapped = bmt.remap.len(),
            "attached"
        );
        Ok(bmt)
    }

    /// Give back the underlying device
    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn config(&self) -> &BmtConfig {
        &self.config
    }

    pub fn bad_blocks(&self) -> &BadBlockTable {
        &self.bbt
    }

    pub fn remap_table(&self) -> &RemapTable {
        &self.remap
    }

    /// Where the BBT is currently stored, if anywhere
    pub fn bbt_block(&self) -> Option<u32> {
        self.bbt_block
    }

    /// Where the BMT is currently stored, if anywhere
    pub fn bmt_block(&self) -> Option<u32> {
        self.bmt_block
    }

    /// Number of logical blocks backed by a good system block
    pub fn capacity(&self) -> u32 {
        self.pbbt.len()
    }

    fn read_oob(&mut self, block: u32) -> Result<OobRemap> {
        let mut oob = [0xFF; oob::OOB_REMAP_BYTES];
        self.flash.read_page(block, 0, &mut [], &mut oob)?;
        Ok(OobRemap::decode(&oob))
    }

    fn write_oob(&mut self, block: u32, oob: OobRemap) -> Result<()> {
        self.flash.write_page(block, 0, &[], &oob.encode())
    }
}

/// The on-media form of a block number. [Geometry::probe] refuses devices with more blocks than
/// fit, so this never truncates.
fn tag(block: u32) -> u16 {
    block as u16
}

/// A flash device as handed to the layers above, remapped unless remapping was disabled
#[derive(Debug)]
pub enum Attached<F: Flash> {
    Passthrough(F),
    Remapped(Bmt<F>),
}

/// Attach the remapper to `flash` according to `config`
pub fn attach<F: Flash>(flash: F, config: BmtConfig) -> Result<Attached<F>> {
    if !config.enabled {
        info!("remapping disabled; passing all I/O through");
        return Ok(Attached::Passthrough(flash));
    }

    Bmt::attach(flash, config).map(Attached::Remapped)
}

impl<F: Flash> Attached<F> {
    /// The remapping session, if there is one
    pub fn bmt(&self) -> Option<&Bmt<F>> {
        match self {
            Attached::Passthrough(_) => None,
            Attached::Remapped(bmt) => Some(bmt),
        }
    }

    pub fn bmt_mut(&mut self) -> Option<&mut Bmt<F>> {
        match self {
            Attached::Passthrough(_) => None,
            Attached::Remapped(bmt) => Some(bmt),
        }
    }

    pub fn into_inner(self) -> F {
        match self {
            Attached::Passthrough(flash) => flash,
            Attached::Remapped(bmt) => bmt.into_inner(),
        }
    }
}

impl<F: Flash> Flash for Attached<F> {
    fn layout(&self) -> FlashLayout {
        match self {
            Attached::Passthrough(flash) => flash.layout(),
            Attached::Remapped(bmt) => bmt.layout(),
        }
    }

    fn read_page(
        &mut self,
        block: u32,
        page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> Result<u32> {
        match self {
            Attached::Passthrough(flash) => flash.read_page(block, page, data, oob),
            Attached::Remapped(bmt) => bmt.read_page(block, page, data, oob),
        }
    }

    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        match self {
            Attached::Passthrough(flash) => flash.write_page(block, page, data, oob),
            Attached::Remapped(bmt) => bmt.write_page(block, page, data, oob),
        }
    }

    fn urgent_write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        match self {
            Attached::Passthrough(flash) => flash.urgent_write(addr, data),
            Attached::Remapped(bmt) => bmt.urgent_write(addr, data),
        }
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        match self {
            Attached::Passthrough(flash) => flash.erase(block),
            Attached::Remapped(bmt) => bmt.erase(block),
        }
    }

    fn is_bad(&mut self, block: u32) -> Result<bool> {
        match self {
            Attached::Passthrough(flash) => flash.is_bad(block),
            Attached::Remapped(bmt) => bmt.is_bad(block),
        }
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        match self {
            Attached::Passthrough(flash) => flash.mark_bad(block),
            Attached::Remapped(bmt) => bmt.mark_bad(block),
        }
    }
}
