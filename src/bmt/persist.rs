//! Loading the stored tables at attach time, rebuilding them from OOB metadata when they can't be
//! found, and writing them back after every change.

use tracing::{debug, info, warn};

use super::{BadBlockTable, Bmt, Direction, GoodBlockIndex, RemapTable};
use crate::error::{BmtError, Result};
use crate::nand::Flash;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Table {
    BadBlocks,
    Remap,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::BadBlocks => "BBT",
            Table::Remap => "BMT",
        }
    }
}

impl<F: Flash> Bmt<F> {
    pub(super) fn load_tables(&mut self) -> Result<()> {
        let bbt = self.locate_bbt()?;
        let bmt = self.locate_bmt()?;

        match (bbt, bmt) {
            (Some((bbt_block, bbt)), Some((bmt_block, remap))) => {
                debug!(bbt_block, bmt_block, "found stored tables");
                self.pbbt = GoodBlockIndex::new(self.geometry.system_blocks, &bbt);
                self.bbt = bbt;
                self.remap = remap;
                self.bbt_block = Some(bbt_block);
                self.bmt_block = Some(bmt_block);
                Ok(())
            }
            (bbt, bmt) => {
                let missing = match (bbt, bmt) {
                    (None, None) => "BBT and BMT",
                    (None, _) => "BBT",
                    _ => "BMT",
                };
                let cause = BmtError::TableCorrupt(missing);
                info!(%cause, "rebuilding tables from OOB metadata");
                self.rebuild()
            }
        }
    }

    /// Read page 0 of `block` into the page buffer, returning whether it should be considered
    fn read_table_page(&mut self, block: u32) -> Result<bool> {
        match self
            .flash
            .read_page(block, 0, &mut self.page_buf, &mut self.oob_buf)
        {
            Ok(_) => Ok(!super::OobRemap::decode(&self.oob_buf).is_bad()),
            Err(e) if e.is_media_error() => {
                debug!(block, %e, "unreadable table candidate");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// The first valid BBT, scanning forward from the start of the pool
    fn locate_bbt(&mut self) -> Result<Option<(u32, BadBlockTable)>> {
        let first = self.geometry.system_blocks;
        let last = self.geometry.total_blocks;
        let rpt = howudoin::new()
            .label("Looking for BBT")
            .set_len(u64::from(last - first));

        let mut found = None;
        for block in first..last {
            rpt.inc();
            if !self.read_table_page(block)? {
                continue;
            }
            if let Some(bbt) = BadBlockTable::decode(&self.page_buf) {
                found = Some((block, bbt));
                break;
            }
        }

        rpt.close();
        Ok(found)
    }

    /// The first valid BMT, scanning backward from the end of the device
    fn locate_bmt(&mut self) -> Result<Option<(u32, RemapTable)>> {
        let system_blocks = self.geometry.system_blocks;
        let last = self.geometry.total_blocks;
        let rpt = howudoin::new()
            .label("Looking for BMT")
            .set_len(u64::from(last - system_blocks - 1));

        let mut found = None;
        for block in (system_blocks + 1..last).rev() {
            rpt.inc();
            if !self.read_table_page(block)? {
                continue;
            }
            if let Some(remap) = RemapTable::decode(&self.page_buf, system_blocks) {
                found = Some((block, remap));
                break;
            }
        }

        rpt.close();
        Ok(found)
    }

    /// Throw away the in-memory tables and rebuild both from the metadata left on the device:
    /// remap targets from the remap field in each pool block's OOB, bad blocks from the
    /// hardware-bad state of each system block. Then store the result.
    pub fn rebuild(&mut self) -> Result<()> {
        let total_blocks = self.geometry.total_blocks;
        let system_blocks = self.geometry.system_blocks;
        let rpt = howudoin::new()
            .label("Rebuilding tables")
            .set_len(u64::from(total_blocks));

        let mut remap = RemapTable::default();
        for block in (system_blocks + 1..total_blocks).rev() {
            rpt.inc();
            if self.flash.is_bad(block)? {
                continue;
            }

            let oob = match self.read_oob(block) {
                Ok(oob) => oob,
                Err(e) if e.is_media_error() => {
                    debug!(block, %e, "unreadable pool block");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(from) = oob
                .remapped
                .map(u32::from)
                .filter(|&from| from < system_blocks)
            else {
                continue;
            };

            if let Some(to) = remap.lookup(from) {
                warn!(from, to, duplicate = block, "block claimed twice; keeping first claim");
                continue;
            }
            debug!(from, to = block, "recovered remap");
            remap.upsert(from, block)?;
        }

        let mut bbt = BadBlockTable::default();
        for block in 0..system_blocks {
            rpt.inc();
            if self.flash.is_bad(block)? && remap.lookup(block).is_none() {
                bbt.push(block)?;
            }
        }
        rpt.close();

        info!(bad = bbt.len(), remapped = remap.len(), "rebuilt tables");
        self.pbbt = GoodBlockIndex::new(system_blocks, &bbt);
        self.bbt = bbt;
        self.remap = remap;
        self.persist()
    }

    /// Write both tables back to the pool, finding homes for them first if they have none.
    ///
    /// A table that cannot be written anywhere is dropped with a warning; it will be rebuilt from
    /// OOB metadata at the next attach.
    pub fn persist(&mut self) -> Result<()> {
        let system_blocks = self.geometry.system_blocks;
        if self.bmt_block.is_none() {
            self.bmt_block = self
                .find_spare(Direction::Backward)?
                .filter(|&block| block > system_blocks);
        }
        if self.bbt_block.is_none() {
            self.bbt_block = self.find_spare(Direction::Forward)?;
        }

        self.bmt_block = self.write_table(Table::Remap)?;
        self.bbt_block = self.write_table(Table::BadBlocks)?;
        Ok(())
    }

    fn write_table(&mut self, table: Table) -> Result<Option<u32>> {
        let mut candidate = match table {
            Table::BadBlocks => self.bbt_block,
            Table::Remap => self.bmt_block,
        };

        self.page_buf.fill(0xFF);
        match table {
            Table::BadBlocks => self.bbt.encode(&mut self.page_buf)?,
            Table::Remap => self.remap.encode(&mut self.page_buf)?,
        }

        while let Some(block) = candidate {
            match self.program_table(block) {
                Ok(()) => {
                    debug!(table = table.name(), block, "stored table");
                    return Ok(Some(block));
                }
                Err(e) if e.is_media_error() => {
                    warn!(table = table.name(), block, %e, "retiring table block");
                    self.flash.mark_bad(block)?;
                    candidate = self.next_table_block(table, block)?;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(table = table.name(), "no usable pool block left; table not stored");
        Ok(None)
    }

    fn program_table(&mut self, block: u32) -> Result<()> {
        self.flash.erase(block)?;
        self.flash.write_page(block, 0, &self.page_buf, &[])
    }

    /// The BMT retreats toward the system region, the BBT toward the end of the device
    fn next_table_block(&mut self, table: Table, failed: u32) -> Result<Option<u32>> {
        let system_blocks = self.geometry.system_blocks;
        match table {
            Table::Remap => match Direction::Backward.step(failed) {
                Some(start) => Ok(self
                    .find_spare_from(start, Direction::Backward)?
                    .filter(|&block| block > system_blocks)),
                None => Ok(None),
            },
            Table::BadBlocks => match Direction::Forward.step(failed) {
                Some(start) => self.find_spare_from(start, Direction::Forward),
                None => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{attach_fresh, TEST_LAYOUT};
    use super::super::{MapEntry, OobRemap};
    use super::*;
    use crate::config::BmtConfig;
    use crate::nand::SimNand;

    fn stored_tables(
        nand: &mut SimNand,
        bbt_block: u32,
        bmt_block: u32,
    ) -> Result<(BadBlockTable, RemapTable)> {
        let mut page = vec![0; TEST_LAYOUT.bytes_per_page];
        nand.read_page(bbt_block, 0, &mut page, &mut [])?;
        let bbt = BadBlockTable::decode(&page).ok_or(BmtError::TableCorrupt("BBT"))?;
        nand.read_page(bmt_block, 0, &mut page, &mut [])?;
        let remap = RemapTable::decode(&page, 942).ok_or(BmtError::TableCorrupt("BMT"))?;
        Ok((bbt, remap))
    }

    #[test]
    fn test_reconstruct() -> Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);

        // Factory-bad system blocks, one of which was remapped before the tables were lost
        for block in [3, 5, 100] {
            nand.mark_bad(block)?;
        }
        for (to, from) in [(1000, 5), (1001, 17), (1010, 600)] {
            nand.write_page(to, 0, &[], &OobRemap::target_of(from).encode())?;
        }

        // Stale, corrupted copies of both tables
        let mut page = vec![0xFF; TEST_LAYOUT.bytes_per_page];
        page[..8].copy_from_slice(b"RAWB\x01\x00\x12\x34");
        nand.write_page(942, 0, &page, &[])?;
        page[..8].copy_from_slice(b"BMT\x01\x01\x77\x00\x00");
        nand.write_page(1023, 0, &page, &[])?;

        let bmt = Bmt::attach(nand, BmtConfig::default())?;
        let mut entries = bmt.remap_table().entries().to_vec();
        entries.sort_by_key(|entry| entry.from);
        assert_eq!(
            entries,
            [
                MapEntry { from: 5, to: 1000 },
                MapEntry { from: 17, to: 1001 },
                MapEntry { from: 600, to: 1010 },
            ]
        );
        assert_eq!(bmt.bad_blocks().entries(), [3, 100]);
        assert_eq!(bmt.capacity(), 940);

        // The rebuilt tables were stored, and re-validate
        let (bbt_block, bmt_block) = (bmt.bbt_block().unwrap(), bmt.bmt_block().unwrap());
        assert_eq!((bbt_block, bmt_block), (942, 1023));
        let bad_blocks = bmt.bad_blocks().clone();
        let remap = bmt.remap_table().clone();

        let mut nand = bmt.into_inner();
        let (stored_bbt, stored_remap) = stored_tables(&mut nand, bbt_block, bmt_block)?;
        assert_eq!(stored_bbt, bad_blocks);
        assert_eq!(stored_remap, remap);

        // And are picked up as-is at the next attach
        let bmt = Bmt::attach(nand, BmtConfig::default())?;
        assert_eq!(bmt.bad_blocks(), &bad_blocks);
        assert_eq!(bmt.remap_table(), &remap);
        assert_eq!(bmt.bbt_block(), Some(bbt_block));
        assert_eq!(bmt.bmt_block(), Some(bmt_block));

        Ok(())
    }

    #[test]
    fn test_duplicate_claims() -> Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.write_page(1005, 0, &[], &OobRemap::target_of(9).encode())?;
        nand.write_page(1015, 0, &[], &OobRemap::target_of(9).encode())?;
        // Forward pointers left in retired blocks name pool blocks, not logical ones
        nand.write_page(1016, 0, &[], &OobRemap::target_of(1005).encode())?;

        let bmt = Bmt::attach(nand, BmtConfig::default())?;
        assert_eq!(bmt.remap_table().entries(), [MapEntry { from: 9, to: 1015 }]);
        Ok(())
    }

    #[test]
    fn test_reconstruct_overflow() -> Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        for block in 0..251 {
            nand.mark_bad(block)?;
        }

        assert!(matches!(
            Bmt::attach(nand, BmtConfig::default()),
            Err(BmtError::CapacityExceeded("BBT"))
        ));
        Ok(())
    }

    #[test]
    fn test_persist_relocates() -> Result<()> {
        let mut bmt = attach_fresh();
        bmt.remap.upsert(4, 980)?;

        bmt.flash.fail_next_erase(1023, 1);
        bmt.flash.fail_next_write(942, 1);
        bmt.persist()?;

        assert_eq!(bmt.bmt_block, Some(1022));
        assert_eq!(bmt.bbt_block, Some(943));
        assert!(bmt.flash.is_bad(1023)?);
        assert!(bmt.flash.is_bad(942)?);

        let (_, remap) = stored_tables(&mut bmt.flash, 943, 1022)?;
        assert_eq!(remap.lookup(4), Some(980));
        Ok(())
    }

    #[test]
    fn test_persist_gives_up() -> Result<()> {
        let mut bmt = attach_fresh();
        for block in 943..1023 {
            bmt.flash.mark_bad(block)?;
        }

        // Nowhere left for the BMT to go, but the flush as a whole still succeeds
        bmt.flash.fail_next_erase(1023, 1);
        bmt.persist()?;
        assert_eq!(bmt.bmt_block, None);
        assert_eq!(bmt.bbt_block, Some(942));

        // A device this worn can't be attached again
        let bmt = Bmt::attach(bmt.into_inner(), BmtConfig::default());
        assert!(matches!(bmt, Err(BmtError::InsufficientPool { .. })));
        Ok(())
    }
}
