//! Relocation of a failing block onto a spare from the pool.

use retry::OperationResult;
use tracing::{debug, info, warn};

use super::{tag, Bmt, Direction, OobRemap, RETRY_LIMIT};
use crate::error::{BmtError, Result};
use crate::nand::{Flash, PageUtil};
use crate::util::bounded;

impl<F: Flash> Bmt<F> {
    /// Move logical block `key`, currently served by `current`, onto a fresh pool block.
    ///
    /// The first `bytes_to_copy` bytes of `current` are carried over (rounded up to whole pages).
    /// `current` is retired and both tables are stored. Returns the replacement.
    pub fn remap(&mut self, key: u32, current: u32, bytes_to_copy: u64) -> Result<u32> {
        let replacement = bounded(RETRY_LIMIT, || {
            self.try_relocate(key, current, bytes_to_copy)
        })?;

        self.remap.upsert(key, replacement)?;
        self.flash.mark_bad(current)?;

        let system_blocks = self.geometry.system_blocks;
        if key < system_blocks {
            if key != current && !self.flash.is_bad(key)? {
                self.flash.mark_bad(key)?;
            }
            if let Err(e) = self.write_oob(key, OobRemap::software_bad()) {
                debug!(key, %e, "could not set software-bad marker");
            }
        }

        let forward = OobRemap {
            remapped: Some(tag(replacement)),
            ..Default::default()
        };
        if let Err(e) = self.write_oob(current, forward) {
            debug!(current, %e, "could not leave forward pointer");
        }

        self.persist()?;

        info!(key, current, replacement, "remapped block");
        Ok(replacement)
    }

    /// One attempt at claiming a spare and moving data onto it
    fn try_relocate(
        &mut self,
        key: u32,
        current: u32,
        bytes_to_copy: u64,
    ) -> OperationResult<u32, BmtError> {
        let start = self.geometry.system_blocks + 1;
        let replacement = match self.find_spare_from(start, Direction::Forward) {
            Ok(Some(block)) => block,
            Ok(None) => return OperationResult::Err(BmtError::PoolExhausted),
            Err(e) => return OperationResult::Err(e),
        };

        match self.migrate(key, current, replacement, bytes_to_copy) {
            Ok(()) => OperationResult::Ok(replacement),
            Err(e @ (BmtError::WriteFailure { .. } | BmtError::EraseFailure { .. })) => {
                warn!(replacement, %e, "replacement failed; retiring it");
                match self.flash.mark_bad(replacement) {
                    Ok(()) => OperationResult::Retry(e),
                    Err(e) => OperationResult::Err(e),
                }
            }
            Err(e) => OperationResult::Err(e),
        }
    }

    /// Erase `replacement` and copy pages over from `current`, tagging each with `key`.
    ///
    /// Erased pages are left alone, so the caller can still program them once.
    fn migrate(
        &mut self,
        key: u32,
        current: u32,
        replacement: u32,
        bytes_to_copy: u64,
    ) -> Result<()> {
        self.flash.erase(replacement)?;

        let page_size = self.layout.bytes_per_page as u64;
        let pages = bytes_to_copy
            .div_ceil(page_size)
            .min(u64::from(self.layout.pages_per_block)) as u32;
        let header = OobRemap::target_of(tag(key)).encode();

        for page in 0..pages {
            self.flash
                .read_page(current, page, &mut self.page_buf, &mut self.oob_buf)?;
            if self.page_buf.is_erased() && self.oob_buf.is_erased() {
                continue;
            }

            self.oob_buf[..header.len()].copy_from_slice(&header);
            self.flash
                .write_page(replacement, page, &self.page_buf, &self.oob_buf)?;
        }

        debug!(key, current, replacement, pages, "migrated block");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{attach_fresh, page_of, TEST_LAYOUT};
    use super::*;
    use crate::nand::SimNand;

    #[test]
    fn test_remap_copies() -> Result<()> {
        let mut bmt = attach_fresh();
        bmt.flash.write_page(10, 0, &page_of(0xA0), &[0xFF, 0xFF, 0xFF, 0xFF, 0x5A])?;
        bmt.flash.write_page(10, 1, &page_of(0xA1), &[])?;
        bmt.flash.write_page(10, 3, &page_of(0xA3), &[])?;

        // Only the first two pages are asked for
        let replacement = bmt.remap(10, 10, TEST_LAYOUT.bytes_per_page as u64 + 1)?;
        assert_eq!(replacement, 943);
        assert_eq!(bmt.remap.lookup(10), Some(943));

        let mut data = page_of(0);
        let mut oob = [0u8; 5];
        bmt.flash.read_page(943, 0, &mut data, &mut oob)?;
        assert_eq!(data, page_of(0xA0));
        assert_eq!(oob, [0xFF, 0xFF, 0x00, 0x0A, 0x5A]);
        bmt.flash.read_page(943, 1, &mut data, &mut oob)?;
        assert_eq!(data, page_of(0xA1));
        bmt.flash.read_page(943, 3, &mut data, &mut [])?;
        assert!(data.is_erased());

        // The old block is retired and points at its replacement
        assert!(bmt.flash.is_bad(10)?);
        let old = bmt.read_oob(10)?;
        assert!(old.hw_bad && old.sw_bad);
        assert_eq!(old.remapped, Some(943));

        Ok(())
    }

    #[test]
    fn test_remap_no_copy() -> Result<()> {
        let mut bmt = attach_fresh();
        let replacement = bmt.remap(20, 20, 0)?;

        // Nothing is programmed yet; the table alone keeps the replacement from being reused
        assert_eq!(bmt.read_oob(replacement)?, OobRemap::default());
        assert_eq!(bmt.flash.program_count(replacement, 0), 0);
        assert!(bmt.remap.is_target(replacement));
        assert_eq!(bmt.find_spare_from(943, Direction::Forward)?, Some(944));
        Ok(())
    }

    #[test]
    fn test_remap_result() -> Result<()> {
        let mut bmt = attach_fresh();

        // A successful relocation reports the block now serving the key
        let replacement = bmt.remap(15, 15, 0)?;
        assert_eq!(Some(replacement), bmt.remap.lookup(15));
        assert_eq!(bmt.resolve(15)?, replacement);

        // The key is the translated system block, not the caller's logical number
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_bad(3)?;
        let mut bmt = Bmt::attach(nand, Default::default())?;
        assert_eq!(bmt.resolve(4)?, 5);
        let replacement = bmt.remap(5, 5, 0)?;
        assert_eq!(bmt.remap.lookup(5), Some(replacement));
        assert_eq!(bmt.remap.lookup(4), None);
        assert_eq!(bmt.resolve(4)?, replacement);
        Ok(())
    }

    #[test]
    fn test_remap_again() -> Result<()> {
        let mut bmt = attach_fresh();
        let first = bmt.remap(30, 30, 0)?;
        let second = bmt.remap(30, first, 0)?;

        assert_ne!(first, second);
        assert_eq!(bmt.remap.len(), 1);
        assert_eq!(bmt.remap.lookup(30), Some(second));
        assert!(bmt.flash.is_bad(first)?);
        Ok(())
    }

    #[test]
    fn test_remap_retires_bad_replacement() -> Result<()> {
        let mut bmt = attach_fresh();
        bmt.flash.write_page(7, 0, &page_of(0x77), &[])?;
        bmt.flash.fail_next_erase(943, 1);
        bmt.flash.fail_next_write(944, 1);

        let replacement = bmt.remap(7, 7, 1)?;
        assert_eq!(replacement, 945);
        assert!(bmt.flash.is_bad(943)?);
        assert!(bmt.flash.is_bad(944)?);
        Ok(())
    }

    #[test]
    fn test_remap_read_failure_aborts() -> Result<()> {
        let mut bmt = attach_fresh();
        bmt.flash.write_page(8, 0, &page_of(0x88), &[])?;
        bmt.flash.fail_next_read(8, 1);

        assert!(matches!(
            bmt.remap(8, 8, 1),
            Err(BmtError::ReadFailure { block: 8, page: 0 })
        ));
        assert!(bmt.remap.is_empty());
        assert!(!bmt.flash.is_bad(8)?);
        Ok(())
    }

    #[test]
    fn test_remap_exhausted() -> Result<()> {
        let mut bmt = attach_fresh();
        for block in 943..1023 {
            bmt.flash.mark_bad(block)?;
        }

        assert!(matches!(bmt.remap(9, 9, 0), Err(BmtError::PoolExhausted)));
        assert!(!bmt.flash.is_bad(9)?);
        Ok(())
    }
}
