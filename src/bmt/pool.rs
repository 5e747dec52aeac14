//! Allocation of spare blocks from the reserved pool.

use tracing::debug;

use super::{Bmt, Direction, Geometry};
use crate::error::Result;
use crate::nand::Flash;

impl<F: Flash> Bmt<F> {
    /// Find a free pool block, starting from whichever end of the pool `direction` begins at
    pub fn find_spare(&mut self, direction: Direction) -> Result<Option<u32>> {
        let start = match direction {
            Direction::Forward => self.geometry.system_blocks,
            Direction::Backward => self.geometry.total_blocks - 1,
        };
        self.find_spare_from(start, direction)
    }

    /// Find a free pool block, examining at most `pool_blocks` candidates from `start` onward
    pub fn find_spare_from(&mut self, start: u32, direction: Direction) -> Result<Option<u32>> {
        let Geometry {
            total_blocks,
            system_blocks,
            pool_blocks,
        } = self.geometry;

        let mut candidate = Some(start);
        for _ in 0..pool_blocks {
            let Some(block) = candidate.filter(|b| (system_blocks..total_blocks).contains(b))
            else {
                break;
            };

            if self.is_spare(block)? {
                return Ok(Some(block));
            }
            candidate = direction.step(block);
        }

        Ok(None)
    }

    fn is_spare(&mut self, block: u32) -> Result<bool> {
        if self.bbt_block == Some(block)
            || self.bmt_block == Some(block)
            || self.remap.is_target(block)
        {
            return Ok(false);
        }

        if self.flash.is_bad(block)? {
            debug!(block, "skipping bad pool block");
            return Ok(false);
        }

        match self.read_oob(block) {
            Ok(oob) if oob.is_bad() => Ok(false),
            Ok(oob) => Ok(oob.remapped.is_none()),
            Err(e) if e.is_media_error() => {
                debug!(block, %e, "skipping unreadable pool block");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test::attach_fresh;
    use super::super::OobRemap;
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_find_spare() -> Result<()> {
        let mut bmt = attach_fresh();
        assert_eq!(bmt.bbt_block, Some(942));
        assert_eq!(bmt.bmt_block, Some(1023));

        // The table blocks themselves are never handed out
        assert_eq!(bmt.find_spare(Direction::Forward)?, Some(943));
        assert_eq!(bmt.find_spare(Direction::Backward)?, Some(1022));

        bmt.flash.mark_bad(943)?;
        bmt.write_oob(944, OobRemap::target_of(12))?;
        bmt.write_oob(945, OobRemap::software_bad())?;
        bmt.flash.fail_next_read(946, 1);
        assert_eq!(bmt.find_spare(Direction::Forward)?, Some(947));

        // Scans never leave the pool
        assert_eq!(bmt.find_spare_from(1023, Direction::Forward)?, None);
        assert_eq!(bmt.find_spare_from(941, Direction::Forward)?, None);

        Ok(())
    }

    #[test]
    fn test_pool_exhausted() -> Result<()> {
        let mut bmt = attach_fresh();
        for block in 943..1023 {
            bmt.flash.mark_bad(block)?;
        }
        assert_eq!(bmt.find_spare(Direction::Forward)?, None);
        assert_eq!(bmt.find_spare(Direction::Backward)?, None);
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_find_spare_is_free(
            bad in proptest::collection::btree_set(942u32..1024, 0..40),
            tagged in proptest::collection::btree_set(942u32..1024, 0..40),
            forward in any::<bool>(),
        ) {
            let mut bmt = attach_fresh();
            for &block in &bad {
                bmt.flash.mark_bad(block).unwrap();
            }
            for &block in &tagged {
                bmt.write_oob(block, OobRemap::target_of(7)).unwrap();
            }

            let direction = if forward { Direction::Forward } else { Direction::Backward };
            if let Some(block) = bmt.find_spare(direction).unwrap() {
                prop_assert_ne!(Some(block), bmt.bbt_block);
                prop_assert_ne!(Some(block), bmt.bmt_block);
                prop_assert!(!bmt.flash.is_bad(block).unwrap());
                prop_assert!(!tagged.contains(&block));
                prop_assert!(!bmt.remap.is_target(block));
            }
        }
    }
}
