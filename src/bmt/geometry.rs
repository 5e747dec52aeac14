//! Sizing of the reserved pool, and the index from logical block numbers to good system blocks.

use tracing::debug;

use super::{BadBlockTable, MAX_TABLE_SIZE, POOL_GOOD_PERCENT, POOL_SCAN_PERCENT};
use crate::error::{BmtError, Result};
use crate::nand::Flash;

/// Where the system region ends and the pool begins
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub total_blocks: u32,
    pub system_blocks: u32,
    pub pool_blocks: u32,
}

impl Geometry {
    /// Number of good blocks the pool should hold on a device of `total_blocks`
    pub fn pool_target(total_blocks: u32) -> u32 {
        let wanted = (u64::from(total_blocks) * u64::from(POOL_GOOD_PERCENT)).div_ceil(100);
        wanted.min(MAX_TABLE_SIZE as u64) as u32
    }

    /// Walk backward from the end of the device until the pool holds enough good blocks.
    ///
    /// Gives up with [BmtError::InsufficientPool] if that takes more than a tenth of the device.
    pub fn probe<F: Flash>(flash: &mut F) -> Result<Self> {
        let layout = flash.layout();
        let total_blocks = layout.blocks;
        if total_blocks > u32::from(u16::MAX) {
            return Err(BmtError::OutOfRange(format!(
                "{total_blocks} blocks do not fit 16-bit table entries"
            )));
        }
        if layout.oob_bytes < super::oob::OOB_REMAP_BYTES {
            return Err(BmtError::OutOfRange("OOB area too small".into()));
        }

        let wanted = Self::pool_target(total_blocks);
        let max_scan = total_blocks * POOL_SCAN_PERCENT / 100;
        if wanted == 0 {
            return Err(BmtError::InsufficientPool {
                wanted,
                found: 0,
                scanned: 0,
            });
        }

        let mut found = 0;
        let mut scanned = 0;
        let mut block = total_blocks;
        while found < wanted {
            if scanned >= max_scan {
                return Err(BmtError::InsufficientPool {
                    wanted,
                    found,
                    scanned,
                });
            }

            block -= 1;
            scanned += 1;
            if flash.is_bad(block)? {
                debug!(block, "bad block in pool");
            } else {
                found += 1;
            }
        }

        Ok(Self {
            total_blocks,
            system_blocks: block,
            pool_blocks: total_blocks - block,
        })
    }
}

/// The good system blocks in order: logical block N lives on the Nth of them.
///
/// Logical numbers past the last good block have no block of their own.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct GoodBlockIndex {
    good: Vec<u32>,
}

impl GoodBlockIndex {
    pub fn new(system_blocks: u32, bbt: &BadBlockTable) -> Self {
        let good = (0..system_blocks)
            .filter(|&block| !bbt.contains(block))
            .collect();
        Self { good }
    }

    pub fn translate(&self, logical: u32) -> Option<u32> {
        self.good.get(logical as usize).copied()
    }

    pub fn len(&self) -> u32 {
        self.good.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.good.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{FlashLayout, SimNand};

    fn nand(blocks: u32) -> SimNand {
        SimNand::new(FlashLayout {
            blocks,
            pages_per_block: 4,
            bytes_per_page: 512,
            oob_bytes: 16,
        })
    }

    #[test]
    fn test_pool_target() {
        assert_eq!(Geometry::pool_target(1024), 82);
        assert_eq!(Geometry::pool_target(100), 8);
        assert_eq!(Geometry::pool_target(101), 9);
        assert_eq!(Geometry::pool_target(4096), 250);
    }

    #[test]
    fn test_probe() -> Result<()> {
        let mut nand = nand(1024);
        assert_eq!(
            Geometry::probe(&mut nand)?,
            Geometry {
                total_blocks: 1024,
                system_blocks: 942,
                pool_blocks: 82,
            }
        );

        // 20 bad blocks at the very end push the pool to the limit of 102 scanned blocks
        for block in 1004..1024 {
            nand.mark_bad(block)?;
        }
        assert_eq!(
            Geometry::probe(&mut nand)?,
            Geometry {
                total_blocks: 1024,
                system_blocks: 922,
                pool_blocks: 102,
            }
        );

        // One more is too many
        nand.mark_bad(950)?;
        assert!(matches!(
            Geometry::probe(&mut nand),
            Err(BmtError::InsufficientPool {
                wanted: 82,
                found: 81,
                scanned: 102,
            })
        ));

        Ok(())
    }

    #[test]
    fn test_probe_limits() {
        assert!(matches!(
            Geometry::probe(&mut nand(70_000)),
            Err(BmtError::OutOfRange(_))
        ));

        let mut tiny_oob = SimNand::new(FlashLayout {
            blocks: 1024,
            pages_per_block: 4,
            bytes_per_page: 512,
            oob_bytes: 2,
        });
        assert!(Geometry::probe(&mut tiny_oob).is_err());

        assert!(matches!(
            Geometry::probe(&mut nand(0)),
            Err(BmtError::InsufficientPool { wanted: 0, .. })
        ));
    }

    #[test]
    fn test_good_block_index() -> Result<()> {
        let mut bbt = BadBlockTable::default();
        bbt.push(1)?;
        bbt.push(4)?;

        let pbbt = GoodBlockIndex::new(8, &bbt);
        assert_eq!(pbbt.len(), 6);
        let translated: Vec<_> = (0..8).map(|n| pbbt.translate(n)).collect();
        assert_eq!(
            translated,
            [Some(0), Some(2), Some(3), Some(5), Some(6), Some(7), None, None]
        );

        let empty = GoodBlockIndex::new(8, &BadBlockTable::default());
        assert!((0..8).all(|n| empty.translate(n) == Some(n)));
        assert_eq!(empty.translate(8), None);

        Ok(())
    }
}
