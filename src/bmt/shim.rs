//! [Flash] over logical block numbers: every call is translated to the block currently serving
//! it, and media errors are answered by relocating that block and trying again.

use retry::OperationResult;
use tracing::debug;

use super::{tag, Bmt, OobRemap, RETRY_LIMIT};
use crate::error::{BmtError, Result};
use crate::nand::{Flash, FlashLayout};
use crate::util::bounded;

impl<F: Flash> Bmt<F> {
    /// The key a logical block is remapped under, or `None` if it bypasses translation.
    ///
    /// System-region numbers past the last good block are refused rather than aliased.
    fn route(&self, logical: u32) -> Result<Option<u32>> {
        let block_base = u64::from(logical) * self.layout.block_size();
        if logical >= self.geometry.system_blocks || !self.config.covers(block_base) {
            return Ok(None);
        }

        match self.pbbt.translate(logical) {
            Some(key) => Ok(Some(key)),
            None => Err(BmtError::OutOfRange(format!(
                "logical block {logical} is past the {} good system blocks",
                self.pbbt.len()
            ))),
        }
    }

    fn physical(&self, key: u32) -> u32 {
        self.remap.lookup(key).unwrap_or(key)
    }

    /// The physical block currently serving `logical`
    pub fn resolve(&self, logical: u32) -> Result<u32> {
        Ok(self
            .route(logical)?
            .map_or(logical, |key| self.physical(key)))
    }

    /// Relocate `key` after `cause`, and ask for the failed operation to be tried again
    fn recover<T>(
        &mut self,
        key: u32,
        physical: u32,
        bytes_to_copy: u64,
        cause: BmtError,
    ) -> OperationResult<T, BmtError> {
        debug!(key, physical, %cause, "relocating");
        match self.remap(key, physical, bytes_to_copy) {
            Ok(_) => OperationResult::Retry(cause),
            Err(e) => OperationResult::Err(e),
        }
    }

}

impl<F: Flash> Flash for Bmt<F> {
    /// Only the logical blocks are counted; the pool stays reachable past them.
    fn layout(&self) -> FlashLayout {
        FlashLayout {
            blocks: self.capacity(),
            ..self.layout
        }
    }

    fn read_page(
        &mut self,
        block: u32,
        page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> Result<u32> {
        let Some(key) = self.route(block)? else {
            return self.flash.read_page(block, page, data, oob);
        };
        let threshold = self.config.bitflip_threshold;
        let block_size = self.layout.block_size();

        bounded(RETRY_LIMIT, || {
            let physical = self.physical(key);
            match self.flash.read_page(physical, page, data, oob) {
                Ok(bitflips) if threshold == 0 || bitflips < threshold => {
                    OperationResult::Ok(bitflips)
                }
                Ok(bitflips) => {
                    debug!(block, physical, bitflips, "bitflips over threshold");
                    let cause = BmtError::ReadFailure {
                        block: physical,
                        page,
                    };
                    self.recover(key, physical, block_size, cause)
                }
                Err(e) if e.is_media_error() => self.recover(key, physical, block_size, e),
                Err(e) => OperationResult::Err(e),
            }
        })
    }

    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        let Some(key) = self.route(block)? else {
            return self.flash.write_page(block, page, data, oob);
        };
        let page_size = self.layout.bytes_per_page as u64;

        bounded(RETRY_LIMIT, || {
            let physical = self.physical(key);
            let result = if physical == key {
                self.flash.write_page(physical, page, data, oob)
            } else {
                let mut stamped = oob.to_vec();
                OobRemap::stamp(&mut stamped, tag(key));
                self.flash.write_page(physical, page, data, &stamped)
            };

            match result {
                Ok(()) => OperationResult::Ok(()),
                Err(e) if e.is_media_error() => {
                    self.recover(key, physical, u64::from(page) * page_size, e)
                }
                Err(e) => OperationResult::Err(e),
            }
        })
    }

    fn urgent_write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let block_size = self.layout.block_size();
        let block = u32::try_from(addr / block_size)
            .map_err(|_| BmtError::OutOfRange(format!("address {addr:#x}")))?;
        let offset = addr % block_size;

        let Some(key) = self.route(block)? else {
            return self.flash.urgent_write(addr, data);
        };
        if offset + data.len() as u64 > block_size {
            return Err(BmtError::OutOfRange(format!(
                "urgent write at {addr:#x} crosses a block boundary"
            )));
        }

        bounded(RETRY_LIMIT, || {
            let physical = self.physical(key);
            match self
                .flash
                .urgent_write(u64::from(physical) * block_size + offset, data)
            {
                Ok(()) => OperationResult::Ok(()),
                Err(e) if e.is_media_error() => self.recover(key, physical, offset, e),
                Err(e) => OperationResult::Err(e),
            }
        })
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        let Some(key) = self.route(block)? else {
            return self.flash.erase(block);
        };

        bounded(RETRY_LIMIT, || {
            let physical = self.physical(key);
            // A replacement gets its tag back with the next page written to it
            match self.flash.erase(physical) {
                Ok(()) => OperationResult::Ok(()),
                Err(e) if e.is_media_error() => self.recover(key, physical, 0, e),
                Err(e) => OperationResult::Err(e),
            }
        })
    }

    /// A bad block behind a logical number is replaced on the spot, so this only reports `true`
    /// if replacements keep turning out bad.
    fn is_bad(&mut self, block: u32) -> Result<bool> {
        let Some(key) = self.route(block)? else {
            return self.flash.is_bad(block);
        };

        let result = bounded(RETRY_LIMIT, || {
            let physical = self.physical(key);
            match self.flash.is_bad(physical) {
                Ok(false) => OperationResult::Ok(false),
                Ok(true) => self.recover(key, physical, 0, BmtError::BadBlock { block: physical }),
                Err(e) => OperationResult::Err(e),
            }
        });

        match result {
            Err(BmtError::BadBlock { .. }) => Ok(true),
            result => result,
        }
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        let Some(key) = self.route(block)? else {
            return self.flash.mark_bad(block);
        };

        let physical = self.physical(key);
        self.remap(key, physical, 0)?;
        Ok(())
    }
}
