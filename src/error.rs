//! The error type shared by the flash backends and the remapping engine.

use thiserror::Error;

use crate::bmt::MAX_TABLE_SIZE;

pub type Result<T, E = BmtError> = std::result::Result<T, E>;

/// Everything that can go wrong while talking to flash or maintaining the remap tables
#[derive(Debug, Error)]
pub enum BmtError {
    /// A page read came back with more errors than ECC could correct
    #[error("uncorrectable read error at block {block}, page {page}")]
    ReadFailure { block: u32, page: u32 },

    /// The device reported a program failure
    #[error("program failure at block {block}, page {page}")]
    WriteFailure { block: u32, page: u32 },

    /// The device reported an erase failure
    #[error("erase failure at block {block}")]
    EraseFailure { block: u32 },

    /// No stored copy of a table had a good signature, version, checksum and mapping
    #[error("{0} missing or corrupt")]
    TableCorrupt(&'static str),

    /// A block reported itself bad
    #[error("block {block} is bad")]
    BadBlock { block: u32 },

    /// Every block in the reserved pool is bad or already in use
    #[error("no spare block left in the reserved pool")]
    PoolExhausted,

    /// A table would grow past its fixed on-media capacity
    #[error("{0} table would exceed {max} entries", max = MAX_TABLE_SIZE)]
    CapacityExceeded(&'static str),

    /// Too many bad blocks at the tail of the device to carve out a pool
    #[error("only {found} of {wanted} good pool blocks within the last {scanned} blocks")]
    InsufficientPool { wanted: u32, found: u32, scanned: u32 },

    /// A block, page or buffer did not fit the device layout
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The backing device failed in a way that isn't a media error
    #[error(transparent)]
    Device(#[from] std::io::Error),
}

impl BmtError {
    /// Media errors are the ones worth answering with a remap
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Self::ReadFailure { .. } | Self::WriteFailure { .. } | Self::EraseFailure { .. }
        )
    }
}
