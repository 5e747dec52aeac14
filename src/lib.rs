//! Bad-block remapping for raw NAND flash.
//!
//! [bmt::Bmt] sits between a raw [nand::Flash] device and whatever uses it, presenting a gap-free
//! range of logical blocks while factory-bad and worn-out blocks are absorbed by a reserved pool
//! at the end of the device.

pub mod bmt;
pub mod config;
pub mod error;
pub mod nand;
pub mod util;
