//! This module contains the code necessary to read, write, and validate the two persistent
//! tables: the raw-bad-block table (BBT) and the block-remap table (BMT).
//!
//! Each table occupies the first page of a block in the reserved pool. All fields are big-endian.
//!
//! ```text
//! BBT: "RAWB" | version: u8 | count: u8 | checksum: u16 | count x block: u16
//! BMT: "BMT"  | version: u8 | count: u8 | checksum: u8 | reserved: [u8; 2] | count x (from: u16, to: u16)
//! ```
//!
//! Both checksums are plain wrapping sums of the version, the count and every entry byte; the BBT
//! sums into 16 bits, the BMT into 8.

use deku::prelude::*;

use super::MAX_TABLE_SIZE;
use crate::error::{BmtError, Result};

pub const BBT_SIGNATURE: &[u8; 4] = b"RAWB";
pub const BMT_SIGNATURE: &[u8; 3] = b"BMT";
const TABLE_VERSION: u8 = 1;

/// Largest encoded BMT, which is the larger of the two tables
pub const MAX_TABLE_BYTES: usize = 8 + 4 * MAX_TABLE_SIZE;

#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct BbtPage {
    signature: [u8; 4],
    version: u8,
    size: u8,
    checksum: u16,
    #[deku(count = "size")]
    table: Vec<u16>,
}

#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct BmtPage {
    signature: [u8; 3],
    version: u8,
    size: u8,
    checksum: u8,
    reserved: [u8; 2],
    #[deku(count = "size")]
    table: Vec<MapEntry>,
}

/// One remapping: logical block `from` is currently served by physical block `to`
#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct MapEntry {
    pub from: u16,
    pub to: u16,
}

/// Implements validation of a decoded table page: signature, version, and checksum
trait ParseTable<'a>: Sized + DekuContainerRead<'a> + ComputeChecksum {
    fn get_signature() -> &'static [u8];
    fn get_table_signature(&self) -> &[u8];
    fn get_table_version(&self) -> u8;
    fn get_size(&self) -> u8;

    fn is_valid(&self, expected_signature: &[u8]) -> bool {
        self.get_table_signature() == expected_signature
            && self.get_table_version() == TABLE_VERSION
            && usize::from(self.get_size()) <= MAX_TABLE_SIZE
            && self.check_checksum()
    }

    fn parse(buf: &'a [u8]) -> Option<Self> {
        let (_, table) = Self::from_bytes((buf, 0)).ok()?;
        table.is_valid(Self::get_signature()).then_some(table)
    }
}

impl ParseTable<'_> for BbtPage {
    fn get_signature() -> &'static [u8] {
        BBT_SIGNATURE
    }
    fn get_table_signature(&self) -> &[u8] {
        &self.signature
    }
    fn get_table_version(&self) -> u8 {
        self.version
    }
    fn get_size(&self) -> u8 {
        self.size
    }
}

impl ParseTable<'_> for BmtPage {
    fn get_signature() -> &'static [u8] {
        BMT_SIGNATURE
    }
    fn get_table_signature(&self) -> &[u8] {
        &self.signature
    }
    fn get_table_version(&self) -> u8 {
        self.version
    }
    fn get_size(&self) -> u8 {
        self.size
    }
}

/// Computes, checks, and repairs the additive checksum of a table page
trait ComputeChecksum {
    type Sum: PartialEq + Copy;

    fn compute_checksum(&self) -> Self::Sum;
    fn get_checksum(&self) -> Self::Sum;
    fn set_checksum(&mut self, sum: Self::Sum);

    fn check_checksum(&self) -> bool {
        self.get_checksum() == self.compute_checksum()
    }

    fn fix_checksum(&mut self) {
        self.set_checksum(self.compute_checksum())
    }
}

impl ComputeChecksum for BbtPage {
    type Sum = u16;

    fn compute_checksum(&self) -> u16 {
        self.table
            .iter()
            .flat_map(|block| block.to_be_bytes())
            .fold(
                u16::from(self.version).wrapping_add(u16::from(self.size)),
                |sum, byte| sum.wrapping_add(u16::from(byte)),
            )
    }
    fn get_checksum(&self) -> u16 {
        self.checksum
    }
    fn set_checksum(&mut self, sum: u16) {
        self.checksum = sum;
    }
}

impl ComputeChecksum for BmtPage {
    type Sum = u8;

    fn compute_checksum(&self) -> u8 {
        self.table
            .iter()
            .flat_map(|entry| [entry.from.to_be_bytes(), entry.to.to_be_bytes()])
            .flatten()
            .fold(self.version.wrapping_add(self.size), u8::wrapping_add)
    }
    fn get_checksum(&self) -> u8 {
        self.checksum
    }
    fn set_checksum(&mut self, sum: u8) {
        self.checksum = sum;
    }
}

/// Copy encoded table bytes into the front of a page buffer
fn place(bytes: Result<Vec<u8>, DekuError>, out_bytes: &mut [u8]) -> Result<()> {
    let bytes = bytes.map_err(|e| BmtError::OutOfRange(e.to_string()))?;
    let out_bytes = out_bytes
        .get_mut(..bytes.len())
        .ok_or_else(|| BmtError::OutOfRange("table does not fit in a page".into()))?;
    out_bytes.copy_from_slice(&bytes);
    Ok(())
}

fn to_u16(block: u32) -> Result<u16> {
    u16::try_from(block).map_err(|_| BmtError::OutOfRange(format!("block {block}")))
}

/// The raw-bad-block table: system blocks known bad at the hardware level
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct BadBlockTable {
    entries: Vec<u16>,
}

impl BadBlockTable {
    pub fn entries(&self) -> &[u16] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, block: u32) -> bool {
        self.entries.iter().any(|&x| u32::from(x) == block)
    }

    /// Record another bad block
    pub fn push(&mut self, block: u32) -> Result<()> {
        if self.entries.len() >= MAX_TABLE_SIZE {
            return Err(BmtError::CapacityExceeded("BBT"));
        }
        self.entries.push(to_u16(block)?);
        Ok(())
    }

    /// The checksum this table is stored with
    pub fn checksum(&self) -> u16 {
        BbtPage::from(self).compute_checksum()
    }

    /// Convert from a page; `None` unless the signature, version, and checksum all check out
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        BbtPage::parse(bytes).map(|page| Self {
            entries: page.table,
        })
    }

    /// Write into the front of a page buffer
    pub fn encode(&self, out_bytes: &mut [u8]) -> Result<()> {
        place(BbtPage::from(self).to_bytes(), out_bytes)
    }
}

impl From<&BadBlockTable> for BbtPage {
    fn from(value: &BadBlockTable) -> Self {
        let mut target = Self {
            signature: *BBT_SIGNATURE,
            version: TABLE_VERSION,
            size: value.entries.len() as u8,
            checksum: Default::default(),
            table: value.entries.clone(),
        };

        target.fix_checksum();
        target
    }
}

/// The block-remap table: which pool block currently serves each remapped logical block
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct RemapTable {
    entries: Vec<MapEntry>,
}

impl RemapTable {
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Which block serves `from`, if it has been remapped
    pub fn lookup(&self, from: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|entry| u32::from(entry.from) == from)
            .map(|entry| u32::from(entry.to))
    }

    /// Is `block` the target of any mapping?
    pub fn is_target(&self, block: u32) -> bool {
        self.entries.iter().any(|entry| u32::from(entry.to) == block)
    }

    /// Point `from` at `to`, replacing any existing mapping for `from`
    pub fn upsert(&mut self, from: u32, to: u32) -> Result<()> {
        let (from, to) = (to_u16(from)?, to_u16(to)?);

        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.from == from) {
            entry.to = to;
            return Ok(());
        }

        if self.entries.len() >= MAX_TABLE_SIZE {
            return Err(BmtError::CapacityExceeded("BMT"));
        }
        self.entries.push(MapEntry { from, to });
        Ok(())
    }

    /// The checksum this table is stored with
    pub fn checksum(&self) -> u8 {
        BmtPage::from(self).compute_checksum()
    }

    /// Convert from a page.
    ///
    /// Besides the signature, version and checksum, every target must lie beyond
    /// `system_blocks`, or the table is rejected.
    pub fn decode(bytes: &[u8], system_blocks: u32) -> Option<Self> {
        BmtPage::parse(bytes)
            .filter(|page| {
                page.table
                    .iter()
                    .all(|entry| u32::from(entry.to) > system_blocks)
            })
            .map(|page| Self {
                entries: page.table,
            })
    }

    /// Write into the front of a page buffer
    pub fn encode(&self, out_bytes: &mut [u8]) -> Result<()> {
        place(BmtPage::from(self).to_bytes(), out_bytes)
    }
}

impl From<&RemapTable> for BmtPage {
    fn from(value: &RemapTable) -> Self {
        let mut target = Self {
            signature: *BMT_SIGNATURE,
            version: TABLE_VERSION,
            size: value.entries.len() as u8,
            checksum: Default::default(),
            reserved: Default::default(),
            table: value.entries.clone(),
        };

        target.fix_checksum();
        target
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn page() -> Vec<u8> {
        vec![0xFF; 2048]
    }

    #[test]
    fn test_bbt_encode() -> Result<()> {
        let mut bbt = BadBlockTable::default();
        bbt.push(3)?;
        bbt.push(0x0102)?;

        let mut buf = page();
        bbt.encode(&mut buf)?;

        assert_eq!(&buf[..4], b"RAWB");
        // version 1 + size 2 + entry bytes 0,3,1,2
        assert_eq!(bbt.checksum(), 1 + 2 + 3 + 1 + 2);
        assert_eq!(&buf[4..12], &[1, 2, 0x00, 0x09, 0x00, 0x03, 0x01, 0x02]);
        assert_eq!(BadBlockTable::decode(&buf), Some(bbt));

        Ok(())
    }

    #[test]
    fn test_bbt_reject() -> Result<()> {
        let mut bbt = BadBlockTable::default();
        bbt.push(17)?;
        let mut buf = page();
        bbt.encode(&mut buf)?;

        let mut bad_signature = buf.clone();
        bad_signature[0] = b'X';
        assert_eq!(BadBlockTable::decode(&bad_signature), None);

        let mut bad_sum = buf.clone();
        bad_sum[9] ^= 0x10;
        assert_eq!(BadBlockTable::decode(&bad_sum), None);

        // A BMT is not a BBT, and an erased page is neither
        assert_eq!(BadBlockTable::decode(&page()), None);
        assert_eq!(RemapTable::decode(&page(), 0), None);
        assert_eq!(RemapTable::decode(&buf, 0), None);

        Ok(())
    }

    #[test]
    fn test_bmt_encode() -> Result<()> {
        let mut bmt = RemapTable::default();
        bmt.upsert(10, 950)?;
        bmt.upsert(11, 951)?;

        let mut buf = page();
        bmt.encode(&mut buf)?;
        assert_eq!(&buf[..3], b"BMT");
        assert_eq!(buf[5], bmt.checksum());
        assert_eq!(RemapTable::decode(&buf, 942), Some(bmt.clone()));

        // Remapping an already-remapped block replaces its target
        bmt.upsert(10, 960)?;
        assert_eq!(bmt.len(), 2);
        assert_eq!(bmt.lookup(10), Some(960));
        assert_eq!(bmt.lookup(12), None);
        assert!(bmt.is_target(951));
        assert!(!bmt.is_target(950));

        Ok(())
    }

    #[test]
    fn test_bmt_sanity_check() -> Result<()> {
        let mut bmt = RemapTable::default();
        bmt.upsert(5, 943)?;
        bmt.upsert(6, 1000)?;

        let mut buf = page();
        bmt.encode(&mut buf)?;

        assert!(RemapTable::decode(&buf, 942).is_some());
        // A target at or below the system/pool boundary makes the whole table invalid
        assert!(RemapTable::decode(&buf, 943).is_none());
        assert!(RemapTable::decode(&buf, 999).is_none());

        Ok(())
    }

    #[test]
    fn test_capacity() -> Result<()> {
        let mut bbt = BadBlockTable::default();
        let mut bmt = RemapTable::default();
        for block in 0..MAX_TABLE_SIZE as u32 {
            bbt.push(block)?;
            bmt.upsert(block, 1000 + block)?;
        }

        assert!(matches!(bbt.push(1), Err(BmtError::CapacityExceeded("BBT"))));
        assert!(matches!(
            bmt.upsert(MAX_TABLE_SIZE as u32, 2000),
            Err(BmtError::CapacityExceeded("BMT"))
        ));
        // Updating an existing mapping never needs room
        bmt.upsert(0, 3000)?;

        let mut buf = vec![0xFF; MAX_TABLE_BYTES];
        bmt.encode(&mut buf)?;
        assert_eq!(RemapTable::decode(&buf, 999), Some(bmt));

        let mut short = vec![0xFF; MAX_TABLE_BYTES - 1];
        assert!(RemapTable::default().encode(&mut short).is_ok());
        let mut full = RemapTable::default();
        for block in 0..MAX_TABLE_SIZE as u32 {
            full.upsert(block, 1000 + block)?;
        }
        assert!(full.encode(&mut short).is_err());

        Ok(())
    }
}
