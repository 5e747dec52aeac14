//! Abstractions and code to access raw NAND flash, out-of-band area included

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::error::{BmtError, Result};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub oob_bytes: usize,
}

impl FlashLayout {
    /// Size of one erase block, in bytes
    pub fn block_size(&self) -> u64 {
        u64::from(self.pages_per_block) * self.bytes_per_page as u64
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTESxOOB"
impl FromStr for FlashLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page, oob_bytes]: [&str; 4] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;
        let oob_bytes = oob_bytes.parse()?;

        Ok(FlashLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            oob_bytes,
        })
    }
}

/// The primitive operations of a raw NAND device.
///
/// Pages are addressed as `(block, page)`. A `data` buffer is either empty (skip the main area)
/// or exactly one page long; an `oob` buffer may be any length up to the OOB size, and covers the
/// leading bytes of the OOB area.
pub trait Flash {
    /// Get the layout of the NAND
    fn layout(&self) -> FlashLayout;

    /// Read one page and/or its OOB bytes.
    ///
    /// On success, returns the number of bitflips ECC had to correct.
    fn read_page(&mut self, block: u32, page: u32, data: &mut [u8], oob: &mut [u8])
        -> Result<u32>;

    /// Program one page and/or its OOB bytes
    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> Result<()>;

    /// Write without any of the usual ceremony, for use when the system is going down.
    ///
    /// `addr` is a byte offset into the device.
    fn urgent_write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self, block: u32) -> Result<()>;

    /// Does the device consider this block bad?
    fn is_bad(&mut self, block: u32) -> Result<bool>;

    /// Permanently mark a block bad at the hardware level
    fn mark_bad(&mut self, block: u32) -> Result<()>;
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: FlashLayout,
}

/// A block of SimNand
#[derive(Debug, Clone, Default)]
struct SimBlock {
    /// Only programmed pages are stored; everything else reads back erased
    pages: BTreeMap<u32, SimPage>,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Faults scheduled by the test driving this NAND
    faults: SimFaults,
}

#[derive(Debug, Clone)]
struct SimPage {
    data: Box<[u8]>,
    oob: Box<[u8]>,

    /// Programs since the last erase; real NAND with ECC tolerates only one
    programs: u32,
}

#[derive(Debug, Clone, Default)]
struct SimFaults {
    writes: u32,
    erases: u32,
    reads: u32,
    bitflips: u32,
}

impl SimNand {
    /// Create an empty (fully erased) SimNand with the specified layout
    pub fn new(layout: FlashLayout) -> Self {
        let blocks = vec![SimBlock::default(); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    fn sim_block(&mut self, index: u32) -> Result<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or_else(|| BmtError::OutOfRange(format!("block {index}")))
    }

    /// Make the next `count` page programs into `block` fail
    pub fn fail_next_write(&mut self, block: u32, count: u32) {
        self.blocks[block as usize].faults.writes = count;
    }

    /// Make the next `count` erases of `block` fail
    pub fn fail_next_erase(&mut self, block: u32, count: u32) {
        self.blocks[block as usize].faults.erases = count;
    }

    /// Make the next `count` page reads from `block` uncorrectable
    pub fn fail_next_read(&mut self, block: u32, count: u32) {
        self.blocks[block as usize].faults.reads = count;
    }

    /// Report `bitflips` corrected bitflips on every read from `block`
    pub fn set_bitflips(&mut self, block: u32, bitflips: u32) {
        self.blocks[block as usize].faults.bitflips = bitflips;
    }

    /// How many times `page` of `block` has been programmed since it was last erased
    pub fn program_count(&self, block: u32, page: u32) -> u32 {
        self.blocks[block as usize]
            .pages
            .get(&page)
            .map_or(0, |page| page.programs)
    }

    /// Initialize the NAND contents from a stream holding, for every page in order, the page data
    /// immediately followed by its OOB bytes.
    ///
    /// A block whose first page has a zeroed hardware-bad marker is restored as bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let layout = self.layout;
        let mut data = vec![0; layout.bytes_per_page];
        let mut oob = vec![0; layout.oob_bytes];

        for block in self.blocks.iter_mut() {
            *block = SimBlock::default();
            for page in 0..layout.pages_per_block {
                read.read_exact(&mut data)?;
                read.read_exact(&mut oob)?;
                if page == 0 && oob.first().is_some_and(|&x| x != 0xFF) {
                    block.marked_bad = true;
                }
                if !data.is_erased() || !oob.is_erased() {
                    block.pages.insert(
                        page,
                        SimPage {
                            data: data.clone().into(),
                            oob: oob.clone().into(),
                            programs: 1,
                        },
                    );
                }
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File), in the
    /// format accepted by [SimNand::load]
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let erased_data = vec![0xFF; self.layout.bytes_per_page];
        let erased_oob = vec![0xFF; self.layout.oob_bytes];

        for block in self.blocks.iter() {
            for page in 0..self.layout.pages_per_block {
                match block.pages.get(&page) {
                    Some(content) => {
                        write.write_all(&content.data)?;
                        write.write_all(&content.oob)?;
                    }
                    None => {
                        write.write_all(&erased_data)?;
                        write.write_all(&erased_oob)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn check_page(&self, page: u32, data_len: usize, oob_len: usize) -> Result<()> {
        if page >= self.layout.pages_per_block {
            return Err(BmtError::OutOfRange(format!("page {page}")));
        }
        if data_len != 0 && data_len != self.layout.bytes_per_page {
            return Err(BmtError::OutOfRange("data buffer not page-sized".into()));
        }
        if oob_len > self.layout.oob_bytes {
            return Err(BmtError::OutOfRange("OOB buffer too large".into()));
        }
        Ok(())
    }
}

impl SimBlock {
    fn page_mut(&mut self, index: u32, layout: FlashLayout) -> &mut SimPage {
        self.pages.entry(index).or_insert_with(|| SimPage {
            data: vec![0xFF; layout.bytes_per_page].into(),
            oob: vec![0xFF; layout.oob_bytes].into(),
            programs: 0,
        })
    }

    /// NAND programming can only clear bits, so new content is ANDed into the old.
    fn program(&mut self, index: u32, layout: FlashLayout, data: &[u8], oob: &[u8]) {
        if data.is_erased() && oob.is_erased() {
            // Writing fully-erased content is a no-op.
            return;
        }

        let page = self.page_mut(index, layout);
        page.data.iter_mut().zip(data).for_each(|(x, y)| *x &= y);
        page.oob.iter_mut().zip(oob).for_each(|(x, y)| *x &= y);
        page.programs += 1;
    }
}

impl Flash for SimNand {
    fn layout(&self) -> FlashLayout {
        self.layout
    }

    fn read_page(
        &mut self,
        block: u32,
        page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> Result<u32> {
        self.check_page(page, data.len(), oob.len())?;
        let sim = self.sim_block(block)?;

        if sim.faults.reads > 0 {
            sim.faults.reads -= 1;
            return Err(BmtError::ReadFailure { block, page });
        }

        match sim.pages.get(&page) {
            Some(content) => {
                data.copy_from_slice(&content.data[..data.len()]);
                oob.copy_from_slice(&content.oob[..oob.len()]);
            }
            None => {
                data.fill(0xFF);
                oob.fill(0xFF);
            }
        }

        Ok(sim.faults.bitflips)
    }

    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        self.check_page(page, data.len(), oob.len())?;
        let layout = self.layout;
        let sim = self.sim_block(block)?;

        if sim.faults.writes > 0 {
            sim.faults.writes -= 1;
            return Err(BmtError::WriteFailure { block, page });
        }

        sim.program(page, layout, data, oob);
        Ok(())
    }

    fn urgent_write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let layout = self.layout;
        let page_size = layout.bytes_per_page as u64;
        if addr % page_size != 0 {
            return Err(BmtError::OutOfRange(format!("unaligned urgent write at {addr:#x}")));
        }

        let mut page_index = addr / page_size;
        let mut page_buf = vec![0xFF; layout.bytes_per_page];
        for chunk in data.chunks(layout.bytes_per_page) {
            let block = u32::try_from(page_index / u64::from(layout.pages_per_block))
                .map_err(|_| BmtError::OutOfRange(format!("address {addr:#x}")))?;
            let page = (page_index % u64::from(layout.pages_per_block)) as u32;

            page_buf.fill(0xFF);
            page_buf[..chunk.len()].copy_from_slice(chunk);
            self.write_page(block, page, &page_buf, &[])?;
            page_index += 1;
        }

        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        let sim = self.sim_block(block)?;

        if sim.faults.erases > 0 {
            sim.faults.erases -= 1;
            return Err(BmtError::EraseFailure { block });
        }

        sim.pages.clear();
        Ok(())
    }

    fn is_bad(&mut self, block: u32) -> Result<bool> {
        Ok(self.sim_block(block)?.marked_bad)
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        let layout = self.layout;
        let sim = self.sim_block(block)?;

        sim.pages.clear();
        sim.program(0, layout, &[], &[0x00]);
        sim.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: FlashLayout = FlashLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    oob_bytes: 16,
};

#[test]
fn test_sim_range() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(!nand.is_bad(0).unwrap());
    assert!(!nand.is_bad(TEST_LAYOUT.blocks - 1).unwrap());
    assert!(nand.is_bad(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.mark_bad(0).unwrap();
    assert!(nand.is_bad(0).unwrap());

    let mut oob = [0u8; 2];
    nand.read_page(0, 0, &mut [], &mut oob).unwrap();
    assert_eq!(oob, [0x00, 0xFF]);
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let mut data_out = data_in.clone();
    let mut oob_out = [0u8; 4];

    nand.write_page(0, 2, &data_in, &[0xFF, 0xFF, 0x12, 0x34])
        .unwrap();

    nand.read_page(0, 1, &mut data_out, &mut oob_out).unwrap();
    assert!(data_out.is_erased());
    assert!(oob_out.is_erased());

    nand.read_page(0, 2, &mut data_out, &mut oob_out).unwrap();
    assert_eq!(data_out, data_in);
    assert_eq!(oob_out, [0xFF, 0xFF, 0x12, 0x34]);

    // Programming again can only clear more bits
    nand.write_page(0, 2, &vec![0x0F; TEST_LAYOUT.bytes_per_page], &[])
        .unwrap();
    nand.read_page(0, 2, &mut data_out, &mut []).unwrap();
    assert!(data_out.iter().all(|&x| x == 0x05));

    nand.erase(0).unwrap();
    nand.read_page(0, 2, &mut data_out, &mut oob_out).unwrap();
    assert!(data_out.is_erased());
    assert!(oob_out.is_erased());
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let mut buf = page.clone();

    nand.fail_next_write(3, 1);
    assert!(matches!(
        nand.write_page(3, 0, &page, &[]),
        Err(BmtError::WriteFailure { block: 3, page: 0 })
    ));
    nand.write_page(3, 0, &page, &[]).unwrap();

    nand.fail_next_erase(3, 1);
    assert!(nand.erase(3).is_err());
    nand.erase(3).unwrap();

    nand.set_bitflips(3, 5);
    assert_eq!(nand.read_page(3, 0, &mut buf, &mut []).unwrap(), 5);

    nand.fail_next_read(3, 1);
    assert!(matches!(
        nand.read_page(3, 0, &mut buf, &mut []),
        Err(BmtError::ReadFailure { block: 3, page: 0 })
    ));
    assert_eq!(nand.read_page(3, 0, &mut buf, &mut []).unwrap(), 5);
}

#[test]
fn test_sim_urgent_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let block_size = TEST_LAYOUT.block_size();
    let payload = vec![0x42u8; TEST_LAYOUT.bytes_per_page + 10];

    nand.urgent_write(block_size * 2 + 256, &payload).unwrap();

    let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page];
    nand.read_page(2, 1, &mut buf, &mut []).unwrap();
    assert!(buf.iter().all(|&x| x == 0x42));
    nand.read_page(2, 2, &mut buf, &mut []).unwrap();
    assert!(buf[..10].iter().all(|&x| x == 0x42));
    assert!(buf[10..].is_erased());

    assert!(nand.urgent_write(3, &payload).is_err());
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.write_page(1, 3, &vec![0x55; TEST_LAYOUT.bytes_per_page], &[0xFF, 0xFF, 0, 7])?;
    nand.mark_bad(5)?;

    let mut image = Vec::new();
    nand.save(&mut image)?;

    let mut restored = SimNand::new(TEST_LAYOUT);
    restored.load(&mut image.as_slice())?;

    let mut data = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let mut oob = [0u8; 4];
    restored.read_page(1, 3, &mut data, &mut oob)?;
    assert!(data.iter().all(|&x| x == 0x55));
    assert_eq!(oob, [0xFF, 0xFF, 0, 7]);
    assert!(restored.is_bad(5)?);
    assert!(!restored.is_bad(1)?);

    Ok(())
}

#[test]
fn test_layout_parse() {
    let layout: FlashLayout = "1024x64x2048x64".parse().unwrap();
    assert_eq!(
        layout,
        FlashLayout {
            blocks: 1024,
            pages_per_block: 64,
            bytes_per_page: 2048,
            oob_bytes: 64,
        }
    );
    assert_eq!(layout.block_size(), 128 * 1024);
    assert!("1024x64x2048".parse::<FlashLayout>().is_err());
}
