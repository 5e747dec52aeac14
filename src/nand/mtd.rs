//! Flash implementation over the Linux MTD subsystem, with OOB access

use super::{Flash, FlashLayout};
use crate::error::{BmtError, Result};

use anyhow::bail;
use nix::errno::Errno;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: FlashLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Compute the offset of the first byte of a block, checking that it exists
    fn block_base(&self, block: u32) -> Result<u64> {
        if block >= self.layout.blocks {
            return Err(BmtError::OutOfRange(format!("block {block}")));
        }
        Ok(u64::from(block) * self.layout.block_size())
    }

    /// Ensure the buffers fit the layout, and compute the /dev/mtdX offset for the page
    fn page_offset(&self, block: u32, page: u32, data_len: usize, oob_len: usize) -> Result<u64> {
        if page >= self.layout.pages_per_block {
            return Err(BmtError::OutOfRange(format!("block {block}, page {page}")));
        }
        if data_len != 0 && data_len != self.layout.bytes_per_page {
            return Err(BmtError::OutOfRange("data buffer not page-sized".into()));
        }
        if oob_len > self.layout.oob_bytes {
            return Err(BmtError::OutOfRange("OOB buffer too large".into()));
        }

        Ok(self.block_base(block)? + self.layout.bytes_per_page as u64 * u64::from(page))
    }
}

impl Flash for MtdNand {
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
        let mut req = ioctl::mtd_read_req {
            start: self.page_offset(block, page, data.len(), oob.len())?,
            len: data.len() as u64,
            ooblen: oob.len() as u64,
            usr_data: data.as_mut_ptr() as u64,
            usr_oob: oob.as_mut_ptr() as u64,
            mode: ioctl::MTD_OPS_PLACE_OOB,
            padding: [0; 7],
            ecc_stats: Default::default(),
        };

        match unsafe { ioctl::memread(self.file.as_raw_fd(), &mut req) } {
            Err(Errno::EBADMSG) => Err(BmtError::ReadFailure { block, page }),
            Err(errno) => Err(std::io::Error::from(errno).into()),
            Ok(_) if req.ecc_stats.uncorrectable_errors > 0 => {
                Err(BmtError::ReadFailure { block, page })
            }
            Ok(_) => Ok(req.ecc_stats.max_bitflips),
        }
    }

    fn write_page(&mut self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        let mut req = ioctl::mtd_write_req {
            start: self.page_offset(block, page, data.len(), oob.len())?,
            len: data.len() as u64,
            ooblen: oob.len() as u64,
            usr_data: data.as_ptr() as u64,
            usr_oob: oob.as_ptr() as u64,
            mode: ioctl::MTD_OPS_PLACE_OOB,
            padding: [0; 7],
        };

        unsafe { ioctl::memwrite(self.file.as_raw_fd(), &mut req) }
            .map_err(|_| BmtError::WriteFailure { block, page })?;
        Ok(())
    }

    fn urgent_write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, addr).map_err(|_| {
            let page = addr / self.layout.bytes_per_page as u64;
            let pages_per_block = u64::from(self.layout.pages_per_block);
            BmtError::WriteFailure {
                block: (page / pages_per_block) as u32,
                page: (page % pages_per_block) as u32,
            }
        })
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        let erase_info = ioctl::erase_info_user64 {
            start: self.block_base(block)?,
            length: self.layout.block_size(),
        };
        unsafe { ioctl::memerase64(self.file.as_raw_fd(), &erase_info) }
            .map_err(|_| BmtError::EraseFailure { block })?;
        Ok(())
    }

    fn is_bad(&mut self, block: u32) -> Result<bool> {
        let block_base = self.block_base(block)?;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base) }
            .map_err(std::io::Error::from)?;
        Ok(bad != 0)
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        let block_base = self.block_base(block)?;
        unsafe { ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base) }
            .map_err(std::io::Error::from)?;
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::FlashLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// Place OOB bytes at the given offset within the raw OOB area
    pub const MTD_OPS_PLACE_OOB: u8 = 0;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<FlashLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<FlashLayout> {
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );
            ensure!(self.oobsize >= 4, "MTD device has no usable OOB area");

            Ok(FlashLayout {
                blocks: self.size / self.erasesize,
                pages_per_block: self.erasesize / self.writesize,
                bytes_per_page: self.writesize as usize,
                oob_bytes: self.oobsize as usize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user64 {
        pub start: u64,
        pub length: u64,
    }
    ioctl_write_ptr!(memerase64, MTD_IOC_MAGIC, 20, erase_info_user64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 24, mtd_write_req);

    #[repr(C)]
    #[derive(Default)]
    pub struct mtd_read_req_ecc_stats {
        pub uncorrectable_errors: u32,
        pub corrected_bitflips: u32,
        pub max_bitflips: u32,
    }

    #[repr(C)]
    pub struct mtd_read_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
        pub ecc_stats: mtd_read_req_ecc_stats,
    }
    ioctl_readwrite!(memread, MTD_IOC_MAGIC, 26, mtd_read_req);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
}
