//! The four OOB bytes every page carries for the benefit of the remapper.
//!
//! ```text
//! +---------+---------+------------------+
//! | byte 0  | byte 1  | bytes 2..4 (BE)  |
//! | hw bad  | sw bad  | remapped from    |
//! +---------+---------+------------------+
//! ```
//!
//! `0xFF` in a marker byte means good; `0xFFFF` in the remap field means "not a remap target".
//! These bytes are the ground truth the tables are rebuilt from when both stored copies are lost.

use bytes::{Buf, BufMut};

/// Number of leading OOB bytes owned by the remapper
pub const OOB_REMAP_BYTES: usize = 4;

const MARKER_GOOD: u8 = 0xFF;
const MARKER_BAD: u8 = 0x00;
const NOT_REMAPPED: u16 = 0xFFFF;

/// Decoded form of the remapper's OOB bytes
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct OobRemap {
    /// The block was marked bad at the hardware level
    pub hw_bad: bool,

    /// The block was retired by the remapper
    pub sw_bad: bool,

    /// The logical block this block stands in for (or, in a retired block, the block it was
    /// relocated to)
    pub remapped: Option<u16>,
}

impl OobRemap {
    /// A remap target standing in for `from`
    pub fn target_of(from: u16) -> Self {
        Self {
            remapped: Some(from),
            ..Default::default()
        }
    }

    /// Marks a block retired by the remapper, leaving everything else untouched
    pub fn software_bad() -> Self {
        Self {
            sw_bad: true,
            ..Default::default()
        }
    }

    /// Either marker set?
    pub fn is_bad(&self) -> bool {
        self.hw_bad || self.sw_bad
    }

    /// Convert from the leading bytes of an OOB buffer.
    ///
    /// Missing bytes are treated as erased.
    pub fn decode(oob: &[u8]) -> Self {
        let mut raw = [0xFF; OOB_REMAP_BYTES];
        let len = oob.len().min(OOB_REMAP_BYTES);
        raw[..len].copy_from_slice(&oob[..len]);

        let mut buf = &raw[..];
        let hw_bad = buf.get_u8() != MARKER_GOOD;
        let sw_bad = buf.get_u8() != MARKER_GOOD;
        let remapped = Some(buf.get_u16()).filter(|&x| x != NOT_REMAPPED);

        Self {
            hw_bad,
            sw_bad,
            remapped,
        }
    }

    /// Convert to the raw OOB bytes
    pub fn encode(self) -> [u8; OOB_REMAP_BYTES] {
        let marker = |bad| if bad { MARKER_BAD } else { MARKER_GOOD };

        let mut raw = [0u8; OOB_REMAP_BYTES];
        let mut buf = &mut raw[..];
        buf.put_u8(marker(self.hw_bad));
        buf.put_u8(marker(self.sw_bad));
        buf.put_u16(self.remapped.unwrap_or(NOT_REMAPPED));
        raw
    }

    /// Overwrite the remap field of a caller-supplied OOB buffer, growing it if needed
    pub fn stamp(oob: &mut Vec<u8>, from: u16) {
        if oob.len() < OOB_REMAP_BYTES {
            oob.resize(OOB_REMAP_BYTES, 0xFF);
        }
        oob[2..OOB_REMAP_BYTES].copy_from_slice(&from.to_be_bytes());
    }
}

#[test]
fn test_oob_encode() {
    assert_eq!(OobRemap::default().encode(), [0xFF; 4]);
    assert_eq!(OobRemap::target_of(0x0123).encode(), [0xFF, 0xFF, 0x01, 0x23]);
    assert_eq!(OobRemap::software_bad().encode(), [0xFF, 0x00, 0xFF, 0xFF]);

    let decoded = OobRemap::decode(&[0x00, 0xFF, 0x03, 0xAC, 0x55, 0x55]);
    assert!(decoded.hw_bad);
    assert!(!decoded.sw_bad);
    assert!(decoded.is_bad());
    assert_eq!(decoded.remapped, Some(940));

    // Anything short of all-ones is bad, and short buffers read as erased
    assert!(OobRemap::decode(&[0xFE]).hw_bad);
    assert_eq!(OobRemap::decode(&[]), OobRemap::default());
}

#[test]
fn test_oob_stamp() {
    let mut oob = vec![0xFF];
    OobRemap::stamp(&mut oob, 7);
    assert_eq!(oob, [0xFF, 0xFF, 0x00, 0x07]);

    let mut oob = vec![0xFF, 0xFF, 0xFF, 0xFF, 0x12];
    OobRemap::stamp(&mut oob, 0x0304);
    assert_eq!(oob, [0xFF, 0xFF, 0x03, 0x04, 0x12]);
}
