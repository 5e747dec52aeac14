//! Settings read once when a device is attached.

use std::str::FromStr;

use anyhow::{ensure, Context};

/// How the remapper should treat an attached device
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BmtConfig {
    /// With this off, every call passes straight through to the device
    pub enabled: bool,

    /// Byte ranges of the device eligible for translation. Empty means the whole device.
    pub ranges: Vec<RemapRange>,

    /// Reads correcting at least this many bitflips trigger a relocation; 0 never does
    pub bitflip_threshold: u32,
}

impl Default for BmtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ranges: Vec::new(),
            bitflip_threshold: 0,
        }
    }
}

impl BmtConfig {
    /// Is the block starting at byte `block_base` eligible for translation?
    pub fn covers(&self, block_base: u64) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(block_base))
    }
}

/// A half-open range of byte addresses, `start..end`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RemapRange {
    pub start: u64,
    pub end: u64,
}

impl RemapRange {
    pub fn contains(&self, addr: u64) -> bool {
        (self.start..self.end).contains(&addr)
    }
}

fn parse_addr(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    value.with_context(|| format!("bad address {s:?}"))
}

/// Parse strings like "0x100000-0x800000"
impl FromStr for RemapRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or(anyhow::anyhow!("expected START-END"))?;
        let start = parse_addr(start)?;
        let end = parse_addr(end)?;
        ensure!(start < end, "empty range {start:#x}-{end:#x}");

        Ok(RemapRange { start, end })
    }
}

#[test]
fn test_range_parse() {
    let range: RemapRange = "0x20000-0x40000".parse().unwrap();
    assert_eq!(
        range,
        RemapRange {
            start: 0x20000,
            end: 0x40000
        }
    );
    assert!(range.contains(0x20000));
    assert!(range.contains(0x3FFFF));
    assert!(!range.contains(0x40000));

    assert_eq!(
        "4096-8192".parse::<RemapRange>().unwrap(),
        RemapRange {
            start: 4096,
            end: 8192
        }
    );
    assert!("0x10".parse::<RemapRange>().is_err());
    assert!("0x40-0x20".parse::<RemapRange>().is_err());
    assert!("zz-0x20".parse::<RemapRange>().is_err());
}

#[test]
fn test_covers() {
    let mut config = BmtConfig::default();
    assert!(config.covers(0));
    assert!(config.covers(u64::MAX));

    config.ranges = vec![
        "0x0-0x10000".parse().unwrap(),
        "0x80000-0x100000".parse().unwrap(),
    ];
    assert!(config.covers(0x8000));
    assert!(!config.covers(0x10000));
    assert!(config.covers(0x80000));
    assert!(!config.covers(0x100000));
}
