//! DfuSe memory layout descriptors
//!
//! The alternate setting string of a DfuSe interface describes the memory behind it, e.g.
//! `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`.

use std::ops::Range;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("The layout descriptor does not start with '@'")]
    MissingMarker,
    #[error("Invalid start address {:?}", _0)]
    InvalidAddress(String),
    #[error("Invalid sector description {:?}", _0)]
    InvalidSectors(String),
}

/// A single erasable page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub address: u32,
    pub size: u32,
    /// The attribute letter: `a` readable, `b` erasable, `d` writeable, combined by addition up to
    /// `g`
    pub attributes: u8,
}

impl Page {
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    pub fn is_erasable(&self) -> bool {
        (self.attributes - b'a' + 1) & 0b010 != 0
    }

    pub fn is_readable(&self) -> bool {
        (self.attributes - b'a' + 1) & 0b001 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryLayout {
    pub name: String,
    pub pages: Vec<Page>,
}

impl MemoryLayout {
    pub fn parse(descriptor: &str) -> Result<MemoryLayout, LayoutError> {
        let descriptor = descriptor
            .trim()
            .strip_prefix('@')
            .ok_or(LayoutError::MissingMarker)?;

        let mut parts = descriptor.split('/');
        let name = parts.next().unwrap_or_default().trim().to_owned();
        let mut pages = Vec::new();

        while let Some(address) = parts.next() {
            let address = address.trim();
            let mut next = parse_hex(address)
                .ok_or_else(|| LayoutError::InvalidAddress(address.to_owned()))?;

            let sectors = parts
                .next()
                .ok_or_else(|| LayoutError::InvalidSectors(String::new()))?;

            for sector in sectors.split(',').filter(|s| !s.trim().is_empty()) {
                let (count, size, attributes) = parse_sector(sector)
                    .ok_or_else(|| LayoutError::InvalidSectors(sector.to_owned()))?;

                for _ in 0..count {
                    pages.push(Page {
                        address: next,
                        size,
                        attributes,
                    });
                    next = next.wrapping_add(size);
                }
            }
        }

        Ok(MemoryLayout { name, pages })
    }

    /// The lowest address described by the layout.
    pub fn start(&self) -> Option<u32> {
        self.pages.first().map(|p| p.address)
    }

    /// The total number of bytes described by the layout.
    pub fn size(&self) -> u64 {
        self.pages.iter().map(|p| p.size as u64).sum()
    }

    /// Returns the pages overlapping `range`, or the first address of `range` not covered by
    /// any page.
    pub fn pages_in(&self, range: Range<u32>) -> Result<Vec<Page>, u32> {
        let mut covered = range.start as u64;
        let mut pages = Vec::new();

        for page in &self.pages {
            if page.end() <= range.start as u64 || page.address >= range.end {
                continue;
            }

            if page.address as u64 > covered {
                return Err(covered as u32);
            }

            covered = covered.max(page.end());
            pages.push(*page);
        }

        if covered < range.end as u64 {
            return Err(covered as u32);
        }

        Ok(pages)
    }

    /// Whether every byte of `range` is described by the layout.
    pub fn contains(&self, range: Range<u32>) -> bool {
        self.pages_in(range).is_ok()
    }
}

fn parse_hex(text: &str) -> Option<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))?;

    u32::from_str_radix(digits, 16).ok()
}

/// Parses `NN*SSSua` where `u` is the unit (` `, `B`, `K` or `M`) and `a` the attribute letter.
fn parse_sector(sector: &str) -> Option<(u32, u32, u8)> {
    let sector = sector.trim();
    let (count, rest) = sector.split_at(sector.find('*')?);
    let count: u32 = count.trim().parse().ok()?;

    let rest = rest[1..].as_bytes();
    let (&attributes, rest) = rest.split_last()?;

    if !(b'a'..=b'g').contains(&attributes) {
        return None;
    }

    let (multiplier, digits) = match rest.split_last() {
        Some((&b'K', digits)) => (1024, digits),
        Some((&b'M', digits)) => (1024 * 1024, digits),
        Some((&b'B', digits)) | Some((&b' ', digits)) => (1, digits),
        _ => (1, rest),
    };

    let size: u32 = std::str::from_utf8(digits).ok()?.trim().parse().ok()?;

    Some((count, size.checked_mul(multiplier)?, attributes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const F4_FLASH: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg";

    #[test]
    fn it_should_parse_sector_lists() {
        let layout = MemoryLayout::parse(F4_FLASH).unwrap();

        assert_eq!(layout.name, "Internal Flash");
        assert_eq!(layout.pages.len(), 12);
        assert_eq!(layout.start(), Some(0x0800_0000));
        assert_eq!(layout.size(), 1024 * 1024);
        assert_eq!(layout.pages[4].address, 0x0801_0000);
        assert_eq!(layout.pages[4].size, 64 * 1024);
        assert_eq!(layout.pages[5].address, 0x0802_0000);
    }

    #[test]
    fn it_should_parse_byte_units_and_attributes() {
        let layout = MemoryLayout::parse("@Option Bytes  /0x1FFFC000/01*016 e").unwrap();

        assert_eq!(layout.pages.len(), 1);
        assert_eq!(layout.pages[0].size, 16);
        assert!(layout.pages[0].is_readable());
        assert!(!layout.pages[0].is_erasable());
    }

    #[test]
    fn it_should_parse_multiple_address_blocks() {
        let layout =
            MemoryLayout::parse("@Internal Flash /0x08000000/02*002Kg/0x08100000/01*128Ka")
                .unwrap();

        assert_eq!(layout.pages.len(), 3);
        assert_eq!(layout.pages[2].address, 0x0810_0000);
        assert!(!layout.pages[2].is_erasable());
    }

    #[test]
    fn it_should_find_pages_covering_a_range() {
        let layout = MemoryLayout::parse(F4_FLASH).unwrap();
        let pages = layout.pages_in(0x0800_3ff0..0x0800_8000).unwrap();

        assert_eq!(
            pages.iter().map(|p| p.address).collect::<Vec<_>>(),
            vec![0x0800_0000, 0x0800_4000]
        );
    }

    #[test]
    fn it_should_report_uncovered_addresses() {
        let layout = MemoryLayout::parse(F4_FLASH).unwrap();

        assert_eq!(layout.pages_in(0x080f_fff0..0x0810_0010), Err(0x0810_0000));
        assert_eq!(layout.pages_in(0x0400_0000..0x0400_0010), Err(0x0400_0000));
        assert!(!layout.contains(0x2000_0000..0x2000_0004));
    }

    #[test]
    fn it_should_reject_malformed_descriptors() {
        assert_eq!(
            MemoryLayout::parse("Internal Flash"),
            Err(LayoutError::MissingMarker)
        );
        assert!(matches!(
            MemoryLayout::parse("@Flash/08000000/04*016Kg"),
            Err(LayoutError::InvalidAddress(_))
        ));
        assert!(matches!(
            MemoryLayout::parse("@Flash/0x08000000/04*016Kz"),
            Err(LayoutError::InvalidSectors(_))
        ));
    }
}
