//! Flash-geometry descriptor parsing.
//!
//! DfuSe bootloaders describe their memory in the string descriptor of
//! each alternate setting, e.g.
//! `@Internal Flash  /0x08000000/4*016Kg,1*064Kg,7*128Kg`. Each
//! segment is `<pages>*<size><unit><mode>` where the unit is blank for
//! bytes, `K` for KiB or `M` for MiB, and the mode letter encodes the
//! allowed operations. Segments are laid out back to back from the
//! declared base address.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Malformed memory descriptor: {0}")]
    MalformedDescriptor(String),
}

/// Page access mode letter from the descriptor. Recorded as reported;
/// nothing here enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAccess(pub char);

impl PageAccess {
    pub fn readable(&self) -> bool {
        matches!(self.0, 'a' | 'c' | 'e' | 'g')
    }

    pub fn erasable(&self) -> bool {
        matches!(self.0, 'b' | 'c' | 'f' | 'g')
    }

    pub fn writable(&self) -> bool {
        matches!(self.0, 'd' | 'e' | 'f' | 'g')
    }
}

/// A run of equally sized pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start_address: u32,
    pub pages: u32,
    pub page_size: u32,
    pub access: PageAccess,
}

impl Region {
    /// Total size in bytes.
    pub fn size(&self) -> u32 {
        self.pages * self.page_size
    }

    pub fn end_address(&self) -> u32 {
        self.start_address + self.size()
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start_address && address < self.end_address()
    }

    /// Index of the page containing `address`.
    pub fn page_index(&self, address: u32) -> u32 {
        (address - self.start_address) / self.page_size
    }
}

/// Decoded flash geometry: contiguous regions from a single base
/// address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub name: String,
    pub regions: Vec<Region>,
}

impl MemoryLayout {
    /// Parse an interface descriptor string.
    pub fn parse(descriptor: &str) -> Result<Self, LayoutError> {
        let malformed = || LayoutError::MalformedDescriptor(descriptor.to_string());

        let mut parts = descriptor.split('/');
        let name_part = parts.next().ok_or_else(malformed)?;
        let name = name_part.trim_start_matches('@').trim().to_string();

        let addr_part = parts.next().ok_or_else(malformed)?;
        let mut address = parse_number(addr_part.trim()).ok_or_else(malformed)?;

        let segment_part = parts.next().ok_or_else(malformed)?;
        let mut regions = Vec::new();
        for segment in segment_part.split(',') {
            let (pages, page_size, access) =
                parse_segment(segment.trim()).ok_or_else(malformed)?;
            let region = Region {
                start_address: address,
                pages,
                page_size,
                access,
            };
            address += region.size();
            regions.push(region);
        }

        if regions.is_empty() {
            return Err(malformed());
        }

        Ok(MemoryLayout { name, regions })
    }

    /// The region containing `address`, if any.
    pub fn region_containing(&self, address: u32) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(address))
    }

    pub fn start_address(&self) -> u32 {
        self.regions[0].start_address
    }

    pub fn end_address(&self) -> u32 {
        self.regions[self.regions.len() - 1].end_address()
    }
}

/// `<pages>*<size>[K|M]<mode>`
fn parse_segment(segment: &str) -> Option<(u32, u32, PageAccess)> {
    let (pages_str, rest) = segment.split_once('*')?;
    let pages: u32 = pages_str.parse().ok()?;

    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let mut page_size: u32 = rest[..digits].parse().ok()?;

    let tail: Vec<char> = rest[digits..].chars().collect();
    let mode = match tail.as_slice() {
        [mode] => *mode,
        [unit, mode] => {
            match unit {
                'K' => page_size *= 1024,
                'M' => page_size *= 1024 * 1024,
                ' ' => {}
                _ => return None,
            }
            *mode
        }
        _ => return None,
    };
    if !mode.is_ascii_alphabetic() || pages == 0 || page_size == 0 {
        return None;
    }

    Some((pages, page_size, PageAccess(mode)))
}

/// Decimal, or hex with a `0x` prefix.
fn parse_number(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_region() {
        let layout = MemoryLayout::parse("@Flash /0x08000000/16*1Ka").unwrap();
        assert_eq!(layout.name, "Flash");
        assert_eq!(layout.regions.len(), 1);

        let region = &layout.regions[0];
        assert_eq!(region.start_address, 0x0800_0000);
        assert_eq!(region.pages, 16);
        assert_eq!(region.page_size, 1024);
        assert_eq!(region.size(), 16384);
        assert!(region.access.readable());
        assert!(!region.access.writable());
    }

    #[test]
    fn test_stm32f4_style_descriptor() {
        let layout =
            MemoryLayout::parse("@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg")
                .unwrap();
        assert_eq!(layout.name, "Internal Flash");
        assert_eq!(layout.regions.len(), 3);

        // Regions are laid out back to back.
        assert_eq!(layout.regions[0].start_address, 0x0800_0000);
        assert_eq!(layout.regions[1].start_address, 0x0801_0000);
        assert_eq!(layout.regions[2].start_address, 0x0802_0000);
        assert_eq!(layout.end_address(), 0x0810_0000);
        for window in layout.regions.windows(2) {
            assert_eq!(window[0].end_address(), window[1].start_address);
        }
    }

    #[test]
    fn test_region_lookup_and_page_index() {
        let layout = MemoryLayout::parse("@Flash /0x08000000/16*1Ka").unwrap();
        let region = layout.region_containing(0x0800_0400).unwrap();
        assert_eq!(region.page_index(0x0800_0400), 1);
        assert_eq!(region.page_index(0x0800_0BFF), 2);
        assert!(layout.region_containing(0x0800_4000).is_none());
        assert!(layout.region_containing(0x0700_0000).is_none());
    }

    #[test]
    fn test_byte_and_megabyte_units() {
        let layout = MemoryLayout::parse("@OTP /0x1FFF7800/1*512 e,1*1Mg").unwrap();
        assert_eq!(layout.regions[0].page_size, 512);
        assert_eq!(layout.regions[1].page_size, 1024 * 1024);
        assert_eq!(layout.regions[1].start_address, 0x1FFF_7800 + 512);
    }

    #[test]
    fn test_malformed_descriptors() {
        for bad in [
            "",
            "@Flash",
            "@Flash /0x08000000",
            "@Flash /notanumber/16*1Ka",
            "@Flash /0x08000000/16*Ka",
            "@Flash /0x08000000/16-1Ka",
            "@Flash /0x08000000/16*1Qa",
            "@Flash /0x08000000/16*1K9",
            "@Flash /0x08000000/0*1Ka",
        ] {
            assert!(
                matches!(
                    MemoryLayout::parse(bad),
                    Err(LayoutError::MalformedDescriptor(_))
                ),
                "expected failure for {bad:?}"
            );
        }
    }
}
