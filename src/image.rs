//! RVA resolution over the raw image bytes.
//!
//! [`PeImage`] pairs the file bytes with the parsed headers and turns
//! relative virtual addresses into bounds-checked slices of the file. Every
//! cross-reference a decoder follows goes through [`PeImage::resolve_rva`].

use tracing::warn;

use crate::bytes::{cstr, read_u16, read_u32, read_u64};
use crate::error::{Error, Result};
use crate::pe::{DataDirectory, DirectoryIndex, Headers, SectionHeader};

/// A data directory entry together with the bytes it covers.
#[derive(Clone, Copy, Debug)]
pub struct Directory<'a> {
    pub rva: u32,
    pub size: u32,
    pub data: &'a [u8],
}

impl Directory<'_> {
    /// Does `rva` fall inside this directory's own `[rva, rva + size)` window?
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.rva && rva - self.rva < self.size
    }
}

/// A parsed PE image borrowing the file bytes.
#[derive(Debug)]
pub struct PeImage<'a> {
    data: &'a [u8],
    headers: Headers,
}

impl<'a> PeImage<'a> {
    /// Parse the headers of `data`. Fails only on a bad signature or a
    /// file too short to hold the file header.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let headers = Headers::parse(data)?;
        Ok(Self { data, headers })
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn is_64bit(&self) -> bool {
        self.headers.is_64bit()
    }

    /// Size in bytes of a pointer-sized field in this image.
    pub fn pointer_size(&self) -> u32 {
        if self.is_64bit() {
            8
        } else {
            4
        }
    }

    /// Raw file bytes at `offset`, for the few structures addressed by file
    /// offset rather than RVA.
    pub fn file_bytes(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        self.data.get(offset..offset.checked_add(len)?)
    }

    /// Translate `[rva, rva + len)` into a slice of the file.
    ///
    /// Returns `None` for the null RVA, or when no single section holds the
    /// whole range in its raw data. Sections are scanned in table order
    /// since the table is not guaranteed to be sorted.
    pub fn resolve_rva(&self, rva: u32, len: u32) -> Option<&'a [u8]> {
        if rva == 0 {
            return None;
        }
        self.headers
            .sections
            .iter()
            .find_map(|s| self.slice_in_section(s, rva, Some(len)))
    }

    /// Everything from `rva` to the end of its section's raw data.
    pub fn resolve_tail(&self, rva: u32) -> Option<&'a [u8]> {
        if rva == 0 {
            return None;
        }
        self.headers
            .sections
            .iter()
            .find_map(|s| self.slice_in_section(s, rva, None))
    }

    fn slice_in_section(&self, s: &SectionHeader, rva: u32, len: Option<u32>) -> Option<&'a [u8]> {
        let off = rva.checked_sub(s.virtual_address)?;
        if off >= s.mapped_size() {
            return None;
        }
        let len = match len {
            Some(len) => len,
            None => s.size_of_raw_data.checked_sub(off)?,
        };
        if off.checked_add(len)? > s.size_of_raw_data {
            return None;
        }
        let start = (s.pointer_to_raw_data as usize).checked_add(off as usize)?;
        self.file_bytes(start, len as usize)
    }

    /// File offset backing `rva`, if it is mapped.
    pub fn file_offset(&self, rva: u32) -> Option<usize> {
        let bytes = self.resolve_rva(rva, 1)?;
        Some(bytes.as_ptr() as usize - self.data.as_ptr() as usize)
    }

    /// Same as [`resolve_rva`](Self::resolve_rva) but reports failure as an
    /// unresolved reference named `what`.
    pub fn require(&self, what: &'static str, rva: u32, len: u32) -> Result<&'a [u8]> {
        self.resolve_rva(rva, len).ok_or_else(|| {
            warn!(what, rva = format_args!("{rva:#x}"), len, "unresolved reference");
            Error::unresolved(what, rva, len as usize)
        })
    }

    pub fn read_u16(&self, rva: u32) -> Option<u16> {
        read_u16(self.resolve_rva(rva, 2)?, 0)
    }

    pub fn read_u32(&self, rva: u32) -> Option<u32> {
        read_u32(self.resolve_rva(rva, 4)?, 0)
    }

    pub fn read_u64(&self, rva: u32) -> Option<u64> {
        read_u64(self.resolve_rva(rva, 8)?, 0)
    }

    /// Reads a pointer-sized value (4 or 8 bytes, per bitness).
    pub fn read_ptr(&self, rva: u32) -> Option<u64> {
        if self.is_64bit() {
            self.read_u64(rva)
        } else {
            self.read_u32(rva).map(u64::from)
        }
    }

    /// NUL-terminated string at `rva`, bounded by its section.
    pub fn read_cstr(&self, rva: u32) -> Option<String> {
        self.resolve_tail(rva).map(cstr)
    }

    /// Convert an absolute virtual address to an RVA against `ImageBase`.
    pub fn va_to_rva(&self, va: u64) -> Option<u32> {
        va.checked_sub(self.headers.image_base())
            .and_then(|rva| u32::try_from(rva).ok())
    }

    /// Look up a data directory.
    ///
    /// `Ok(None)` means the slot is beyond `NumberOfRvaAndSizes` or its RVA
    /// is zero. A non-null directory that does not map is an error.
    pub fn directory(&self, index: DirectoryIndex) -> Result<Option<Directory<'a>>> {
        let Some(DataDirectory { virtual_address, size }) = self.headers.data_directory(index) else {
            return Ok(None);
        };
        if virtual_address == 0 {
            return Ok(None);
        }
        let data = self.require(index.name(), virtual_address, size)?;
        Ok(Some(Directory {
            rva: virtual_address,
            size,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ImageBuilder;

    fn two_section_image() -> Vec<u8> {
        let text: Vec<u8> = (0..0x200u32).map(|i| i as u8).collect();
        let data: Vec<u8> = (0..0x100u32).map(|i| 0xff - i as u8).collect();
        ImageBuilder::pe32()
            // Listed out of address order on purpose.
            .section_sized(".data", 0x3000, 0x400, 0x100, &data)
            .section(".text", 0x1000, 0x200, &text)
            .build()
    }

    #[test]
    fn test_rva_round_trip_over_every_byte() {
        let bytes = two_section_image();
        let image = PeImage::parse(&bytes).unwrap();
        for s in &image.headers().sections {
            for k in 0..s.virtual_size {
                let got = image.resolve_rva(s.virtual_address + k, 1);
                if k < s.size_of_raw_data {
                    let expected = bytes[(s.pointer_to_raw_data + k) as usize];
                    assert_eq!(got, Some(&[expected][..]), "rva {:#x}", s.virtual_address + k);
                } else {
                    assert_eq!(got, None, "zero-fill tail must not resolve");
                }
            }
        }
    }

    #[test]
    fn test_null_rva_never_resolves() {
        let bytes = ImageBuilder::pe32().section(".text", 0, 0x200, &[1, 2, 3]).build();
        let image = PeImage::parse(&bytes).unwrap();
        for len in [0, 1, 4, 0x200] {
            assert_eq!(image.resolve_rva(0, len), None);
        }
        assert_eq!(image.resolve_tail(0), None);
        assert!(image.resolve_rva(1, 1).is_some());
    }

    #[test]
    fn test_range_must_fit_raw_data() {
        let bytes = two_section_image();
        let image = PeImage::parse(&bytes).unwrap();
        assert!(image.resolve_rva(0x1000, 0x200).is_some());
        assert_eq!(image.resolve_rva(0x1001, 0x200), None);
        assert_eq!(image.resolve_rva(0x2000, 1), None);
        assert_eq!(image.resolve_rva(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn test_cstr_and_file_offset() {
        let mut text = vec![0u8; 0x200];
        text[0x10..0x14].copy_from_slice(b"Foo\0");
        let bytes = ImageBuilder::pe32().section(".text", 0x1000, 0x200, &text).build();
        let image = PeImage::parse(&bytes).unwrap();
        assert_eq!(image.read_cstr(0x1010).as_deref(), Some("Foo"));
        assert_eq!(image.file_offset(0x1010), Some(0x410));
        assert_eq!(image.va_to_rva(0x40_1010), Some(0x1010));
        assert_eq!(image.va_to_rva(0x10), None);
    }

    #[test]
    fn test_unmapped_directory_is_an_error() {
        let bytes = ImageBuilder::pe32()
            .section(".text", 0x1000, 0x200, &[])
            .directory(DirectoryIndex::Export, 0x9000, 0x28)
            .build();
        let image = PeImage::parse(&bytes).unwrap();
        assert!(matches!(
            image.directory(DirectoryIndex::Export),
            Err(Error::Unresolved { rva: 0x9000, .. })
        ));
        assert!(image.directory(DirectoryIndex::Import).unwrap().is_none());
    }
}
