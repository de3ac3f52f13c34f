//! Synthetic PE image builder for unit tests.

use crate::pe::{
    DirectoryIndex, DATA_DIRECTORY_SIZE, DOS_MAGIC, FILE_HEADER_SIZE, MACHINE_AMD64, MACHINE_I386,
    NUMBER_OF_DIRECTORY_ENTRIES, OPTIONAL_HEADER32_FIXED, OPTIONAL_HEADER64_FIXED, PE32PLUS_MAGIC,
    PE32_MAGIC, PE_SIGNATURE, SECTION_HEADER_SIZE,
};

pub(crate) const PE_OFFSET: usize = 0x80;
pub(crate) const HEADERS_SIZE: usize = 0x400;
const FILE_ALIGNMENT: usize = 0x200;

struct TestSection {
    name: String,
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    data: Vec<u8>,
}

/// Builds a minimal but well-formed PE32 or PE32+ image in memory.
pub(crate) struct ImageBuilder {
    is_64bit: bool,
    machine: u16,
    image_base: u64,
    rva_and_sizes: u32,
    directories: [(u32, u32); NUMBER_OF_DIRECTORY_ENTRIES],
    sections: Vec<TestSection>,
}

impl ImageBuilder {
    pub(crate) fn pe32() -> Self {
        Self::new(false, MACHINE_I386)
    }

    pub(crate) fn pe32plus() -> Self {
        Self::new(true, MACHINE_AMD64)
    }

    fn new(is_64bit: bool, machine: u16) -> Self {
        Self {
            is_64bit,
            machine,
            image_base: 0x40_0000,
            rva_and_sizes: NUMBER_OF_DIRECTORY_ENTRIES as u32,
            directories: [(0, 0); NUMBER_OF_DIRECTORY_ENTRIES],
            sections: Vec::new(),
        }
    }

    pub(crate) fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub(crate) fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub(crate) fn rva_and_sizes(mut self, count: u32) -> Self {
        self.rva_and_sizes = count;
        self
    }

    pub(crate) fn directory(mut self, index: DirectoryIndex, rva: u32, size: u32) -> Self {
        self.directories[index as usize] = (rva, size);
        self
    }

    /// Adds a section whose virtual size equals its raw size.
    pub(crate) fn section(self, name: &str, va: u32, raw_size: u32, data: &[u8]) -> Self {
        self.section_sized(name, va, raw_size, raw_size, data)
    }

    pub(crate) fn section_sized(
        mut self,
        name: &str,
        va: u32,
        virtual_size: u32,
        raw_size: u32,
        data: &[u8],
    ) -> Self {
        assert!(data.len() <= raw_size as usize, "section data larger than raw size");
        self.sections.push(TestSection {
            name: name.to_string(),
            virtual_address: va,
            virtual_size,
            raw_size,
            data: data.to_vec(),
        });
        self
    }

    pub(crate) fn optional_header_size(&self) -> usize {
        let fixed = if self.is_64bit {
            OPTIONAL_HEADER64_FIXED
        } else {
            OPTIONAL_HEADER32_FIXED
        };
        fixed + NUMBER_OF_DIRECTORY_ENTRIES * DATA_DIRECTORY_SIZE
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut raw_offsets = Vec::with_capacity(self.sections.len());
        let mut next = HEADERS_SIZE;
        for s in &self.sections {
            raw_offsets.push(next);
            next += (s.raw_size as usize).div_ceil(FILE_ALIGNMENT) * FILE_ALIGNMENT;
        }

        let mut out = vec![0u8; next];
        put16(&mut out, 0, DOS_MAGIC);
        put32(&mut out, 0x3C, PE_OFFSET as u32);
        put32(&mut out, PE_OFFSET, PE_SIGNATURE);

        let fh = PE_OFFSET + 4;
        put16(&mut out, fh, self.machine);
        put16(&mut out, fh + 2, self.sections.len() as u16);
        put32(&mut out, fh + 4, 0x5F00_0000);
        put16(&mut out, fh + 16, self.optional_header_size() as u16);
        put16(&mut out, fh + 18, 0x0102);

        let oh = fh + FILE_HEADER_SIZE;
        let size_of_image = self
            .sections
            .iter()
            .map(|s| s.virtual_address + s.virtual_size.max(s.raw_size))
            .max()
            .unwrap_or(0x1000);
        put16(&mut out, oh, if self.is_64bit { PE32PLUS_MAGIC } else { PE32_MAGIC });
        out[oh + 2] = 14;
        put32(&mut out, oh + 16, 0x1000); // entry point
        put32(&mut out, oh + 20, 0x1000); // base of code
        let mut p = oh + 24;
        if self.is_64bit {
            put64(&mut out, p, self.image_base);
            p += 8;
        } else {
            put32(&mut out, p, 0); // base of data
            put32(&mut out, p + 4, self.image_base as u32);
            p += 8;
        }
        put32(&mut out, p, 0x1000); // section alignment
        put32(&mut out, p + 4, FILE_ALIGNMENT as u32);
        put16(&mut out, p + 8, 6);
        put16(&mut out, p + 16, 6);
        put32(&mut out, p + 24, size_of_image);
        put32(&mut out, p + 28, HEADERS_SIZE as u32);
        put16(&mut out, p + 36, 3); // console subsystem
        put16(&mut out, p + 38, 0x0140);
        p += 40;
        for value in [0x10_0000u64, 0x1000, 0x10_0000, 0x1000] {
            if self.is_64bit {
                put64(&mut out, p, value);
                p += 8;
            } else {
                put32(&mut out, p, value as u32);
                p += 4;
            }
        }
        put32(&mut out, p + 4, self.rva_and_sizes);
        p += 8;
        for (rva, size) in self.directories {
            put32(&mut out, p, rva);
            put32(&mut out, p + 4, size);
            p += DATA_DIRECTORY_SIZE;
        }

        let mut sh = oh + self.optional_header_size();
        for (s, &raw) in self.sections.iter().zip(&raw_offsets) {
            let name = s.name.as_bytes();
            out[sh..sh + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            put32(&mut out, sh + 8, s.virtual_size);
            put32(&mut out, sh + 12, s.virtual_address);
            put32(&mut out, sh + 16, s.raw_size);
            put32(&mut out, sh + 20, raw as u32);
            put32(&mut out, sh + 36, 0x6000_0020);
            out[raw..raw + s.data.len()].copy_from_slice(&s.data);
            sh += SECTION_HEADER_SIZE;
        }
        out
    }
}

pub(crate) fn put16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
