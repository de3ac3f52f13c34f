//! End-to-end tests over synthetic images.
//!
//! Each test assembles a small PE32 or PE32+ file byte by byte, runs the
//! dump driver on it and checks the rendered text:
//! 1. RVA resolution through a section whose raw data is not at its RVA
//! 2. Export table rendering
//! 3. Import descriptor and thunk termination with trailing garbage
//! 4. x86-64 exception unwind rendering

use peinspect::import::{self, ThunkKind};
use peinspect::{render, DumpConfig, DumpSection, Dumper, PeImage};

const PE_OFFSET: usize = 0x80;
const HEADERS_SIZE: usize = 0x400;
const FILE_ALIGNMENT: usize = 0x200;

const MACHINE_I386: u16 = 0x014C;
const MACHINE_AMD64: u16 = 0x8664;

const DIR_EXPORT: usize = 0;
const DIR_IMPORT: usize = 1;
const DIR_EXCEPTION: usize = 3;

struct Section {
    name: &'static str,
    va: u32,
    data: Vec<u8>,
}

/// Minimal image writer: every section gets 0x200 bytes of raw data.
struct Image {
    is_64bit: bool,
    directories: [(u32, u32); 16],
    sections: Vec<Section>,
}

impl Image {
    fn pe32() -> Self {
        Self {
            is_64bit: false,
            directories: [(0, 0); 16],
            sections: Vec::new(),
        }
    }

    fn pe32plus() -> Self {
        Self {
            is_64bit: true,
            ..Self::pe32()
        }
    }

    fn directory(mut self, index: usize, rva: u32, size: u32) -> Self {
        self.directories[index] = (rva, size);
        self
    }

    fn section(mut self, name: &'static str, va: u32, data: Vec<u8>) -> Self {
        assert!(data.len() <= FILE_ALIGNMENT);
        self.sections.push(Section { name, va, data });
        self
    }

    fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADERS_SIZE + self.sections.len() * FILE_ALIGNMENT];
        out[0..2].copy_from_slice(b"MZ");
        put32(&mut out, 0x3C, PE_OFFSET as u32);
        out[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let optional_size = if self.is_64bit { 112 } else { 96 } + 16 * 8;
        let fh = PE_OFFSET + 4;
        put16(&mut out, fh, if self.is_64bit { MACHINE_AMD64 } else { MACHINE_I386 });
        put16(&mut out, fh + 2, self.sections.len() as u16);
        put16(&mut out, fh + 16, optional_size as u16);
        put16(&mut out, fh + 18, 0x0102);

        let oh = fh + 20;
        put16(&mut out, oh, if self.is_64bit { 0x20B } else { 0x10B });
        let p = if self.is_64bit {
            put64(&mut out, oh + 24, 0x1_4000_0000);
            oh + 32
        } else {
            put32(&mut out, oh + 28, 0x40_0000);
            oh + 32
        };
        put32(&mut out, p, 0x1000);
        put32(&mut out, p + 4, FILE_ALIGNMENT as u32);
        put32(&mut out, p + 24, 0x10000);
        put32(&mut out, p + 28, HEADERS_SIZE as u32);
        put16(&mut out, p + 36, 3);
        let dirs = oh + optional_size - 16 * 8;
        put32(&mut out, dirs - 4, 16);
        for (i, (rva, size)) in self.directories.iter().enumerate() {
            put32(&mut out, dirs + i * 8, *rva);
            put32(&mut out, dirs + i * 8 + 4, *size);
        }

        let mut sh = oh + optional_size;
        for (i, s) in self.sections.iter().enumerate() {
            let raw = HEADERS_SIZE + i * FILE_ALIGNMENT;
            out[sh..sh + s.name.len()].copy_from_slice(s.name.as_bytes());
            put32(&mut out, sh + 8, FILE_ALIGNMENT as u32);
            put32(&mut out, sh + 12, s.va);
            put32(&mut out, sh + 16, FILE_ALIGNMENT as u32);
            put32(&mut out, sh + 20, raw as u32);
            put32(&mut out, sh + 36, 0x4000_0040);
            out[raw..raw + s.data.len()].copy_from_slice(&s.data);
            sh += 40;
        }
        out
    }
}

fn put16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn dump(bytes: &[u8], sections: &[DumpSection]) -> String {
    let config = DumpConfig {
        sections: sections.to_vec(),
        ..Default::default()
    };
    let dumper = Dumper::new(bytes).unwrap();
    let report = dumper.run(&config);
    let mut out = Vec::new();
    render::write_report(&mut out, dumper.image(), &report, &config).unwrap();
    String::from_utf8(out).unwrap()
}

/// `.text` at 0x1000 (file 0x400) and an export of `Foo` at 0x1010 from `.rdata`.
fn export_image() -> Vec<u8> {
    let mut text = vec![0x90u8; 0x20];
    text[0x10] = 0xC3;

    let mut rdata = vec![0u8; 0x60];
    put32(&mut rdata, 12, 0x2040); // name
    put32(&mut rdata, 16, 1); // base
    put32(&mut rdata, 20, 1); // functions
    put32(&mut rdata, 24, 1); // names
    put32(&mut rdata, 28, 0x2028);
    put32(&mut rdata, 32, 0x202C);
    put32(&mut rdata, 36, 0x2030);
    put32(&mut rdata, 0x28, 0x1010);
    put32(&mut rdata, 0x2C, 0x2050);
    put16(&mut rdata, 0x30, 0);
    rdata[0x40..0x48].copy_from_slice(b"test.dll");
    rdata[0x50..0x53].copy_from_slice(b"Foo");

    Image::pe32()
        .section(".text", 0x1000, text)
        .section(".rdata", 0x2000, rdata)
        .directory(DIR_EXPORT, 0x2000, 0x60)
        .build()
}

#[test]
fn test_rva_maps_through_section_raw_offset() {
    let bytes = export_image();
    assert_eq!(bytes[0x410], 0xC3);

    let image = PeImage::parse(&bytes).unwrap();
    assert_eq!(image.resolve_rva(0x1010, 1), Some(&[0xC3u8][..]));
    assert_eq!(image.resolve_rva(0, 1), None);
    assert_eq!(image.resolve_rva(0x9000, 1), None);
}

#[test]
fn test_export_table_renders_named_entry() {
    let text = dump(&export_image(), &[DumpSection::Export]);
    assert!(text.starts_with("Exports table:\n\n  Name:            test.dll\n"), "{text}");
    assert!(text.contains("  # of functions:  1\n"));
    assert!(text.contains("  Entry Pt  Ordn  Name\n  00001010     1 Foo\n"), "{text}");
}

#[test]
fn test_import_walk_stops_at_sentinels() {
    let mut idata = vec![0u8; 0x180];
    put32(&mut idata, 0, 0x2100); // OriginalFirstThunk
    put32(&mut idata, 12, 0x2160); // Name
    put32(&mut idata, 16, 0x2120); // FirstThunk
    // idata[20..40] is the all-zero sentinel; garbage follows it.
    idata[40..60].fill(0x41);

    put32(&mut idata, 0x100, 0x2140);
    // Zero thunk at 0x104, garbage after it.
    put32(&mut idata, 0x108, 0x2150);
    put16(&mut idata, 0x140, 7);
    idata[0x142..0x14D].copy_from_slice(b"ExitProcess");
    idata[0x150..0x158].copy_from_slice(b"\x01\x00Bogus\0");
    idata[0x160..0x16C].copy_from_slice(b"kernel32.dll");

    let bytes = Image::pe32()
        .section(".idata", 0x2000, idata)
        .directory(DIR_IMPORT, 0x2000, 40)
        .build();
    let image = PeImage::parse(&bytes).unwrap();
    let imports = import::decode(&image).unwrap().unwrap();

    assert_eq!(imports.descriptors.len(), 1);
    let desc = &imports.descriptors[0];
    assert_eq!(desc.dll_name.as_deref(), Some("kernel32.dll"));
    let thunks = desc.thunks.as_ref().unwrap();
    assert_eq!(thunks.len(), 1);
    assert_eq!(
        thunks[0].kind,
        ThunkKind::Named {
            hint: 7,
            name: "ExitProcess".to_string()
        }
    );

    let text = dump(&bytes, &[DumpSection::Import]);
    assert!(text.contains("  offset 00000400 kernel32.dll\n"), "{text}");
    assert!(text.contains("  00002120     7  ExitProcess\n"), "{text}");
    assert!(!text.contains("Bogus"));
}

#[test]
fn test_x64_exception_renders_push() {
    let mut pdata = vec![0u8; 12];
    put32(&mut pdata, 0, 0x2000);
    put32(&mut pdata, 4, 0x2010);
    put32(&mut pdata, 8, 0x3000);

    // Version 1, prolog 1 byte, one code: push rbp at offset 1.
    let xdata = vec![0x01, 0x01, 0x01, 0x00, 0x01, 0x50, 0x00, 0x00];

    let bytes = Image::pe32plus()
        .section(".text", 0x2000, vec![0x55, 0xC3])
        .section(".xdata", 0x3000, xdata)
        .section(".pdata", 0x4000, pdata)
        .directory(DIR_EXCEPTION, 0x4000, 12)
        .build();
    let text = dump(&bytes, &[DumpSection::Except]);

    assert!(text.starts_with("Exception info (1 functions):\n"), "{text}");
    assert!(text.contains("\nFunction 00002000-00002010:\n  unwind info at 00003000\n"));
    assert!(text.contains("    prolog 0x1 bytes\n"));
    assert!(text.contains("      0x01: push %rbp\n"), "{text}");
}

#[test]
fn test_all_keeps_going_past_broken_directory() {
    let bytes = Image::pe32()
        .section(".text", 0x1000, vec![0xC3])
        .directory(DIR_EXPORT, 0x8000, 0x28)
        .build();
    let text = dump(&bytes, &[DumpSection::All]);
    assert!(text.contains("Can't grab"), "{text}");
}

#[test]
fn test_non_pe_input_is_fatal() {
    let err = Dumper::new(b"definitely not an image").err().unwrap();
    assert!(err.is_fatal());
}
