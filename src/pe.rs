//! PE format constants and header parsing.
//!
//! This module reads the DOS header, the COFF file header, the PE32/PE32+
//! optional header and the section table into one normalized [`Headers`]
//! value. Nothing downstream needs to care about the optional header's
//! source width except when rendering.

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::bytes::{cstr, read_u16, read_u32, FieldReader};
use crate::error::{Error, Result};

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const PE32_MAGIC: u16 = 0x10B;
pub const PE32PLUS_MAGIC: u16 = 0x20B;
pub const ROM_MAGIC: u16 = 0x107;

pub const MACHINE_UNKNOWN: u16 = 0x0000;
pub const MACHINE_I386: u16 = 0x014C;
pub const MACHINE_R3000: u16 = 0x0162;
pub const MACHINE_R4000: u16 = 0x0166;
pub const MACHINE_R10000: u16 = 0x0168;
pub const MACHINE_ALPHA: u16 = 0x0184;
pub const MACHINE_POWERPC: u16 = 0x01F0;
pub const MACHINE_ARM: u16 = 0x01C0;
pub const MACHINE_THUMB: u16 = 0x01C2;
pub const MACHINE_ARMNT: u16 = 0x01C4;
pub const MACHINE_IA64: u16 = 0x0200;
pub const MACHINE_I860: u16 = 0x014D;
pub const MACHINE_AMD64: u16 = 0x8664;
pub const MACHINE_ARM64: u16 = 0xAA64;

pub const DOS_HEADER_SIZE: usize = 64;
pub const FILE_HEADER_SIZE: usize = 20;
pub const SECTION_HEADER_SIZE: usize = 40;
pub const COFF_SYMBOL_SIZE: usize = 18;
pub const NUMBER_OF_DIRECTORY_ENTRIES: usize = 16;

pub(crate) const OPTIONAL_HEADER32_FIXED: usize = 96;
pub(crate) const OPTIONAL_HEADER64_FIXED: usize = 112;
pub(crate) const DATA_DIRECTORY_SIZE: usize = 8;

const WINE_BUILTIN_SIGNATURE: &[u8] = b"Wine builtin DLL\0";
const WINE_PLACEHOLDER_SIGNATURE: &[u8] = b"Wine placeholder DLL\0";

bitflags! {
    /// `IMAGE_FILE_*` characteristics of the COFF file header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FileCharacteristics: u16 {
        const RELOCS_STRIPPED = 0x0001;
        const EXECUTABLE_IMAGE = 0x0002;
        const LINE_NUMS_STRIPPED = 0x0004;
        const LOCAL_SYMS_STRIPPED = 0x0008;
        const AGGRESIVE_WS_TRIM = 0x0010;
        const LARGE_ADDRESS_AWARE = 0x0020;
        const MACHINE_16BIT = 0x0040;
        const BYTES_REVERSED_LO = 0x0080;
        const MACHINE_32BIT = 0x0100;
        const DEBUG_STRIPPED = 0x0200;
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        const NET_RUN_FROM_SWAP = 0x0800;
        const SYSTEM = 0x1000;
        const DLL = 0x2000;
        const UP_SYSTEM_ONLY = 0x4000;
        const BYTES_REVERSED_HI = 0x8000;
    }
}

bitflags! {
    /// `IMAGE_DLLCHARACTERISTICS_*` flags of the optional header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DllCharacteristics: u16 {
        const HIGH_ENTROPY_VA = 0x0020;
        const DYNAMIC_BASE = 0x0040;
        const FORCE_INTEGRITY = 0x0080;
        const NX_COMPAT = 0x0100;
        const NO_ISOLATION = 0x0200;
        const NO_SEH = 0x0400;
        const NO_BIND = 0x0800;
        const APPCONTAINER = 0x1000;
        const WDM_DRIVER = 0x2000;
        const GUARD_CF = 0x4000;
        const TERMINAL_SERVER_AWARE = 0x8000;
    }
}

bitflags! {
    /// `IMAGE_SCN_*` section characteristics, minus the alignment nibble.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const CNT_CODE = 0x0000_0020;
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const LNK_OTHER = 0x0000_0100;
        const LNK_INFO = 0x0000_0200;
        const LNK_REMOVE = 0x0000_0800;
        const LNK_COMDAT = 0x0000_1000;
        const MEM_FARDATA = 0x0000_8000;
        const MEM_PURGEABLE = 0x0002_0000;
        const MEM_LOCKED = 0x0004_0000;
        const MEM_PRELOAD = 0x0008_0000;
        const LNK_NRELOC_OVFL = 0x0100_0000;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_NOT_CACHED = 0x0400_0000;
        const MEM_NOT_PAGED = 0x0800_0000;
        const MEM_SHARED = 0x1000_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

const SCN_ALIGN_MASK: u32 = 0x00F0_0000;

/// The 16 canonical data directory slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum DirectoryIndex {
    Export = 0,
    Import = 1,
    Resource = 2,
    Exception = 3,
    Security = 4,
    BaseReloc = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImport = 13,
    ClrHeader = 14,
    Reserved = 15,
}

impl DirectoryIndex {
    pub const ALL: [DirectoryIndex; NUMBER_OF_DIRECTORY_ENTRIES] = [
        Self::Export,
        Self::Import,
        Self::Resource,
        Self::Exception,
        Self::Security,
        Self::BaseReloc,
        Self::Debug,
        Self::Architecture,
        Self::GlobalPtr,
        Self::Tls,
        Self::LoadConfig,
        Self::BoundImport,
        Self::Iat,
        Self::DelayImport,
        Self::ClrHeader,
        Self::Reserved,
    ];

    /// Short display name, as printed in the data directory table.
    pub fn name(self) -> &'static str {
        match self {
            Self::Export => "EXPORT",
            Self::Import => "IMPORT",
            Self::Resource => "RESOURCE",
            Self::Exception => "EXCEPTION",
            Self::Security => "SECURITY",
            Self::BaseReloc => "BASERELOC",
            Self::Debug => "DEBUG",
            Self::Architecture => "ARCHITECTURE",
            Self::GlobalPtr => "GLOBALPTR",
            Self::Tls => "TLS",
            Self::LoadConfig => "LOAD_CONFIG",
            Self::BoundImport => "Bound IAT",
            Self::Iat => "IAT",
            Self::DelayImport => "Delay IAT",
            Self::ClrHeader => "CLR Header",
            Self::Reserved => "",
        }
    }
}

/// Human-readable machine name.
pub fn machine_name(machine: u16) -> &'static str {
    match machine {
        MACHINE_UNKNOWN => "Unknown",
        MACHINE_I860 => "i860",
        MACHINE_I386 => "i386",
        MACHINE_R3000 => "R3000",
        MACHINE_R4000 => "R4000",
        MACHINE_R10000 => "R10000",
        MACHINE_ALPHA => "Alpha",
        MACHINE_POWERPC => "PowerPC",
        MACHINE_AMD64 => "AMD64",
        MACHINE_IA64 => "IA64",
        MACHINE_ARM64 => "ARM64",
        MACHINE_ARM => "ARM",
        MACHINE_ARMNT => "ARMNT",
        MACHINE_THUMB => "ARM Thumb",
        _ => "???",
    }
}

/// Human-readable subsystem name.
pub fn subsystem_name(subsystem: u16) -> &'static str {
    match subsystem {
        1 => "Native",
        2 => "Windows GUI",
        3 => "Windows CUI",
        5 => "OS/2 CUI",
        7 => "Posix CUI",
        8 => "native Win9x driver",
        9 => "Windows CE GUI",
        10 => "EFI application",
        11 => "EFI driver (boot)",
        12 => "EFI driver (runtime)",
        13 => "EFI ROM",
        14 => "Xbox application",
        16 => "Boot application",
        _ => "Unknown",
    }
}

/// DOS header (the fields a dumper cares about).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    /// File address of new exe header (PE offset).
    pub e_lfanew: u32,
}

impl DosHeader {
    fn parse(data: &[u8]) -> Self {
        let mut r = FieldReader::new(data);
        let mut header = Self {
            e_magic: r.u16(),
            e_cblp: r.u16(),
            e_cp: r.u16(),
            e_crlc: r.u16(),
            e_cparhdr: r.u16(),
            e_minalloc: r.u16(),
            e_maxalloc: r.u16(),
            e_ss: r.u16(),
            e_sp: r.u16(),
            e_csum: r.u16(),
            e_ip: r.u16(),
            e_cs: r.u16(),
            e_lfarlc: r.u16(),
            e_ovno: r.u16(),
            e_lfanew: 0,
        };
        header.e_lfanew = read_u32(data, 0x3C).unwrap_or(0);
        header
    }
}

/// COFF file header (20 bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: FileCharacteristics,
}

impl FileHeader {
    fn parse(data: &[u8]) -> Self {
        let mut r = FieldReader::new(data);
        Self {
            machine: r.u16(),
            number_of_sections: r.u16(),
            time_date_stamp: r.u32(),
            pointer_to_symbol_table: r.u32(),
            number_of_symbols: r.u32(),
            size_of_optional_header: r.u16(),
            characteristics: FileCharacteristics::from_bits_retain(r.u16()),
        }
    }
}

/// Data directory entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub(crate) fn read(r: &mut FieldReader<'_>) -> Self {
        Self {
            virtual_address: r.u32(),
            size: r.u32(),
        }
    }
}

/// Optional header normalized to 64-bit fields.
///
/// `base_of_data` only exists in PE32 and reads as 0 for PE32+.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionalHeader {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: DllCharacteristics,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    /// Directory entries actually present (at most 16).
    pub data_directories: Vec<DataDirectory>,
}

impl OptionalHeader {
    /// Parses an optional header of `header_size` declared bytes.
    ///
    /// Bytes the file does not provide read as zero, mirroring how the
    /// loader tolerates short optional headers.
    pub fn parse(available: &[u8], header_size: usize) -> Self {
        let full = OPTIONAL_HEADER64_FIXED + NUMBER_OF_DIRECTORY_ENTRIES * DATA_DIRECTORY_SIZE;
        let mut buf = vec![0u8; full];
        let take = header_size.min(available.len()).min(full);
        buf[..take].copy_from_slice(&available[..take]);

        let magic = read_u16(&buf, 0).unwrap_or(0);
        let is_64bit = magic == PE32PLUS_MAGIC;

        let mut r = FieldReader::new(&buf);
        r.skip(2);
        let major_linker_version = r.u8();
        let minor_linker_version = r.u8();
        let size_of_code = r.u32();
        let size_of_initialized_data = r.u32();
        let size_of_uninitialized_data = r.u32();
        let address_of_entry_point = r.u32();
        let base_of_code = r.u32();
        let (base_of_data, image_base) = if is_64bit {
            (0, r.u64())
        } else {
            (r.u32(), r.u32() as u64)
        };
        let section_alignment = r.u32();
        let file_alignment = r.u32();
        let major_operating_system_version = r.u16();
        let minor_operating_system_version = r.u16();
        let major_image_version = r.u16();
        let minor_image_version = r.u16();
        let major_subsystem_version = r.u16();
        let minor_subsystem_version = r.u16();
        let win32_version_value = r.u32();
        let size_of_image = r.u32();
        let size_of_headers = r.u32();
        let check_sum = r.u32();
        let subsystem = r.u16();
        let dll_characteristics = DllCharacteristics::from_bits_retain(r.u16());
        let size_of_stack_reserve = r.ptr(is_64bit);
        let size_of_stack_commit = r.ptr(is_64bit);
        let size_of_heap_reserve = r.ptr(is_64bit);
        let size_of_heap_commit = r.ptr(is_64bit);
        let loader_flags = r.u32();
        let number_of_rva_and_sizes = r.u32();

        let count = (number_of_rva_and_sizes as usize).min(NUMBER_OF_DIRECTORY_ENTRIES);
        let data_directories = (0..count).map(|_| DataDirectory::read(&mut r)).collect();

        Self {
            magic,
            major_linker_version,
            minor_linker_version,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data,
            address_of_entry_point,
            base_of_code,
            base_of_data,
            image_base,
            section_alignment,
            file_alignment,
            major_operating_system_version,
            minor_operating_system_version,
            major_image_version,
            minor_image_version,
            major_subsystem_version,
            minor_subsystem_version,
            win32_version_value,
            size_of_image,
            size_of_headers,
            check_sum,
            subsystem,
            dll_characteristics,
            size_of_stack_reserve,
            size_of_stack_commit,
            size_of_heap_reserve,
            size_of_heap_commit,
            loader_flags,
            number_of_rva_and_sizes,
            data_directories,
        }
    }

    /// Is this a PE32+ (64-bit) optional header?
    pub fn is_64bit(&self) -> bool {
        self.magic == PE32PLUS_MAGIC
    }

    pub fn magic_name(&self) -> &'static str {
        match self.magic {
            PE32_MAGIC => "32bit",
            PE32PLUS_MAGIC => "64bit",
            ROM_MAGIC => "ROM",
            _ => "???",
        }
    }
}

/// Parsed section header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionHeader {
    pub raw_name: [u8; 8],
    /// Display name, with `/nnn` long names resolved through the string table.
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    fn parse(data: &[u8]) -> Self {
        let mut raw_name = [0u8; 8];
        raw_name.copy_from_slice(&data[..8]);
        let mut r = FieldReader::new(&data[8..]);
        Self {
            raw_name,
            name: cstr(&raw_name),
            virtual_size: r.u32(),
            virtual_address: r.u32(),
            size_of_raw_data: r.u32(),
            pointer_to_raw_data: r.u32(),
            pointer_to_relocations: r.u32(),
            pointer_to_linenumbers: r.u32(),
            number_of_relocations: r.u16(),
            number_of_linenumbers: r.u16(),
            characteristics: r.u32(),
        }
    }

    pub fn flags(&self) -> SectionFlags {
        SectionFlags::from_bits_truncate(self.characteristics)
    }

    /// Section alignment in bytes encoded in the `IMAGE_SCN_ALIGN_*` nibble.
    pub fn alignment(&self) -> Option<u32> {
        match (self.characteristics & SCN_ALIGN_MASK) >> 20 {
            n @ 1..=14 => Some(1 << (n - 1)),
            _ => None,
        }
    }

    /// Size of the section's address range; object-style images leave
    /// `VirtualSize` at zero, in which case the raw size stands in.
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.size_of_raw_data
        } else {
            self.virtual_size
        }
    }
}

/// Which kind of Wine-generated stub module this is, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WineDll {
    Builtin,
    Placeholder,
}

/// All headers of a PE image.
#[derive(Clone, Debug)]
pub struct Headers {
    pub dos: DosHeader,
    /// Offset to PE signature (e_lfanew).
    pub pe_offset: u32,
    pub file: FileHeader,
    pub optional: OptionalHeader,
    pub sections: Vec<SectionHeader>,
    pub wine_dll: Option<WineDll>,
}

impl Headers {
    /// Parse all headers from the start of an image file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DOS_HEADER_SIZE {
            return Err(Error::HeadersTooSmall {
                expected: DOS_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let dos = DosHeader::parse(&data[..DOS_HEADER_SIZE]);
        if dos.e_magic != DOS_MAGIC {
            return Err(Error::InvalidDosSignature(0));
        }

        let pe_offset = dos.e_lfanew;
        let pe_start = pe_offset as usize;
        let min_pe_size = pe_start + 4 + FILE_HEADER_SIZE;
        if data.len() < min_pe_size {
            return Err(Error::HeadersTooSmall {
                expected: min_pe_size,
                actual: data.len(),
            });
        }

        if read_u32(data, pe_start) != Some(PE_SIGNATURE) {
            return Err(Error::InvalidPeSignature(pe_start));
        }

        let file = FileHeader::parse(&data[pe_start + 4..min_pe_size]);
        let opt_start = min_pe_size;
        let optional = OptionalHeader::parse(&data[opt_start..], file.size_of_optional_header as usize);
        if (file.size_of_optional_header as usize) > data.len() - opt_start {
            warn!(
                declared = file.size_of_optional_header,
                available = data.len() - opt_start,
                "optional header truncated, zero-filling"
            );
        }

        let sections = Self::parse_sections(data, &file, opt_start + file.size_of_optional_header as usize);

        debug!(
            machine = machine_name(file.machine),
            sections = sections.len(),
            is_64bit = optional.is_64bit(),
            "parsed PE headers"
        );

        Ok(Self {
            wine_dll: detect_wine_dll(data, pe_offset),
            dos,
            pe_offset,
            file,
            optional,
            sections,
        })
    }

    fn parse_sections(data: &[u8], file: &FileHeader, table_start: usize) -> Vec<SectionHeader> {
        let strtab = string_table(data, file);
        let count = file.number_of_sections as usize;
        let mut sections = Vec::with_capacity(count);

        for i in 0..count {
            let off = table_start + i * SECTION_HEADER_SIZE;
            let Some(raw) = data.get(off..off + SECTION_HEADER_SIZE) else {
                warn!(index = i, declared = count, "section table truncated");
                break;
            };
            let mut section = SectionHeader::parse(raw);
            if let Some(long) = strtab.and_then(|t| long_section_name(&section.raw_name, t)) {
                section.name = long;
            }
            sections.push(section);
        }
        sections
    }

    pub fn is_64bit(&self) -> bool {
        self.optional.is_64bit()
    }

    pub fn image_base(&self) -> u64 {
        self.optional.image_base
    }

    /// Data directory entry, or `None` past `NumberOfRvaAndSizes`.
    pub fn data_directory(&self, index: DirectoryIndex) -> Option<DataDirectory> {
        self.optional.data_directories.get(index as usize).copied()
    }
}

/// COFF string table, when the image carries a symbol table.
fn string_table<'a>(data: &'a [u8], file: &FileHeader) -> Option<&'a [u8]> {
    if file.pointer_to_symbol_table == 0 || file.number_of_symbols == 0 {
        return None;
    }
    let start = (file.pointer_to_symbol_table as usize)
        .checked_add((file.number_of_symbols as usize).checked_mul(COFF_SYMBOL_SIZE)?)?;
    data.get(start..)
}

fn long_section_name(raw_name: &[u8; 8], strtab: &[u8]) -> Option<String> {
    if raw_name[0] != b'/' {
        return None;
    }
    let offset: usize = cstr(&raw_name[1..]).trim().parse().ok()?;
    let table_size = read_u32(strtab, 0)? as usize;
    if offset >= table_size {
        return None;
    }
    strtab.get(offset..).map(cstr)
}

fn detect_wine_dll(data: &[u8], pe_offset: u32) -> Option<WineDll> {
    if (pe_offset as usize) < DOS_HEADER_SIZE + 32 {
        return None;
    }
    let stub = &data[DOS_HEADER_SIZE..];
    if stub.starts_with(WINE_BUILTIN_SIGNATURE) {
        Some(WineDll::Builtin)
    } else if stub.starts_with(WINE_PLACEHOLDER_SIGNATURE) {
        Some(WineDll::Placeholder)
    } else {
        None
    }
}
